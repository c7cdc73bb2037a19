//! # Node
//!
//! The composition root. A [`Node`] wires the store, overlay, endpoint
//! backends, session layer, tracker client and port mapper together;
//! tests instantiate several nodes in one process and connect them over
//! loopback.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(Config::default()).await?;
//! node.bootstrap(&["198.51.100.7:8480".parse()?]).await?;
//!
//! // Store a block and fetch it from elsewhere by digest.
//! let digest = node.store_block(data);
//! let bytes = other.fetch(&digest, Duration::from_secs(30)).await;
//! ```
//!
//! ## Maintenance
//!
//! A background task broadcasts `Offer`s with the node's external
//! addresses on the configured cadence, and while the node is below its
//! connection minimum it announces to the tracker and connects to the
//! candidates the tracker returns, retrying on a short randomized
//! interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::identity::{Keypair, NodeId};
use crate::messages::Message;
use crate::network::{Listener, Network};
use crate::overlay::{Overlay, OverlayConfig};
use crate::portmapping::PortMapping;
use crate::pubsub::{Publisher, Subscriber};
use crate::store::Store;
use crate::tracker::TrackerClient;
use crate::transport::{Backend, DatagramBackend, StreamBackend};

pub struct Node {
    keypair: Keypair,
    config: Config,
    overlay: Overlay,
    network: Network,
    store: Store,
    port_mapping: Option<PortMapping>,
    stream_port: u16,
    datagram_port: u16,
    maintenance: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Create a node with a fresh identity.
    ///
    /// RSA generation takes on the order of a second; long-lived nodes
    /// persist the key and use [`bind_with_keypair`](Self::bind_with_keypair).
    pub async fn bind(config: Config) -> Result<Self> {
        let keypair = Keypair::generate()?;
        Self::bind_with_keypair(config, keypair).await
    }

    pub async fn bind_with_keypair(config: Config, keypair: Keypair) -> Result<Self> {
        let store = Store::new();
        let overlay_config = OverlayConfig {
            keepalive_timeout: config.keepalive_timeout(),
            request_timeout: config.request_timeout(),
        };
        let (overlay, inbox_rx) = Overlay::new(keypair.clone(), store.clone(), overlay_config);

        // Both endpoint flavours on the configured port (ephemeral ports
        // may differ between them).
        let listen = config.listen_addr();
        let datagram = Arc::new(DatagramBackend::bind(
            listen,
            keypair.clone(),
            config.connect_timeout(),
            config.idle_timeout(),
            config.force_http_tunnel,
        )?);
        let stream = Arc::new(
            StreamBackend::bind(
                listen,
                keypair.clone(),
                config.connect_timeout(),
                config.force_http_tunnel,
            )
            .await?,
        );
        let datagram_port = datagram.local_port();
        let stream_port = stream.local_port();

        let backends: Vec<Arc<dyn Backend>> = vec![datagram, stream];
        overlay.start(backends);

        let network = Network::new(overlay.clone(), inbox_rx, &config);

        let port_mapping = if config.port_mapping {
            let mapping = PortMapping::new();
            mapping.enable(stream_port);
            Some(mapping)
        } else {
            None
        };

        // Suggested and tracker-supplied candidates naming our own
        // addresses must be dropped before dialling; the maintenance loop
        // refreshes this set as the port mapper learns more.
        overlay.set_local_addresses(&external_addresses(
            &config,
            port_mapping.as_ref(),
            stream_port,
            datagram_port,
        ));

        let maintenance = {
            let overlay = overlay.clone();
            let config = config.clone();
            let port_mapping = port_mapping.clone();
            let node_id = keypair.node_id();
            tokio::spawn(run_maintenance(
                overlay,
                config,
                port_mapping,
                node_id,
                stream_port,
                datagram_port,
            ))
        };

        info!(
            node = %keypair.node_id(),
            tcp = stream_port,
            udp = datagram_port,
            "node up"
        );

        Ok(Self {
            keypair,
            config,
            overlay,
            network,
            store,
            port_mapping,
            stream_port,
            datagram_port,
            maintenance,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// TCP listen port (also the HTTP tunnel port).
    pub fn stream_port(&self) -> u16 {
        self.stream_port
    }

    /// UDP listen port.
    pub fn datagram_port(&self) -> u16 {
        self.datagram_port
    }

    /// Addresses this node publishes as reachable.
    pub fn external_addresses(&self) -> Vec<SocketAddr> {
        external_addresses(
            &self.config,
            self.port_mapping.as_ref(),
            self.stream_port,
            self.datagram_port,
        )
    }

    // ------------------------------------------------------------------
    // Overlay operations
    // ------------------------------------------------------------------

    pub fn neighbor_count(&self) -> usize {
        self.overlay.neighbor_count()
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        self.overlay.neighbors()
    }

    /// Connect to known peer addresses (bootstrap).
    pub async fn bootstrap(&self, addrs: &[SocketAddr]) -> Result<bool> {
        self.overlay.connect(addrs, None).await
    }

    /// Liveness round-trip to a node.
    pub async fn ping(&self, node: &NodeId, content: &[u8], deadline: Duration) -> bool {
        self.network.ping(node, content, deadline).await
    }

    pub fn store_value(&self, key: &NodeId, value: &[u8]) {
        self.network.store_value(key, value);
    }

    pub async fn retrieve_value(&self, key: &NodeId) -> Vec<Vec<u8>> {
        self.network.retrieve_value(key).await
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Store a block and announce this node as a holder.
    pub fn store_block(&self, data: Vec<u8>) -> NodeId {
        self.network.store_block(data)
    }

    /// Fetch a block by digest from the mesh.
    pub async fn fetch(&self, digest: &NodeId, deadline: Duration) -> Option<Arc<Vec<u8>>> {
        self.network.fetch(digest, deadline).await
    }

    /// Fetch a block directly from a session peer, bypassing mesh lookup.
    pub async fn fetch_from_peer(
        &self,
        local: &NodeId,
        remote: &NodeId,
        digest: &NodeId,
        deadline: Duration,
    ) -> Option<Arc<Vec<u8>>> {
        self.network.fetch_from_peer(local, remote, digest, deadline).await
    }

    // ------------------------------------------------------------------
    // Identities and sessions
    // ------------------------------------------------------------------

    /// Register a local user identity.
    pub fn add_identity(&self, keypair: Keypair) -> Result<()> {
        self.network.add_identity(keypair)
    }

    /// Track a friend pair and authorize its sessions.
    pub fn listen(&self, local: NodeId, remote: NodeId, listener: Arc<dyn Listener>) {
        self.network.listen(local, remote, listener);
    }

    /// Open a session from a local identity to a friend identity.
    pub async fn connect_identity(&self, local: &NodeId, remote: NodeId) -> Result<()> {
        self.network.connect(local, remote).await
    }

    pub async fn send_notification(
        &self,
        local: &NodeId,
        remote: &NodeId,
        payload: &[u8],
    ) -> Result<u32> {
        self.network.send_notification(local, remote, payload).await
    }

    // ------------------------------------------------------------------
    // Publish/subscribe
    // ------------------------------------------------------------------

    pub async fn publish(&self, prefix: &str, publisher: Arc<dyn Publisher>) {
        self.network.publish(prefix, publisher).await;
    }

    pub async fn subscribe(&self, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        self.network.subscribe(prefix, subscriber).await;
    }

    /// Low-level escape hatch: inject an overlay message as if received.
    pub async fn inject(&self, message: Message) {
        self.overlay.incoming(message, None).await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("neighbors", &self.neighbor_count())
            .finish_non_exhaustive()
    }
}

/// Addresses worth publishing: configured external addresses, whatever the
/// port mapper learnt, and the bound addresses when they are concrete.
fn external_addresses(
    config: &Config,
    port_mapping: Option<&PortMapping>,
    stream_port: u16,
    datagram_port: u16,
) -> Vec<SocketAddr> {
    let mut addrs = config.external_addresses.clone();
    if let Some(mapped) = port_mapping.and_then(|m| m.external_addr()) {
        addrs.push(mapped);
    }
    if let Some(port) = config.external_port {
        for addr in addrs.clone() {
            addrs.push(SocketAddr::new(addr.ip(), port));
        }
    }
    // A concrete bind address is directly dialable (loopback setups and
    // machines with a routable interface address).
    if !config.listen_address.is_unspecified() {
        addrs.push(SocketAddr::new(config.listen_address, datagram_port));
        if stream_port != datagram_port {
            addrs.push(SocketAddr::new(config.listen_address, stream_port));
        }
    }
    addrs.sort();
    addrs.dedup();
    addrs
}

async fn run_maintenance(
    overlay: Overlay,
    config: Config,
    port_mapping: Option<PortMapping>,
    node_id: NodeId,
    stream_port: u16,
    datagram_port: u16,
) {
    let tracker = config.tracker.as_deref().and_then(|t| match TrackerClient::new(t) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "invalid tracker configuration");
            None
        }
    });

    loop {
        let addrs =
            external_addresses(&config, port_mapping.as_ref(), stream_port, datagram_port);
        overlay.set_local_addresses(&addrs);

        // Offer our addresses for path folding.
        if overlay.neighbor_count() > 0 {
            overlay.broadcast_offer(&addrs);
        }

        // Below the connection minimum, the tracker supplies candidates.
        if overlay.neighbor_count() < config.min_connections {
            if let Some(tracker) = &tracker {
                let publish: Vec<SocketAddr> = addrs
                    .iter()
                    .filter(|a| !crate::transport::is_loopback(a))
                    .copied()
                    .collect();
                let pinned_port = config.external_port.or({
                    match port_mapping.as_ref().map(|m| m.is_available()) {
                        Some(true) => None,
                        // Without a mapper the tracker needs the local port.
                        _ => Some(stream_port),
                    }
                });
                match tracker.announce(&node_id, &publish, pinned_port).await {
                    Ok(entries) => {
                        for (remote, addrs) in entries {
                            if overlay.neighbor_count() >= config.min_connections {
                                break;
                            }
                            match overlay.connect(&addrs, Some(remote)).await {
                                Ok(true) => debug!(remote = %remote, "tracker bootstrap connected"),
                                Ok(false) => {}
                                Err(e) => debug!(remote = %remote, error = %e, "bootstrap failed"),
                            }
                        }
                    }
                    Err(e) => debug!(error = %e, "tracker announce failed"),
                }
            }
        }

        // Well-connected nodes settle into the slow offer cadence; the
        // rest retry on a short randomized interval.
        let delay = if overlay.neighbor_count() >= config.min_connections {
            config.offer_interval()
        } else {
            Duration::from_secs(rand::thread_rng().gen_range(10..=120))
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn loopback_config() -> Config {
        Config {
            port: 0,
            listen_address: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port_mapping: false,
            min_connections: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn node_binds_and_reports_identity() {
        let node = Node::bind(loopback_config()).await.expect("bind");
        assert_eq!(node.node_id().to_hex().len(), 128);
        assert!(node.stream_port() > 0);
        assert!(node.datagram_port() > 0);
        assert_eq!(node.neighbor_count(), 0);
    }

    #[tokio::test]
    async fn external_addresses_include_concrete_bind() {
        let node = Node::bind(loopback_config()).await.expect("bind");
        let addrs = node.external_addresses();
        assert!(
            addrs.iter().any(|a| a.port() == node.datagram_port()),
            "bound datagram address must be published"
        );
    }

    #[tokio::test]
    async fn identity_survives_rebind() {
        let keypair = Keypair::generate().unwrap();
        let id = keypair.node_id();
        let node = Node::bind_with_keypair(loopback_config(), keypair.clone())
            .await
            .expect("bind");
        assert_eq!(node.node_id(), id);
        drop(node);

        let node = Node::bind_with_keypair(loopback_config(), keypair).await.expect("rebind");
        assert_eq!(node.node_id(), id);
    }
}
