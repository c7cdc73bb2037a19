//! # Session Layer
//!
//! The network orchestrates everything above the overlay: per-pair session
//! handlers, the caller registry driving block fetches, listeners tracking
//! friend identities, and publish/subscribe fan-out.
//!
//! One pump task drains three sources:
//!
//! - the **overlay inbox** (records addressed to this node): `Value`
//!   observations feed callers and listeners, `Call`/`Data` serve and
//!   consume fountain transfers, `Tunnel` records go to the tunneler,
//!   `Pong` wakes ping waiters;
//! - **session events** from handlers: notifications (delivered to
//!   listeners), publish/subscribe records (matched against the
//!   registries), session lifecycle;
//! - a **beacon tick**: callers re-issue `Retrieve`, tracked identities
//!   and local block digests are re-published, expired values dropped.
//!
//! Registries are keyed maps looked up on demand; a session handler exists
//! at most once per (local, remote) identity pair.
//!
//! Blocks travel two ways: [`fetch`](Network::fetch) discovers holders
//! through the mesh and pulls with overlay-routed `Call`/`Data` records,
//! while [`fetch_from_peer`](Network::fetch_from_peer) pulls straight from
//! an established session with the pair's own `Call`/`Cancel`/`Data`
//! records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::crypto::LocalIdentityResolver;
use crate::handler::{Handler, HandlerEvent};
use crate::identity::{Keypair, NodeId, NODE_ID_LEN};
use crate::messages::{deserialize_payload, serialize_payload, Message, MessageType};
use crate::overlay::Overlay;
use crate::pubsub::{PubSub, Publisher, Subscriber};
use crate::store::Store;
use crate::tunneler::{SessionLink, Tunneler};

/// Tokens granted per `Call` when fetching a block.
const CALL_TOKEN_GRANT: u16 = 32;

/// Upper bound honoured when serving a `Call`.
const MAX_SERVED_TOKENS: u16 = 64;

/// Beacon cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks between identity/digest republications.
const PUBLISH_EVERY_TICKS: u64 = 10;

/// Ticks between store expiry sweeps.
const EXPIRE_EVERY_TICKS: u64 = 60;

/// Callbacks observing a (local, remote) identity pair.
///
/// All methods have do-nothing defaults; implementors override what they
/// care about.
pub trait Listener: Send + Sync {
    /// A session with the pair is up.
    fn connected(&self, _local: &NodeId, _remote: &NodeId) {}

    /// The session went away.
    fn disconnected(&self, _local: &NodeId, _remote: &NodeId) {}

    /// A notification arrived (deduplicated, at-least-once upstream).
    fn notification(&self, _local: &NodeId, _remote: &NodeId, _payload: &[u8]) {}

    /// A notification exhausted its retries.
    fn failed(&self, _local: &NodeId, _remote: &NodeId, _sequence: u32) {}

    /// Gate for inbound sessions: returning false rejects the peer.
    fn auth(&self, _local: &NodeId, _remote: &NodeId) -> bool {
        true
    }

    /// The tracked remote identity was seen on a node.
    fn seen(&self, _local: &NodeId, _remote: &NodeId, _node: &NodeId) {}
}

#[derive(Default)]
struct NetworkState {
    /// Exactly one session handler per (local, remote) pair.
    handlers: HashMap<(NodeId, NodeId), Handler>,
    /// Local user identities able to accept and open sessions.
    identities: HashMap<NodeId, Keypair>,
    /// Listeners keyed by (remote, local).
    listeners: HashMap<(NodeId, NodeId), Vec<Arc<dyn Listener>>>,
    /// Block digests being fetched, reference counted.
    callers: HashMap<NodeId, usize>,
    /// Ping waiters keyed by (responder, echoed content).
    pending_pings: HashMap<(NodeId, Vec<u8>), Arc<Notify>>,
}

struct NetworkShared {
    overlay: Overlay,
    store: Store,
    tunneler: Tunneler,
    pubsub: PubSub,
    state: Mutex<NetworkState>,
    events_tx: mpsc::Sender<HandlerEvent>,
    keepalive: Duration,
}

/// Handle to the session layer. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    shared: Arc<NetworkShared>,
}

impl Network {
    /// Wire the session layer over an overlay and start the pump.
    pub fn new(overlay: Overlay, inbox_rx: mpsc::Receiver<Message>, config: &Config) -> Self {
        let resolver = Arc::new(LocalIdentityResolver::new());
        let (tunneler, sessions_rx) = Tunneler::new(
            overlay.clone(),
            resolver,
            config.connect_timeout(),
            config.tunnel_timeout(),
        );
        let (events_tx, events_rx) = mpsc::channel(256);

        let network = Self {
            shared: Arc::new(NetworkShared {
                store: overlay.store().clone(),
                overlay,
                tunneler,
                pubsub: PubSub::new(),
                state: Mutex::new(NetworkState::default()),
                events_tx,
                keepalive: config.keepalive_timeout(),
            }),
        };

        {
            let network = network.clone();
            tokio::spawn(network.run(inbox_rx, events_rx, sessions_rx));
        }
        network
    }

    pub fn overlay(&self) -> &Overlay {
        &self.shared.overlay
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.shared.pubsub
    }

    // ------------------------------------------------------------------
    // Identities and listeners
    // ------------------------------------------------------------------

    /// Register a local user identity able to accept tunnel sessions.
    pub fn add_identity(&self, keypair: Keypair) -> Result<()> {
        // The resolver serves the identity's certificate by SNI during
        // tunnel handshakes; it is owned by the tunneler side.
        self.resolver_register(&keypair)?;
        self.shared
            .state
            .lock()
            .expect("network lock poisoned")
            .identities
            .insert(keypair.node_id(), keypair);
        Ok(())
    }

    fn resolver_register(&self, keypair: &Keypair) -> Result<()> {
        // The tunneler holds the resolver; reach it through a stored copy.
        self.shared.tunneler_resolver().register(keypair)
    }

    /// Track a (local, remote) identity pair: authorize its sessions and
    /// receive its callbacks.
    pub fn listen(&self, local: NodeId, remote: NodeId, listener: Arc<dyn Listener>) {
        let connected = {
            let mut state = self.shared.state.lock().expect("network lock poisoned");
            state
                .listeners
                .entry((remote, local))
                .or_default()
                .push(listener.clone());
            state.handlers.contains_key(&(local, remote))
        };
        if connected {
            listener.connected(&local, &remote);
        }

        // Make the pair findable right away: publish where the local
        // identity lives and start looking for the remote one. The beacon
        // tick repeats both.
        let node = self.shared.overlay.local_node();
        self.shared.overlay.store_value(&local, node.as_bytes());
        self.beacon_retrieve(&remote);
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Open a session from a local identity to a remote identity.
    ///
    /// The remote's node is located through the distributed store (friends
    /// publish `identity → node`); each candidate node is tried until a
    /// tunnel handshake succeeds.
    pub async fn connect(&self, local: &NodeId, remote: NodeId) -> Result<()> {
        let keypair = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            if state.handlers.contains_key(&(*local, remote)) {
                return Ok(());
            }
            state
                .identities
                .get(local)
                .cloned()
                .context("unknown local identity")?
        };

        let values = self.shared.overlay.retrieve_value(&remote).await;
        let mut nodes: Vec<NodeId> = values
            .iter()
            .filter_map(|v| NodeId::try_from(v.as_slice()).ok())
            .filter(|n| *n != self.shared.overlay.local_node())
            .collect();
        nodes.dedup();
        if nodes.is_empty() {
            anyhow::bail!("no node found for identity {}", remote);
        }

        let mut last_error = None;
        for node in nodes {
            match self.shared.tunneler.open(node, &keypair, remote).await {
                Ok(()) => {
                    // The session is adopted by the pump; wait for it so
                    // callers can use the pair immediately.
                    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                    while tokio::time::Instant::now() < deadline {
                        if self.has_session(local, &remote) {
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(node = %node, error = %e, "tunnel open failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no candidate nodes")))
    }

    pub fn has_session(&self, local: &NodeId, remote: &NodeId) -> bool {
        self.shared
            .state
            .lock()
            .expect("network lock poisoned")
            .handlers
            .contains_key(&(*local, *remote))
    }

    pub fn session_count(&self) -> usize {
        self.shared.state.lock().expect("network lock poisoned").handlers.len()
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Send a notification to one peer. Delivery failure surfaces through
    /// the pair's listeners.
    pub async fn send_notification(
        &self,
        local: &NodeId,
        remote: &NodeId,
        payload: &[u8],
    ) -> Result<u32> {
        let handler = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state
                .handlers
                .get(&(*local, *remote))
                .cloned()
                .context("no session with peer")?
        };
        handler.notify(payload).await
    }

    /// Send a notification to every peer of a local identity.
    pub async fn broadcast_notification(&self, local: &NodeId, payload: &[u8]) -> bool {
        let handlers: Vec<Handler> = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state
                .handlers
                .iter()
                .filter(|((l, _), _)| l == local)
                .map(|(_, h)| h.clone())
                .collect()
        };
        let mut any = false;
        for handler in handlers {
            any |= handler.notify(payload).await.is_ok();
        }
        any
    }

    // ------------------------------------------------------------------
    // Distributed store and blocks
    // ------------------------------------------------------------------

    pub fn store_value(&self, key: &NodeId, value: &[u8]) {
        self.shared.overlay.store_value(key, value);
    }

    pub async fn retrieve_value(&self, key: &NodeId) -> Vec<Vec<u8>> {
        self.shared.overlay.retrieve_value(key).await
    }

    /// Store a block locally and announce this node as its holder.
    pub fn store_block(&self, data: Vec<u8>) -> NodeId {
        let digest = self.shared.store.store_block(data);
        let node = self.shared.overlay.local_node();
        self.shared.overlay.store_value(&digest, node.as_bytes());
        digest
    }

    /// Fetch a block by digest: beacons `Retrieve`, calls announced
    /// holders, and waits for the decoder to finish.
    pub async fn fetch(&self, digest: &NodeId, deadline: Duration) -> Option<Arc<Vec<u8>>> {
        if let Some(block) = self.shared.store.get_block(digest) {
            return Some(block);
        }

        {
            let mut state = self.shared.state.lock().expect("network lock poisoned");
            *state.callers.entry(*digest).or_insert(0) += 1;
        }
        // First beacon immediately; the tick repeats it.
        self.beacon_retrieve(digest);

        let block = self.shared.store.wait_block(digest, deadline).await;

        let mut state = self.shared.state.lock().expect("network lock poisoned");
        if let Some(count) = state.callers.get_mut(digest) {
            *count -= 1;
            if *count == 0 {
                state.callers.remove(digest);
            }
        }
        if block.is_none() {
            self.shared.store.abort_fetch(digest);
        }
        block
    }

    /// Fetch a block directly from a session peer with `Call`/`Data`
    /// records, bypassing mesh discovery.
    ///
    /// The peer's sender is fed token grants until the decoder finishes or
    /// the deadline passes; the session's record loop cancels the transfer
    /// by itself once the block completes, and an abandoned fetch sends a
    /// final `Cancel` here.
    pub async fn fetch_from_peer(
        &self,
        local: &NodeId,
        remote: &NodeId,
        digest: &NodeId,
        deadline: Duration,
    ) -> Option<Arc<Vec<u8>>> {
        if let Some(block) = self.shared.store.get_block(digest) {
            return Some(block);
        }
        let handler = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state.handlers.get(&(*local, *remote)).cloned()
        }?;

        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline_at {
                break;
            }
            // Renewed grants keep the peer's sender fed across losses.
            if handler.call(digest, CALL_TOKEN_GRANT).await.is_err() {
                break;
            }
            let wait = (deadline_at - now).min(Duration::from_secs(1));
            if let Some(block) = self.shared.store.wait_block(digest, wait).await {
                return Some(block);
            }
        }

        let _ = handler.cancel(digest).await;
        self.shared.store.abort_fetch(digest);
        None
    }

    fn beacon_retrieve(&self, key: &NodeId) {
        let message = Message {
            ty: MessageType::Retrieve,
            source: Some(self.shared.overlay.local_node()),
            destination: Some(*key),
            ..Message::default()
        };
        self.shared.overlay.send(message);
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Round-trip a `Ping` to a node, true when the `Pong` echoing the
    /// content arrives within the deadline.
    pub async fn ping(&self, node: &NodeId, content: &[u8], deadline: Duration) -> bool {
        let key = (*node, content.to_vec());
        let notify = {
            let mut state = self.shared.state.lock().expect("network lock poisoned");
            state
                .pending_pings
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        // Register interest before sending so an answer racing the await
        // is not lost.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let sent = self
            .shared
            .overlay
            .send(Message::to(MessageType::Ping, *node, content.to_vec()));
        if !sent {
            self.shared
                .state
                .lock()
                .expect("network lock poisoned")
                .pending_pings
                .remove(&key);
            return false;
        }

        let answered = tokio::time::timeout(deadline, notified).await.is_ok();
        self.shared
            .state
            .lock()
            .expect("network lock poisoned")
            .pending_pings
            .remove(&key);
        answered
    }

    // ------------------------------------------------------------------
    // Publish/subscribe
    // ------------------------------------------------------------------

    /// Register a publisher under a prefix and announce its digests to the
    /// subscribers that match.
    pub async fn publish(&self, prefix: &str, publisher: Arc<dyn Publisher>) {
        self.shared.pubsub.publish(prefix, publisher);
        self.announce(prefix).await;
    }

    pub fn unpublish(&self, prefix: &str, publisher: &Arc<dyn Publisher>) {
        self.shared.pubsub.unpublish(prefix, publisher);
    }

    /// Push current matches for `path` to local and remote subscribers.
    pub async fn announce(&self, path: &str) {
        let records = self.shared.pubsub.match_publishers(None, path);
        for record in records {
            let targets = record.decoded_targets();
            self.shared.pubsub.match_subscribers(None, &record.path, &targets);
        }
    }

    /// Register a subscriber; local publishers answer immediately and
    /// connected peers are told unless the subscriber is local-only.
    pub async fn subscribe(&self, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        self.shared.pubsub.subscribe(prefix, subscriber.clone());

        // Immediate answer from local publishers, both directions.
        for record in self.shared.pubsub.match_publishers_subscribe(None, prefix) {
            for target in record.decoded_targets() {
                subscriber.incoming(None, &record.path, "/", &target);
            }
        }

        if !subscriber.local_only() {
            let handlers: Vec<Handler> = {
                let state = self.shared.state.lock().expect("network lock poisoned");
                state.handlers.values().cloned().collect()
            };
            for handler in handlers {
                if let Err(e) = handler.send_subscribe(prefix).await {
                    trace!(error = %e, "subscribe announcement failed");
                }
            }
        }
    }

    pub fn unsubscribe(&self, prefix: &str, subscriber: &Arc<dyn Subscriber>) {
        self.shared.pubsub.unsubscribe(prefix, subscriber);
    }

    // ------------------------------------------------------------------
    // Pump
    // ------------------------------------------------------------------

    async fn run(
        self,
        mut inbox_rx: mpsc::Receiver<Message>,
        mut events_rx: mpsc::Receiver<HandlerEvent>,
        mut sessions_rx: mpsc::Receiver<SessionLink>,
    ) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                message = inbox_rx.recv() => {
                    match message {
                        Some(message) => self.handle_inbox(message).await,
                        None => break,
                    }
                }
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                session = sessions_rx.recv() => {
                    if let Some(session) = session {
                        self.adopt_session(session);
                    }
                }
                _ = tick.tick() => {
                    ticks += 1;
                    self.handle_tick(ticks);
                }
            }
        }
        debug!("session layer pump ended");
    }

    async fn handle_inbox(&self, message: Message) {
        match message.ty {
            MessageType::Value => self.handle_value(message),
            MessageType::Call => self.handle_call(message),
            MessageType::Data => self.handle_data(message),
            MessageType::Tunnel => self.shared.tunneler.incoming(message),
            MessageType::Pong => {
                let Some(source) = message.source else { return };
                let state = self.shared.state.lock().expect("network lock poisoned");
                if let Some(notify) = state.pending_pings.get(&(source, message.content)) {
                    notify.notify_waiters();
                }
            }
            other => trace!(ty = ?other, "unhandled inbox record"),
        }
    }

    /// A value observation: `source` is the key, content the value.
    fn handle_value(&self, message: Message) {
        let Some(key) = message.source else { return };

        // A fetch in progress calls the announced holder.
        let calling = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state.callers.contains_key(&key)
        };
        if calling {
            if let Ok(holder) = NodeId::try_from(message.content.as_slice()) {
                if holder != self.shared.overlay.local_node() {
                    let mut content = key.as_bytes().to_vec();
                    content.extend_from_slice(&CALL_TOKEN_GRANT.to_be_bytes());
                    self.shared
                        .overlay
                        .send(Message::to(MessageType::Call, holder, content));
                }
            }
        }

        // Listeners tracking this identity learn where it lives.
        let interested: Vec<(NodeId, NodeId, Arc<dyn Listener>)> = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state
                .listeners
                .iter()
                .filter(|((remote, _), _)| *remote == key)
                .flat_map(|((remote, local), listeners)| {
                    listeners
                        .iter()
                        .map(|l| (*local, *remote, l.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        if !interested.is_empty() {
            if let Ok(node) = NodeId::try_from(message.content.as_slice()) {
                for (local, remote, listener) in interested {
                    listener.seen(&local, &remote, &node);
                }
            }
        }
    }

    /// Serve a block request: one `Data` record per granted token.
    fn handle_call(&self, message: Message) {
        let Some(requester) = message.source else { return };
        if message.content.len() < NODE_ID_LEN + 2 {
            return;
        }
        let Ok(target) = NodeId::try_from(&message.content[..NODE_ID_LEN]) else { return };
        let tokens = u16::from_be_bytes(
            message.content[NODE_ID_LEN..NODE_ID_LEN + 2]
                .try_into()
                .expect("length checked"),
        )
        .min(MAX_SERVED_TOKENS);

        if !self.shared.store.has_block(&target) {
            trace!(target = %target, "call for block we do not hold");
            return;
        }

        debug!(target = %target, requester = %requester, tokens, "serving call");
        let network = self.clone();
        tokio::spawn(async move {
            for _ in 0..tokens {
                let Some(combination) = network.shared.store.pull(&target) else { break };
                let Ok(serialized) = serialize_payload(&combination) else { break };
                let mut content = target.as_bytes().to_vec();
                content.extend_from_slice(&serialized);
                network
                    .shared
                    .overlay
                    .send(Message::to(MessageType::Data, requester, content));
                // Pace the burst a little so link queues keep up.
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
    }

    fn handle_data(&self, message: Message) {
        if message.content.len() < NODE_ID_LEN {
            return;
        }
        let Ok(target) = NodeId::try_from(&message.content[..NODE_ID_LEN]) else { return };
        let Ok(combination) = deserialize_payload(&message.content[NODE_ID_LEN..]) else {
            trace!("malformed combination in data record");
            return;
        };
        if self.shared.store.push(&target, combination) {
            trace!(target = %target, "block fetch complete");
        }
    }

    async fn handle_event(&self, event: HandlerEvent) {
        match event {
            HandlerEvent::Established { .. } => {}
            HandlerEvent::Notification { local, remote, payload } => {
                for listener in self.listeners_for(&remote, &local) {
                    listener.notification(&local, &remote, &payload);
                }
            }
            HandlerEvent::NotificationFailed { local, remote, sequence } => {
                for listener in self.listeners_for(&remote, &local) {
                    listener.failed(&local, &remote, sequence);
                }
            }
            HandlerEvent::Subscribe { local, remote, path } => {
                self.handle_remote_subscribe(local, remote, path).await;
            }
            HandlerEvent::Publish { remote, record, .. } => {
                let targets = record.decoded_targets();
                self.shared
                    .pubsub
                    .match_subscribers(Some(&remote), &record.path, &targets);
            }
            HandlerEvent::Closed { local, remote } => {
                let removed = {
                    let mut state = self.shared.state.lock().expect("network lock poisoned");
                    state.handlers.remove(&(local, remote)).is_some()
                };
                if removed {
                    info!(local = %local, remote = %remote, "session closed");
                    self.shared.pubsub.remove_remote_subscribers(&remote);
                    for listener in self.listeners_for(&remote, &local) {
                        listener.disconnected(&local, &remote);
                    }
                }
            }
        }
    }

    /// A peer subscribed: answer once with matching publishers and keep it
    /// posted through a remote subscriber.
    async fn handle_remote_subscribe(&self, local: NodeId, remote: NodeId, path: String) {
        let handler = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state.handlers.get(&(local, remote)).cloned()
        };
        let Some(handler) = handler else { return };

        debug!(remote = %remote, path = %path, "peer subscribed");
        for record in self.shared.pubsub.match_publishers_subscribe(Some(&remote), &path) {
            if let Err(e) = handler.send_publish(&record).await {
                trace!(error = %e, "publish answer failed");
                return;
            }
        }

        // Re-subscribing replaces the previous forwarding handle.
        self.shared.pubsub.remove_remote_subscriber(&remote, &path);
        self.shared.pubsub.subscribe(
            &path,
            Arc::new(RemoteSubscriber { handler, remote }),
        );
    }

    fn listeners_for(&self, remote: &NodeId, local: &NodeId) -> Vec<Arc<dyn Listener>> {
        let state = self.shared.state.lock().expect("network lock poisoned");
        state
            .listeners
            .get(&(*remote, *local))
            .cloned()
            .unwrap_or_default()
    }

    /// Adopt a completed tunnel handshake as a session.
    fn adopt_session(&self, session: SessionLink) {
        let local = session.local;
        let remote = session.remote;

        // Friend gating: inbound sessions need an authorizing listener.
        if !session.outbound {
            let listeners = self.listeners_for(&remote, &local);
            if listeners.is_empty() || !listeners.iter().any(|l| l.auth(&local, &remote)) {
                debug!(local = %local, remote = %remote, "rejecting unauthorized session");
                return;
            }
        }

        {
            let state = self.shared.state.lock().expect("network lock poisoned");
            if state.handlers.contains_key(&(local, remote)) {
                debug!(local = %local, remote = %remote, "duplicate session dropped");
                return;
            }
        }

        let handler = Handler::spawn(
            session,
            self.shared.store.clone(),
            self.shared.events_tx.clone(),
            self.shared.keepalive,
        );
        self.shared
            .state
            .lock()
            .expect("network lock poisoned")
            .handlers
            .insert((local, remote), handler.clone());
        info!(local = %local, remote = %remote, "session established");

        for listener in self.listeners_for(&remote, &local) {
            listener.connected(&local, &remote);
        }

        // Tell the new peer what we subscribe to.
        let prefixes = self.shared.pubsub.subscribed_prefixes();
        if !prefixes.is_empty() {
            tokio::spawn(async move {
                for prefix in prefixes {
                    if handler.send_subscribe(&prefix).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn handle_tick(&self, ticks: u64) {
        // Callers keep pumping lookups for their targets.
        let targets: Vec<NodeId> = {
            let state = self.shared.state.lock().expect("network lock poisoned");
            state.callers.keys().copied().collect()
        };
        for target in targets {
            self.beacon_retrieve(&target);
        }

        if ticks % PUBLISH_EVERY_TICKS == 0 {
            let node = self.shared.overlay.local_node();

            // Identities with listeners publish where they live and look
            // up where their friends are.
            let (locals, remotes) = {
                let state = self.shared.state.lock().expect("network lock poisoned");
                let mut locals = Vec::new();
                let mut remotes = Vec::new();
                for (remote, local) in state.listeners.keys() {
                    locals.push(*local);
                    remotes.push(*remote);
                }
                (locals, remotes)
            };
            for local in locals {
                self.shared.overlay.store_value(&local, node.as_bytes());
            }
            for remote in remotes {
                self.beacon_retrieve(&remote);
            }

            // Blocks we hold stay discoverable.
            for digest in self.shared.store.block_digests() {
                self.shared.overlay.store_value(&digest, node.as_bytes());
            }
        }

        if ticks % EXPIRE_EVERY_TICKS == 0 {
            self.shared.store.expire();
        }
    }
}

impl NetworkShared {
    fn tunneler_resolver(&self) -> Arc<LocalIdentityResolver> {
        self.tunneler.resolver()
    }
}

/// Forwards matched digests back to a subscribed peer as JSON publish
/// records over its session.
struct RemoteSubscriber {
    handler: Handler,
    remote: NodeId,
}

impl Subscriber for RemoteSubscriber {
    fn incoming(&self, peer: Option<&NodeId>, prefix: &str, subpath: &str, target: &NodeId) -> bool {
        // Do not echo a peer's own publications back at it.
        if peer == Some(&self.remote) {
            return false;
        }
        let path = if subpath == "/" {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, subpath)
        };
        let record = crate::pubsub::PublishRecord::new(path, std::slice::from_ref(target));
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.send_publish(&record).await {
                trace!(error = %e, "remote publish forward failed");
            }
        });
        false
    }

    fn remote(&self) -> Option<NodeId> {
        Some(self.remote)
    }

    fn local_only(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("node", &self.shared.overlay.local_node())
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::test_keypair;
    use crate::overlay::OverlayConfig;

    fn test_network() -> Network {
        let (overlay, inbox) =
            Overlay::new(test_keypair(0).clone(), Store::new(), OverlayConfig::default());
        Network::new(overlay, inbox, &Config::default())
    }

    struct CountingListener {
        seen: std::sync::atomic::AtomicUsize,
    }

    impl Listener for CountingListener {
        fn seen(&self, _local: &NodeId, _remote: &NodeId, _node: &NodeId) {
            self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn identity_registration_enables_sessions() {
        let network = test_network();
        let user = test_keypair(1).clone();
        network.add_identity(user.clone()).unwrap();

        assert!(network.shared.tunneler_resolver().contains(&user.node_id()));
    }

    #[tokio::test]
    async fn connect_requires_known_identity() {
        let network = test_network();
        let unknown = NodeId::hash(b"nobody");
        let remote = NodeId::hash(b"friend");
        let err = network.connect(&unknown, remote).await.unwrap_err();
        assert!(err.to_string().contains("unknown local identity"));
    }

    #[tokio::test]
    async fn value_observation_reaches_listeners() {
        let network = test_network();
        let local = test_keypair(1).node_id();
        let remote = test_keypair(2).node_id();
        let listener = Arc::new(CountingListener { seen: Default::default() });
        network.listen(local, remote, listener.clone());

        let node = NodeId::hash(b"some-node");
        let value = Message {
            ty: MessageType::Value,
            source: Some(remote),
            destination: Some(network.shared.overlay.local_node()),
            content: node.as_bytes().to_vec(),
            ..Message::default()
        };
        network.handle_inbox(value).await;

        assert_eq!(listener.seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_block_publishes_holder() {
        let network = test_network();
        let data = vec![7u8; 500];
        let digest = network.store_block(data.clone());

        assert!(network.shared.store.has_block(&digest));
        // The holder mapping is in the local slice of the distributed
        // store even with no neighbours to propagate to.
        let values = network.shared.store.retrieve_value(&digest);
        assert_eq!(values, vec![network.shared.overlay.local_node().as_bytes().to_vec()]);
    }

    #[tokio::test]
    async fn fetch_times_out_without_holders() {
        let network = test_network();
        let digest = NodeId::hash(b"missing");
        let got = network.fetch(&digest, Duration::from_millis(100)).await;
        assert!(got.is_none());
        assert_eq!(
            network.shared.state.lock().unwrap().callers.len(),
            0,
            "caller registration must be cleaned up"
        );
    }
}
