//! # Overlay Routing Mesh
//!
//! The overlay joins the stream and datagram backends, authenticates every
//! link, and routes records by XOR distance over node identifiers:
//!
//! - **Neighbours**: peers with a live authenticated link. If `x` is a
//!   neighbour, its route is `x` itself.
//! - **Route cache**: best next hop per destination, bounded, invalidated
//!   when the hop disappears or bounces the record back (dead end).
//! - **Path folding**: each node periodically offers its external
//!   addresses; receivers fold the offer toward neighbours at least as
//!   close to the sender, and those may connect back.
//! - **Distributed store traffic**: `Retrieve`/`Store`/`Value` are
//!   processed hop by hop against the local [`Store`]; `Ping`/`Pong`,
//!   `Call`/`Data` and `Tunnel` route transparently toward their
//!   destination and surface in the inbox when they arrive.
//!
//! The routing state lives behind a single mutex; link writers are fed
//! through bounded channels with drop-on-overflow, so the dispatcher never
//! blocks and never fails: it logs and drops.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::identity::{distance_cmp, Keypair, NodeId};
use crate::messages::{deserialize_payload, serialize_payload, Frame, Message, MessageType};
use crate::store::{Store, ValueClass};
use crate::transport::{Backend, SecureLink};

/// Bound on the per-destination route cache.
const ROUTE_CACHE_SIZE: usize = 4096;

/// Outbound queue depth per link; overflow drops the record.
const LINK_QUEUE_SIZE: usize = 256;

/// Inbox depth for records surfaced to the session layer.
const INBOX_SIZE: usize = 256;

/// Tunables the overlay takes from node configuration.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Keepalive: a quiet link sends `Dummy` after this long.
    pub keepalive_timeout: Duration,
    /// Bound on `retrieve_value` waiting for the mesh to answer.
    pub request_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
        }
    }
}

struct LinkHandle {
    tx: mpsc::Sender<Message>,
    addr: SocketAddr,
    generation: u64,
}

#[derive(Default)]
struct OverlayState {
    neighbors: HashMap<NodeId, LinkHandle>,
    routes: Option<LruCache<NodeId, NodeId>>,
    /// Addresses of connected links, used to filter suggested candidates.
    /// Matching is exact: several instances may share one IP.
    remote_addrs: HashSet<SocketAddr>,
    /// This node's own listen/external addresses; suggested candidates
    /// naming one of them are never dialled.
    own_addrs: HashSet<SocketAddr>,
}

impl OverlayState {
    fn routes(&mut self) -> &mut LruCache<NodeId, NodeId> {
        self.routes.get_or_insert_with(|| {
            LruCache::new(NonZeroUsize::new(ROUTE_CACHE_SIZE).expect("cache size is non-zero"))
        })
    }
}

struct OverlayShared {
    keypair: Keypair,
    local_node: NodeId,
    store: Store,
    config: OverlayConfig,
    state: Mutex<OverlayState>,
    inbox_tx: mpsc::Sender<Message>,
    /// Keys with an in-flight `retrieve_value`, woken by Store/Value.
    pending_retrieve: Mutex<HashSet<NodeId>>,
    retrieve_notify: Notify,
    generation: AtomicU64,
    backends: Mutex<Vec<Arc<dyn Backend>>>,
}

/// Handle to the overlay. Cheap to clone.
#[derive(Clone)]
pub struct Overlay {
    shared: Arc<OverlayShared>,
}

impl Overlay {
    /// Create the overlay; the returned receiver is the inbox of records
    /// addressed to this node (`Value`, `Pong`, `Call`, `Data`, `Tunnel`).
    pub fn new(
        keypair: Keypair,
        store: Store,
        config: OverlayConfig,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_SIZE);
        let local_node = keypair.node_id();
        let overlay = Self {
            shared: Arc::new(OverlayShared {
                keypair,
                local_node,
                store,
                config,
                state: Mutex::new(OverlayState::default()),
                inbox_tx,
                pending_retrieve: Mutex::new(HashSet::new()),
                retrieve_notify: Notify::new(),
                generation: AtomicU64::new(0),
                backends: Mutex::new(Vec::new()),
            }),
        };
        (overlay, inbox_rx)
    }

    pub fn local_node(&self) -> NodeId {
        self.shared.local_node
    }

    pub fn keypair(&self) -> &Keypair {
        &self.shared.keypair
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// Attach the endpoint backends and start their accept loops.
    pub fn start(&self, backends: Vec<Arc<dyn Backend>>) {
        *self.shared.backends.lock().expect("overlay lock poisoned") = backends.clone();
        for backend in backends {
            let overlay = self.clone();
            tokio::spawn(async move {
                loop {
                    match backend.accept().await {
                        Ok(link) => overlay.register_link(link),
                        Err(e) => {
                            warn!(error = %e, "backend accept loop ended");
                            break;
                        }
                    }
                }
            });
        }
    }

    pub fn neighbor_count(&self) -> usize {
        self.shared.state.lock().expect("overlay lock poisoned").neighbors.len()
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        let state = self.shared.state.lock().expect("overlay lock poisoned");
        state.neighbors.keys().copied().collect()
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.shared
            .state
            .lock()
            .expect("overlay lock poisoned")
            .neighbors
            .contains_key(node)
    }

    /// Register this node's own listen and external addresses. Offers and
    /// tracker entries circle back through the mesh, so candidates naming
    /// one of these are dropped before any dial.
    pub fn set_local_addresses(&self, addrs: &[SocketAddr]) {
        let mut state = self.shared.state.lock().expect("overlay lock poisoned");
        state.own_addrs = addrs.iter().copied().collect();
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Try to connect to a peer on any backend, preferring the order the
    /// backends were attached in. Addresses of existing neighbours and this
    /// node's own addresses are skipped up front.
    pub async fn connect(&self, addrs: &[SocketAddr], remote: Option<NodeId>) -> Result<bool> {
        if let Some(remote) = remote {
            if remote == self.shared.local_node || self.is_connected(&remote) {
                return Ok(true);
            }
        }

        let filtered: Vec<SocketAddr> = {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            addrs
                .iter()
                .filter(|a| !state.remote_addrs.contains(a) && !state.own_addrs.contains(a))
                .copied()
                .collect()
        };
        if filtered.is_empty() {
            return Ok(false);
        }

        let backends = self.shared.backends.lock().expect("overlay lock poisoned").clone();
        for backend in backends {
            for addr in &filtered {
                match backend.connect_addr(*addr, remote).await {
                    Ok(link) => {
                        self.register_link(link);
                        return Ok(true);
                    }
                    Err(e) => {
                        trace!(addr = %addr, error = %e, "connect attempt failed");
                    }
                }
            }
        }
        Ok(false)
    }

    /// Same as [`connect`](Self::connect), detached.
    pub fn connect_async(&self, addrs: Vec<SocketAddr>, remote: Option<NodeId>) {
        let overlay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = overlay.connect(&addrs, remote).await {
                debug!(error = %e, "async connect failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------

    /// Adopt an authenticated link as a neighbour and spawn its read and
    /// write loops.
    pub fn register_link(&self, link: SecureLink) {
        let SecureLink { stream, remote, addr } = link;
        if remote == self.shared.local_node {
            debug!("refusing link to self");
            return;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(LINK_QUEUE_SIZE);
        let (read_half, write_half) = tokio::io::split(stream);

        {
            let mut state = self.shared.state.lock().expect("overlay lock poisoned");
            state.remote_addrs.insert(addr);
            // A newer link for the same node replaces the old handle; the
            // old loops notice when their generation no longer matches.
            state
                .neighbors
                .insert(remote, LinkHandle { tx: tx.clone(), addr, generation });
        }
        info!(remote = %remote, addr = %addr, "neighbour registered");

        // Writer: drains the queue, keepalives when quiet.
        let keepalive = self.shared.config.keepalive_timeout;
        tokio::spawn(async move {
            let mut rx = rx;
            let mut write_half = write_half;
            // An immediate record lets stream-per-connection transports
            // materialise the link on the passive side.
            let mut next: Option<Message> = Some(Message::new(MessageType::Dummy));
            loop {
                let message = match next.take() {
                    Some(m) => m,
                    None => match timeout(keepalive, rx.recv()).await {
                        Ok(Some(m)) => m,
                        Ok(None) => break,
                        Err(_) => Message::new(MessageType::Dummy),
                    },
                };
                if let Err(e) = message.to_frame().write_to(&mut write_half).await {
                    debug!(error = %e, "link write failed");
                    break;
                }
            }
        });

        // Reader: frames records into the dispatcher until the link dies.
        let overlay = self.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                let frame = match Frame::read_from(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(remote = %remote, error = %e, "link closed");
                        break;
                    }
                };
                let mut message = match Message::from_frame(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        // Parse errors are fatal for this link only.
                        warn!(remote = %remote, error = %e, "protocol error on link");
                        break;
                    }
                };
                if message.ty == MessageType::Dummy {
                    continue;
                }
                if message.source.is_none() || message.ttl == 0 {
                    continue;
                }
                message.ttl -= 1;
                overlay.incoming(message, Some(remote)).await;
            }
            overlay.unregister_link(&remote, generation);
        });
    }

    fn unregister_link(&self, remote: &NodeId, generation: u64) {
        let mut state = self.shared.state.lock().expect("overlay lock poisoned");
        let current = state
            .neighbors
            .get(remote)
            .map(|handle| (handle.generation, handle.addr));
        let removed = matches!(current, Some((g, _)) if g == generation);
        if removed {
            let (_, addr) = current.expect("checked above");
            state.neighbors.remove(remote);
            state.remote_addrs.remove(&addr);
            // Cached routes through the lost neighbour are stale.
            let stale: Vec<NodeId> = state
                .routes()
                .iter()
                .filter(|(_, hop)| *hop == remote)
                .map(|(dest, _)| *dest)
                .collect();
            for dest in stale {
                state.routes().pop(&dest);
            }
            info!(remote = %remote, "neighbour lost");
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Deliver a record to the neighbour closest to its destination.
    ///
    /// Returns false when there is nothing useful to do: no neighbours, or
    /// the destination is this node.
    pub fn send(&self, mut message: Message) -> bool {
        if message.source.is_none() {
            message.source = Some(self.shared.local_node);
        }
        let state = self.shared.state.lock().expect("overlay lock poisoned");
        if state.neighbors.is_empty() {
            return false;
        }
        let Some(destination) = message.destination else {
            drop(state);
            return self.broadcast(message, None);
        };
        if destination == self.shared.local_node {
            return false;
        }

        if state.neighbors.contains_key(&destination) {
            return Self::send_on(&state, &message, &destination);
        }

        // Closest neighbour to the destination.
        let mut best: Option<(NodeId, [u8; 64])> = None;
        for node in state.neighbors.keys() {
            let d = destination.xor_distance(node);
            match &best {
                Some((_, current)) if distance_cmp(&d, current) != std::cmp::Ordering::Less => {}
                _ => best = Some((*node, d)),
            }
        }
        match best {
            Some((node, _)) => Self::send_on(&state, &message, &node),
            None => false,
        }
    }

    /// Send to every neighbour except `except`.
    pub fn broadcast(&self, mut message: Message, except: Option<NodeId>) -> bool {
        if message.source.is_none() {
            message.source = Some(self.shared.local_node);
        }
        let state = self.shared.state.lock().expect("overlay lock poisoned");
        let mut any = false;
        for node in state.neighbors.keys() {
            if Some(*node) == except {
                continue;
            }
            any |= Self::send_on(&state, &message, node);
        }
        any
    }

    fn send_on(state: &OverlayState, message: &Message, to: &NodeId) -> bool {
        let Some(handle) = state.neighbors.get(to) else {
            return false;
        };
        match handle.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(to = %to, "link queue full, dropping record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Neighbours (and this node) ordered by distance to `target`.
    fn sorted_candidates(&self, state: &OverlayState, target: &NodeId) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = state.neighbors.keys().copied().collect();
        // The local node is appended before sorting so equidistant targets
        // resolve to self and terminate here.
        all.push(self.shared.local_node);
        all.sort_by(|a, b| {
            distance_cmp(&target.xor_distance(a), &target.xor_distance(b))
        });
        all
    }

    /// Neighbours strictly closer to `target` than this node.
    fn closer_neighbors(&self, state: &OverlayState, target: &NodeId) -> Vec<NodeId> {
        let sorted = self.sorted_candidates(state, target);
        sorted
            .into_iter()
            .take_while(|n| *n != self.shared.local_node)
            .collect()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch a record received from `from` (or locally originated when
    /// `from` is `None`).
    pub async fn incoming(&self, message: Message, from: Option<NodeId>) {
        // Routable records not addressed to us are forwarded and never
        // consumed here.
        if message.ty.is_routable() {
            if let Some(destination) = message.destination {
                if destination != self.shared.local_node {
                    self.route(message, from);
                    return;
                }
            }
        }

        match message.ty {
            MessageType::Dummy => {}
            MessageType::Offer => self.incoming_offer(message),
            MessageType::Suggest => self.incoming_suggest(message),
            MessageType::Retrieve => self.incoming_retrieve(message, from),
            MessageType::Store => self.incoming_store(message, from),
            MessageType::Value => self.incoming_value(message, from).await,
            MessageType::Ping => {
                let Some(source) = message.source else { return };
                trace!(from = %source, "ping");
                self.send(Message::to(MessageType::Pong, source, message.content));
            }
            MessageType::Pong | MessageType::Call | MessageType::Data | MessageType::Tunnel => {
                self.push(message).await;
            }
        }
    }

    /// Surface a record to the session layer.
    async fn push(&self, message: Message) {
        if self.shared.inbox_tx.send(message).await.is_err() {
            trace!("inbox gone, dropping record");
        }
    }

    /// Path folding: rewrite an offer to `Suggest` and forward it to every
    /// neighbour at least as close to the offering node as we are.
    fn incoming_offer(&self, message: Message) {
        let Some(source) = message.source else { return };
        if source == self.shared.local_node {
            return;
        }
        let own_distance = source.xor_distance(&self.shared.local_node);

        let targets: Vec<NodeId> = {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            state
                .neighbors
                .keys()
                .filter(|n| {
                    **n != source
                        && distance_cmp(&source.xor_distance(n), &own_distance)
                            != std::cmp::Ordering::Greater
                })
                .copied()
                .collect()
        };

        for target in targets {
            let suggest = Message {
                ty: MessageType::Suggest,
                ttl: message.ttl,
                source: Some(source),
                destination: Some(target),
                content: message.content.clone(),
                ..Message::default()
            };
            self.send(suggest);
        }
    }

    /// A folded offer reached us: connect to the carried addresses on
    /// behalf of the offering node.
    fn incoming_suggest(&self, message: Message) {
        let Some(source) = message.source else { return };
        if source == self.shared.local_node || self.is_connected(&source) {
            return;
        }
        let Ok(addrs) = deserialize_payload::<Vec<SocketAddr>>(&message.content) else {
            debug!(from = %source, "malformed suggest payload");
            return;
        };
        debug!(node = %source, count = addrs.len(), "suggest: attempting connection");
        self.connect_async(addrs, Some(source));
    }

    fn incoming_retrieve(&self, message: Message, from: Option<NodeId>) {
        let Some(key) = message.destination else { return };
        let Some(requester) = message.source else { return };

        // Keep the lookup moving toward the key.
        let next = {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            self.closer_neighbors(&state, &key)
                .into_iter()
                .find(|n| Some(*n) != from)
        };
        if let Some(next) = next {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            Self::send_on(&state, &message, &next);
        }

        // Answer whatever we hold.
        for value in self.shared.store.retrieve_value(&key) {
            let answer = Message {
                ty: MessageType::Value,
                source: Some(key),
                destination: Some(requester),
                content: value,
                ..Message::default()
            };
            self.send(answer);
        }
    }

    fn incoming_store(&self, message: Message, from: Option<NodeId>) {
        let Some(key) = message.destination else { return };

        self.shared
            .store
            .store_value(&key, &message.content, ValueClass::Distributed);
        self.wake_retrieve(&key);

        // Forward to every neighbour strictly closer to the key, with
        // ourselves as the new source.
        let targets: Vec<NodeId> = {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            self.closer_neighbors(&state, &key)
                .into_iter()
                .filter(|n| Some(*n) != from)
                .collect()
        };
        let forwarded = Message {
            source: Some(self.shared.local_node),
            ..message
        };
        let state = self.shared.state.lock().expect("overlay lock poisoned");
        for target in targets {
            Self::send_on(&state, &forwarded, &target);
        }
    }

    async fn incoming_value(&self, message: Message, from: Option<NodeId>) {
        let Some(key) = message.source else { return };

        self.shared
            .store
            .store_value(&key, &message.content, ValueClass::Distributed);
        self.wake_retrieve(&key);

        match message.destination {
            Some(destination) if destination != self.shared.local_node => {
                // Keep moving toward the requester.
                self.route(message, from);
            }
            _ => {
                // Ours: surface it so callers can react to holder
                // announcements.
                self.push(message).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Forward a routable record toward its destination.
    fn route(&self, message: Message, from: Option<NodeId>) -> bool {
        if message.ttl == 0 {
            return false;
        }
        let Some(destination) = message.destination else {
            return false;
        };
        if destination == self.shared.local_node {
            return false;
        }

        let mut state = self.shared.state.lock().expect("overlay lock poisoned");
        if state.neighbors.is_empty() {
            return false;
        }

        // Best guess for the way back to the source.
        if let (Some(from), Some(source)) = (from, message.source) {
            if state.routes().peek(&source).is_none() {
                state.routes().put(source, from);
            }
        }

        if state.neighbors.contains_key(&destination) {
            return Self::send_on(&state, &message, &destination);
        }

        // A cached hop that is no longer a neighbour is forgotten outright.
        let cached = match state.routes().get(&destination).copied() {
            Some(hop) if !state.neighbors.contains_key(&hop) => {
                state.routes().pop(&destination);
                None
            }
            cached => cached,
        };

        let next = match cached {
            Some(hop) if Some(hop) != from => Some(hop),
            cached => {
                // No route, or a dead end (the record came back from the
                // cached hop): pick afresh from the sorted candidates.
                let sorted = self.sorted_candidates(&state, &destination);
                let fresh = match cached {
                    Some(dead_end) => sorted
                        .iter()
                        .skip_while(|n| **n != dead_end)
                        .skip(1)
                        .find(|n| **n != self.shared.local_node && Some(**n) != from)
                        .copied(),
                    None => sorted
                        .into_iter()
                        .find(|n| Some(*n) != from)
                        .filter(|n| *n != self.shared.local_node),
                };
                match fresh {
                    Some(hop) => {
                        state.routes().put(destination, hop);
                        Some(hop)
                    }
                    None => {
                        state.routes().pop(&destination);
                        None
                    }
                }
            }
        };

        match next {
            Some(hop) => Self::send_on(&state, &message, &hop),
            None => {
                trace!(destination = %destination, "no route, dropping");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Distributed store operations
    // ------------------------------------------------------------------

    /// Insert a value locally and propagate it toward the nodes closest to
    /// the key.
    pub fn store_value(&self, key: &NodeId, value: &[u8]) {
        self.shared.store.store_value(key, value, ValueClass::Distributed);

        let message = Message {
            ty: MessageType::Store,
            source: Some(self.shared.local_node),
            destination: Some(*key),
            content: value.to_vec(),
            ..Message::default()
        };

        let targets: Vec<NodeId> = {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            self.closer_neighbors(&state, key)
        };
        if targets.is_empty() {
            self.send(message);
        } else {
            let state = self.shared.state.lock().expect("overlay lock poisoned");
            for target in targets {
                Self::send_on(&state, &message, &target);
            }
        }
    }

    /// Ask the mesh for the values under a key, waiting up to
    /// `request_timeout` for answers, then return the local view.
    pub async fn retrieve_value(&self, key: &NodeId) -> Vec<Vec<u8>> {
        let sent = {
            let should_send = {
                let mut pending =
                    self.shared.pending_retrieve.lock().expect("overlay lock poisoned");
                pending.insert(*key)
            };
            if should_send {
                // Prefer a strictly closer neighbour; fall back to the
                // closest one so the lookup always leaves this node.
                let message = Message {
                    ty: MessageType::Retrieve,
                    source: Some(self.shared.local_node),
                    destination: Some(*key),
                    ..Message::default()
                };
                let next = {
                    let state = self.shared.state.lock().expect("overlay lock poisoned");
                    self.closer_neighbors(&state, key).into_iter().next()
                };
                match next {
                    Some(next) => {
                        let state = self.shared.state.lock().expect("overlay lock poisoned");
                        Self::send_on(&state, &message, &next)
                    }
                    None => self.send(message),
                }
            } else {
                false
            }
        };

        if sent {
            let deadline = tokio::time::Instant::now() + self.shared.config.request_timeout;
            loop {
                // Register interest before checking the condition so a
                // wakeup between the two is not lost.
                let notified = self.shared.retrieve_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let pending =
                        self.shared.pending_retrieve.lock().expect("overlay lock poisoned");
                    if !pending.contains(key) {
                        break;
                    }
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
        }

        self.shared
            .pending_retrieve
            .lock()
            .expect("overlay lock poisoned")
            .remove(key);
        self.shared.store.retrieve_value(key)
    }

    fn wake_retrieve(&self, key: &NodeId) {
        let mut pending = self.shared.pending_retrieve.lock().expect("overlay lock poisoned");
        if pending.remove(key) {
            self.shared.retrieve_notify.notify_waiters();
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Broadcast this node's external addresses as an `Offer`.
    pub fn broadcast_offer(&self, addrs: &[SocketAddr]) {
        if addrs.is_empty() {
            return;
        }
        let Ok(content) = serialize_payload(&addrs.to_vec()) else { return };
        let offer = Message {
            ty: MessageType::Offer,
            source: Some(self.shared.local_node),
            content,
            ..Message::default()
        };
        self.broadcast(offer, None);
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("local_node", &self.shared.local_node)
            .field("neighbors", &self.neighbor_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::test_keypair;
    use std::sync::atomic::AtomicUsize;

    fn test_overlay() -> (Overlay, mpsc::Receiver<Message>) {
        Overlay::new(test_keypair(0).clone(), Store::new(), OverlayConfig::default())
    }

    /// A backend that refuses every dial but counts the attempts.
    #[derive(Default)]
    struct CountingBackend {
        dials: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Backend for CountingBackend {
        async fn accept(&self) -> Result<SecureLink> {
            std::future::pending().await
        }

        async fn connect_addr(
            &self,
            _addr: SocketAddr,
            _remote: Option<NodeId>,
        ) -> Result<SecureLink> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("refused by test backend")
        }

        fn local_port(&self) -> u16 {
            0
        }
    }

    /// A fake neighbour: a registered handle plus the receiving end of its
    /// link queue.
    fn attach_neighbor(overlay: &Overlay, id: NodeId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_SIZE);
        let mut state = overlay.shared.state.lock().unwrap();
        let generation = overlay.shared.generation.fetch_add(1, Ordering::SeqCst);
        state.neighbors.insert(
            id,
            LinkHandle {
                tx,
                addr: "127.0.0.1:1".parse().unwrap(),
                generation,
            },
        );
        rx
    }

    fn id_at_distance(from: &NodeId, flip_byte: usize) -> NodeId {
        let mut bytes = *from.as_bytes();
        bytes[flip_byte] ^= 0xFF;
        NodeId::from_bytes(bytes)
    }

    fn id_flipping(from: &NodeId, flip_bytes: &[usize]) -> NodeId {
        let mut bytes = *from.as_bytes();
        for &b in flip_bytes {
            bytes[b] ^= 0xFF;
        }
        NodeId::from_bytes(bytes)
    }

    #[tokio::test]
    async fn send_picks_closest_neighbor() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();

        // far flips the first byte, near the last: near is closer to any
        // destination that differs from local only late in the identifier.
        let far = id_at_distance(&local, 0);
        let near = id_at_distance(&local, 60);
        let mut far_rx = attach_neighbor(&overlay, far);
        let mut near_rx = attach_neighbor(&overlay, near);

        let destination = id_at_distance(&local, 63);
        assert!(overlay.send(Message::to(MessageType::Ping, destination, vec![])));

        let got = near_rx.try_recv().expect("closest neighbour must receive");
        assert_eq!(got.ty, MessageType::Ping);
        assert!(far_rx.try_recv().is_err(), "farther neighbour must not receive");
    }

    #[tokio::test]
    async fn send_to_self_is_dropped() {
        let (overlay, _inbox) = test_overlay();
        let _rx = attach_neighbor(&overlay, id_at_distance(&overlay.local_node(), 0));
        assert!(!overlay.send(Message::to(MessageType::Ping, overlay.local_node(), vec![])));
    }

    #[tokio::test]
    async fn send_without_neighbors_fails() {
        let (overlay, _inbox) = test_overlay();
        let destination = id_at_distance(&overlay.local_node(), 0);
        assert!(!overlay.send(Message::to(MessageType::Ping, destination, vec![])));
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let (overlay, _inbox) = test_overlay();
        let peer = id_at_distance(&overlay.local_node(), 0);
        let mut rx = attach_neighbor(&overlay, peer);

        let ping = Message {
            ty: MessageType::Ping,
            source: Some(peer),
            destination: Some(overlay.local_node()),
            content: b"hi".to_vec(),
            ..Message::default()
        };
        overlay.incoming(ping, Some(peer)).await;

        let pong = rx.try_recv().expect("pong must be sent");
        assert_eq!(pong.ty, MessageType::Pong);
        assert_eq!(pong.destination, Some(peer));
        assert_eq!(pong.content, b"hi");
    }

    #[tokio::test]
    async fn routable_records_are_forwarded_with_route_learning() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();

        let previous_hop = id_at_distance(&local, 1);
        let next_hop = id_at_distance(&local, 62);
        let _prev_rx = attach_neighbor(&overlay, previous_hop);
        let mut next_rx = attach_neighbor(&overlay, next_hop);

        let origin = id_at_distance(&local, 2);
        // Closest candidate to this destination is next_hop, then the local
        // node, then previous_hop.
        let destination = id_flipping(&local, &[62, 63]);

        let message = Message {
            ty: MessageType::Ping,
            ttl: 5,
            source: Some(origin),
            destination: Some(destination),
            ..Message::default()
        };
        overlay.incoming(message, Some(previous_hop)).await;

        let forwarded = next_rx.try_recv().expect("record must be forwarded");
        assert_eq!(forwarded.ttl, 5, "route() does not decrement (the receive loop does)");

        // The way back to the origin was learnt from the traversal.
        let mut state = overlay.shared.state.lock().unwrap();
        assert_eq!(state.routes().get(&origin).copied(), Some(previous_hop));
    }

    #[tokio::test]
    async fn zero_ttl_never_forwarded() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();
        let neighbor = id_at_distance(&local, 60);
        let mut rx = attach_neighbor(&overlay, neighbor);

        let message = Message {
            ty: MessageType::Ping,
            ttl: 0,
            source: Some(id_at_distance(&local, 1)),
            destination: Some(id_at_distance(&local, 63)),
            ..Message::default()
        };
        assert!(!overlay.route(message, None));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_end_invalidates_cached_route() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();

        let hop_a = id_at_distance(&local, 62);
        let hop_b = id_at_distance(&local, 61);
        let mut rx_a = attach_neighbor(&overlay, hop_a);
        let mut rx_b = attach_neighbor(&overlay, hop_b);

        // Candidate order for this destination: hop_b, hop_a, local.
        let destination = id_flipping(&local, &[61, 62, 63]);

        // First pass caches the closest hop.
        let message = Message {
            ty: MessageType::Ping,
            ttl: 5,
            source: Some(id_at_distance(&local, 2)),
            destination: Some(destination),
            ..Message::default()
        };
        assert!(overlay.route(message.clone(), None));
        assert!(rx_b.try_recv().is_ok());

        // The record coming back from that hop is a dead end; the route
        // must move to the next candidate.
        assert!(overlay.route(message, Some(hop_b)));
        assert!(rx_a.try_recv().is_ok(), "dead end must reroute to the next neighbour");
        let mut state = overlay.shared.state.lock().unwrap();
        assert_eq!(state.routes().get(&destination).copied(), Some(hop_a));
    }

    #[tokio::test]
    async fn route_drops_when_self_is_closest() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();

        // The only neighbour is farther from the destination than we are.
        let far = id_at_distance(&local, 0);
        let mut rx = attach_neighbor(&overlay, far);

        let destination = id_at_distance(&local, 63);
        let message = Message {
            ty: MessageType::Ping,
            ttl: 5,
            source: Some(far),
            destination: Some(destination),
            ..Message::default()
        };
        assert!(!overlay.route(message, Some(far)), "self as closest candidate drops");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_neighbor_drops_its_routes() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();
        let hop = id_at_distance(&local, 62);
        let _rx = attach_neighbor(&overlay, hop);

        // hop is closer to this destination than the local node.
        let destination = id_flipping(&local, &[62, 63]);
        let message = Message {
            ty: MessageType::Ping,
            ttl: 5,
            source: Some(id_at_distance(&local, 2)),
            destination: Some(destination),
            ..Message::default()
        };
        assert!(overlay.route(message, None));

        let generation = overlay.shared.state.lock().unwrap().neighbors[&hop].generation;
        overlay.unregister_link(&hop, generation);

        let mut state = overlay.shared.state.lock().unwrap();
        assert!(state.routes().peek(&destination).is_none());
    }

    #[tokio::test]
    async fn own_addresses_are_never_dialled() {
        let (overlay, _inbox) = test_overlay();
        let backend = Arc::new(CountingBackend::default());
        overlay.start(vec![backend.clone() as Arc<dyn Backend>]);

        let own: SocketAddr = "192.0.2.10:9000".parse().unwrap();
        overlay.set_local_addresses(&[own]);

        // A candidate list naming only our own address is filtered before
        // any dial happens.
        let connected = overlay.connect(&[own], None).await.unwrap();
        assert!(!connected);
        assert_eq!(
            backend.dials.load(Ordering::SeqCst),
            0,
            "own address must not be dialled"
        );

        // Foreign addresses in the same list still get dialled.
        let other: SocketAddr = "192.0.2.11:9000".parse().unwrap();
        let connected = overlay.connect(&[other, own], None).await.unwrap();
        assert!(!connected);
        assert_eq!(
            backend.dials.load(Ordering::SeqCst),
            1,
            "only the foreign address is dialled"
        );
    }

    #[tokio::test]
    async fn suggest_naming_own_address_does_not_dial() {
        let (overlay, _inbox) = test_overlay();
        let backend = Arc::new(CountingBackend::default());
        overlay.start(vec![backend.clone() as Arc<dyn Backend>]);

        let own: SocketAddr = "192.0.2.20:9000".parse().unwrap();
        overlay.set_local_addresses(&[own]);

        let offerer = id_at_distance(&overlay.local_node(), 7);
        let relay = id_at_distance(&overlay.local_node(), 1);
        let suggest = Message {
            ty: MessageType::Suggest,
            source: Some(offerer),
            destination: Some(overlay.local_node()),
            content: serialize_payload(&vec![own]).unwrap(),
            ..Message::default()
        };
        overlay.incoming(suggest, Some(relay)).await;

        // The connect attempt is detached; give it a moment, then confirm
        // the filter kept the dialler idle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            backend.dials.load(Ordering::SeqCst),
            0,
            "suggest carrying our own address must not trigger a dial"
        );
    }

    #[tokio::test]
    async fn offer_folds_toward_closer_neighbors() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();

        // The offering node flips byte 8; a neighbour sharing that flip is
        // much closer to it than we are, a neighbour flipping byte 0 is
        // farther.
        let offerer = id_at_distance(&local, 8);
        let mut close_bytes = *offerer.as_bytes();
        close_bytes[63] ^= 0x01;
        let close = NodeId::from_bytes(close_bytes);
        let far = id_at_distance(&local, 0);

        let mut close_rx = attach_neighbor(&overlay, close);
        let mut far_rx = attach_neighbor(&overlay, far);

        let addrs: Vec<SocketAddr> = vec!["203.0.113.5:9000".parse().unwrap()];
        let offer = Message {
            ty: MessageType::Offer,
            source: Some(offerer),
            content: serialize_payload(&addrs).unwrap(),
            ..Message::default()
        };
        overlay.incoming(offer, Some(offerer)).await;

        let folded = close_rx.try_recv().expect("closer neighbour must get a suggest");
        assert_eq!(folded.ty, MessageType::Suggest);
        assert_eq!(folded.source, Some(offerer));
        let carried: Vec<SocketAddr> = deserialize_payload(&folded.content).unwrap();
        assert_eq!(carried, addrs);

        assert!(far_rx.try_recv().is_err(), "farther neighbour must not get a suggest");
    }

    #[tokio::test]
    async fn retrieve_answers_from_local_store() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();
        let requester = id_at_distance(&local, 5);
        let mut rx = attach_neighbor(&overlay, requester);

        let key = NodeId::hash(b"key");
        overlay.shared.store.store_value(&key, b"stored", ValueClass::Distributed);

        let retrieve = Message {
            ty: MessageType::Retrieve,
            source: Some(requester),
            destination: Some(key),
            ..Message::default()
        };
        overlay.incoming(retrieve, Some(requester)).await;

        let value = rx.try_recv().expect("value answer expected");
        assert_eq!(value.ty, MessageType::Value);
        assert_eq!(value.source, Some(key), "the key travels in the source field");
        assert_eq!(value.destination, Some(requester));
        assert_eq!(value.content, b"stored");
    }

    #[tokio::test]
    async fn store_message_inserted_and_forwarded_closer() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();
        let key = NodeId::hash(b"key");

        // One neighbour right next to the key, one at maximum distance
        // from it (every byte flipped), so the orderings are deterministic.
        let mut closer_bytes = *key.as_bytes();
        closer_bytes[63] ^= 0x01;
        let closer = NodeId::from_bytes(closer_bytes);
        let farther = id_flipping(&key, &(0..64).collect::<Vec<_>>());
        let sender = id_at_distance(&local, 1);

        let mut closer_rx = attach_neighbor(&overlay, closer);
        let mut farther_rx = attach_neighbor(&overlay, farther);
        let _sender_rx = attach_neighbor(&overlay, sender);

        let store_msg = Message {
            ty: MessageType::Store,
            source: Some(sender),
            destination: Some(key),
            content: b"value".to_vec(),
            ..Message::default()
        };
        overlay.incoming(store_msg, Some(sender)).await;

        assert_eq!(overlay.shared.store.retrieve_value(&key), vec![b"value".to_vec()]);

        let forwarded = closer_rx.try_recv().expect("closer neighbour gets the store");
        assert_eq!(forwarded.source, Some(local), "forwarded store names us as source");
        assert!(farther_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn value_wakes_pending_retrieve() {
        let (overlay, _inbox) = test_overlay();
        let local = overlay.local_node();
        let key = NodeId::hash(b"wanted");
        // The holder sits right next to the key so the retrieve is sent.
        let holder = id_at_distance(&key, 63);
        let _rx = attach_neighbor(&overlay, holder);

        let waiter = {
            let overlay = overlay.clone();
            tokio::spawn(async move { overlay.retrieve_value(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = Message {
            ty: MessageType::Value,
            source: Some(key),
            destination: Some(local),
            content: b"answer".to_vec(),
            ..Message::default()
        };
        overlay.incoming(value, Some(holder)).await;

        let values = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(values, vec![b"answer".to_vec()]);
    }
}
