//! # Per-Peer Session Handler
//!
//! One handler exists per (local identity, remote identity) pair, running
//! over the authenticated tunnel stream between them. Records reuse the
//! overlay frame layout with a session-local type space:
//!
//! | Record | Content |
//! |--------|---------|
//! | `Notify` | `[sequence:u32][payload]`, retransmitted until acked |
//! | `Ack` | `[sequence:u32]` |
//! | `Call` | `[target:64][tokens:u16]`, grants fountain send budget |
//! | `Cancel` | `[target:64]`, stops a transfer |
//! | `Data` | `[target:64][combination]` |
//! | `Publish` | JSON `{path, targets}` |
//! | `Subscribe` | JSON `{path}` |
//!
//! Notifications carry a per-sender monotonic sequence and are delivered
//! at least once: unacked records retransmit up to [`RETRANSMIT_COUNT`]
//! times with exponential backoff, then surface as failed delivery.
//! Receivers ack every copy and deduplicate by sequence.
//!
//! The fountain sender is shaped by tokens: every `Data` record consumes
//! one token granted by `Call` records, so a quiet receiver stops the
//! sender. Record and higher-level semantics (publish/subscribe matching,
//! listener callbacks) are the session layer's business; the handler
//! reports them as [`HandlerEvent`]s.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::fountain::Combination;
use crate::identity::{NodeId, NODE_ID_LEN};
use crate::messages::{deserialize_payload, serialize_payload, Frame, WireError, DEFAULT_TTL};
use crate::pubsub::{PublishRecord, SubscribeRecord};
use crate::store::Store;
use crate::tunneler::SessionLink;

/// Session record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Dummy = 0x00,
    Notify = 0x01,
    Ack = 0x02,
    Call = 0x03,
    Cancel = 0x04,
    Data = 0x05,
    Publish = 0x06,
    Subscribe = 0x07,
}

impl TryFrom<u8> for RecordType {
    type Error = WireError;

    fn try_from(value: u8) -> std::result::Result<Self, WireError> {
        Ok(match value {
            0x00 => RecordType::Dummy,
            0x01 => RecordType::Notify,
            0x02 => RecordType::Ack,
            0x03 => RecordType::Call,
            0x04 => RecordType::Cancel,
            0x05 => RecordType::Data,
            0x06 => RecordType::Publish,
            0x07 => RecordType::Subscribe,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Unacked notifications retransmit this many times before giving up.
pub const RETRANSMIT_COUNT: u32 = 5;

/// Base delay before the first retransmission; doubles each round.
pub const RETRANSMIT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Sequences remembered for duplicate suppression.
const DEDUP_WINDOW: usize = 1024;

/// Token budget cap per transfer target.
const MAX_TOKENS_PER_TARGET: u32 = 1024;

/// Outbound record queue depth.
const OUT_QUEUE_SIZE: usize = 64;

/// What a session reports to the layer above.
#[derive(Debug)]
pub enum HandlerEvent {
    /// The session is up and records may be exchanged.
    Established { local: NodeId, remote: NodeId },
    /// A fresh (non-duplicate) notification arrived.
    Notification { local: NodeId, remote: NodeId, payload: Vec<u8> },
    /// A notification exhausted its retransmissions without an ack.
    NotificationFailed { local: NodeId, remote: NodeId, sequence: u32 },
    /// The peer announced published digests.
    Publish { local: NodeId, remote: NodeId, record: PublishRecord },
    /// The peer subscribed to a path.
    Subscribe { local: NodeId, remote: NodeId, path: String },
    /// The session ended; pending sends are cancelled.
    Closed { local: NodeId, remote: NodeId },
}

#[derive(Default)]
struct SenderState {
    /// Transfer targets and their remaining token budget, round-robin.
    targets: Vec<(NodeId, u32)>,
    next: usize,
}

struct NotificationState {
    next_sequence: u32,
    unacked: HashSet<u32>,
    received: LruCache<u32, ()>,
}

impl Default for NotificationState {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            unacked: HashSet::new(),
            received: LruCache::new(NonZeroUsize::new(DEDUP_WINDOW).expect("window is non-zero")),
        }
    }
}

struct HandlerShared {
    local: NodeId,
    remote: NodeId,
    out_tx: mpsc::Sender<Frame>,
    store: Store,
    events: mpsc::Sender<HandlerEvent>,
    sender: Mutex<SenderState>,
    sender_notify: Notify,
    notifications: Mutex<NotificationState>,
    retransmit_base: Duration,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Handler {
    shared: Arc<HandlerShared>,
}

impl Handler {
    /// Adopt an authenticated session and start its loops.
    pub fn spawn(
        session: SessionLink,
        store: Store,
        events: mpsc::Sender<HandlerEvent>,
        keepalive: Duration,
    ) -> Handler {
        Self::spawn_with_retransmit(session, store, events, keepalive, RETRANSMIT_BASE_DELAY)
    }

    fn spawn_with_retransmit(
        session: SessionLink,
        store: Store,
        events: mpsc::Sender<HandlerEvent>,
        keepalive: Duration,
        retransmit_base: Duration,
    ) -> Handler {
        let SessionLink { stream, local, remote, .. } = session;
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_SIZE);
        let shared = Arc::new(HandlerShared {
            local,
            remote,
            out_tx,
            store,
            events,
            sender: Mutex::new(SenderState::default()),
            sender_notify: Notify::new(),
            notifications: Mutex::new(NotificationState::default()),
            retransmit_base,
        });
        let handler = Handler { shared: shared.clone() };

        let (read_half, write_half) = tokio::io::split(stream);

        // Writer: drains records, keepalives when quiet.
        let writer = tokio::spawn(async move {
            let mut rx: mpsc::Receiver<Frame> = out_rx;
            let mut write_half = write_half;
            loop {
                let frame = match timeout(keepalive, rx.recv()).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(_) => Frame {
                        ttl: DEFAULT_TTL,
                        ty: RecordType::Dummy as u8,
                        ..Frame::default()
                    },
                };
                if let Err(e) = frame.write_to(&mut write_half).await {
                    debug!(error = %e, "session write failed");
                    break;
                }
            }
        });

        // Fountain sender: one Data record per token.
        let sender = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.run_sender().await })
        };

        // Reader: drives dispatch until the stream ends, then tears the
        // session down.
        {
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = handler
                    .shared
                    .events
                    .send(HandlerEvent::Established { local, remote })
                    .await;

                let mut read_half = read_half;
                loop {
                    let frame = match Frame::read_from(&mut read_half).await {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "session closed");
                            break;
                        }
                    };
                    if let Err(e) = handler.dispatch(frame).await {
                        warn!(remote = %remote, error = %e, "session record error");
                        break;
                    }
                }

                writer.abort();
                sender.abort();
                // Pending retransmissions stop finding their sequence.
                handler
                    .shared
                    .notifications
                    .lock()
                    .expect("handler lock poisoned")
                    .unacked
                    .clear();
                let _ = handler
                    .shared
                    .events
                    .send(HandlerEvent::Closed { local, remote })
                    .await;
            });
        }

        handler
    }

    pub fn local(&self) -> NodeId {
        self.shared.local
    }

    pub fn remote(&self) -> NodeId {
        self.shared.remote
    }

    fn record(&self, ty: RecordType, content: Vec<u8>) -> Frame {
        Frame {
            version: 0,
            flags: 0,
            ttl: DEFAULT_TTL,
            ty: ty as u8,
            source: self.shared.local.as_bytes().to_vec(),
            destination: self.shared.remote.as_bytes().to_vec(),
            content,
        }
    }

    async fn send_record(&self, ty: RecordType, content: Vec<u8>) -> Result<()> {
        self.shared
            .out_tx
            .send(self.record(ty, content))
            .await
            .map_err(|_| anyhow::anyhow!("session closed"))
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Queue a notification for at-least-once delivery. Returns its
    /// sequence; failure to deliver surfaces later as
    /// [`HandlerEvent::NotificationFailed`].
    pub async fn notify(&self, payload: &[u8]) -> Result<u32> {
        let sequence = {
            let mut state = self.shared.notifications.lock().expect("handler lock poisoned");
            state.next_sequence = state.next_sequence.wrapping_add(1);
            if state.next_sequence == 0 {
                state.next_sequence = 1;
            }
            let sequence = state.next_sequence;
            state.unacked.insert(sequence);
            sequence
        };

        let mut content = sequence.to_be_bytes().to_vec();
        content.extend_from_slice(payload);
        self.send_record(RecordType::Notify, content.clone()).await?;

        // Retransmission with exponential backoff until acked or spent.
        let handler = self.clone();
        tokio::spawn(async move {
            let mut delay = handler.shared.retransmit_base;
            for _ in 0..RETRANSMIT_COUNT {
                tokio::time::sleep(delay).await;
                {
                    let state =
                        handler.shared.notifications.lock().expect("handler lock poisoned");
                    if !state.unacked.contains(&sequence) {
                        return; // acked
                    }
                }
                if handler
                    .send_record(RecordType::Notify, content.clone())
                    .await
                    .is_err()
                {
                    return; // session gone; Closed already reported
                }
                delay *= 2;
            }

            let still_unacked = {
                let mut state =
                    handler.shared.notifications.lock().expect("handler lock poisoned");
                state.unacked.remove(&sequence)
            };
            if still_unacked {
                let _ = handler
                    .shared
                    .events
                    .send(HandlerEvent::NotificationFailed {
                        local: handler.shared.local,
                        remote: handler.shared.remote,
                        sequence,
                    })
                    .await;
            }
        });

        Ok(sequence)
    }

    // ------------------------------------------------------------------
    // Fountain transfer
    // ------------------------------------------------------------------

    /// Request a block from the peer, granting it `tokens` Data records.
    pub async fn call(&self, target: &NodeId, tokens: u16) -> Result<()> {
        let mut content = target.as_bytes().to_vec();
        content.extend_from_slice(&tokens.to_be_bytes());
        self.send_record(RecordType::Call, content).await
    }

    /// Stop a transfer.
    pub async fn cancel(&self, target: &NodeId) -> Result<()> {
        self.send_record(RecordType::Cancel, target.as_bytes().to_vec()).await
    }

    async fn run_sender(&self) {
        loop {
            let notified = self.shared.sender_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.shared.sender.lock().expect("handler lock poisoned");
                if state.targets.is_empty() {
                    None
                } else {
                    let index = state.next % state.targets.len();
                    let (target, tokens) = state.targets[index];
                    if tokens == 0 {
                        state.targets.remove(index);
                        continue;
                    }
                    state.targets[index].1 -= 1;
                    state.next = index + 1;
                    Some(target)
                }
            };

            match next {
                Some(target) => {
                    match self.shared.store.pull(&target) {
                        Some(combination) => {
                            let Ok(serialized) = serialize_payload(&combination) else { continue };
                            let mut content = target.as_bytes().to_vec();
                            content.extend_from_slice(&serialized);
                            if self.send_record(RecordType::Data, content).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Nothing to serve for this target.
                            trace!(target = %target, "call for unavailable block");
                            let mut state =
                                self.shared.sender.lock().expect("handler lock poisoned");
                            state.targets.retain(|(t, _)| t != &target);
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Publish/subscribe records
    // ------------------------------------------------------------------

    pub async fn send_publish(&self, record: &PublishRecord) -> Result<()> {
        let content = serde_json::to_vec(record).context("publish record encoding")?;
        self.send_record(RecordType::Publish, content).await
    }

    pub async fn send_subscribe(&self, path: &str) -> Result<()> {
        let content = serde_json::to_vec(&SubscribeRecord { path: path.to_string() })
            .context("subscribe record encoding")?;
        self.send_record(RecordType::Subscribe, content).await
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let ty = RecordType::try_from(frame.ty).context("unknown session record")?;
        let content = frame.content;

        match ty {
            RecordType::Dummy => {}
            RecordType::Notify => {
                if content.len() < 4 {
                    anyhow::bail!("short notify record");
                }
                let sequence = u32::from_be_bytes(content[..4].try_into().expect("length checked"));
                let payload = content[4..].to_vec();

                // Ack every copy; duplicates are possible by design.
                self.send_record(RecordType::Ack, sequence.to_be_bytes().to_vec()).await?;

                let fresh = {
                    let mut state =
                        self.shared.notifications.lock().expect("handler lock poisoned");
                    state.received.put(sequence, ()).is_none()
                };
                if fresh {
                    let _ = self
                        .shared
                        .events
                        .send(HandlerEvent::Notification {
                            local: self.shared.local,
                            remote: self.shared.remote,
                            payload,
                        })
                        .await;
                }
            }
            RecordType::Ack => {
                if content.len() < 4 {
                    anyhow::bail!("short ack record");
                }
                let sequence = u32::from_be_bytes(content[..4].try_into().expect("length checked"));
                self.shared
                    .notifications
                    .lock()
                    .expect("handler lock poisoned")
                    .unacked
                    .remove(&sequence);
            }
            RecordType::Call => {
                if content.len() < NODE_ID_LEN + 2 {
                    anyhow::bail!("short call record");
                }
                let target = NodeId::try_from(&content[..NODE_ID_LEN])?;
                let tokens = u16::from_be_bytes(
                    content[NODE_ID_LEN..NODE_ID_LEN + 2].try_into().expect("length checked"),
                );
                let mut state = self.shared.sender.lock().expect("handler lock poisoned");
                match state.targets.iter_mut().find(|(t, _)| t == &target) {
                    Some((_, budget)) => {
                        *budget = budget.saturating_add(tokens as u32).min(MAX_TOKENS_PER_TARGET);
                    }
                    None => state.targets.push((target, (tokens as u32).min(MAX_TOKENS_PER_TARGET))),
                }
                drop(state);
                self.shared.sender_notify.notify_waiters();
            }
            RecordType::Cancel => {
                if content.len() < NODE_ID_LEN {
                    anyhow::bail!("short cancel record");
                }
                let target = NodeId::try_from(&content[..NODE_ID_LEN])?;
                let mut state = self.shared.sender.lock().expect("handler lock poisoned");
                state.targets.retain(|(t, _)| t != &target);
            }
            RecordType::Data => {
                if content.len() < NODE_ID_LEN {
                    anyhow::bail!("short data record");
                }
                let target = NodeId::try_from(&content[..NODE_ID_LEN])?;
                let combination: Combination = deserialize_payload(&content[NODE_ID_LEN..])
                    .context("malformed combination")?;
                let had = self.shared.store.has_block(&target);
                if self.shared.store.push(&target, combination) && !had {
                    // Block just completed: stop the peer's sender.
                    self.cancel(&target).await?;
                }
            }
            RecordType::Publish => {
                let record: PublishRecord =
                    serde_json::from_slice(&content).context("malformed publish record")?;
                let _ = self
                    .shared
                    .events
                    .send(HandlerEvent::Publish {
                        local: self.shared.local,
                        remote: self.shared.remote,
                        record,
                    })
                    .await;
            }
            RecordType::Subscribe => {
                let record: SubscribeRecord =
                    serde_json::from_slice(&content).context("malformed subscribe record")?;
                let _ = self
                    .shared
                    .events
                    .send(HandlerEvent::Subscribe {
                        local: self.shared.local,
                        remote: self.shared.remote,
                        path: record.path,
                    })
                    .await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("local", &self.shared.local)
            .field("remote", &self.shared.remote)
            .finish()
    }
}
