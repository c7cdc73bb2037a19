//! # Tunneler
//!
//! Authenticated identity-to-identity channels over the overlay. A tunnel
//! multiplexes a virtual datagram stream onto `Tunnel` records keyed by a
//! random 64-bit id:
//!
//! ```text
//! [tunnelId:u64][bytes]   (record content, addressed to the remote node)
//! ```
//!
//! Each tunnel carries a second certificate handshake between *user*
//! identities (distinct from the node identities that secure the links
//! underneath). The client names the identity it wants in the SNI; the
//! server resolves that identity's credentials from its local registry and
//! both sides verify each other's key digests. Authorization of the pair
//! happens above, when the session is adopted.
//!
//! Exactly one tunnel exists per id in a process; ids are drawn from the
//! full 64-bit space and re-drawn on collision. A tunnel unregisters itself
//! when its stream is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::crypto::LocalIdentityResolver;
use crate::identity::{Keypair, NodeId};
use crate::messages::{Message, MessageType, MAX_CONTENT_LEN};
use crate::overlay::Overlay;
use crate::transport::{secure_client, secure_server_resolving, Link};

/// Payload bytes per tunnel record, leaving room for the id.
const TUNNEL_MTU: usize = 16 * 1024;

/// Queued datagrams per tunnel; overflow drops.
const TUNNEL_QUEUE_SIZE: usize = 64;

const _: () = assert!(TUNNEL_MTU + 8 <= MAX_CONTENT_LEN);

/// An authenticated session produced by a completed tunnel handshake.
pub struct SessionLink {
    pub stream: Link,
    /// Local user identity of the session.
    pub local: NodeId,
    /// Remote user identity, verified from its certificate.
    pub remote: NodeId,
    /// The node the tunnel runs to.
    pub node: NodeId,
    /// True when this side initiated the tunnel.
    pub outbound: bool,
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLink")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("node", &self.node)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

struct TunnelerShared {
    overlay: Overlay,
    resolver: Arc<LocalIdentityResolver>,
    tunnels: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    sessions_tx: mpsc::Sender<SessionLink>,
    handshake_timeout: Duration,
    read_timeout: Duration,
}

/// Owner of the id→tunnel map. Cheap to clone.
#[derive(Clone)]
pub struct Tunneler {
    shared: Arc<TunnelerShared>,
}

impl Tunneler {
    /// Create the tunneler; completed sessions (both directions) arrive on
    /// the returned receiver.
    pub fn new(
        overlay: Overlay,
        resolver: Arc<LocalIdentityResolver>,
        handshake_timeout: Duration,
        read_timeout: Duration,
    ) -> (Self, mpsc::Receiver<SessionLink>) {
        let (sessions_tx, sessions_rx) = mpsc::channel(16);
        let tunneler = Self {
            shared: Arc::new(TunnelerShared {
                overlay,
                resolver,
                tunnels: Mutex::new(HashMap::new()),
                sessions_tx,
                handshake_timeout,
                read_timeout,
            }),
        };
        (tunneler, sessions_rx)
    }

    /// Dispatch an overlay `Tunnel` record to its tunnel, creating a server
    /// tunnel (and its handshake) for a fresh id.
    pub fn incoming(&self, message: Message) {
        if message.ty != MessageType::Tunnel || message.content.len() < 8 {
            return;
        }
        let Some(node) = message.source else { return };
        let id = u64::from_be_bytes(message.content[..8].try_into().expect("length checked"));
        let payload = message.content[8..].to_vec();

        let existing = {
            let tunnels = self.shared.tunnels.lock().expect("tunnel table poisoned");
            tunnels.get(&id).cloned()
        };

        match existing {
            Some(tx) => {
                if tx.try_send(payload).is_err() {
                    trace!(id = format!("{:016x}", id), "tunnel queue full or gone, dropping");
                }
            }
            None => {
                debug!(id = format!("{:016x}", id), node = %node, "incoming tunnel");
                let stream = self.create_tunnel(id, node);
                if !payload.is_empty() {
                    let _ = stream.queue_tx.try_send(payload);
                }

                let shared = self.shared.clone();
                tokio::spawn(async move {
                    match secure_server_resolving(
                        stream,
                        shared.resolver.clone(),
                        shared.handshake_timeout,
                    )
                    .await
                    {
                        Ok((link, remote, local)) => {
                            let session = SessionLink {
                                stream: link,
                                local,
                                remote,
                                node,
                                outbound: false,
                            };
                            if shared.sessions_tx.send(session).await.is_err() {
                                warn!("session consumer gone, dropping tunnel session");
                            }
                        }
                        Err(e) => {
                            debug!(
                                id = format!("{:016x}", id),
                                error = %e,
                                "tunnel server handshake failed"
                            );
                        }
                    }
                });
            }
        }
    }

    /// Open a tunnel to `remote` (a user identity) through `node`, driving
    /// the client handshake with `local`'s credentials.
    pub async fn open(&self, node: NodeId, local: &Keypair, remote: NodeId) -> Result<()> {
        if self.shared.overlay.neighbor_count() == 0 {
            anyhow::bail!("not connected to any neighbour");
        }

        let id = {
            let tunnels = self.shared.tunnels.lock().expect("tunnel table poisoned");
            loop {
                let id: u64 = rand::thread_rng().gen();
                if !tunnels.contains_key(&id) {
                    break id;
                }
            }
        };
        debug!(
            id = format!("{:016x}", id),
            node = %node,
            remote = %remote,
            "opening tunnel"
        );

        let stream = self.create_tunnel(id, node);
        let (link, peer) =
            secure_client(stream, local, Some(remote), self.shared.handshake_timeout)
                .await
                .context("tunnel handshake failed")?;

        let session = SessionLink {
            stream: link,
            local: local.node_id(),
            remote: peer,
            node,
            outbound: true,
        };
        self.shared
            .sessions_tx
            .send(session)
            .await
            .map_err(|_| anyhow::anyhow!("session consumer gone"))?;
        Ok(())
    }

    fn create_tunnel(&self, id: u64, node: NodeId) -> TunnelStream {
        let (queue_tx, queue_rx) = mpsc::channel(TUNNEL_QUEUE_SIZE);
        self.shared
            .tunnels
            .lock()
            .expect("tunnel table poisoned")
            .insert(id, queue_tx.clone());
        TunnelStream {
            id,
            node,
            shared: self.shared.clone(),
            queue_tx,
            queue_rx,
            pending: Vec::new(),
            pending_pos: 0,
            idle: Box::pin(tokio::time::sleep(self.shared.read_timeout)),
        }
    }

    /// The resolver serving local identity credentials to tunnel servers.
    pub fn resolver(&self) -> Arc<LocalIdentityResolver> {
        self.shared.resolver.clone()
    }

    #[cfg(test)]
    pub(crate) fn tunnel_count(&self) -> usize {
        self.shared.tunnels.lock().expect("tunnel table poisoned").len()
    }
}

/// The virtual datagram endpoint of one tunnel.
///
/// Reads dequeue payloads pushed by the overlay dispatcher; writes emit
/// overlay `Tunnel` records toward the fixed remote node. Reads idle past
/// the configured timeout fail the stream.
struct TunnelStream {
    id: u64,
    node: NodeId,
    shared: Arc<TunnelerShared>,
    /// Kept so incoming() can clone a sender for this id.
    queue_tx: mpsc::Sender<Vec<u8>>,
    queue_rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    idle: Pin<Box<tokio::time::Sleep>>,
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.shared
            .tunnels
            .lock()
            .expect("tunnel table poisoned")
            .remove(&self.id);
        trace!(id = format!("{:016x}", self.id), "tunnel unregistered");
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.pending_pos < self.pending.len() {
                let take = (self.pending.len() - self.pending_pos).min(buf.remaining());
                buf.put_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
                self.pending_pos += take;
                return Poll::Ready(Ok(()));
            }

            match self.queue_rx.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    let deadline = tokio::time::Instant::now() + self.shared.read_timeout;
                    self.idle.as_mut().reset(deadline);
                    self.pending = payload;
                    self.pending_pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())), // closed: EOF
                Poll::Pending => {
                    return match self.idle.as_mut().poll(cx) {
                        Poll::Ready(()) => Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "tunnel read timed out",
                        ))),
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        // Datagram semantics: emit and forget; reliability comes from the
        // layers driving the tunnel.
        for chunk in buf.chunks(TUNNEL_MTU) {
            let mut content = Vec::with_capacity(8 + chunk.len());
            content.extend_from_slice(&self.id.to_be_bytes());
            content.extend_from_slice(chunk);
            let sent = self
                .shared
                .overlay
                .send(Message::to(MessageType::Tunnel, self.node, content));
            if !sent {
                trace!(id = format!("{:016x}", self.id), "tunnel record not sent");
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
