//! # Endpoint Backends and Secure Links
//!
//! The two socket flavours the overlay joins, behind one [`Backend`] trait:
//!
//! - [`StreamBackend`]: TCP. Accepted connections are peeked for their
//!   first five bytes; `GET ` or `POST ` diverts the socket to the HTTP
//!   tunnel server, anything else goes straight to a TLS handshake. Outbound
//!   connections fall back to the HTTP tunnel when direct TCP or its
//!   handshake fails, and use it unconditionally when configuration forces
//!   the tunnel.
//! - [`DatagramBackend`]: UDP via QUIC. The server validates source
//!   addresses with a stateless retry (the datagram cookie exchange) before
//!   accepting a handshake. Each connection carries one bidirectional
//!   stream that the overlay frames records onto.
//!
//! Every link ends up as a [`SecureLink`]: an encrypted byte stream plus
//! the peer identity extracted from its certificate. The handshake helpers
//! at the bottom are shared with the tunneler, which runs the same
//! certificate handshake over virtual streams.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::crypto::{
    self, client_config, extract_verified_identity, node_id_to_sni, peer_node_id,
    quic_client_config, quic_server_config, server_config, Credential, LocalIdentityResolver,
};
use crate::httptunnel::{self, HttpTunnelServer};
use crate::identity::{Keypair, NodeId};

/// Capability set every link flavour provides.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// An established link as a boxed byte stream.
pub type Link = Box<dyn PeerStream>;

/// An authenticated link to a peer.
pub struct SecureLink {
    pub stream: Link,
    /// Identity from the peer's certificate.
    pub remote: NodeId,
    /// Transport address the link runs over.
    pub addr: SocketAddr,
}

impl std::fmt::Debug for SecureLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureLink")
            .field("remote", &self.remote)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// An endpoint flavour the overlay can listen and dial on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Accept the next authenticated link. Backends skip connections whose
    /// handshake fails; an error means the backend itself is gone.
    async fn accept(&self) -> Result<SecureLink>;

    /// Dial one address. `remote`, when known, pins the expected identity.
    async fn connect_addr(&self, addr: SocketAddr, remote: Option<NodeId>) -> Result<SecureLink>;

    fn local_port(&self) -> u16;
}

// ============================================================================
// Stream backend (TCP + HTTP tunnel)
// ============================================================================

pub struct StreamBackend {
    keypair: Keypair,
    connect_timeout: Duration,
    force_http_tunnel: bool,
    local_port: u16,
    /// Completed inbound handshakes, produced by the listener pump.
    links_rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<SecureLink>>,
}

impl StreamBackend {
    pub async fn bind(
        addr: SocketAddr,
        keypair: Keypair,
        connect_timeout: Duration,
        force_http_tunnel: bool,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {}", addr))?;
        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

        // Inbound connections are handshaken concurrently: an HTTP tunnel
        // handshake needs further inbound connections (POST and
        // reconnecting GET legs) to make progress, so the accept loop must
        // never wait on a handshake.
        let (links_tx, links_rx) = tokio::sync::mpsc::channel(16);
        let tunnel = HttpTunnelServer::new();
        {
            let keypair = keypair.clone();
            tokio::spawn(async move {
                loop {
                    let (sock, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "TCP accept failed");
                            break;
                        }
                    };
                    trace!(addr = %addr, "incoming stream connection");

                    let keypair = keypair.clone();
                    let tunnel = tunnel.clone();
                    let links_tx = links_tx.clone();
                    tokio::spawn(async move {
                        match handle_stream_incoming(sock, addr, &keypair, &tunnel, connect_timeout)
                            .await
                        {
                            Ok(Some(link)) => {
                                let _ = links_tx.send(link).await;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!(addr = %addr, error = %e, "stream accept handshake failed");
                            }
                        }
                    });
                }
            });
        }

        Ok(Self {
            keypair,
            connect_timeout,
            force_http_tunnel,
            local_port,
            links_rx: tokio::sync::Mutex::new(links_rx),
        })
    }

    async fn connect_http(&self, addr: SocketAddr, remote: Option<NodeId>) -> Result<SecureLink> {
        debug!(addr = %addr, "trying address (HTTP)");
        let link = httptunnel::connect(addr, self.connect_timeout).await?;
        let (stream, peer) =
            secure_client(link, &self.keypair, remote, self.connect_timeout).await?;
        Ok(SecureLink { stream, remote: peer, addr })
    }
}

/// Peek the first five bytes to tell HTTP apart from TLS.
async fn peek_is_http(sock: &TcpStream, deadline: Duration) -> Result<bool> {
    let mut buf = [0u8; 5];
    let peeked = timeout(deadline, async {
        loop {
            let n = sock.peek(&mut buf).await?;
            if n >= 5 {
                return Ok::<_, std::io::Error>(());
            }
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            // A short peek means more bytes are in flight.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match peeked {
        Ok(Ok(())) => Ok(&buf[..4] == b"GET " || &buf == b"POST "),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("timed out peeking connection preamble"),
    }
}

async fn handle_stream_incoming(
    sock: TcpStream,
    addr: SocketAddr,
    keypair: &Keypair,
    tunnel: &HttpTunnelServer,
    connect_timeout: Duration,
) -> Result<Option<SecureLink>> {
    if peek_is_http(&sock, connect_timeout).await? {
        // HTTP request: hand the socket to the tunnel server; a link only
        // comes back when this opened a new session.
        match tunnel.incoming(sock).await? {
            Some(link) => {
                let (stream, remote) = secure_server(link, keypair, connect_timeout).await?;
                Ok(Some(SecureLink { stream, remote, addr }))
            }
            None => Ok(None),
        }
    } else {
        let (stream, remote) = secure_server(sock, keypair, connect_timeout).await?;
        Ok(Some(SecureLink { stream, remote, addr }))
    }
}

#[async_trait]
impl Backend for StreamBackend {
    async fn accept(&self) -> Result<SecureLink> {
        self.links_rx
            .lock()
            .await
            .recv()
            .await
            .context("stream backend closed")
    }

    async fn connect_addr(&self, addr: SocketAddr, remote: Option<NodeId>) -> Result<SecureLink> {
        if self.force_http_tunnel {
            return self.connect_http(addr, remote).await;
        }

        debug!(addr = %addr, "trying address (TCP)");
        let direct: Result<SecureLink> = async {
            let sock = timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .context("TCP connect timed out")?
                .context("TCP connect failed")?;
            let (stream, peer) =
                secure_client(sock, &self.keypair, remote, self.connect_timeout).await?;
            Ok(SecureLink { stream, remote: peer, addr })
        }
        .await;

        match direct {
            Ok(link) => Ok(link),
            Err(e) => {
                debug!(addr = %addr, error = %e, "direct TCP failed, trying HTTP tunnel");
                self.connect_http(addr, remote).await
            }
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

// ============================================================================
// Datagram backend (QUIC over UDP)
// ============================================================================

pub struct DatagramBackend {
    endpoint: quinn::Endpoint,
    keypair: Keypair,
    connect_timeout: Duration,
    force_http_tunnel: bool,
    links_rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<SecureLink>>,
}

impl DatagramBackend {
    pub fn bind(
        addr: SocketAddr,
        keypair: Keypair,
        connect_timeout: Duration,
        idle_timeout: Duration,
        force_http_tunnel: bool,
    ) -> Result<Self> {
        let server = quic_server_config(&keypair, idle_timeout)?;
        let endpoint = quinn::Endpoint::server(server, addr)
            .with_context(|| format!("failed to bind UDP endpoint on {}", addr))?;

        // Handshakes run concurrently so a slow client cannot stall the
        // accept loop.
        let (links_tx, links_rx) = tokio::sync::mpsc::channel(16);
        {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    // Stateless cookie exchange: unvalidated sources get a
                    // retry and must come back echoing the token.
                    if !incoming.remote_address_validated() {
                        if let Err(e) = incoming.retry() {
                            trace!(error = %e, "retry refused");
                        }
                        continue;
                    }

                    let addr = incoming.remote_address();
                    let links_tx = links_tx.clone();
                    tokio::spawn(async move {
                        let result: Result<SecureLink> = async {
                            let conn = timeout(connect_timeout, incoming)
                                .await
                                .context("datagram handshake timed out")?
                                .context("datagram handshake failed")?;
                            let remote = extract_verified_identity(&conn)
                                .context("peer presented no usable certificate")?;
                            let (send, recv) = timeout(connect_timeout, conn.accept_bi())
                                .await
                                .context("timed out waiting for link stream")?
                                .context("link stream refused")?;
                            Ok(SecureLink {
                                stream: Box::new(QuicStream { _conn: conn, send, recv }),
                                remote,
                                addr,
                            })
                        }
                        .await;

                        match result {
                            Ok(link) => {
                                debug!(addr = %addr, remote = %link.remote, "datagram link accepted");
                                let _ = links_tx.send(link).await;
                            }
                            Err(e) => {
                                debug!(addr = %addr, error = %e, "datagram accept failed");
                            }
                        }
                    });
                }
            });
        }

        Ok(Self {
            endpoint,
            keypair,
            connect_timeout,
            force_http_tunnel,
            links_rx: tokio::sync::Mutex::new(links_rx),
        })
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

#[async_trait]
impl Backend for DatagramBackend {
    async fn accept(&self) -> Result<SecureLink> {
        self.links_rx
            .lock()
            .await
            .recv()
            .await
            .context("datagram backend closed")
    }

    async fn connect_addr(&self, addr: SocketAddr, remote: Option<NodeId>) -> Result<SecureLink> {
        if self.force_http_tunnel {
            anyhow::bail!("datagram connects disabled: HTTP tunnel forced");
        }
        debug!(addr = %addr, "trying address (UDP)");
        let config = quic_client_config(&self.keypair, remote)?;
        let sni = remote
            .map(|id| node_id_to_sni(&id))
            .unwrap_or_else(|| "teapotnet".to_string());

        let conn = timeout(
            self.connect_timeout,
            self.endpoint
                .connect_with(config, addr, &sni)
                .context("failed to initiate datagram connection")?,
        )
        .await
        .context("datagram connect timed out")?
        .context("datagram connect failed")?;

        let peer = extract_verified_identity(&conn)
            .context("peer presented no usable certificate")?;
        if let Some(expected) = remote {
            if peer != expected {
                anyhow::bail!("peer identity mismatch: expected {}, got {}", expected, peer);
            }
        }

        let (send, recv) = conn.open_bi().await.context("failed to open link stream")?;
        Ok(SecureLink {
            stream: Box::new(QuicStream { _conn: conn, send, recv }),
            remote: peer,
            addr,
        })
    }

    fn local_port(&self) -> u16 {
        self.endpoint.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

/// The single bidirectional stream of a QUIC link, holding the connection
/// alive for as long as the stream is in use.
struct QuicStream {
    _conn: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

// ============================================================================
// Handshake helpers
// ============================================================================

/// Client-side certificate handshake over any byte stream.
///
/// Returns the encrypted stream and the peer identity from its certificate;
/// when `expected` is set a mismatching peer fails the handshake.
pub async fn secure_client<S>(
    stream: S,
    keypair: &Keypair,
    expected: Option<NodeId>,
    deadline: Duration,
) -> Result<(Link, NodeId)>
where
    S: PeerStream + 'static,
{
    let config = client_config(&Credential::Certificate(keypair.clone()), expected)?;
    let sni = expected
        .map(|id| node_id_to_sni(&id))
        .unwrap_or_else(|| "teapotnet".to_string());
    let server_name = rustls::pki_types::ServerName::try_from(sni)
        .context("identity SNI is not a valid server name")?;

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let tls = timeout(deadline, connector.connect(server_name, stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    let peer = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(peer_node_id)
        .context("server presented no usable certificate")?;
    if let Some(expected) = expected {
        if peer != expected {
            anyhow::bail!("peer identity mismatch: expected {}, got {}", expected, peer);
        }
    }

    Ok((Box::new(tls), peer))
}

/// Server-side certificate handshake over any byte stream.
pub async fn secure_server<S>(
    stream: S,
    keypair: &Keypair,
    deadline: Duration,
) -> Result<(Link, NodeId)>
where
    S: PeerStream + 'static,
{
    let config = server_config(&Credential::Certificate(keypair.clone()))?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let tls = timeout(deadline, acceptor.accept(stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    let peer = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(peer_node_id)
        .context("client presented no usable certificate")?;

    Ok((Box::new(tls), peer))
}

/// Server-side handshake resolving its certificate per SNI from the node's
/// local identities. Returns the remote identity and the local identity the
/// client addressed.
pub async fn secure_server_resolving<S>(
    stream: S,
    resolver: Arc<LocalIdentityResolver>,
    deadline: Duration,
) -> Result<(Link, NodeId, NodeId)>
where
    S: PeerStream + 'static,
{
    let config = crypto::resolving_server_config(resolver)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let tls = timeout(deadline, acceptor.accept(stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    let session = tls.get_ref().1;
    let local = session
        .server_name()
        .and_then(crypto::node_id_from_sni)
        .context("client did not name a local identity")?;
    let remote = session
        .peer_certificates()
        .and_then(peer_node_id)
        .context("client presented no usable certificate")?;

    Ok((Box::new(tls), remote, local))
}

// ============================================================================
// Address classification
// ============================================================================

/// True for loopback addresses.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// True for private and link-local ranges.
pub fn is_private(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

/// True for globally routable addresses.
pub fn is_public(addr: &SocketAddr) -> bool {
    !is_loopback(addr) && !is_private(addr) && !addr.ip().is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::test_keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn address_classification() {
        let loopback: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let private: SocketAddr = "192.168.1.10:80".parse().unwrap();
        let link_local: SocketAddr = "169.254.0.1:80".parse().unwrap();
        let public: SocketAddr = "198.51.100.7:80".parse().unwrap();
        let v6_local: SocketAddr = "[fe80::1]:80".parse().unwrap();
        let v6_unique: SocketAddr = "[fd00::1]:80".parse().unwrap();
        let v6_public: SocketAddr = "[2001:db8::1]:80".parse().unwrap();

        assert!(is_loopback(&loopback) && !is_public(&loopback));
        assert!(is_private(&private) && !is_public(&private));
        assert!(is_private(&link_local));
        assert!(is_public(&public));
        assert!(is_private(&v6_local));
        assert!(is_private(&v6_unique));
        assert!(is_public(&v6_public));
    }

    #[tokio::test]
    async fn tls_handshake_exchanges_identities() {
        let server_keypair = test_keypair(0).clone();
        let client_keypair = test_keypair(1).clone();
        let server_id = server_keypair.node_id();
        let client_id = client_keypair.node_id();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (mut stream, remote) =
                secure_server(sock, &server_keypair, Duration::from_secs(10))
                    .await
                    .expect("server handshake");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
            (remote, buf)
        });

        let sock = TcpStream::connect(addr).await.unwrap();
        let (mut stream, remote) =
            secure_client(sock, &client_keypair, Some(server_id), Duration::from_secs(10))
                .await
                .expect("client handshake");
        assert_eq!(remote, server_id, "client must see the server identity");

        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let (server_saw, server_got) = server.await.unwrap();
        assert_eq!(server_saw, client_id, "server must see the client identity");
        assert_eq!(&server_got, b"ping");
    }

    #[tokio::test]
    async fn tls_handshake_rejects_wrong_identity() {
        let server_keypair = test_keypair(0).clone();
        let client_keypair = test_keypair(1).clone();
        let wrong_id = test_keypair(2).node_id();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let _ = secure_server(sock, &server_keypair, Duration::from_secs(10)).await;
        });

        let sock = TcpStream::connect(addr).await.unwrap();
        let result =
            secure_client(sock, &client_keypair, Some(wrong_id), Duration::from_secs(10)).await;
        assert!(result.is_err(), "pinned identity mismatch must fail the handshake");
    }

    #[tokio::test]
    async fn datagram_backend_roundtrip() {
        let server_keypair = test_keypair(0).clone();
        let client_keypair = test_keypair(1).clone();
        let server_id = server_keypair.node_id();
        let client_id = client_keypair.node_id();

        let server_backend = DatagramBackend::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_keypair,
            Duration::from_secs(10),
            Duration::from_secs(60),
            false,
        )
        .unwrap();
        let server_addr: SocketAddr =
            format!("127.0.0.1:{}", server_backend.local_port()).parse().unwrap();

        let client_backend = DatagramBackend::bind(
            "127.0.0.1:0".parse().unwrap(),
            client_keypair,
            Duration::from_secs(10),
            Duration::from_secs(60),
            false,
        )
        .unwrap();

        let server = tokio::spawn(async move {
            let mut link = server_backend.accept().await.expect("accept");
            let mut buf = [0u8; 5];
            link.stream.read_exact(&mut buf).await.unwrap();
            link.stream.write_all(b"world").await.unwrap();
            link.stream.flush().await.unwrap();
            (link.remote, buf)
        });

        let mut link = client_backend
            .connect_addr(server_addr, Some(server_id))
            .await
            .expect("connect");
        assert_eq!(link.remote, server_id);

        link.stream.write_all(b"hello").await.unwrap();
        link.stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        link.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        let (seen, got) = server.await.unwrap();
        assert_eq!(seen, client_id);
        assert_eq!(&got, b"hello");
    }
}
