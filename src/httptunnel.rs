//! # HTTP Tunnel Transport
//!
//! A bidirectional byte stream impersonating ordinary web traffic, used
//! when UDP and direct TCP are filtered. A tunnel session pairs two HTTP
//! half-sessions identified by a random 32-bit cookie:
//!
//! - the **download half**: the client issues `GET` and the server streams
//!   raw bytes in the response body, at most [`MAX_DOWNLOAD_SIZE`] per leg
//!   before the client must reconnect;
//! - the **upload half**: the client issues `POST` with a fixed
//!   `Content-Length` budget and fills the body with command frames.
//!
//! ## Command framing (POST body)
//!
//! Each frame starts with a command byte; commands without the 0x40 bit
//! carry a big-endian `u16` length:
//!
//! | Command | Byte | Payload |
//! |---------|------|---------|
//! | `TunnelOpen` | 0x01 | length + auth data (currently empty) |
//! | `TunnelData` | 0x02 | length + bytes |
//! | `TunnelPadding` | 0x03 | length zeros |
//! | `TunnelPad` | 0x41 | single filler byte |
//! | `TunnelClose` | 0x42 | closes the session |
//! | `TunnelDisconnect` | 0x43 | ends the POST body |
//!
//! The POST budget starts at [`DEFAULT_POST_SIZE`] and doubles up to
//! [`MAX_POST_SIZE`] whenever a body is fully consumed by data, which makes
//! throughput track demand. A 200 ms flush timer pads out and terminates
//! half-full bodies (and closes quiet download legs) so small writes are
//! never stuck behind the budget.
//!
//! Conflicting concurrent halves for one session answer `409`; a closed or
//! unknown session answers `400`; a half-session that stays silent past the
//! idle timeout tears the session down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Browser user agent presented by tunnel clients; mobile matters for some
/// middleboxes.
pub const USER_AGENT: &str = "Mozilla/5.0 (Android; Mobile; rv:23.0) Gecko/23.0 Firefox/23.0";

/// Initial POST body budget.
pub const DEFAULT_POST_SIZE: usize = 1024;

/// Largest POST body budget the doubling policy reaches.
pub const MAX_POST_SIZE: usize = 2 * 1024 * 1024;

/// Bytes a single GET response body may carry before the leg closes.
pub const MAX_DOWNLOAD_SIZE: usize = 20 * 1024 * 1024;

/// Quiet period after which buffered data is pushed out.
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// A half-session with no active leg for this long kills the session.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall deadline for establishing the tunnel.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket-level timeout for reading HTTP heads and POST responses.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted HTTP head size.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// In-memory pipe capacity between the tunnel pumps and the secure layer.
const PIPE_CAPACITY: usize = 64 * 1024;

const TUNNEL_OPEN: u8 = 0x01;
const TUNNEL_DATA: u8 = 0x02;
const TUNNEL_PADDING: u8 = 0x03;
const TUNNEL_PAD: u8 = 0x41;
const TUNNEL_CLOSE: u8 = 0x42;
const TUNNEL_DISCONNECT: u8 = 0x43;

/// Commands with this bit carry no length field.
const NO_LENGTH_BIT: u8 = 0x40;

// ============================================================================
// HTTP head parsing helpers
// ============================================================================

/// Read bytes until the blank line ending an HTTP head; returns the head
/// and any body bytes already received.
async fn read_head(sock: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_head_end(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            anyhow::bail!("HTTP head too large");
        }
        let n = timeout(HEAD_TIMEOUT, sock.read(&mut chunk))
            .await
            .context("timed out reading HTTP head")??;
        if n == 0 {
            anyhow::bail!("connection closed before HTTP head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Session id from a `Cookie` header value.
fn session_from_cookie(value: &str) -> Option<u32> {
    value.split(';').find_map(|part| {
        let part = part.trim();
        let hex = part.strip_prefix("session=")?;
        u32::from_str_radix(hex, 16).ok()
    })
}

struct ParsedRequest {
    method: String,
    session: Option<u32>,
}

fn parse_request(head: &[u8]) -> Result<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head).context("malformed HTTP request")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("incomplete HTTP request head"),
    }

    let method = request.method.unwrap_or("").to_string();
    let session = request
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
        .find_map(|h| session_from_cookie(std::str::from_utf8(h.value).ok()?));

    Ok(ParsedRequest { method, session })
}

struct ParsedResponse {
    code: u16,
    session: Option<u32>,
}

fn parse_response(head: &[u8]) -> Result<ParsedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head).context("malformed HTTP response")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("incomplete HTTP response head"),
    }

    let session = response
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("set-cookie"))
        .find_map(|h| session_from_cookie(std::str::from_utf8(h.value).ok()?));

    Ok(ParsedResponse {
        code: response.code.unwrap_or(0),
        session,
    })
}

async fn write_status(sock: &mut TcpStream, code: u16, reason: &str) {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, reason
    );
    let _ = sock.write_all(head.as_bytes()).await;
    let _ = sock.shutdown().await;
}

// ============================================================================
// Server
// ============================================================================

struct SessionHandle {
    down_tx: mpsc::Sender<TcpStream>,
    up_tx: mpsc::Sender<(TcpStream, Vec<u8>)>,
    down_busy: Arc<AtomicBool>,
    up_busy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

/// Server-side tunnel registry. One per stream backend; sessions register
/// themselves under their cookie id and expire when either pump stops.
#[derive(Clone, Default)]
pub struct HttpTunnelServer {
    sessions: Arc<Mutex<HashMap<u32, SessionHandle>>>,
}

impl HttpTunnelServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one HTTP connection diverted from the stream backend.
    ///
    /// Returns a byte stream for the secure layer when this request opened
    /// a new tunnel session; requests joining an existing session are
    /// absorbed into that session's pumps.
    pub async fn incoming(&self, mut sock: TcpStream) -> Result<Option<DuplexStream>> {
        let (head, leftover) = match read_head(&mut sock).await {
            Ok(parts) => parts,
            Err(e) => {
                write_status(&mut sock, 408, "Request Timeout").await;
                return Err(e);
            }
        };
        let request = parse_request(&head)?;

        match request.method.as_str() {
            "GET" => self.handle_get(sock, request.session).await,
            "POST" => {
                self.handle_post(sock, request.session, leftover).await?;
                Ok(None)
            }
            _ => {
                write_status(&mut sock, 400, "Bad Request").await;
                Ok(None)
            }
        }
    }

    async fn handle_get(
        &self,
        mut sock: TcpStream,
        session: Option<u32>,
    ) -> Result<Option<DuplexStream>> {
        match session {
            None => {
                // Allocate a new session; this GET becomes its first
                // download leg.
                let (id, handle, link) = self.allocate();
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nCache-Control: no-cache\r\n\
                     Set-Cookie: session={:08x}\r\nConnection: close\r\n\r\n",
                    id
                );
                sock.write_all(head.as_bytes()).await?;
                handle.down_busy.store(true, Ordering::SeqCst);
                handle
                    .down_tx
                    .send(sock)
                    .await
                    .map_err(|_| anyhow::anyhow!("session pump gone"))?;
                debug!(session = format!("{:08x}", id), "allocated tunnel session");
                Ok(Some(link))
            }
            Some(id) => {
                let lookup = {
                    let sessions = self.sessions.lock().expect("session table poisoned");
                    match sessions.get(&id) {
                        Some(handle) if !handle.closed.load(Ordering::SeqCst) => {
                            Some((handle.down_tx.clone(), handle.down_busy.clone()))
                        }
                        _ => None,
                    }
                };
                let (down_tx, down_busy) = match lookup {
                    Some(pair) => pair,
                    None => {
                        write_status(&mut sock, 400, "Bad Request").await;
                        return Ok(None);
                    }
                };
                if down_busy.swap(true, Ordering::SeqCst) {
                    write_status(&mut sock, 409, "Conflict").await;
                    return Ok(None);
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\
                     Cache-Control: no-cache\r\nSet-Cookie: session={:08x}\r\nConnection: close\r\n\r\n",
                    id
                );
                sock.write_all(head.as_bytes()).await?;
                if down_tx.send(sock).await.is_err() {
                    down_busy.store(false, Ordering::SeqCst);
                }
                Ok(None)
            }
        }
    }

    async fn handle_post(
        &self,
        mut sock: TcpStream,
        session: Option<u32>,
        mut leftover: Vec<u8>,
    ) -> Result<()> {
        let Some(id) = session else {
            debug!("POST without session cookie");
            write_status(&mut sock, 400, "Bad Request").await;
            return Ok(());
        };

        let lookup = {
            let sessions = self.sessions.lock().expect("session table poisoned");
            match sessions.get(&id) {
                Some(handle) if !handle.closed.load(Ordering::SeqCst) => {
                    Some((handle.up_tx.clone(), handle.up_busy.clone()))
                }
                _ => None,
            }
        };
        let (up_tx, up_busy) = match lookup {
            Some(pair) => pair,
            None => {
                write_status(&mut sock, 400, "Bad Request").await;
                return Ok(());
            }
        };

        // The body must open with TunnelOpen and a (currently empty)
        // auth block.
        let mut body = PostBody::new(&mut sock, &mut leftover);
        let command = body.read_u8().await?;
        if command != TUNNEL_OPEN {
            drop(body);
            warn!(session = format!("{:08x}", id), "invalid tunnel opening sequence");
            write_status(&mut sock, 400, "Bad Request").await;
            return Ok(());
        }
        let auth_len = body.read_u16().await? as usize;
        body.skip(auth_len).await?;
        let leftover = body.into_leftover();

        if up_busy.swap(true, Ordering::SeqCst) {
            write_status(&mut sock, 409, "Conflict").await;
            return Ok(());
        }
        if up_tx.send((sock, leftover)).await.is_err() {
            up_busy.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn allocate(&self) -> (u32, SessionHandle, DuplexStream) {
        let (link_side, mgr_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (mgr_read, mgr_write) = tokio::io::split(mgr_side);

        let (down_tx, down_rx) = mpsc::channel(1);
        let (up_tx, up_rx) = mpsc::channel(1);
        let down_busy = Arc::new(AtomicBool::new(false));
        let up_busy = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let handle = SessionHandle {
            down_tx: down_tx.clone(),
            up_tx: up_tx.clone(),
            down_busy: down_busy.clone(),
            up_busy: up_busy.clone(),
            closed: closed.clone(),
        };

        let mut sessions = self.sessions.lock().expect("session table poisoned");
        let id = loop {
            let id: u32 = rand::thread_rng().gen();
            if id != 0 && !sessions.contains_key(&id) {
                break id;
            }
        };
        sessions.insert(
            id,
            SessionHandle {
                down_tx,
                up_tx,
                down_busy: down_busy.clone(),
                up_busy: up_busy.clone(),
                closed: closed.clone(),
            },
        );
        drop(sessions);

        let registry = self.sessions.clone();
        tokio::spawn(server_down_pump(mgr_read, down_rx, down_busy, closed.clone()));
        tokio::spawn({
            let closed = closed.clone();
            async move {
                server_up_pump(mgr_write, up_rx, up_busy, closed).await;
                registry.lock().expect("session table poisoned").remove(&id);
                trace!(session = format!("{:08x}", id), "tunnel session removed");
            }
        });

        (id, handle, link_side)
    }
}

/// Copies bytes written by the secure layer into successive GET legs.
async fn server_down_pump(
    mut mgr_read: ReadHalf<DuplexStream>,
    mut down_rx: mpsc::Receiver<TcpStream>,
    down_busy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    let mut leg: Option<TcpStream> = None;
    let mut sent_in_leg = 0usize;

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        if leg.is_none() {
            match timeout(IDLE_TIMEOUT, down_rx.recv()).await {
                Ok(Some(sock)) => {
                    leg = Some(sock);
                    sent_in_leg = 0;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("download half idle timeout");
                    break;
                }
            }
            continue;
        }

        match timeout(FLUSH_TIMEOUT, mgr_read.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break, // secure layer closed the link
            Ok(Ok(n)) => {
                let sock = leg.as_mut().expect("leg checked above");
                if sock.write_all(&buf[..n]).await.is_err() {
                    leg = None;
                    down_busy.store(false, Ordering::SeqCst);
                    continue;
                }
                sent_in_leg += n;
                if sent_in_leg >= MAX_DOWNLOAD_SIZE {
                    let mut sock = leg.take().expect("leg present");
                    let _ = sock.shutdown().await;
                    down_busy.store(false, Ordering::SeqCst);
                }
            }
            Err(_) => {
                // Flush: complete the response so the client sees the data
                // and reconnects for more.
                if sent_in_leg > 0 {
                    if let Some(mut sock) = leg.take() {
                        let _ = sock.shutdown().await;
                    }
                    down_busy.store(false, Ordering::SeqCst);
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

/// Decodes command frames from successive POST legs into the secure layer.
async fn server_up_pump(
    mut mgr_write: WriteHalf<DuplexStream>,
    mut up_rx: mpsc::Receiver<(TcpStream, Vec<u8>)>,
    up_busy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    'session: loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let (mut sock, mut leftover) = match timeout(IDLE_TIMEOUT, up_rx.recv()).await {
            Ok(Some(leg)) => leg,
            Ok(None) => break,
            Err(_) => {
                debug!("upload half idle timeout");
                break;
            }
        };

        let mut body = PostBody::new(&mut sock, &mut leftover);
        loop {
            let command = match body.read_u8().await {
                Ok(c) => c,
                Err(_) => {
                    up_busy.store(false, Ordering::SeqCst);
                    continue 'session;
                }
            };
            let len = if command & NO_LENGTH_BIT == 0 {
                match body.read_u16().await {
                    Ok(l) => l as usize,
                    Err(_) => {
                        up_busy.store(false, Ordering::SeqCst);
                        continue 'session;
                    }
                }
            } else {
                0
            };

            match command {
                TUNNEL_DATA => {
                    let mut remaining = len;
                    let mut chunk = [0u8; 4096];
                    while remaining > 0 {
                        let take = remaining.min(chunk.len());
                        if body.read_exact(&mut chunk[..take]).await.is_err() {
                            up_busy.store(false, Ordering::SeqCst);
                            continue 'session;
                        }
                        if mgr_write.write_all(&chunk[..take]).await.is_err() {
                            break 'session;
                        }
                        remaining -= take;
                    }
                }
                TUNNEL_PADDING => {
                    if body.skip(len).await.is_err() {
                        up_busy.store(false, Ordering::SeqCst);
                        continue 'session;
                    }
                }
                TUNNEL_PAD => {}
                TUNNEL_CLOSE => {
                    closed.store(true, Ordering::SeqCst);
                }
                TUNNEL_DISCONNECT => {
                    let _ = sock
                        .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    let _ = sock.shutdown().await;
                    up_busy.store(false, Ordering::SeqCst);
                    continue 'session;
                }
                other => {
                    trace!(command = format!("{:#04x}", other), "unknown tunnel command");
                    if body.skip(len).await.is_err() {
                        up_busy.store(false, Ordering::SeqCst);
                        continue 'session;
                    }
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping mgr_write signals end-of-stream to the secure layer.
}

/// Reader over a POST body: consumes head leftover first, then the socket.
struct PostBody<'a> {
    sock: &'a mut TcpStream,
    leftover: &'a mut Vec<u8>,
    pos: usize,
}

impl<'a> PostBody<'a> {
    fn new(sock: &'a mut TcpStream, leftover: &'a mut Vec<u8>) -> Self {
        Self { sock, leftover, pos: 0 }
    }

    fn into_leftover(self) -> Vec<u8> {
        self.leftover[self.pos..].to_vec()
    }

    async fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos < self.leftover.len() {
                let take = (self.leftover.len() - self.pos).min(out.len() - filled);
                out[filled..filled + take]
                    .copy_from_slice(&self.leftover[self.pos..self.pos + take]);
                self.pos += take;
                filled += take;
                continue;
            }
            let n = timeout(IDLE_TIMEOUT, self.sock.read(&mut out[filled..]))
                .await
                .context("timed out reading POST body")??;
            if n == 0 {
                anyhow::bail!("POST body ended prematurely");
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    async fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b).await?;
        Ok(u16::from_be_bytes(b))
    }

    async fn skip(&mut self, mut len: usize) -> Result<()> {
        let mut scratch = [0u8; 1024];
        while len > 0 {
            let take = len.min(scratch.len());
            self.read_exact(&mut scratch[..take]).await?;
            len -= take;
        }
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Open a tunnel to `addr`, returning a byte stream for the secure layer.
pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<DuplexStream> {
    let deadline = if connect_timeout.is_zero() { CONNECT_TIMEOUT } else { connect_timeout };

    // The initial GET allocates the session and doubles as the first
    // download leg.
    let (sock, leftover, session) = timeout(deadline, open_download_leg(addr, None))
        .await
        .context("HTTP tunnel connect timed out")??;
    let session = session.context("server did not assign a session cookie")?;
    debug!(addr = %addr, session = format!("{:08x}", session), "HTTP tunnel established");

    let (link_side, mgr_side) = tokio::io::duplex(PIPE_CAPACITY);
    let (mgr_read, mgr_write) = tokio::io::split(mgr_side);

    tokio::spawn(client_down_pump(addr, session, sock, leftover, mgr_write));
    tokio::spawn(client_up_pump(addr, session, mgr_read));

    Ok(link_side)
}

async fn open_download_leg(
    addr: SocketAddr,
    session: Option<u32>,
) -> Result<(TcpStream, Vec<u8>, Option<u32>)> {
    let mut sock = TcpStream::connect(addr).await.context("tunnel TCP connect failed")?;
    let path: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    let cookie = session
        .map(|s| format!("Cookie: session={:08x}\r\n", s))
        .unwrap_or_default();
    let head = format!(
        "GET /{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\n{}Connection: close\r\n\r\n",
        path, addr, USER_AGENT, cookie
    );
    sock.write_all(head.as_bytes()).await?;

    let (head, leftover) = read_head(&mut sock).await?;
    let response = parse_response(&head)?;
    if response.code != 200 {
        anyhow::bail!("HTTP tunnel GET failed with status {}", response.code);
    }
    Ok((sock, leftover, response.session.or(session)))
}

/// Streams GET response bodies into the secure layer, reconnecting legs as
/// they end.
async fn client_down_pump(
    addr: SocketAddr,
    session: u32,
    first_sock: TcpStream,
    first_leftover: Vec<u8>,
    mut mgr_write: WriteHalf<DuplexStream>,
) {
    let mut leg = Some((first_sock, first_leftover));
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let (mut sock, leftover) = match leg.take() {
            Some(l) => l,
            None => match open_download_leg(addr, Some(session)).await {
                Ok((sock, leftover, _)) => (sock, leftover),
                Err(e) => {
                    debug!(error = %e, "download leg reconnect failed");
                    break;
                }
            },
        };

        if !leftover.is_empty() && mgr_write.write_all(&leftover).await.is_err() {
            break;
        }

        loop {
            match timeout(IDLE_TIMEOUT, sock.read(&mut buf)).await {
                Ok(Ok(0)) => break, // leg complete, reconnect
                Ok(Ok(n)) => {
                    if mgr_write.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
}

struct PostLeg {
    sock: TcpStream,
    left: usize,
}

/// Packs bytes from the secure layer into POST bodies.
async fn client_up_pump(addr: SocketAddr, session: u32, mut mgr_read: ReadHalf<DuplexStream>) {
    let mut post_size = DEFAULT_POST_SIZE;
    let mut leg: Option<PostLeg> = None;
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let read = if leg.is_some() {
            match timeout(FLUSH_TIMEOUT, mgr_read.read(&mut buf)).await {
                Ok(r) => r,
                Err(_) => {
                    // Flush timer: pad the body out and let the server
                    // deliver what it has.
                    if let Some(current) = leg.take() {
                        post_size = shrink_post_size(post_size, current.left);
                        let _ = finish_leg(current, TUNNEL_DISCONNECT).await;
                    }
                    continue;
                }
            }
        } else {
            mgr_read.read(&mut buf).await
        };

        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let mut data = &buf[..n];
        while !data.is_empty() {
            let current = match leg.take() {
                Some(l) => l,
                None => match open_upload_leg(addr, session, post_size).await {
                    Ok(l) => l,
                    Err(e) => {
                        debug!(error = %e, "upload leg open failed");
                        return;
                    }
                },
            };
            match write_data(current, data).await {
                Ok((remaining_leg, consumed, exhausted)) => {
                    data = &data[consumed..];
                    match remaining_leg {
                        Some(l) => leg = Some(l),
                        None if exhausted => {
                            // Budget fully consumed by data: demand is
                            // there, double the next body.
                            post_size = (post_size * 2).min(MAX_POST_SIZE);
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    debug!(error = %e, "upload leg write failed");
                    return;
                }
            }
        }
    }

    // Secure layer closed: announce the close inside a final body.
    let current = match leg.take() {
        Some(l) => Some(l),
        None => open_upload_leg(addr, session, DEFAULT_POST_SIZE).await.ok(),
    };
    if let Some(current) = current {
        let _ = finish_leg_with_close(current).await;
    }
}

async fn open_upload_leg(addr: SocketAddr, session: u32, post_size: usize) -> Result<PostLeg> {
    let mut sock = TcpStream::connect(addr).await.context("tunnel TCP connect failed")?;
    let path: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let head = format!(
        "POST /{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nCookie: session={:08x}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        path, addr, USER_AGENT, session, post_size
    );
    sock.write_all(head.as_bytes()).await?;

    // Opening sequence: TunnelOpen plus an empty auth block.
    sock.write_all(&[TUNNEL_OPEN, 0, 0]).await?;
    Ok(PostLeg { sock, left: post_size - 3 })
}

/// Write as much of `data` as the leg's budget allows.
///
/// Returns the leg if it still has budget, the bytes consumed, and whether
/// the budget was exhausted by data (as opposed to padding).
async fn write_data(mut leg: PostLeg, data: &[u8]) -> Result<(Option<PostLeg>, usize, bool)> {
    let mut consumed = 0;

    // A data frame needs its 3-byte header plus at least one byte, and one
    // byte of budget must remain for the closing command.
    while leg.left >= 5 && consumed < data.len() {
        let chunk = (data.len() - consumed).min(leg.left - 4).min(u16::MAX as usize);
        let mut frame = Vec::with_capacity(3 + chunk);
        frame.push(TUNNEL_DATA);
        frame.extend_from_slice(&(chunk as u16).to_be_bytes());
        frame.extend_from_slice(&data[consumed..consumed + chunk]);
        leg.sock.write_all(&frame).await?;
        leg.left -= 3 + chunk;
        consumed += chunk;
    }

    if leg.left < 5 {
        let exhausted = consumed > 0;
        finish_leg(leg, TUNNEL_DISCONNECT).await?;
        Ok((None, consumed, exhausted))
    } else {
        Ok((Some(leg), consumed, false))
    }
}

/// Pad the remaining budget and terminate the body with `final_command`.
async fn finish_leg(mut leg: PostLeg, final_command: u8) -> Result<()> {
    // Large paddings use length-carrying frames, the last few bytes single
    // pad bytes.
    while leg.left >= 4 {
        let len = (leg.left - 4).min(u16::MAX as usize);
        let mut frame = vec![TUNNEL_PADDING];
        frame.extend_from_slice(&(len as u16).to_be_bytes());
        frame.extend(std::iter::repeat(0u8).take(len));
        leg.sock.write_all(&frame).await?;
        leg.left -= 3 + len;
    }
    while leg.left > 1 {
        leg.sock.write_all(&[TUNNEL_PAD]).await?;
        leg.left -= 1;
    }
    leg.sock.write_all(&[final_command]).await?;

    // Read (and discard) the 204 the server answers the body with.
    let mut scratch = [0u8; 1024];
    let _ = timeout(HEAD_TIMEOUT, leg.sock.read(&mut scratch)).await;
    let _ = leg.sock.shutdown().await;
    Ok(())
}

/// Terminate the session: TunnelClose followed by TunnelDisconnect.
async fn finish_leg_with_close(mut leg: PostLeg) -> Result<()> {
    while leg.left > 2 {
        leg.sock.write_all(&[TUNNEL_PAD]).await?;
        leg.left -= 1;
    }
    leg.sock.write_all(&[TUNNEL_CLOSE, TUNNEL_DISCONNECT]).await?;
    let mut scratch = [0u8; 1024];
    let _ = timeout(HEAD_TIMEOUT, leg.sock.read(&mut scratch)).await;
    let _ = leg.sock.shutdown().await;
    Ok(())
}

fn shrink_post_size(post_size: usize, left: usize) -> usize {
    post_size.saturating_sub(left).saturating_add(1).max(DEFAULT_POST_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[test]
    fn cookie_parsing() {
        assert_eq!(session_from_cookie("session=0000002a"), Some(42));
        assert_eq!(session_from_cookie("other=1; session=ff"), Some(255));
        assert_eq!(session_from_cookie("other=1"), None);
        assert_eq!(session_from_cookie("session=zz"), None);
    }

    #[test]
    fn post_size_policy() {
        // Fully consumed bodies double up to the cap.
        assert_eq!((DEFAULT_POST_SIZE * 2).min(MAX_POST_SIZE), 2048);
        // Flushed bodies shrink toward what was actually used.
        assert_eq!(shrink_post_size(4096, 4000), DEFAULT_POST_SIZE);
        assert_eq!(shrink_post_size(4096, 100), 3997);
        assert_eq!(shrink_post_size(DEFAULT_POST_SIZE, 1000), DEFAULT_POST_SIZE);
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    async fn spawn_tunnel_server() -> (SocketAddr, HttpTunnelServer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpTunnelServer::new();
        let server_clone = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                let server = server_clone.clone();
                tokio::spawn(async move {
                    if let Ok(Some(link)) = server.incoming(sock).await {
                        // Echo server over the tunnel byte stream.
                        let (mut read, mut write) = tokio::io::split(link);
                        let mut buf = [0u8; 4096];
                        while let Ok(n) = read.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                            if write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        (addr, server)
    }

    #[tokio::test]
    async fn tunnel_carries_bytes_both_ways() {
        let (addr, _server) = spawn_tunnel_server().await;

        let link = connect(addr, Duration::from_secs(10)).await.expect("tunnel connect");
        let (mut read, mut write) = tokio::io::split(link);

        let payload = b"through the tunnel";
        write.write_all(payload).await.unwrap();

        let mut got = vec![0u8; payload.len()];
        timeout(Duration::from_secs(10), read.read_exact(&mut got))
            .await
            .expect("echo must arrive in time")
            .expect("echo read");
        assert_eq!(&got, payload);
    }

    #[tokio::test]
    async fn tunnel_survives_multi_burst_traffic() {
        let (addr, _server) = spawn_tunnel_server().await;

        let link = connect(addr, Duration::from_secs(10)).await.expect("tunnel connect");
        let (mut read, mut write) = tokio::io::split(link);

        // Several bursts with pauses exercise flush, padding and leg
        // reconnection on both halves.
        for round in 0u8..3 {
            let payload: Vec<u8> = (0..3000).map(|i| (i as u8).wrapping_add(round)).collect();
            write.write_all(&payload).await.unwrap();

            let mut got = vec![0u8; payload.len()];
            timeout(Duration::from_secs(10), read.read_exact(&mut got))
                .await
                .expect("echo must arrive in time")
                .expect("echo read");
            assert_eq!(got, payload, "round {} payload must roundtrip", round);

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let (addr, _server) = spawn_tunnel_server().await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(
            b"GET /x HTTP/1.1\r\nHost: t\r\nCookie: session=deadbeef\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

        let (head, _) = read_head(&mut sock).await.unwrap();
        let response = parse_response(&head).unwrap();
        assert_eq!(response.code, 400);
    }

    #[tokio::test]
    async fn post_without_session_rejected() {
        let (addr, _server) = spawn_tunnel_server().await;

        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(b"POST /x HTTP/1.1\r\nHost: t\r\nContent-Length: 3\r\n\r\n\x01\x00\x00")
            .await
            .unwrap();

        let (head, _) = read_head(&mut sock).await.unwrap();
        let response = parse_response(&head).unwrap();
        assert_eq!(response.code, 400);
    }
}
