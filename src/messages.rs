//! # Wire Protocol
//!
//! The overlay record format shared by every link flavour. A record is a
//! fixed eight-byte header followed by three length-delimited fields,
//! big-endian throughout:
//!
//! ```text
//! [version:u8][flags:u8][ttl:u8][type:u8]
//! [srcLen:u8][dstLen:u8][contentLen:u16]
//! [src bytes][dst bytes][content bytes]
//! ```
//!
//! The top bit of `type` marks a record as *routable*: routable records
//! whose destination is not the local node are forwarded by the overlay,
//! everything else is consumed where it arrives.
//!
//! [`Frame`] is the raw codec (used as-is by the per-peer session layer,
//! which has its own type space); [`Message`] is the overlay's typed view
//! with identifier-checked source and destination.
//!
//! Structured content payloads (address sets, fountain combinations) ride
//! inside `content` as bincode with bounded deserialization to cap
//! allocations from untrusted input.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{NodeId, NODE_ID_LEN};

/// Default initial time-to-live of routable records.
pub const DEFAULT_TTL: u8 = 16;

/// Maximum length of the content field (u16 length on the wire).
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Bound for bincode deserialization of content payloads.
const MAX_PAYLOAD_DECODE: u64 = (MAX_CONTENT_LEN as u64) + 4096;

/// Bit marking a record type as routable.
pub const ROUTABLE_BIT: u8 = 0x80;

// ============================================================================
// Errors
// ============================================================================

/// Decoding failures for incoming records.
///
/// A `Truncated` stream means the transport closed; anything else is a
/// protocol error that is fatal for the offending link only.
#[derive(Debug)]
pub enum WireError {
    /// The underlying transport ended mid-record (or cleanly at a record
    /// boundary, in which case `clean` is true).
    Truncated { clean: bool },
    /// The type byte does not name a known overlay record type.
    UnknownType(u8),
    /// A source or destination field had a length that is neither empty nor
    /// an identifier.
    BadIdentifier(usize),
    /// Transport-level I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated { clean: true } => write!(f, "stream closed"),
            WireError::Truncated { clean: false } => write!(f, "stream closed mid-record"),
            WireError::UnknownType(t) => write!(f, "unknown record type {:#04x}", t),
            WireError::BadIdentifier(len) => {
                write!(f, "identifier field has invalid length {}", len)
            }
            WireError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated { clean: false }
        } else {
            WireError::Io(e)
        }
    }
}

// ============================================================================
// Raw frame codec
// ============================================================================

/// A raw wire record: header plus unvalidated field bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub flags: u8,
    pub ttl: u8,
    pub ty: u8,
    pub source: Vec<u8>,
    pub destination: Vec<u8>,
    pub content: Vec<u8>,
}

impl Frame {
    /// Serialize into a buffer. Field limits are enforced by construction
    /// from validated messages; debug builds assert them.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        debug_assert!(self.source.len() <= u8::MAX as usize);
        debug_assert!(self.destination.len() <= u8::MAX as usize);
        debug_assert!(self.content.len() <= MAX_CONTENT_LEN);

        let mut buf =
            Vec::with_capacity(8 + self.source.len() + self.destination.len() + self.content.len());
        buf.push(self.version);
        buf.push(self.flags);
        buf.push(self.ttl);
        buf.push(self.ty);
        buf.push(self.source.len() as u8);
        buf.push(self.destination.len() as u8);
        buf.extend_from_slice(&(self.content.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.source);
        buf.extend_from_slice(&self.destination);
        buf.extend_from_slice(&self.content);
        buf
    }

    /// Read one frame from a stream.
    ///
    /// A clean end-of-stream before the first header byte reports
    /// `Truncated { clean: true }`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Frame, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 8];
        // Distinguish a clean close from a mid-record close: read the first
        // byte separately.
        match reader.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::Truncated { clean: true });
            }
            Err(e) => return Err(e.into()),
        }
        reader.read_exact(&mut header[1..]).await?;

        let source_len = header[4] as usize;
        let destination_len = header[5] as usize;
        let content_len = u16::from_be_bytes([header[6], header[7]]) as usize;

        let mut source = vec![0u8; source_len];
        reader.read_exact(&mut source).await?;
        let mut destination = vec![0u8; destination_len];
        reader.read_exact(&mut destination).await?;
        let mut content = vec![0u8; content_len];
        reader.read_exact(&mut content).await?;

        Ok(Frame {
            version: header[0],
            flags: header[1],
            ttl: header[2],
            ty: header[3],
            source,
            destination,
            content,
        })
    }

    /// Write one frame to a stream and flush it.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode_to_vec();
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Overlay message types
// ============================================================================

/// Overlay record types. Values with the top bit set are routable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Keepalive, discarded on receipt.
    Dummy = 0x00,
    /// Path folding: a set of the sender's external addresses, rewritten to
    /// `Suggest` and folded toward closer neighbours.
    Offer = 0x01,
    /// Relayed offer: the recipient may connect to the carried addresses.
    Suggest = 0x02,
    /// Distributed store lookup; the key is the destination. Processed at
    /// every hop: each node answers what it holds and forwards closer.
    Retrieve = 0x03,
    /// Distributed store insert; the key is the destination. Processed at
    /// every hop on the way to the nodes closest to the key.
    Store = 0x04,
    /// Lookup answer; the key is the *source* and the requester the
    /// destination. Processed at every hop so values propagate back.
    Value = 0x05,
    /// Liveness probe, echoed as `Pong` with the same content.
    Ping = 0x86,
    /// Liveness answer.
    Pong = 0x87,
    /// Request for a fountain combination over a block.
    Call = 0x88,
    /// A serialized fountain combination.
    Data = 0x89,
    /// Tunnel datagram; content starts with the 8-byte tunnel id.
    Tunnel = 0x8A,
}

impl MessageType {
    /// Routable records are forwarded toward their destination; the rest
    /// are always consumed locally.
    #[inline]
    pub fn is_routable(self) -> bool {
        (self as u8) & ROUTABLE_BIT != 0
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x00 => MessageType::Dummy,
            0x01 => MessageType::Offer,
            0x02 => MessageType::Suggest,
            0x03 => MessageType::Retrieve,
            0x04 => MessageType::Store,
            0x05 => MessageType::Value,
            0x86 => MessageType::Ping,
            0x87 => MessageType::Pong,
            0x88 => MessageType::Call,
            0x89 => MessageType::Data,
            0x8A => MessageType::Tunnel,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// A typed overlay message.
///
/// `source`/`destination` are either absent (empty on the wire) or full
/// identifiers; any other field length is a protocol error.
#[derive(Clone, Debug)]
pub struct Message {
    pub version: u8,
    pub flags: u8,
    pub ttl: u8,
    pub ty: MessageType,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
    pub content: Vec<u8>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            version: 0,
            flags: 0,
            ttl: DEFAULT_TTL,
            ty: MessageType::Dummy,
            source: None,
            destination: None,
            content: Vec::new(),
        }
    }
}

impl Message {
    pub fn new(ty: MessageType) -> Self {
        Self { ty, ..Self::default() }
    }

    /// A routable message addressed to `destination`.
    pub fn to(ty: MessageType, destination: NodeId, content: Vec<u8>) -> Self {
        Self {
            ty,
            destination: Some(destination),
            content,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: NodeId) -> Self {
        self.source = Some(source);
        self
    }

    fn identifier_field(bytes: Vec<u8>) -> Result<Option<NodeId>, WireError> {
        match bytes.len() {
            0 => Ok(None),
            NODE_ID_LEN => Ok(Some(
                NodeId::try_from(bytes.as_slice()).expect("length checked"),
            )),
            other => Err(WireError::BadIdentifier(other)),
        }
    }

    /// Validate a raw frame into a typed message.
    pub fn from_frame(frame: Frame) -> Result<Self, WireError> {
        let ty = MessageType::try_from(frame.ty)?;
        Ok(Self {
            version: frame.version,
            flags: frame.flags,
            ttl: frame.ttl,
            ty,
            source: Self::identifier_field(frame.source)?,
            destination: Self::identifier_field(frame.destination)?,
            content: frame.content,
        })
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            version: self.version,
            flags: self.flags,
            ttl: self.ttl,
            ty: self.ty as u8,
            source: self.source.map(|id| id.as_bytes().to_vec()).unwrap_or_default(),
            destination: self
                .destination
                .map(|id| id.as_bytes().to_vec())
                .unwrap_or_default(),
            content: self.content.clone(),
        }
    }
}

// ============================================================================
// Bounded payload serialization
// ============================================================================

/// Bincode options with size limits enforced.
/// Always used for deserialization of network input to prevent
/// memory-exhaustion attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PAYLOAD_DECODE)
        .with_fixint_encoding()
}

/// Serialize a structured content payload.
pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize a structured content payload with size bounds enforced.
pub fn deserialize_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}
