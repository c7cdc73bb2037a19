//! # Identity Primitives
//!
//! This module defines the core identity types used throughout Teapotnet:
//!
//! - [`Keypair`]: RSA signing keypair (at least 2048 bits)
//! - [`NodeId`]: 64-byte identifier, the SHA-512 digest of the DER-encoded
//!   public key
//!
//! ## Identity Model
//!
//! A node (or a user) **is** its RSA key pair; its identifier is the SHA-512
//! digest of the DER `SubjectPublicKeyInfo`. Identifiers are compared
//! bitwise and ordered by the XOR metric, which makes them directly usable
//! for the overlay's distance-based routing.
//!
//! - **Self-certifying**: possession of the private key proves the identity,
//!   no CA involved
//! - **Uniform**: node identifiers and user identifiers live in the same
//!   64-byte space and use the same distance metric
//!
//! The same digest shape is reused for content addressing: a block digest is
//! the SHA-512 hash of the block bytes, so blocks and nodes share the key
//! space of the distributed store.

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use anyhow::{Context, Result};

/// Length in bytes of a node/user identifier (SHA-512 output).
pub const NODE_ID_LEN: usize = 64;

/// Minimum accepted RSA modulus size in bits.
pub const MIN_RSA_BITS: usize = 2048;

/// Default RSA modulus size for newly generated keys.
pub const DEFAULT_RSA_BITS: usize = 2048;

// ============================================================================
// NodeId
// ============================================================================

/// 64-byte identifier of a node, user or block.
///
/// For keys this is the SHA-512 digest of the DER-encoded public key; for
/// blocks it is the SHA-512 digest of the block bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Identifier of a public key given its DER encoding.
    pub fn from_public_key_der(der: &[u8]) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&Sha512::digest(der));
        Self(bytes)
    }

    /// Digest of arbitrary content, used for block addressing.
    pub fn hash(data: &[u8]) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&Sha512::digest(data));
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Bitwise XOR distance to another identifier.
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("identifier is not valid hex")?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| {
            anyhow::anyhow!("identifier must be {} bytes, got {}", NODE_ID_LEN, bytes.len())
        })?;
        Ok(Self(arr))
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// serde derives only cover fixed arrays up to 32 elements portably, so the
// 64-byte identifier serializes as a byte string with a length check.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl<'de> Visitor<'de> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{} bytes", NODE_ID_LEN)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<NodeId, E> {
                NodeId::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<NodeId, A::Error> {
                let mut bytes = [0u8; NODE_ID_LEN];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(bytes))
            }
        }

        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to decide which of two identifiers is closer to a routing target.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Keypair
// ============================================================================

/// RSA keypair backing a node or user identity.
///
/// The DER encoding of the public key is fixed at construction so that the
/// derived [`NodeId`] is stable for the lifetime of the value.
#[derive(Clone)]
pub struct Keypair {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
    node_id: NodeId,
}

impl Keypair {
    /// Generate a new keypair with the default modulus size.
    ///
    /// RSA generation is probabilistic and takes on the order of a second;
    /// callers that need many identities should reuse generated keys.
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(DEFAULT_RSA_BITS)
    }

    /// Generate a keypair with an explicit modulus size (at least 2048 bits).
    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        if bits < MIN_RSA_BITS {
            anyhow::bail!("RSA modulus must be at least {} bits, got {}", MIN_RSA_BITS, bits);
        }
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits).context("RSA key generation failed")?;
        Self::from_private_key(private_key)
    }

    /// Reconstruct a keypair from a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private_key =
            RsaPrivateKey::from_pkcs8_der(der).context("invalid PKCS#8 RSA private key")?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_der = public_key
            .to_public_key_der()
            .context("failed to encode RSA public key")?
            .into_vec();
        let node_id = NodeId::from_public_key_der(&public_key_der);
        Ok(Self {
            private_key,
            public_key_der,
            node_id,
        })
    }

    /// DER-encoded `SubjectPublicKeyInfo` of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// PKCS#8 DER encoding of the private key, for persistence and for
    /// handing the key to the TLS layer.
    pub fn private_key_pkcs8_der(&self) -> Result<Vec<u8>> {
        Ok(self
            .private_key
            .to_pkcs8_der()
            .context("failed to encode RSA private key")?
            .as_bytes()
            .to_vec())
    }

    /// Identifier derived from the public key.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn modulus_bits(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.private_key.n().bits()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id)
            .field("bits", &self.modulus_bits())
            .finish_non_exhaustive()
    }
}
