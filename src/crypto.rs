//! # Cryptographic Infrastructure
//!
//! TLS credentials and verification for Teapotnet links:
//!
//! - **Certificates**: self-signed X.509 generated from the RSA keypair
//! - **Verification**: the peer's identity is the SHA-512 digest of the
//!   public key found in its certificate, never a CA chain
//! - **Credentials**: anonymous, pre-shared key, and certificate sessions
//!
//! ## Identity Model
//!
//! - A certificate binds a [`NodeId`] to an RSA public key by construction:
//!   the identifier *is* the digest of the key the certificate carries
//! - Both sides of a link verify each other (client certificates are
//!   mandatory on certificate-credential servers)
//! - The expected peer identity travels in the SNI: `node_id_to_sni`
//!   encodes the 128 hex characters as DNS labels, and the server side uses
//!   the offered name to install per-identity credentials
//!   ([`LocalIdentityResolver`])
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` rustls APIs are used intentionally: verification binds
//! identity to public-key digest instead of CA-signed chains. An attacker
//! cannot impersonate an identifier without the matching private key, which
//! is exactly the guarantee the overlay needs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::Sha512;

use crate::identity::{Keypair, NodeId};

/// Lazily-initialized crypto provider for rustls, ring-backed.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for every Teapotnet link, preventing accidental
/// cross-protocol connections.
pub const ALPN: &[u8] = b"teapotnet";

/// Signature schemes accepted from RSA peers.
const RSA_SCHEMES: [rustls::SignatureScheme; 6] = [
    rustls::SignatureScheme::RSA_PKCS1_SHA256,
    rustls::SignatureScheme::RSA_PKCS1_SHA384,
    rustls::SignatureScheme::RSA_PKCS1_SHA512,
    rustls::SignatureScheme::RSA_PSS_SHA256,
    rustls::SignatureScheme::RSA_PSS_SHA384,
    rustls::SignatureScheme::RSA_PSS_SHA512,
];

// ============================================================================
// Credentials
// ============================================================================

/// Credential kinds a secure session can be established with.
#[derive(Clone)]
pub enum Credential {
    /// Encrypted but unauthenticated: the server presents a throwaway
    /// certificate and neither side proves an identity.
    Anonymous,
    /// A username plus a symmetric secret. The TLS session is anonymous and
    /// both sides must then exchange proofs bound to the session keying
    /// material (see [`psk_proof`]).
    PresharedKey { username: String, secret: Vec<u8> },
    /// A self-signed certificate binding an identifier to an RSA key.
    Certificate(Keypair),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::PresharedKey { username, .. } => {
                write!(f, "PresharedKey({})", username)
            }
            Credential::Certificate(keypair) => write!(f, "Certificate({:?})", keypair.node_id()),
        }
    }
}

// ============================================================================
// Certificate generation
// ============================================================================

/// Generate a self-signed certificate for an RSA keypair.
///
/// The common name carries the hex identifier for debugging; verification
/// never reads it, only the embedded public key.
pub fn generate_certificate(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = keypair.private_key_pkcs8_der()?;
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());

    let key_pair =
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der, &rcgen::PKCS_RSA_SHA256)
            .context("failed to load RSA key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["teapotnet".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.node_id().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign RSA certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

/// Build a rustls [`CertifiedKey`] for an identity, as installed by the
/// per-SNI resolver on tunnel servers.
pub fn certified_key(keypair: &Keypair) -> Result<Arc<CertifiedKey>> {
    let (certs, key) = generate_certificate(keypair)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .context("RSA key rejected by TLS signer")?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

// ============================================================================
// Identity extraction
// ============================================================================

/// Extract the DER `SubjectPublicKeyInfo` from a certificate.
pub fn extract_public_key_der(cert_der: &[u8]) -> Option<Vec<u8>> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(cert.public_key().raw.to_vec())
}

/// Identity of the peer presenting the given certificate chain.
pub fn peer_node_id(certs: &[CertificateDer<'_>]) -> Option<NodeId> {
    let end_entity = certs.first()?;
    let spki = extract_public_key_der(end_entity.as_ref())?;
    Some(NodeId::from_public_key_der(&spki))
}

/// Identity verified during a QUIC handshake, if the connection carried a
/// client/server certificate.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<NodeId> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    peer_node_id(certs)
}

// ============================================================================
// SNI mapping
// ============================================================================

/// Encode an identifier as a DNS-shaped SNI name.
///
/// 128 hex characters exceed the 63-byte DNS label limit, so the digest is
/// split into four 32-character labels.
pub fn node_id_to_sni(id: &NodeId) -> String {
    let hex = id.to_hex();
    format!("{}.{}.{}.{}", &hex[..32], &hex[32..64], &hex[64..96], &hex[96..])
}

/// Recover an identifier from an SNI name produced by [`node_id_to_sni`].
pub fn node_id_from_sni(sni: &str) -> Option<NodeId> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(&hex_str).ok()?;
    NodeId::try_from(bytes.as_slice()).ok()
}

// ============================================================================
// Pre-shared key proof
// ============================================================================

/// Compute the channel-bound proof for a pre-shared-key session.
///
/// `binding` is RFC 5705 exporter material from the TLS session, so a proof
/// can neither be replayed on another connection nor relayed by a
/// man-in-the-middle. `role` separates the client and server proofs.
pub fn psk_proof(secret: &[u8], username: &str, binding: &[u8], role: &str) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(b"teapotnet-psk-v1:");
    mac.update(role.as_bytes());
    mac.update(b":");
    mac.update(username.as_bytes());
    mac.update(b":");
    mac.update(binding);
    let mut proof = [0u8; 64];
    proof.copy_from_slice(&mac.finalize().into_bytes());
    proof
}

/// Constant-time comparison of two PSK proofs.
pub fn psk_proof_matches(secret: &[u8], username: &str, binding: &[u8], role: &str, proof: &[u8]) -> bool {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(b"teapotnet-psk-v1:");
    mac.update(role.as_bytes());
    mac.update(b":");
    mac.update(username.as_bytes());
    mac.update(b":");
    mac.update(binding);
    mac.verify_slice(proof).is_ok()
}

// ============================================================================
// rustls configs
// ============================================================================

/// TLS server config for the given credential.
///
/// Certificate credentials demand a client certificate; anonymous and PSK
/// servers present a throwaway certificate and skip client auth (PSK
/// authentication happens after the handshake, bound to the session).
pub fn server_config(credential: &Credential) -> Result<rustls::ServerConfig> {
    let mut config = match credential {
        Credential::Certificate(keypair) => {
            let (certs, key) = generate_certificate(keypair)?;
            rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
                .with_safe_default_protocol_versions()
                .context("TLS protocol versions")?
                .with_client_cert_verifier(Arc::new(NodeClientCertVerifier))
                .with_single_cert(certs, key)
                .context("failed to build certificate server config")?
        }
        Credential::Anonymous | Credential::PresharedKey { .. } => {
            let throwaway = Keypair::generate()?;
            let (certs, key) = generate_certificate(&throwaway)?;
            rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
                .with_safe_default_protocol_versions()
                .context("TLS protocol versions")?
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("failed to build anonymous server config")?
        }
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// TLS server config resolving its certificate per SNI from a set of local
/// identities. Used by the tunneler: the client names the identity it wants
/// to talk to and the server installs that identity's credentials.
pub fn resolving_server_config(resolver: Arc<LocalIdentityResolver>) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_client_cert_verifier(Arc::new(NodeClientCertVerifier))
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// TLS client config for the given credential.
///
/// When `expected` is set, the server's key digest must match it exactly;
/// otherwise any well-formed key is accepted and the caller reads the
/// verified identity from the session afterwards.
pub fn client_config(credential: &Credential, expected: Option<NodeId>) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NodeCertVerifier { expected }));

    let mut config = match credential {
        Credential::Certificate(keypair) => {
            let (certs, key) = generate_certificate(keypair)?;
            builder
                .with_client_auth_cert(certs, key)
                .context("failed to build certificate client config")?
        }
        Credential::Anonymous | Credential::PresharedKey { .. } => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// QUIC server config for the datagram backend.
pub fn quic_server_config(keypair: &Keypair, idle_timeout: std::time::Duration) -> Result<quinn::ServerConfig> {
    let server_crypto = server_config(&Credential::Certificate(keypair.clone()))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config is exclusively owned after creation");
    transport.max_idle_timeout(Some(
        idle_timeout.try_into().context("idle timeout out of range")?,
    ));
    transport.max_concurrent_bidi_streams(8u32.into());
    transport.max_concurrent_uni_streams(0u32.into());

    Ok(config)
}

/// QUIC client config for the datagram backend.
pub fn quic_client_config(keypair: &Keypair, expected: Option<NodeId>) -> Result<quinn::ClientConfig> {
    let client_crypto = client_config(&Credential::Certificate(keypair.clone()), expected)?;
    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

// ============================================================================
// Per-SNI credential resolver
// ============================================================================

/// Resolves server certificates by local identity.
///
/// The offered SNI encodes the identifier the client expects; if a matching
/// local identity is registered its certified key is installed, otherwise
/// the handshake fails for lack of a certificate.
#[derive(Default)]
pub struct LocalIdentityResolver {
    identities: RwLock<HashMap<NodeId, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for LocalIdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let identities = self.identities.read().expect("identity resolver lock poisoned");
        f.debug_struct("LocalIdentityResolver")
            .field("identities", &identities.len())
            .finish()
    }
}

impl LocalIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, keypair: &Keypair) -> Result<()> {
        let key = certified_key(keypair)?;
        self.identities
            .write()
            .expect("identity resolver lock poisoned")
            .insert(keypair.node_id(), key);
        Ok(())
    }

    pub fn unregister(&self, id: &NodeId) {
        self.identities
            .write()
            .expect("identity resolver lock poisoned")
            .remove(id);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.identities
            .read()
            .expect("identity resolver lock poisoned")
            .contains_key(id)
    }
}

impl ResolvesServerCert for LocalIdentityResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let id = node_id_from_sni(name)?;
        self.identities
            .read()
            .expect("identity resolver lock poisoned")
            .get(&id)
            .cloned()
    }
}

// ============================================================================
// Verifiers
// ============================================================================

/// Server certificate verifier binding identity to key digest.
#[derive(Debug)]
struct NodeCertVerifier {
    /// When set, the presented key must digest to exactly this identifier.
    expected: Option<NodeId>,
}

impl rustls::client::danger::ServerCertVerifier for NodeCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let spki = extract_public_key_der(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        let actual = NodeId::from_public_key_der(&spki);

        // The expected identity comes either from the caller or from the
        // SNI the caller dialled with; both must agree with the digest.
        let expected = match self.expected {
            Some(id) => Some(id),
            None => match server_name {
                ServerName::DnsName(name) => node_id_from_sni(name.as_ref()),
                _ => None,
            },
        };

        if let Some(expected) = expected {
            if actual != expected {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::NotValidForName,
                ));
            }
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        RSA_SCHEMES.to_vec()
    }
}

/// Client certificate verifier: any well-formed RSA key is accepted, the
/// digest becomes the authoritative identity and authorization happens at
/// the layer that knows which identities are welcome.
#[derive(Debug)]
struct NodeClientCertVerifier;

impl ClientCertVerifier for NodeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        extract_public_key_der(end_entity.as_ref()).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        RSA_SCHEMES.to_vec()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::test_keypair;

    #[test]
    fn certificate_carries_identity_key() {
        let keypair = test_keypair(0);
        let (certs, _key) = generate_certificate(keypair).expect("cert generation must succeed");

        let spki = extract_public_key_der(certs[0].as_ref()).expect("SPKI extraction must succeed");
        assert_eq!(
            spki,
            keypair.public_key_der(),
            "certificate public key must equal the identity key"
        );
        assert_eq!(peer_node_id(&certs), Some(keypair.node_id()));
    }

    #[test]
    fn different_keypairs_different_cert_identities() {
        let (certs_a, _) = generate_certificate(test_keypair(0)).unwrap();
        let (certs_b, _) = generate_certificate(test_keypair(1)).unwrap();
        assert_ne!(peer_node_id(&certs_a), peer_node_id(&certs_b));
    }

    #[test]
    fn sni_roundtrip() {
        let id = test_keypair(0).node_id();
        let sni = node_id_to_sni(&id);

        for label in sni.split('.') {
            assert!(label.len() <= 63, "DNS labels are limited to 63 bytes");
        }
        assert_eq!(node_id_from_sni(&sni), Some(id));
    }

    #[test]
    fn sni_rejects_garbage() {
        assert!(node_id_from_sni("teapotnet").is_none());
        assert!(node_id_from_sni("abcd.ef").is_none());
    }

    #[test]
    fn verifier_rejects_identity_mismatch() {
        use rustls::client::danger::ServerCertVerifier;

        let (certs, _) = generate_certificate(test_keypair(0)).unwrap();
        let wrong = test_keypair(1).node_id();

        let verifier = NodeCertVerifier { expected: Some(wrong) };
        let name = ServerName::try_from("teapotnet").unwrap();
        let result = verifier.verify_server_cert(
            &certs[0],
            &[],
            &name,
            &[],
            rustls::pki_types::UnixTime::now(),
        );
        assert!(result.is_err(), "digest mismatch must fail verification");
    }

    #[test]
    fn verifier_accepts_matching_identity() {
        use rustls::client::danger::ServerCertVerifier;

        let keypair = test_keypair(0);
        let (certs, _) = generate_certificate(keypair).unwrap();

        let verifier = NodeCertVerifier { expected: Some(keypair.node_id()) };
        let name = ServerName::try_from("teapotnet").unwrap();
        let result = verifier.verify_server_cert(
            &certs[0],
            &[],
            &name,
            &[],
            rustls::pki_types::UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn verifier_checks_sni_when_no_expected_identity() {
        use rustls::client::danger::ServerCertVerifier;

        let keypair = test_keypair(0);
        let (certs, _) = generate_certificate(keypair).unwrap();
        let verifier = NodeCertVerifier { expected: None };

        // SNI naming the wrong identity must fail even without an explicit
        // expectation.
        let wrong_sni = node_id_to_sni(&test_keypair(1).node_id());
        let name = ServerName::try_from(wrong_sni).unwrap();
        assert!(verifier
            .verify_server_cert(&certs[0], &[], &name, &[], rustls::pki_types::UnixTime::now())
            .is_err());

        let right_sni = node_id_to_sni(&keypair.node_id());
        let name = ServerName::try_from(right_sni).unwrap();
        assert!(verifier
            .verify_server_cert(&certs[0], &[], &name, &[], rustls::pki_types::UnixTime::now())
            .is_ok());
    }

    #[test]
    fn identity_resolver_matches_sni() {
        let keypair = test_keypair(0);
        let resolver = LocalIdentityResolver::new();
        resolver.register(keypair).unwrap();

        assert!(resolver.contains(&keypair.node_id()));
        assert!(!resolver.contains(&test_keypair(1).node_id()));

        resolver.unregister(&keypair.node_id());
        assert!(!resolver.contains(&keypair.node_id()));
    }

    #[test]
    fn psk_proof_binds_all_inputs() {
        let proof = psk_proof(b"secret", "alice", b"binding", "client");

        assert!(psk_proof_matches(b"secret", "alice", b"binding", "client", &proof));
        assert!(!psk_proof_matches(b"other", "alice", b"binding", "client", &proof));
        assert!(!psk_proof_matches(b"secret", "bob", b"binding", "client", &proof));
        assert!(!psk_proof_matches(b"secret", "alice", b"rebound", "client", &proof));
        assert!(!psk_proof_matches(b"secret", "alice", b"binding", "server", &proof));
    }

    #[test]
    fn server_config_builds_for_all_credentials() {
        let keypair = test_keypair(0);
        assert!(server_config(&Credential::Certificate(keypair.clone())).is_ok());
        assert!(server_config(&Credential::Anonymous).is_ok());
        assert!(server_config(&Credential::PresharedKey {
            username: "alice".into(),
            secret: b"secret".to_vec(),
        })
        .is_ok());
    }
}
