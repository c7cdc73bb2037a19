//! # Teapotnet - Friend-to-Friend Overlay Network
//!
//! Teapotnet is a friend-to-friend overlay in which every user
//! authenticates peers with an RSA key pair and reaches them through a
//! self-organising routing mesh:
//!
//! - **Identity**: a node or user *is* its RSA key; identifiers are the
//!   SHA-512 digest of the DER public key
//! - **Overlay**: XOR-metric routing with path folding over TLS (TCP) and
//!   QUIC (UDP) links, with an HTTP tunnel as transport escape hatch
//! - **Store**: content-addressed blocks plus a distributed key-value
//!   store carried by hop-by-hop `Store`/`Retrieve`/`Value` records
//! - **Fountain**: erasure-coded block transfer over GF(256) driven by
//!   `Call`/`Data` records and token-bucket rate control
//! - **Tunneler**: identity-to-identity virtual channels multiplexed over
//!   the mesh by random 64-bit ids, each carrying a second certificate
//!   handshake
//! - **Sessions**: per-pair handlers with acknowledged notifications and
//!   prefix-matched publish/subscribe discovery
//!
//! ## Architecture
//!
//! Each layer consumes only the layer below: sockets, secure links,
//! overlay routing, store and fountain, tunneler, sessions. A [`Node`]
//! composes the whole stack; tests run several nodes in one process.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | RSA keypairs and 64-byte identifiers |
//! | `crypto` | certificates, rustls configs, digest-binding verification |
//! | `messages` | the binary record format and overlay message types |
//! | `transport` | TCP/QUIC backends, TLS handshakes, HTTP peeking |
//! | `httptunnel` | GET/POST byte-pipe transport |
//! | `overlay` | neighbours, route cache, control message semantics |
//! | `fountain` | GF(256) combinations, encoder, Gauss-Jordan sink |
//! | `store` | blocks, distributed values, fountain endpoints |
//! | `tunneler` | virtual datagram channels and their handshakes |
//! | `handler` | per-pair sessions: notifications, transfers, records |
//! | `pubsub` | longest-prefix publisher/subscriber matching |
//! | `network` | session orchestration, callers, listeners, beacons |
//! | `tracker` | HTTP rendezvous client |
//! | `portmapping` | NAT-PMP / UPnP / Freebox reachability helper |
//! | `config` | tunables |
//! | `node` | composition root |

pub mod config;
pub mod crypto;
pub mod fountain;
pub mod handler;
pub mod httptunnel;
pub mod identity;
pub mod messages;
pub mod network;
pub mod node;
pub mod overlay;
pub mod portmapping;
pub mod pubsub;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod tunneler;

pub use config::Config;
pub use identity::{Keypair, NodeId};
pub use messages::{Message, MessageType};
pub use network::{Listener, Network};
pub use node::Node;
pub use pubsub::{PublishRecord, Publisher, Subscriber};
pub use store::{Store, ValueClass};
