//! # Node Configuration
//!
//! Every tunable in one serde struct with working defaults, loadable from
//! a JSON file and overridable field by field. Timeouts are stored in
//! milliseconds; accessors hand out [`Duration`]s.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port shared by the TCP and UDP endpoints. 0 picks an ephemeral port.
    pub port: u16,

    /// Address the endpoints bind to.
    pub listen_address: IpAddr,

    /// Human-readable instance name; defaults to the hex node identifier.
    pub node_name: Option<String>,

    /// Tracker used as an address rendezvous, e.g.
    /// `http://tracker.example.org`. None disables tracker refresh.
    pub tracker: Option<String>,

    /// Addresses to publish as externally reachable, next to whatever the
    /// port mapper learns.
    pub external_addresses: Vec<SocketAddr>,

    /// Pinned external port, bypassing the port mapper's pick.
    pub external_port: Option<u16>,

    /// Below this many neighbours the node keeps bootstrapping.
    pub min_connections: usize,

    /// Upper bound on concurrently connected neighbours.
    pub max_connections: usize,

    /// Deadline for connection establishment and handshakes.
    pub connect_timeout_ms: u64,

    /// Links idle beyond this are torn down by the transport.
    pub idle_timeout_ms: u64,

    /// Quiet links send a keepalive after this long.
    pub keepalive_timeout_ms: u64,

    /// Bound on waiting for distributed store answers.
    pub request_timeout_ms: u64,

    /// Bound on tunnel reads between datagrams.
    pub tunnel_timeout_ms: u64,

    /// Always reach peers through the HTTP tunnel, never direct TCP/UDP.
    pub force_http_tunnel: bool,

    /// Try NAT port mapping (NAT-PMP, UPnP, Freebox).
    pub port_mapping: bool,

    /// Cadence of Offer broadcasts once the node is well connected.
    pub offer_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8480,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            node_name: None,
            tracker: None,
            external_addresses: Vec::new(),
            external_port: None,
            min_connections: 4,
            max_connections: 16,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            keepalive_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            tunnel_timeout_ms: 30_000,
            force_http_tunnel: false,
            port_mapping: true,
            offer_interval_ms: 600_000,
        }
    }
}

impl Config {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_timeout_ms)
    }

    pub fn offer_interval(&self) -> Duration {
        Duration::from_millis(self.offer_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.connect_timeout() < config.idle_timeout());
        assert!(config.keepalive_timeout() < config.tunnel_timeout());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/teapotnet.json")).unwrap();
        assert_eq!(config.port, Config::default().port);
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("teapotnet-config-{}", std::process::id()));
        let path = dir.join("config.json");

        let mut config = Config::default();
        config.port = 9999;
        config.tracker = Some("http://tracker.example.org".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.port, 9999);
        assert_eq!(loaded.tracker.as_deref(), Some("http://tracker.example.org"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 1234}"#).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.min_connections, Config::default().min_connections);
    }
}
