//! # Tracker Client
//!
//! The tracker is an external HTTP rendezvous, not part of the overlay
//! protocol: nodes POST the addresses they are reachable on and GET a map
//! of other nodes to bootstrap from. Losing the tracker degrades bootstrap,
//! nothing else.
//!
//! `POST {tracker}/teapotnet/tracker?id={hexNodeId}` with form fields
//! `addresses` (comma-separated host:port list) and optionally `port`;
//! the response (also returned by `GET` with the same query) is a JSON
//! object mapping hex node identifiers to address lists.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::identity::NodeId;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TrackerClient {
    url: String,
    http: reqwest::Client,
}

impl TrackerClient {
    /// `tracker` is a host or URL; a missing scheme defaults to http.
    pub fn new(tracker: &str) -> Result<Self> {
        let base = if tracker.contains("://") {
            tracker.to_string()
        } else {
            format!("http://{}", tracker)
        };
        let base = base.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .context("failed to build tracker HTTP client")?;
        Ok(Self { url: format!("{}/teapotnet/tracker", base), http })
    }

    /// Publish our addresses and receive bootstrap candidates.
    pub async fn announce(
        &self,
        node: &NodeId,
        addresses: &[SocketAddr],
        port: Option<u16>,
    ) -> Result<Vec<(NodeId, Vec<SocketAddr>)>> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if !addresses.is_empty() {
            let joined = addresses
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",");
            form.push(("addresses", joined));
        }
        if let Some(port) = port {
            form.push(("port", port.to_string()));
        }

        debug!(url = %self.url, "announcing to tracker");
        let response = self
            .http
            .post(&self.url)
            .query(&[("id", node.to_hex())])
            .form(&form)
            .send()
            .await
            .context("tracker request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tracker answered {}", status);
        }
        let body: HashMap<String, Vec<String>> =
            response.json().await.context("tracker answered malformed JSON")?;
        Ok(Self::parse_entries(node, body))
    }

    /// Fetch bootstrap candidates without publishing anything.
    pub async fn fetch(&self, node: &NodeId) -> Result<Vec<(NodeId, Vec<SocketAddr>)>> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("id", node.to_hex())])
            .send()
            .await
            .context("tracker request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tracker answered {}", status);
        }
        let body: HashMap<String, Vec<String>> =
            response.json().await.context("tracker answered malformed JSON")?;
        Ok(Self::parse_entries(node, body))
    }

    fn parse_entries(
        own: &NodeId,
        body: HashMap<String, Vec<String>>,
    ) -> Vec<(NodeId, Vec<SocketAddr>)> {
        body.into_iter()
            .filter_map(|(id_hex, addrs)| {
                let id = NodeId::from_hex(&id_hex).ok()?;
                if &id == own {
                    return None;
                }
                let parsed: Vec<SocketAddr> = addrs
                    .iter()
                    .filter_map(|a| match a.parse() {
                        Ok(addr) => Some(addr),
                        Err(_) => {
                            warn!(addr = %a, "tracker returned unparseable address");
                            None
                        }
                    })
                    .collect();
                if parsed.is_empty() {
                    None
                } else {
                    Some((id, parsed))
                }
            })
            .collect()
    }
}
