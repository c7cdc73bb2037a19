//! # Publish/Subscribe Matching
//!
//! Resource discovery by path prefix. Publishers attach to prefixes and
//! announce block digests; subscribers attach to prefixes and receive the
//! digests published underneath (or above) them.
//!
//! Paths are `/`-delimited (`/files/music`); matching is longest-prefix:
//! `/a/b/c` is tried as `/a/b/c`, then `/a/b`, then `/a`. Prefixes are
//! stored without their trailing slash.
//!
//! Subscribers may be local (application callbacks) or remote (forwarding
//! matches back to a peer as a JSON `{path, targets}` record through its
//! session). The registries are shared across sessions and guarded by one
//! mutex, like the routing state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// A source of digests under a prefix.
pub trait Publisher: Send + Sync {
    /// Digests this publisher announces for `subpath` under `prefix`.
    /// `peer` names the asking subscriber's identity for remote queries.
    fn announce(&self, peer: Option<&NodeId>, prefix: &str, subpath: &str) -> Vec<NodeId>;
}

/// A receiver of published digests.
pub trait Subscriber: Send + Sync {
    /// Deliver one matched digest. Returning true consumes the digest and
    /// stops shorter-prefix matching for it.
    fn incoming(&self, peer: Option<&NodeId>, prefix: &str, subpath: &str, target: &NodeId) -> bool;

    /// The peer this subscriber forwards to, for remote subscribers.
    fn remote(&self) -> Option<NodeId> {
        None
    }

    /// Local-only subscribers do not trigger a Subscribe record toward
    /// peers when registered.
    fn local_only(&self) -> bool {
        false
    }
}

/// The wire record a remote subscriber receives, JSON-encoded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRecord {
    pub path: String,
    /// Hex digests.
    pub targets: Vec<String>,
}

/// The wire record announcing a subscription, JSON-encoded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRecord {
    pub path: String,
}

impl PublishRecord {
    pub fn new(path: impl Into<String>, targets: &[NodeId]) -> Self {
        Self {
            path: path.into(),
            targets: targets.iter().map(|t| t.to_hex()).collect(),
        }
    }

    pub fn decoded_targets(&self) -> Vec<NodeId> {
        self.targets
            .iter()
            .filter_map(|t| NodeId::from_hex(t).ok())
            .collect()
    }
}

/// Strip the trailing slash a caller may have left on a prefix.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.len() >= 2 && prefix.ends_with('/') {
        prefix[..prefix.len() - 1].to_string()
    } else {
        prefix.to_string()
    }
}

/// Prefixes of a path, longest first: `/a/b/c` → `/a/b/c`, `/a/b`, `/a`.
pub fn prefixes(path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or(path);
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    (1..=components.len())
        .rev()
        .map(|n| format!("/{}", components[..n].join("/")))
        .collect()
}

/// The part of `path` below `prefix`, `/` when they coincide.
fn subpath_of(path: &str, prefix: &str) -> String {
    let rest = &path[prefix.len().min(path.len())..];
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

#[derive(Default)]
struct Registry {
    publishers: BTreeMap<String, Vec<Arc<dyn Publisher>>>,
    subscribers: BTreeMap<String, Vec<Arc<dyn Subscriber>>>,
}

/// Shared publisher/subscriber registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct PubSub {
    registry: Arc<Mutex<Registry>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, prefix: &str, publisher: Arc<dyn Publisher>) {
        let prefix = normalize_prefix(prefix);
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        registry.publishers.entry(prefix).or_default().push(publisher);
    }

    pub fn unpublish(&self, prefix: &str, publisher: &Arc<dyn Publisher>) {
        let prefix = normalize_prefix(prefix);
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        if let Some(list) = registry.publishers.get_mut(&prefix) {
            list.retain(|p| !Arc::ptr_eq(p, publisher));
            if list.is_empty() {
                registry.publishers.remove(&prefix);
            }
        }
    }

    pub fn subscribe(&self, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        let prefix = normalize_prefix(prefix);
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        registry.subscribers.entry(prefix).or_default().push(subscriber);
    }

    pub fn unsubscribe(&self, prefix: &str, subscriber: &Arc<dyn Subscriber>) {
        let prefix = normalize_prefix(prefix);
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        if let Some(list) = registry.subscribers.get_mut(&prefix) {
            list.retain(|s| !Arc::ptr_eq(s, subscriber));
            if list.is_empty() {
                registry.subscribers.remove(&prefix);
            }
        }
    }

    /// Remove every subscriber forwarding to `peer`, when its session ends.
    pub fn remove_remote_subscribers(&self, peer: &NodeId) {
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        registry.subscribers.retain(|_, list| {
            list.retain(|s| s.remote().as_ref() != Some(peer));
            !list.is_empty()
        });
    }

    /// Remove the subscriber forwarding to `peer` under one prefix, before
    /// replacing it on a repeated subscription.
    pub fn remove_remote_subscriber(&self, peer: &NodeId, prefix: &str) {
        let prefix = normalize_prefix(prefix);
        let mut registry = self.registry.lock().expect("pubsub lock poisoned");
        if let Some(list) = registry.subscribers.get_mut(&prefix) {
            list.retain(|s| s.remote().as_ref() != Some(peer));
            if list.is_empty() {
                registry.subscribers.remove(&prefix);
            }
        }
    }

    /// Ask every publisher matching `path` for its digests, longest prefix
    /// first. Returns per-prefix announcements; callers deliver or forward.
    pub fn match_publishers(&self, peer: Option<&NodeId>, path: &str) -> Vec<PublishRecord> {
        let path = normalize_prefix(path);
        let mut results = Vec::new();

        for prefix in prefixes(&path) {
            let matched: Vec<Arc<dyn Publisher>> = {
                let registry = self.registry.lock().expect("pubsub lock poisoned");
                registry.publishers.get(&prefix).cloned().unwrap_or_default()
            };
            if matched.is_empty() {
                continue;
            }
            let subpath = subpath_of(&path, &prefix);
            let mut targets = Vec::new();
            for publisher in matched {
                targets.extend(publisher.announce(peer, &prefix, &subpath));
            }
            if !targets.is_empty() {
                results.push(PublishRecord::new(path.clone(), &targets));
            }
        }
        results
    }

    /// Answer a subscription: matches in both directions. Upward matches
    /// follow the longest-prefix walk of [`match_publishers`]; downward
    /// matches find publishers registered *under* the subscribed prefix,
    /// each announced under its own prefix.
    pub fn match_publishers_subscribe(
        &self,
        peer: Option<&NodeId>,
        path: &str,
    ) -> Vec<PublishRecord> {
        let path = normalize_prefix(path);
        let mut results = self.match_publishers(peer, &path);

        let under: Vec<(String, Vec<Arc<dyn Publisher>>)> = {
            let registry = self.registry.lock().expect("pubsub lock poisoned");
            let floor = format!("{}/", path);
            registry
                .publishers
                .range(floor.clone()..)
                .take_while(|(prefix, _)| prefix.starts_with(&floor))
                .map(|(prefix, list)| (prefix.clone(), list.clone()))
                .collect()
        };

        for (prefix, publishers) in under {
            let mut targets = Vec::new();
            for publisher in publishers {
                targets.extend(publisher.announce(peer, &prefix, "/"));
            }
            if !targets.is_empty() {
                results.push(PublishRecord::new(prefix, &targets));
            }
        }
        results
    }

    /// Deliver published digests to every subscriber matching `path`,
    /// longest prefix first. A subscriber consuming a digest stops its
    /// propagation to shorter prefixes.
    pub fn match_subscribers(&self, peer: Option<&NodeId>, path: &str, targets: &[NodeId]) {
        let path = normalize_prefix(path);

        for target in targets {
            'prefixes: for prefix in prefixes(&path) {
                let matched: Vec<Arc<dyn Subscriber>> = {
                    let registry = self.registry.lock().expect("pubsub lock poisoned");
                    registry.subscribers.get(&prefix).cloned().unwrap_or_default()
                };
                let subpath = subpath_of(&path, &prefix);
                for subscriber in matched {
                    if subscriber.incoming(peer, &prefix, &subpath, target) {
                        break 'prefixes;
                    }
                }
            }
        }
    }

    /// Prefixes that currently have subscribers, for announcing
    /// subscriptions to a newly connected peer.
    pub fn subscribed_prefixes(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("pubsub lock poisoned");
        registry
            .subscribers
            .iter()
            .filter(|(_, list)| list.iter().any(|s| !s.local_only()))
            .map(|(prefix, _)| prefix.clone())
            .collect()
    }
}
