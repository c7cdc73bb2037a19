//! # Content-Addressed Store
//!
//! Local storage shared by the overlay and the session layer:
//!
//! - **Blocks**: immutable byte sequences keyed by their SHA-512 digest.
//!   All state change is by new digest; blocks carry no version.
//! - **Values**: the local slice of the distributed key-value store.
//!   `Permanent` values are locally owned and never expire; `Distributed`
//!   values are held transiently on behalf of the mesh and lapse after a
//!   TTL.
//! - **Fountain endpoints**: `pull` produces combinations over local
//!   blocks (serving `Call`), `push` feeds combinations into per-digest
//!   decoders (consuming `Data`) and commits the block once it decodes and
//!   its digest checks out.
//!
//! The store has its own lock; readers of blocks share it. Waiters on an
//! in-flight fetch park on a per-digest [`Notify`] and re-check on wakeup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::fountain::{Combination, Generator, Sink};
use crate::identity::NodeId;

/// Values a single key may accumulate before inserts are refused.
const MAX_VALUES_PER_KEY: usize = 16;

/// Upper bound on a stored value; the distributed store carries identifiers
/// and small records, not content (content goes in blocks).
pub const MAX_VALUE_SIZE: usize = 4096;

/// Keys the distributed class may occupy before expiry-then-refuse.
const MAX_DISTRIBUTED_KEYS: usize = 4096;

/// Lifetime of a distributed value after its last refresh.
pub const DISTRIBUTED_VALUE_TTL: Duration = Duration::from_secs(3600);

/// Storage class of a value record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueClass {
    /// Locally owned; republished and never expired.
    Permanent,
    /// Held for the mesh; expires unless refreshed.
    Distributed,
}

#[derive(Clone, Debug)]
struct ValueEntry {
    class: ValueClass,
    refreshed: Instant,
}

#[derive(Default)]
struct StoreInner {
    blocks: HashMap<NodeId, Arc<Vec<u8>>>,
    values: HashMap<NodeId, HashMap<Vec<u8>, ValueEntry>>,
    /// Decoders for blocks currently being fetched.
    sinks: HashMap<NodeId, Sink>,
    /// Encoders over local blocks, created on first pull.
    generators: HashMap<NodeId, Generator>,
    /// Wakeup handles for fetch waiters, one per digest.
    fetch_notify: HashMap<NodeId, Arc<Notify>>,
}

/// Shared content store. Cheap to clone.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn has_block(&self, digest: &NodeId) -> bool {
        self.inner.read().expect("store lock poisoned").blocks.contains_key(digest)
    }

    pub fn get_block(&self, digest: &NodeId) -> Option<Arc<Vec<u8>>> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .blocks
            .get(digest)
            .cloned()
    }

    /// Insert a block, returning its digest. Idempotent.
    pub fn store_block(&self, data: Vec<u8>) -> NodeId {
        let digest = NodeId::hash(&data);
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.sinks.remove(&digest);
        inner.blocks.entry(digest).or_insert_with(|| Arc::new(data));
        if let Some(notify) = inner.fetch_notify.get(&digest) {
            notify.notify_waiters();
        }
        digest
    }

    /// Digests of every locally stored block, for publication in the
    /// distributed store.
    pub fn block_digests(&self) -> Vec<NodeId> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .blocks
            .keys()
            .copied()
            .collect()
    }

    // ------------------------------------------------------------------
    // Fountain endpoints
    // ------------------------------------------------------------------

    /// Produce a combination over a locally available block.
    pub fn pull(&self, digest: &NodeId) -> Option<Combination> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if !inner.generators.contains_key(digest) {
            let data = inner.blocks.get(digest)?.as_ref().clone();
            inner.generators.insert(*digest, Generator::new(data));
        }
        let generator = inner.generators.get_mut(digest).expect("generator just inserted");
        Some(generator.generate(&mut rand::thread_rng()))
    }

    /// Feed a received combination into the decoder for `digest`.
    ///
    /// Returns true once the block is fully decoded and committed. A block
    /// that decodes to bytes with the wrong digest is discarded together
    /// with its decoder so the fetch can start over.
    pub fn push(&self, digest: &NodeId, combination: Combination) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.blocks.contains_key(digest) {
            return true; // already have it; late data is dropped
        }

        let sink = inner.sinks.entry(*digest).or_insert_with(Sink::new);
        if !sink.solve(combination) {
            return false;
        }

        let sink = inner.sinks.remove(digest).expect("completed sink present");
        let data = sink.into_data();
        let actual = NodeId::hash(&data);
        if actual != *digest {
            warn!(
                expected = %digest,
                actual = %actual,
                len = data.len(),
                "decoded block failed digest check, discarding"
            );
            return false;
        }

        debug!(digest = %digest, len = data.len(), "block decoded and committed");
        inner.blocks.insert(*digest, Arc::new(data));
        if let Some(notify) = inner.fetch_notify.get(digest) {
            notify.notify_waiters();
        }
        true
    }

    /// Wakeup handle for waiters on `digest`.
    pub fn fetch_notify(&self, digest: &NodeId) -> Arc<Notify> {
        self.inner
            .write()
            .expect("store lock poisoned")
            .fetch_notify
            .entry(*digest)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Drop the decoder state of an abandoned fetch.
    pub fn abort_fetch(&self, digest: &NodeId) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.sinks.remove(digest);
        inner.fetch_notify.remove(digest);
    }

    /// Wait until `digest` is locally available, bounded by `timeout`.
    pub async fn wait_block(&self, digest: &NodeId, timeout: Duration) -> Option<Arc<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.fetch_notify(digest);
        loop {
            // Interest registered before the check so a commit racing the
            // await is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(block) = self.get_block(digest) {
                return Some(block);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get_block(digest);
            }
        }
    }

    // ------------------------------------------------------------------
    // Distributed key-value store
    // ------------------------------------------------------------------

    /// Insert a value under a key. Refreshes the entry if it exists.
    ///
    /// Returns false when the value was refused (too large, key full, or
    /// the distributed class is at capacity).
    pub fn store_value(&self, key: &NodeId, value: &[u8], class: ValueClass) -> bool {
        if value.len() > MAX_VALUE_SIZE {
            trace!(key = %key, len = value.len(), "value refused: too large");
            return false;
        }

        let mut inner = self.inner.write().expect("store lock poisoned");

        if class == ValueClass::Distributed && !inner.values.contains_key(key) {
            if inner.values.len() >= MAX_DISTRIBUTED_KEYS {
                Self::expire_locked(&mut inner);
            }
            if inner.values.len() >= MAX_DISTRIBUTED_KEYS {
                trace!(key = %key, "value refused: distributed store full");
                return false;
            }
        }

        let entries = inner.values.entry(*key).or_default();
        if let Some(entry) = entries.get_mut(value) {
            entry.refreshed = Instant::now();
            // Permanent never downgrades to distributed.
            if class == ValueClass::Permanent {
                entry.class = ValueClass::Permanent;
            }
            return true;
        }
        if entries.len() >= MAX_VALUES_PER_KEY {
            trace!(key = %key, "value refused: key full");
            return false;
        }
        entries.insert(
            value.to_vec(),
            ValueEntry { class, refreshed: Instant::now() },
        );
        true
    }

    /// Local view of the values stored under a key.
    pub fn retrieve_value(&self, key: &NodeId) -> Vec<Vec<u8>> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .values
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| {
                        e.class == ValueClass::Permanent
                            || e.refreshed.elapsed() < DISTRIBUTED_VALUE_TTL
                    })
                    .map(|(v, _)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired distributed values. Called from periodic maintenance.
    pub fn expire(&self) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        Self::expire_locked(&mut inner);
    }

    fn expire_locked(inner: &mut StoreInner) {
        inner.values.retain(|_, entries| {
            entries.retain(|_, e| {
                e.class == ValueClass::Permanent || e.refreshed.elapsed() < DISTRIBUTED_VALUE_TTL
            });
            !entries.is_empty()
        });
    }

    /// Keys of every permanent value, republished by maintenance.
    pub fn permanent_keys(&self) -> Vec<NodeId> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .values
            .iter()
            .filter(|(_, entries)| entries.values().any(|e| e.class == ValueClass::Permanent))
            .map(|(k, _)| *k)
            .collect()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("store lock poisoned");
        f.debug_struct("Store")
            .field("blocks", &inner.blocks.len())
            .field("keys", &inner.values.len())
            .field("fetches", &inner.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn block_store_is_content_addressed() {
        let store = Store::new();
        let data = test_block(5000);
        let digest = store.store_block(data.clone());

        assert_eq!(digest, NodeId::hash(&data));
        assert!(store.has_block(&digest));
        assert_eq!(store.get_block(&digest).unwrap().as_ref(), &data);
        assert!(!store.has_block(&NodeId::hash(b"absent")));
    }

    #[test]
    fn pull_then_push_transfers_a_block() {
        let source = Store::new();
        let sink = Store::new();

        let data = test_block(12_345);
        let digest = source.store_block(data.clone());

        let mut done = false;
        let mut rounds = 0;
        while !done {
            let combination = source.pull(&digest).expect("source has the block");
            done = sink.push(&digest, combination);
            rounds += 1;
            assert!(rounds < 200, "transfer must converge");
        }

        assert_eq!(sink.get_block(&digest).unwrap().as_ref(), &data);
    }

    #[test]
    fn push_rejects_forged_content() {
        let source = Store::new();
        let sink = Store::new();

        // Serve a block under a digest that does not match its bytes.
        let data = test_block(100);
        let real_digest = source.store_block(data);
        let forged_digest = NodeId::hash(b"something else");

        let combination = source.pull(&real_digest).unwrap();
        assert!(
            !sink.push(&forged_digest, combination),
            "decoded block with mismatched digest must be discarded"
        );
        assert!(!sink.has_block(&forged_digest));
    }

    #[test]
    fn pull_unknown_block_is_none() {
        let store = Store::new();
        assert!(store.pull(&NodeId::hash(b"nope")).is_none());
    }

    #[test]
    fn values_accumulate_as_a_set() {
        let store = Store::new();
        let key = NodeId::hash(b"key");

        assert!(store.store_value(&key, b"one", ValueClass::Distributed));
        assert!(store.store_value(&key, b"two", ValueClass::Distributed));
        assert!(store.store_value(&key, b"one", ValueClass::Distributed)); // refresh

        let mut values = store.retrieve_value(&key);
        values.sort();
        assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn oversized_values_refused() {
        let store = Store::new();
        let key = NodeId::hash(b"key");
        assert!(!store.store_value(&key, &vec![0u8; MAX_VALUE_SIZE + 1], ValueClass::Permanent));
    }

    #[test]
    fn per_key_value_cap_enforced() {
        let store = Store::new();
        let key = NodeId::hash(b"key");
        for i in 0..MAX_VALUES_PER_KEY {
            assert!(store.store_value(&key, format!("v{}", i).as_bytes(), ValueClass::Distributed));
        }
        assert!(!store.store_value(&key, b"overflow", ValueClass::Distributed));
    }

    #[test]
    fn permanent_keys_listed_for_republish() {
        let store = Store::new();
        let own = NodeId::hash(b"own");
        let transient = NodeId::hash(b"transient");

        store.store_value(&own, b"me", ValueClass::Permanent);
        store.store_value(&transient, b"them", ValueClass::Distributed);

        assert_eq!(store.permanent_keys(), vec![own]);
    }

    #[tokio::test]
    async fn wait_block_wakes_on_commit() {
        let store = Store::new();
        let data = test_block(64);
        let digest = NodeId::hash(&data);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_block(&digest, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.store_block(data.clone());

        let got = waiter.await.unwrap().expect("waiter must observe the block");
        assert_eq!(got.as_ref(), &data);
    }

    #[tokio::test]
    async fn wait_block_times_out() {
        let store = Store::new();
        let digest = NodeId::hash(b"never");
        let got = store.wait_block(&digest, Duration::from_millis(50)).await;
        assert!(got.is_none());
    }
}
