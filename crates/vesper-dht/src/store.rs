//! TTL-indexed key/value record store.
//!
//! Maps 256-bit keys to opaque byte-string values with optional per-entry
//! expiry. Expired entries behave as absent for reads but are only
//! physically removed by an explicit [`KeyValueStore::sweep`], so callers
//! control when the reclamation work happens.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::kademlia::NodeId;

/// A stored value with its optional absolute expiry.
#[derive(Clone, Debug)]
struct StoreEntry {
    value: Vec<u8>,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

impl StoreEntry {
    /// An entry is expired iff its expiry is set and strictly in the past.
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// In-memory key/value store with per-entry time-to-live.
///
/// Writes that do not name a TTL use the store's default; a `None` TTL
/// (the default of the default) means the entry never expires.
pub struct KeyValueStore {
    entries: HashMap<NodeId, StoreEntry>,
    default_ttl: Option<Duration>,
}

impl KeyValueStore {
    /// Create a store whose entries never expire unless a TTL is given.
    pub fn new() -> Self {
        Self::with_default_ttl(None)
    }

    /// Create a store with a default TTL applied by [`KeyValueStore::put`].
    pub fn with_default_ttl(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    /// Store `value` under `key`, overwriting any existing entry (expired
    /// or not). A `ttl` of `None` makes the entry permanent.
    pub fn set(&mut self, key: NodeId, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key, StoreEntry { value, expires_at });
    }

    /// Store `value` under `key` with the store's default TTL.
    pub fn put(&mut self, key: NodeId, value: Vec<u8>) {
        self.set(key, value, self.default_ttl);
    }

    /// Whether a non-expired entry exists for `key`.
    pub fn contains(&self, key: &NodeId) -> bool {
        self.get(key).is_some()
    }

    /// The value stored under `key`, or `None` if absent or expired.
    pub fn get(&self, key: &NodeId) -> Option<&[u8]> {
        let now = Instant::now();
        self.entries.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.value.as_slice())
            }
        })
    }

    /// Physically remove every expired entry. Returns the number removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired records");
        }
        removed
    }

    /// Number of non-expired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no non-expired entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}
