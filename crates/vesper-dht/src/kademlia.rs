//! Kademlia routing table with XOR-distance metric.
//!
//! Implements a 256-bucket Kademlia routing table over 256-bit node ids.
//! Each bucket holds up to K=20 live contacts ordered by recency plus a
//! queue of in-flight evictions implementing the probe-before-evict
//! protocol.
//!
//! ## Probe-before-evict
//!
//! When a bucket is full and a new contact is observed, the
//! least-recently-seen live contact is handed back to the caller, which
//! must ping it. The old contact and the newcomer are held in a pending
//! eviction record with a deadline. If the old contact answers before the
//! deadline (its PONG re-enters [`RoutingTable::update`]), the eviction is
//! cancelled and the newcomer dropped (Kademlia preference for long-lived
//! nodes that answer). If the deadline passes, the newcomer is promoted
//! into the live list.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{K, NUM_BUCKETS, PROBE_TTL_SECS};

/// A 256-bit node identifier. Ordering is lexicographic on bytes, which is
/// the big-endian 256-bit unsigned integer order.
pub type NodeId = [u8; 32];

/// Compute the XOR distance between two node ids.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Count the leading zero bits of a 256-bit value, MSB first.
///
/// An all-zero value has 256 leading zeros.
pub fn leading_zeros(id: &NodeId) -> usize {
    for (i, byte) in id.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    256
}

/// Determine the bucket index for a given XOR distance: the index `j` such
/// that `2^j <= distance < 2^(j+1)`.
///
/// Returns `None` for distance zero (a contact with the local node's own
/// id has no bucket and must never be inserted).
pub fn bucket_index(distance: &NodeId) -> Option<usize> {
    match leading_zeros(distance) {
        256 => None,
        lz => Some(255 - lz),
    }
}

/// First bytes of an id, for log lines.
fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..4])
}

/// A peer known to the routing table.
///
/// Identity is the `node_id` alone: two contacts with the same id compare
/// equal even when their addresses differ. `last_seen` is local state and
/// is never transmitted.
#[derive(Clone, Debug)]
pub struct Contact {
    /// The peer's 256-bit identifier.
    pub node_id: NodeId,
    /// The peer's IPv4 address and UDP port.
    pub addr: SocketAddrV4,
    /// When this peer last sent us a well-formed message.
    pub last_seen: Instant,
}

impl Contact {
    /// Create a contact observed right now.
    pub fn new(node_id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            node_id,
            addr,
            last_seen: Instant::now(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

/// An eviction in flight: the probed victim, the newcomer that will take
/// its slot, and the deadline by which the victim must answer.
#[derive(Clone, Debug)]
struct PendingEviction {
    victim: Contact,
    replacement: Contact,
    deadline: Instant,
}

/// A single k-bucket.
///
/// `live` is ordered by `last_seen` ascending: the front holds the
/// least-recently-seen contact, the back the most-recently-seen. Together
/// with `pending`, a bucket never tracks more than `k` distinct slots, and
/// no node id appears twice across `live`, pending victims, and pending
/// replacements.
#[derive(Debug)]
struct Bucket {
    live: VecDeque<Contact>,
    pending: Vec<PendingEviction>,
    k: usize,
}

impl Bucket {
    fn new(k: usize) -> Self {
        Self {
            live: VecDeque::with_capacity(k),
            pending: Vec::new(),
            k,
        }
    }

    /// Complete every eviction whose deadline has passed: drop the victim
    /// and promote its replacement into `live`.
    fn expire(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].deadline <= now {
                let slot = self.pending.remove(i);
                debug!(
                    victim = %short_id(&slot.victim.node_id),
                    replacement = %short_id(&slot.replacement.node_id),
                    "probe deadline passed, completing eviction"
                );
                self.promote(slot.replacement);
            } else {
                i += 1;
            }
        }
    }

    /// Insert a contact into `live` keeping `last_seen` ascending order.
    /// Stable: a contact whose timestamp ties an existing entry goes after
    /// it.
    fn promote(&mut self, contact: Contact) {
        let pos = self
            .live
            .iter()
            .position(|c| c.last_seen > contact.last_seen)
            .unwrap_or(self.live.len());
        self.live.insert(pos, contact);
    }

    /// Fold an observation of `contact` into the bucket. Returns a contact
    /// the caller must probe with a PING, if the observation started an
    /// eviction.
    fn update(&mut self, contact: Contact, now: Instant, probe_ttl: Duration) -> Option<Contact> {
        self.expire(now);

        // Known live contact: refresh and move to the most-recently-seen
        // position. The stored entry wins; a reused id arriving from a
        // different address does not overwrite the original.
        if let Some(idx) = self.live.iter().position(|c| c.node_id == contact.node_id) {
            if let Some(mut existing) = self.live.remove(idx) {
                existing.last_seen = now;
                self.live.push_back(existing);
            }
            return None;
        }

        // Already queued as a replacement: refresh it in place.
        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|s| s.replacement.node_id == contact.node_id)
        {
            slot.replacement.last_seen = now;
            return None;
        }

        // A probed victim answered before its deadline: cancel the
        // eviction, drop the replacement, restore the victim at the tail.
        if let Some(idx) = self
            .pending
            .iter()
            .position(|s| s.victim.node_id == contact.node_id)
        {
            let slot = self.pending.remove(idx);
            let mut victim = slot.victim;
            victim.last_seen = now;
            self.live.push_back(victim);
            return None;
        }

        // Truly new contact.
        let mut fresh = contact;
        fresh.last_seen = now;

        if self.live.len() + self.pending.len() < self.k {
            self.live.push_back(fresh);
            return None;
        }

        if let Some(victim) = self.live.pop_front() {
            self.pending.push(PendingEviction {
                victim: victim.clone(),
                replacement: fresh,
                deadline: now + probe_ttl,
            });
            return Some(victim);
        }

        // Every slot already holds a pending eviction with a fresh
        // candidate; nothing to evict, the newcomer is dropped.
        None
    }

    /// Eagerly complete the eviction of `node_id` without waiting for its
    /// deadline.
    fn complete_eviction(&mut self, node_id: &NodeId) {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|s| s.victim.node_id == *node_id)
        {
            let slot = self.pending.remove(idx);
            self.promote(slot.replacement);
        }
    }

    /// Contacts visible to lookups: live entries plus queued replacements
    /// (fresh-but-unverified peers are returned on purpose; the final XOR
    /// sort keeps only the truly closest).
    fn candidates(&self) -> impl Iterator<Item = &Contact> + '_ {
        self.live
            .iter()
            .chain(self.pending.iter().map(|s| &s.replacement))
    }
}

/// The Kademlia routing table: the local node's identity plus 256
/// k-buckets, where bucket `j` holds contacts at XOR distance
/// `2^j <= d < 2^(j+1)` from the local id.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
    probe_ttl: Duration,
}

impl RoutingTable {
    /// Create a routing table with the default bucket size and probe
    /// deadline.
    pub fn new(self_id: NodeId) -> Self {
        Self::with_config(self_id, K, Duration::from_secs(PROBE_TTL_SECS))
    }

    /// Create a routing table with explicit bucket capacity and probe
    /// deadline.
    pub fn with_config(self_id: NodeId, k: usize, probe_ttl: Duration) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(Bucket::new(k));
        }
        Self {
            self_id,
            buckets,
            probe_ttl,
        }
    }

    /// The local node's id.
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Fold an observed contact into its bucket.
    ///
    /// Returns `None` when the caller has no follow-up work, or
    /// `Some(victim)`: a contact the caller MUST probe with a PING. The
    /// caller completes the protocol either implicitly (the victim's PONG
    /// re-enters `update` and cancels the eviction; silence lets the
    /// deadline promote the newcomer) or eagerly via
    /// [`RoutingTable::on_probe_timeout`].
    pub fn update(&mut self, contact: Contact) -> Option<Contact> {
        if contact.node_id == self.self_id {
            return None;
        }
        let distance = xor_distance(&self.self_id, &contact.node_id);
        let idx = bucket_index(&distance)?;
        let victim = self.buckets[idx].update(contact, Instant::now(), self.probe_ttl);
        if let Some(victim) = &victim {
            debug!(
                bucket = idx,
                victim = %short_id(&victim.node_id),
                "bucket full, probing least-recently-seen contact"
            );
        }
        victim
    }

    /// Record that a probed contact answered. Equivalent to observing it.
    pub fn on_probe_reply(&mut self, contact: Contact) -> Option<Contact> {
        self.update(contact)
    }

    /// Record that a probed contact did not answer: complete its eviction
    /// immediately instead of waiting for the deadline.
    pub fn on_probe_timeout(&mut self, node_id: &NodeId) {
        let distance = xor_distance(&self.self_id, node_id);
        if let Some(idx) = bucket_index(&distance) {
            self.buckets[idx].complete_eviction(node_id);
        }
    }

    /// Complete every timed-out eviction across all buckets. Evictions are
    /// also expired lazily on each `update`; this is for callers that want
    /// a periodic pass independent of traffic.
    pub fn tick(&mut self) {
        let now = Instant::now();
        for bucket in &mut self.buckets {
            bucket.expire(now);
        }
    }

    /// Find up to `count` contacts closest to `target` by XOR distance.
    ///
    /// Every bucket contributes its live contacts and queued replacements;
    /// the full XOR sort then decides, so the result is always the true
    /// closest set regardless of how contacts spread across buckets.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut candidates: Vec<(Contact, NodeId)> = Vec::new();
        for bucket in &self.buckets {
            for contact in bucket.candidates() {
                let distance = xor_distance(&contact.node_id, target);
                candidates.push((contact.clone(), distance));
            }
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        candidates
            .into_iter()
            .take(count)
            .map(|(contact, _)| contact)
            .collect()
    }

    /// Total number of live contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    /// Whether the table holds no live contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
