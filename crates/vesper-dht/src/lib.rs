//! # vesper-dht
//!
//! Kademlia routing and storage primitives for a Vesper node.
//!
//! This crate implements:
//! - XOR-distance identifier algebra over 256-bit node ids
//! - Kademlia routing table with 256 k-buckets and a probe-before-evict
//!   discipline (a full bucket pings its least-recently-seen contact and
//!   only evicts it if the ping goes unanswered)
//! - TTL-indexed key/value record store with lazy expiry and explicit sweep
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size) | 20 |
//! | Number of buckets | 256 |
//! | Probe deadline | 10 seconds |
//! | Default record TTL | never expires |

pub mod kademlia;
pub mod store;

/// Kademlia bucket size: maximum contacts per bucket.
pub const K: usize = 20;

/// Number of buckets in the routing table (one per bit of the 256-bit key space).
pub const NUM_BUCKETS: usize = 256;

/// Seconds a probed contact has to answer before its eviction completes.
pub const PROBE_TTL_SECS: u64 = 10;

/// Generate a fresh node identifier, chosen uniformly at random.
pub fn random_node_id() -> kademlia::NodeId {
    let mut id = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(K, 20);
        assert_eq!(NUM_BUCKETS, 256);
        assert_eq!(PROBE_TTL_SECS, 10);
    }

    #[test]
    fn test_random_node_id_is_random() {
        // Two draws colliding would mean the RNG is broken.
        assert_ne!(random_node_id(), random_node_id());
    }
}
