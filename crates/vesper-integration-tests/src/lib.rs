//! Integration test crate for the Vesper node.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise end-to-end datagram flows across the workspace crates.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p vesper-integration-tests
//! ```
