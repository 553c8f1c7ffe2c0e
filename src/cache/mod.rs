//! The cache engine.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`node`]: per-key tree node state machine, purge lifecycle, level
//!   subscription fan-out
//! - [`store`]: the public cache surface (get/set/delete, patterns,
//!   transactions, subscriptions) and path resolution
//! - [`watcher`]: merges the bucket change feed into the tree by timestamp
//! - [`sweeper`]: periodic walk that flushes dirty nodes, computes the LRU
//!   threshold, marks cold nodes for purge, and collects garbage
//! - [`transaction`]: deferred write batches under caller-supplied ids

pub mod node;
pub mod store;
pub(crate) mod sweeper;
pub(crate) mod transaction;
pub(crate) mod watcher;

use thiserror::Error;

use crate::kv::KvError;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The key is materialised locally with no value; the absence was
    /// deliberate, so no bucket fallback applies.
    #[error("value for key {0} does not exist")]
    NotPresent(String),

    /// Read-through miss: the bucket has no (live) entry either.
    #[error("key {0} not found in KV store")]
    NotFound(String),

    /// The bucket entry could not be decoded as a frame.
    #[error("malformed KV payload for key {0}")]
    MalformedEncoding(String),

    /// `get_value_json` on bytes that are not valid JSON.
    #[error("value for key {0} is not valid JSON")]
    NotJson(String),

    #[error("KV backend error: {0}")]
    Backend(#[from] KvError),
}

/// Wall-clock nanoseconds since the Unix epoch. Mutation timestamps use
/// this when the caller passes a negative custom time.
pub(crate) fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
