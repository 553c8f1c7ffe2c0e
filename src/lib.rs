//! kv-cache-tree: hierarchical write-behind cache for remote KV stores.
//!
//! Sits between in-process consumers and a remote, authoritative key/value
//! bucket. Keys are dotted paths (`a.b.c`) forming a tree; values are opaque
//! byte blobs timestamped at nanosecond granularity.
//!
//! - Reads are served locally, falling back to the KV bucket on miss.
//! - Writes land locally and a background sweeper reconciles them to the
//!   bucket (write-behind), last-writer-wins by timestamp.
//! - A background watcher merges external bucket mutations into the tree.
//! - Cold entries are evicted under an LRU bound; the affected subtree
//!   remembers it is no longer a complete mirror of the bucket, so pattern
//!   queries union in a fresh bucket enumeration.

pub mod cache;
pub mod config;
pub mod kv;

pub use cache::node::LevelEvent;
pub use cache::store::CacheStore;
pub use cache::CacheError;
pub use config::CacheConfig;
pub use kv::memory::MemoryBucket;
pub use kv::{KvBucket, KvEntry, KvError, WatchEvent};
