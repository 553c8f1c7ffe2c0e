//! The remote KV bucket seam.
//!
//! The cache talks to its authoritative store through [`KvBucket`], a small
//! bucket-shaped contract: point get/put/delete plus a subject-filtered
//! watch. A watch stream must replay every extant matching entry, emit
//! [`WatchEvent::EndOfBacklog`], and then continue with live updates.
//!
//! - [`frame`]: the timestamped wire encoding of bucket values
//! - [`memory`]: an in-process implementation backed by a BTreeMap

pub mod frame;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("KV store unavailable: {0}")]
    Unavailable(String),

    #[error("watch stream closed")]
    WatchClosed,
}

/// A raw bucket entry: the stored key (prefix included) and its value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// One item on a watch stream.
///
/// `EndOfBacklog` is the sentinel separating the initial replay of extant
/// entries from live updates. A hard deletion surfaces as an `Entry` with an
/// empty value.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Entry(KvEntry),
    EndOfBacklog,
}

/// The bucket contract the cache is built against.
///
/// Keys are NATS-style dotted subjects; watch filters may use `*` (one
/// token) and `>` (rest of the subject, terminal only).
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Fetch a single entry.
    async fn get(&self, key: &str) -> Result<KvEntry, KvError>;

    /// Store an entry, overwriting any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Remove an entry. Watchers observe the removal as a 0-byte entry.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Open a watch over every key matching `filter`: backlog first, then
    /// the sentinel, then live updates until the receiver is dropped.
    async fn watch(&self, filter: &str) -> Result<mpsc::Receiver<WatchEvent>, KvError>;
}
