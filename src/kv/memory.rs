//! In-process [`KvBucket`] implementation.
//!
//! Backs the integration tests and embedded deployments that do not need a
//! remote bucket. Entries live in a `BTreeMap`; each watch gets the backlog
//! snapshotted atomically with its registration, so no update is lost or
//! duplicated around the sentinel.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::kv::{KvBucket, KvEntry, KvError, WatchEvent};

/// Outward watch channel capacity. Live updates beyond this are buffered in
/// the per-watcher forwarding queue, never dropped.
const WATCH_CHANNEL_SIZE: usize = 1024;

struct Watcher {
    filter: String,
    live_tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct BucketState {
    entries: BTreeMap<String, Vec<u8>>,
    watchers: Vec<Watcher>,
}

/// An in-memory bucket with NATS-style subject watch semantics.
#[derive(Default)]
pub struct MemoryBucket {
    state: Mutex<BucketState>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes for a key, if present. Test and debugging hook.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().entries.get(key).cloned()
    }

    /// Number of entries currently stored.
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    fn broadcast(state: &mut BucketState, key: &str, value: &[u8]) {
        state.watchers.retain(|w| {
            if !subject_matches(&w.filter, key) {
                return true;
            }
            w.live_tx
                .send(WatchEvent::Entry(KvEntry {
                    key: key.to_string(),
                    value: value.to_vec(),
                }))
                .is_ok()
        });
    }
}

#[async_trait]
impl KvBucket for MemoryBucket {
    async fn get(&self, key: &str) -> Result<KvEntry, KvError> {
        let state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some(value) => Ok(KvEntry {
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(key.to_string(), value.clone());
        Self::broadcast(&mut state, key, &value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.remove(key).is_some() {
            // Watchers observe a hard deletion as a 0-byte entry.
            Self::broadcast(&mut state, key, &[]);
        }
        Ok(())
    }

    async fn watch(&self, filter: &str) -> Result<mpsc::Receiver<WatchEvent>, KvError> {
        let (out_tx, out_rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();

        // Snapshot the backlog and register for live updates under one lock
        // acquisition, so every mutation lands either in the snapshot or on
        // the live queue, never both.
        let backlog: Vec<KvEntry> = {
            let mut state = self.state.lock().unwrap();
            state.watchers.push(Watcher {
                filter: filter.to_string(),
                live_tx,
            });
            state
                .entries
                .iter()
                .filter(|(k, _)| subject_matches(filter, k))
                .map(|(k, v)| KvEntry {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect()
        };

        debug!(filter, backlog = backlog.len(), "memory bucket watch opened");

        tokio::spawn(async move {
            for entry in backlog {
                if out_tx.send(WatchEvent::Entry(entry)).await.is_err() {
                    return;
                }
            }
            if out_tx.send(WatchEvent::EndOfBacklog).await.is_err() {
                return;
            }
            while let Some(event) = live_rx.recv().await {
                if out_tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(out_rx)
    }
}

/// NATS-style subject match: `*` matches exactly one token, a terminal `>`
/// matches one or more remaining tokens.
fn subject_matches(filter: &str, subject: &str) -> bool {
    let filter_tokens: Vec<&str> = filter.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    for (i, token) in filter_tokens.iter().enumerate() {
        match *token {
            ">" => return subject_tokens.len() > i,
            "*" => {
                if i >= subject_tokens.len() {
                    return false;
                }
            }
            literal => {
                if i >= subject_tokens.len() || subject_tokens[i] != literal {
                    return false;
                }
            }
        }
    }
    filter_tokens.len() == subject_tokens.len()
}
