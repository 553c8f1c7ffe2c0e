//! KV change-feed merge loop.
//!
//! Consumes the bucket watch stream for the cache prefix and folds every
//! entry into the tree by timestamp. The first backlog sentinel releases
//! the store constructor. On any watch error or stream end, the loop
//! re-subscribes after a fixed back-off.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use crate::cache::store::StoreInner;
use crate::kv::frame::{Frame, FrameOp};
use crate::kv::{KvEntry, WatchEvent};

pub(crate) async fn run(
    inner: Arc<StoreInner>,
    init_tx: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let filter = format!("{}.>", inner.config.kv_store_prefix);
    let mut init_tx = Some(init_tx);

    loop {
        if *shutdown.borrow() {
            return;
        }
        match inner.kv.watch(&filter).await {
            Ok(mut updates) => loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = updates.recv() => match event {
                        Some(WatchEvent::Entry(entry)) => apply_entry(&inner, entry).await,
                        Some(WatchEvent::EndOfBacklog) => {
                            if let Some(tx) = init_tx.take() {
                                debug!("initial KV sweep complete");
                                let _ = tx.send(());
                            }
                        }
                        None => {
                            warn!("KV watch stream ended; re-subscribing");
                            break;
                        }
                    },
                }
            },
            Err(e) => warn!(error = %e, "KV watch failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.watch_retry_delay()) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Fold one bucket entry into the tree.
///
/// A 0-byte value means the entry was purged from the bucket entirely.
/// Framed values merge by timestamp: newer sets apply locally, newer
/// delete markers are scrubbed from the bucket, equal timestamps are our
/// own echo, older ones are ignored.
async fn apply_entry(inner: &Arc<StoreInner>, entry: KvEntry) {
    let key = inner.from_store_key(&entry.key);

    if entry.value.is_empty() {
        if let Some(node) = inner.full_walk(&key) {
            node.mark_fully_purged();
        }
        return;
    }

    let frame = match Frame::decode(&entry.value) {
        Ok(frame) => frame,
        Err(e) => {
            error!(key = %key, error = %e, "received KV value without time and flag header");
            return;
        }
    };

    let local_time = inner.get_value_update_time(&key);
    if frame.time_ns > local_time {
        match frame.op {
            FrameOp::Set(payload) => {
                debug!(key = %key, time = frame.time_ns, "applying external KV update");
                inner.set_value(&key, payload, false, frame.time_ns, None);
            }
            FrameOp::Delete => {
                // External tombstone: scrub the raw entry from the bucket
                // rather than mirroring the delete locally.
                if let Err(e) = inner.kv.delete(&entry.key).await {
                    warn!(key = %key, error = %e, "tombstone cleanup failed");
                }
            }
        }
    } else if frame.time_ns == local_time {
        // Our own write echoed back.
        if matches!(frame.op, FrameOp::Delete) {
            if let Err(e) = inner.kv.delete(&entry.key).await {
                warn!(key = %key, error = %e, "tombstone cleanup failed");
            }
        }
        if let Some(node) = inner.full_walk(&key) {
            node.confirm_synced();
        }
    }
    // frame.time_ns < local_time: stale echo, ignored.
}
