//! Lazy writer / sweeper.
//!
//! Walks the whole tree every sweep interval:
//! - dirty nodes are framed and pushed to the bucket (write-behind);
//! - clean nodes at or below the LRU threshold have their payload dropped
//!   and enter the purge state machine, raising the parent's
//!   consistency-loss marker (the bucket copy survives);
//! - childless nodes are offered to garbage collection.
//!
//! After the walk, the update times collected along the way yield the
//! threshold used by the next pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::node::{CacheNode, PurgeState};
use crate::cache::now_ns;
use crate::cache::store::StoreInner;
use crate::kv::frame::Frame;

pub(crate) async fn run(inner: Arc<StoreInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        sweep_pass(&inner).await;
        tokio::select! {
            _ = tokio::time::sleep(inner.config.sweep_interval()) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One full depth-first pass over the tree.
async fn sweep_pass(inner: &Arc<StoreInner>) {
    let lru_threshold = inner.lru_threshold.load(Ordering::SeqCst);

    let mut lru_times: Vec<i64> = Vec::new();
    let mut stack: Vec<(Arc<CacheNode>, String, usize)> =
        vec![(Arc::clone(&inner.root), String::new(), 0)];

    while let Some((node, suffix, depth)) = stack.pop() {
        lru_times.push(node.value_update_time());

        let children = node.children_snapshot();
        if children.is_empty() {
            node.collect_garbage();
            continue;
        }

        for (child_key, child) in children {
            let child_suffix = if depth == 0 {
                format!("{suffix}{child_key}")
            } else {
                format!("{suffix}.{child_key}")
            };

            // Decide under the child's lock; the KV put happens after the
            // lock is released.
            let flush = {
                let mut st = child.lock_state();
                if st.sync_needed {
                    let frame = match &st.value {
                        Some(value) => Frame::set(st.value_update_time, value.clone()),
                        None => Frame::delete(st.value_update_time),
                    };
                    Some((frame.encode(), st.value_update_time))
                } else {
                    if st.value_update_time > 0
                        && st.value_update_time <= lru_threshold
                        && st.purge_state == PurgeState::Live
                    {
                        // Cold and clean: drop the in-memory payload and
                        // let the purge state machine retire the node. The
                        // bucket copy survives, so the level is no longer a
                        // complete local mirror.
                        st.value = None;
                        node.consistency_loss(now_ns());
                        CacheNode::try_purge_ready_locked(&mut st);
                        CacheNode::try_purge_confirm_locked(&mut st);
                        debug!(key = %child_suffix, "evicted cold entry");
                    }
                    None
                }
            };

            if let Some((bytes, captured_time)) = flush {
                match inner.kv.put(&inner.to_store_key(&child_suffix), bytes).await {
                    Ok(()) => {
                        let mut st = child.lock_state();
                        // A concurrent local write moved the timestamp; its
                        // payload still needs a flush, so leave the dirty
                        // bit alone.
                        if st.value_update_time == captured_time {
                            st.sync_needed = false;
                        }
                    }
                    Err(e) => {
                        warn!(key = %child_suffix, error = %e, "lazy writer could not update KV")
                    }
                }
            }

            stack.push((child, child_suffix, depth + 1));
        }
    }

    lru_times.sort_unstable_by(|a, b| b.cmp(a));
    let threshold = if lru_times.len() > inner.config.lru_size {
        lru_times[inner.config.lru_size.saturating_sub(1)]
    } else {
        *lru_times.last().unwrap_or(&0)
    };
    inner.lru_threshold.store(threshold, Ordering::SeqCst);
    inner.tracked_nodes.store(lru_times.len(), Ordering::SeqCst);
}
