//! Per-key tree node state machine.
//!
//! One [`CacheNode`] exists for every cached key that has ever been
//! materialised. A node owns its own mutex; operations crossing the
//! parent-child boundary take the parent's lock to touch the children map
//! and the child's lock to touch child state, always parent before child.
//! No lock is ever held across KV I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::now_ns;

/// Purge lifecycle of a node.
///
/// `Live` → `Ready` (awaiting KV confirmation) → `Confirmed` (collectible).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeState {
    Live,
    Ready,
    Confirmed,
}

/// A direct-child change delivered to level subscribers: the child's edge
/// key and its new value (`None` for a deletion).
#[derive(Debug, Clone)]
pub struct LevelEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Mutable scalar state of a node, guarded by the node's mutex.
pub(crate) struct NodeState {
    pub(crate) children: HashMap<String, Arc<CacheNode>>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) value_update_time: i64,
    pub(crate) purge_state: PurgeState,
    pub(crate) sync_needed: bool,
    pub(crate) synced_with_kv: bool,
}

impl NodeState {
    /// A node that only anchors children: never carried a value and has no
    /// pending KV traffic. Its creation timestamp is incidental, so it does
    /// not participate in last-writer-wins.
    fn is_routing_placeholder(&self) -> bool {
        self.value.is_none() && self.purge_state == PurgeState::Live && !self.sync_needed
    }
}

pub struct CacheNode {
    parent: Weak<CacheNode>,
    key_in_parent: String,
    state: Mutex<NodeState>,

    /// Nanosecond timestamp at which some descendant was evicted; 0 means
    /// the subtree mirrors the KV completely. Raised via max, cleared via
    /// CAS on a previously observed value.
    consistency_lost_at: AtomicI64,

    /// Level subscribers, keyed by caller-supplied id. Kept outside the
    /// state mutex so fan-out from a locked child cannot deadlock against
    /// the parent.
    subscribers: Mutex<HashMap<String, mpsc::Sender<LevelEvent>>>,
}

impl CacheNode {
    pub(crate) fn new_root() -> Arc<CacheNode> {
        Arc::new(CacheNode {
            parent: Weak::new(),
            key_in_parent: String::new(),
            state: Mutex::new(NodeState {
                children: HashMap::new(),
                value: None,
                value_update_time: -1,
                purge_state: PurgeState::Live,
                sync_needed: false,
                synced_with_kv: true,
            }),
            consistency_lost_at: AtomicI64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn new_routing(parent: &Arc<CacheNode>, key: &str) -> Arc<CacheNode> {
        Arc::new(CacheNode {
            parent: Arc::downgrade(parent),
            key_in_parent: key.to_string(),
            state: Mutex::new(NodeState {
                children: HashMap::new(),
                value: None,
                value_update_time: now_ns(),
                purge_state: PurgeState::Live,
                sync_needed: false,
                synced_with_kv: true,
            }),
            consistency_lost_at: AtomicI64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn new_value(
        parent: &Arc<CacheNode>,
        key: &str,
        value: Vec<u8>,
        update_in_kv: bool,
        t: i64,
    ) -> Arc<CacheNode> {
        Arc::new(CacheNode {
            parent: Arc::downgrade(parent),
            key_in_parent: key.to_string(),
            state: Mutex::new(NodeState {
                children: HashMap::new(),
                value: Some(value),
                value_update_time: t,
                purge_state: PurgeState::Live,
                sync_needed: update_in_kv,
                synced_with_kv: !update_in_kv,
            }),
            consistency_lost_at: AtomicI64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<LevelEvent>>> {
        self.subscribers.lock().unwrap()
    }

    pub(crate) fn value_exists(&self) -> bool {
        self.lock_state().value.is_some()
    }

    pub(crate) fn value_update_time(&self) -> i64 {
        self.lock_state().value_update_time
    }

    /// Dotted path from the root to this node.
    pub(crate) fn full_key(&self) -> String {
        let mut parts = vec![self.key_in_parent.clone()];
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            if !node.key_in_parent.is_empty() {
                parts.push(node.key_in_parent.clone());
            }
            current = node.parent.upgrade();
        }
        parts.reverse();
        parts.join(".")
    }

    // ----- value mutations ------------------------------------------------

    /// Accept a value at timestamp `t`. Mutations older than the node's
    /// current `value_update_time` are rejected (last-writer-wins), except
    /// on routing placeholders. Returns whether the mutation was accepted.
    pub(crate) fn put(self: &Arc<Self>, value: Vec<u8>, update_in_kv: bool, t: i64) -> bool {
        {
            let mut st = self.lock_state();
            if !st.is_routing_placeholder() && t < st.value_update_time {
                return false;
            }
            st.value = Some(value.clone());
            st.value_update_time = t;
            st.purge_state = PurgeState::Live;
            st.sync_needed = update_in_kv;
            st.synced_with_kv = !update_in_kv;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.notify_level(&self.key_in_parent, Some(value));
        }
        true
    }

    /// Tombstone the node's value at timestamp `t`. The node itself stays in
    /// the tree until the purge state machine and GC retire it, so later
    /// KV updates can still be compared against `value_update_time`.
    pub(crate) fn delete(self: &Arc<Self>, update_in_kv: bool, t: i64) -> bool {
        {
            let mut st = self.lock_state();
            if t < st.value_update_time {
                return false;
            }
            st.value = None;
            st.value_update_time = t;
            if update_in_kv {
                st.purge_state = PurgeState::Ready;
                st.sync_needed = true;
                st.synced_with_kv = false;
            } else {
                st.purge_state = PurgeState::Confirmed;
                st.sync_needed = false;
                st.synced_with_kv = true;
            }
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.notify_level(&self.key_in_parent, None);
        }
        true
    }

    // ----- purge state machine --------------------------------------------

    pub(crate) fn try_purge_ready_locked(st: &mut NodeState) -> bool {
        if st.purge_state == PurgeState::Live {
            st.purge_state = PurgeState::Ready;
            return true;
        }
        false
    }

    pub(crate) fn try_purge_confirm_locked(st: &mut NodeState) -> bool {
        if !st.sync_needed && st.synced_with_kv && st.purge_state == PurgeState::Ready {
            st.purge_state = PurgeState::Confirmed;
            return true;
        }
        false
    }

    /// Watcher saw the KV echo for this node's last written payload.
    pub(crate) fn confirm_synced(&self) {
        let mut st = self.lock_state();
        st.synced_with_kv = true;
        Self::try_purge_confirm_locked(&mut st);
    }

    /// Watcher saw the entry disappear from the KV entirely.
    pub(crate) fn mark_fully_purged(&self) {
        let mut st = self.lock_state();
        st.synced_with_kv = true;
        Self::try_purge_ready_locked(&mut st);
        Self::try_purge_confirm_locked(&mut st);
    }

    /// Detach this node from its parent if it has fully passed the purge
    /// state machine, then walk up pruning newly childless ancestors.
    /// Locks are taken one node at a time; never nested across the ascent.
    pub(crate) fn collect_garbage(self: &Arc<Self>) {
        let mut current = Arc::clone(self);
        loop {
            let removable = {
                let mut st = current.lock_state();
                if st.value.is_none() && st.children.is_empty() && st.synced_with_kv {
                    Self::try_purge_ready_locked(&mut st);
                    Self::try_purge_confirm_locked(&mut st);
                }
                st.purge_state == PurgeState::Confirmed
                    && st.children.is_empty()
                    && !st.sync_needed
                    && st.synced_with_kv
                    && st.value.is_none()
            };
            let no_subscribers = current.lock_subscribers().is_empty();

            let Some(parent) = current.parent.upgrade() else {
                break;
            };
            if !removable || !no_subscribers {
                break;
            }

            let removed = {
                let mut pst = parent.lock_state();
                let matches = pst
                    .children
                    .get(&current.key_in_parent)
                    .is_some_and(|c| Arc::ptr_eq(c, &current));
                if matches {
                    pst.children.remove(&current.key_in_parent);
                }
                matches
            };
            if !removed {
                break;
            }
            current = parent;
        }
    }

    // ----- consistency-loss bookkeeping -----------------------------------

    /// Record that this subtree stopped mirroring the KV at `loss_time`,
    /// and bubble the marker to every ancestor.
    pub(crate) fn consistency_loss(&self, loss_time: i64) {
        self.consistency_lost_at.fetch_max(loss_time, Ordering::SeqCst);
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            node.consistency_lost_at.fetch_max(loss_time, Ordering::SeqCst);
            current = node.parent.upgrade();
        }
    }

    pub(crate) fn consistency_lost_at(&self) -> i64 {
        self.consistency_lost_at.load(Ordering::SeqCst)
    }

    /// Clear the loss marker, but only if it still holds the previously
    /// observed value. Fails when an eviction raced the enumeration.
    pub(crate) fn clear_consistency_loss(&self, observed: i64) -> bool {
        self.consistency_lost_at
            .compare_exchange(observed, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ----- children -------------------------------------------------------

    pub(crate) fn load_child(&self, key: &str) -> Option<Arc<CacheNode>> {
        self.lock_state().children.get(key).cloned()
    }

    pub(crate) fn children_snapshot(&self) -> Vec<(String, Arc<CacheNode>)> {
        self.lock_state()
            .children
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Get or create a routing child under one parent lock acquisition.
    pub(crate) fn create_routing_child(self: &Arc<Self>, key: &str) -> Arc<CacheNode> {
        let child = {
            let mut st = self.lock_state();
            if let Some(existing) = st.children.get(key) {
                return Arc::clone(existing);
            }
            let child = CacheNode::new_routing(self, key);
            st.children.insert(key.to_string(), Arc::clone(&child));
            child
        };
        self.notify_level(key, None);
        child
    }

    /// Put `value` under the child `key`, creating the child if it is not
    /// materialised. Lookup and insert happen under one parent lock
    /// acquisition so racing first writes cannot shadow each other.
    pub(crate) fn put_child(
        self: &Arc<Self>,
        key: &str,
        value: Vec<u8>,
        update_in_kv: bool,
        t: i64,
    ) -> bool {
        let existing = {
            let mut st = self.lock_state();
            match st.children.get(key) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    let child = CacheNode::new_value(self, key, value.clone(), update_in_kv, t);
                    st.children.insert(key.to_string(), child);
                    None
                }
            }
        };
        match existing {
            Some(child) => child.put(value, update_in_kv, t),
            None => {
                self.notify_level(key, Some(value));
                true
            }
        }
    }

    /// Put `value` under the child `key` only when the child is missing or
    /// carries no value. Atomic at this node's lock.
    pub(crate) fn put_child_if_absent(
        self: &Arc<Self>,
        key: &str,
        value: Vec<u8>,
        update_in_kv: bool,
        t: i64,
    ) -> bool {
        let mut st = self.lock_state();
        if let Some(existing) = st.children.get(key) {
            let child = Arc::clone(existing);
            let absent = child.lock_state().value.is_none();
            if !absent {
                return false;
            }
            // Parent lock stays held, so no other writer can slip in
            // between the check and the put.
            return child.put(value, update_in_kv, t);
        }
        let child = CacheNode::new_value(self, key, value.clone(), update_in_kv, t);
        st.children.insert(key.to_string(), child);
        drop(st);
        self.notify_level(key, Some(value));
        true
    }

    // ----- level subscriptions --------------------------------------------

    pub(crate) fn subscribe(&self, id: &str, sender: mpsc::Sender<LevelEvent>) {
        self.lock_subscribers().insert(id.to_string(), sender);
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        self.lock_subscribers().remove(id);
    }

    /// Fan a child-level change out to every subscriber without blocking
    /// the mutator: if a channel has room the send is inline, otherwise a
    /// detached task completes it.
    pub(crate) fn notify_level(&self, key: &str, value: Option<Vec<u8>>) {
        let subs = self.lock_subscribers();
        for tx in subs.values() {
            let event = LevelEvent {
                key: key.to_string(),
                value: value.clone(),
            };
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            let tx = tx.clone();
                            handle.spawn(async move {
                                let _ = tx.send(event).await;
                            });
                        }
                        Err(_) => {
                            warn!(key, "subscriber channel full outside a runtime; event dropped");
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}
