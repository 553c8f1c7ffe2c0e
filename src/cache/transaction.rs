//! Deferred write batches.
//!
//! A transaction buffers Set/Delete operators under a caller-supplied id.
//! Begins are reference-counted so nested begins of the same logical
//! transaction work; the buffer commits when the count reaches zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One buffered mutation, replayed in insertion order at commit.
pub(crate) enum TxOperator {
    Set {
        key: String,
        value: Vec<u8>,
        update_in_kv: bool,
        time: i64,
    },
    Delete {
        key: String,
        update_in_kv: bool,
        time: i64,
    },
}

struct TxState {
    begin_counter: usize,
    operators: Vec<TxOperator>,
}

struct Transaction {
    state: Mutex<TxState>,
}

#[derive(Default)]
pub(crate) struct TransactionRegistry {
    transactions: Mutex<HashMap<String, Arc<Transaction>>>,
}

impl TransactionRegistry {
    /// Open the transaction, or bump its begin count if it already exists.
    pub(crate) fn begin(&self, id: &str) {
        let mut txs = self.transactions.lock().unwrap();
        match txs.get(id) {
            Some(tx) => tx.state.lock().unwrap().begin_counter += 1,
            None => {
                txs.insert(
                    id.to_string(),
                    Arc::new(Transaction {
                        state: Mutex::new(TxState {
                            begin_counter: 1,
                            operators: Vec::new(),
                        }),
                    }),
                );
            }
        }
    }

    /// Buffer an operator. Returns false when the id was never begun.
    pub(crate) fn append(&self, id: &str, op: TxOperator) -> bool {
        let tx = self.transactions.lock().unwrap().get(id).cloned();
        match tx {
            Some(tx) => {
                tx.state.lock().unwrap().operators.push(op);
                true
            }
            None => false,
        }
    }

    /// Close one begin. When the last begin closes, the transaction is
    /// removed and its operators are returned for commit. Unknown ids are
    /// ignored, matching direct-write behaviour.
    pub(crate) fn end(&self, id: &str) -> Option<Vec<TxOperator>> {
        let tx = self.transactions.lock().unwrap().get(id).cloned()?;
        let mut st = tx.state.lock().unwrap();
        st.begin_counter -= 1;
        if st.begin_counter > 0 {
            return None;
        }
        let operators = std::mem::take(&mut st.operators);
        self.transactions.lock().unwrap().remove(id);
        Some(operators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_op(key: &str) -> TxOperator {
        TxOperator::Set {
            key: key.to_string(),
            value: vec![1],
            update_in_kv: false,
            time: 1,
        }
    }

    #[test]
    fn test_begin_append_end() {
        let registry = TransactionRegistry::default();
        registry.begin("t1");
        assert!(registry.append("t1", set_op("a")));
        assert!(registry.append("t1", set_op("b")));

        let ops = registry.end("t1").unwrap();
        assert_eq!(ops.len(), 2);
        // The id is gone after commit.
        assert!(!registry.append("t1", set_op("c")));
    }

    #[test]
    fn test_nested_begins_commit_once() {
        let registry = TransactionRegistry::default();
        registry.begin("t1");
        registry.begin("t1");
        assert!(registry.append("t1", set_op("a")));

        assert!(registry.end("t1").is_none());
        assert!(registry.append("t1", set_op("b")));
        let ops = registry.end("t1").unwrap();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_unknown_transaction() {
        let registry = TransactionRegistry::default();
        assert!(!registry.append("nope", set_op("a")));
        assert!(registry.end("nope").is_none());
    }
}
