use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Transaction manager: assigns monotonically increasing transaction ids and
/// tracks active transactions. Commit and abort release every lock the
/// transaction still holds through the lock manager.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions
            .lock()
            .insert(txn_id, Arc::clone(&txn));
        txn
    }

    /// Commit a transaction, releasing its locks first
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed || txn.state() == TransactionState::Aborted {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        self.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.finish(txn.id());
        Ok(())
    }

    /// Abort a transaction, releasing its locks. Also used to finish a
    /// transaction the deadlock detector already marked ABORTED.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        txn.set_state(TransactionState::Aborted);
        self.release_all_locks(txn);
        self.finish(txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }

    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.exclusive_rids() {
            self.lock_manager.unlock(txn, rid);
        }
        for rid in txn.shared_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }

    fn finish(&self, txn_id: TxnId) {
        self.active_transactions.lock().remove(&txn_id);
        self.lock_manager.forget_txn(txn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Rid;
    use std::time::Duration;

    fn setup() -> (Arc<LockManager>, TransactionManager) {
        let lock_manager = Arc::new(LockManager::new(Duration::from_millis(10)));
        let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));
        (lock_manager, txn_manager)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (_, tm) = setup();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert!(t2.id() > t1.id());
        assert_eq!(tm.active_transaction_ids().len(), 2);
    }

    #[test]
    fn test_commit_releases_locks() {
        let (lm, tm) = setup();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_exclusive(&t1, rid));
        tm.commit(&t1).unwrap();
        assert_eq!(t1.state(), TransactionState::Committed);
        assert!(t1.exclusive_rids().is_empty());
        assert!(tm.get_transaction(t1.id()).is_none());

        // the rid is free again for the next transaction
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert!(lm.lock_exclusive(&t2, rid));
    }

    #[test]
    fn test_abort_releases_locks() {
        let (lm, tm) = setup();
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        let rid = Rid::new(2, 7);

        assert!(lm.lock_shared(&t1, rid));
        tm.abort(&t1).unwrap();
        assert_eq!(t1.state(), TransactionState::Aborted);
        assert!(t1.shared_rids().is_empty());
    }

    #[test]
    fn test_double_commit_fails() {
        let (_, tm) = setup();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        tm.commit(&t1).unwrap();
        assert!(matches!(
            tm.commit(&t1),
            Err(TransactionError::InvalidState(_))
        ));
    }
}
