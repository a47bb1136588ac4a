use std::collections::HashSet;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels.
///
/// The lock manager itself only enforces two-phase locking; the isolation
/// policy is driven by the caller: REPEATABLE_READ keeps every lock until the
/// transaction ends, READ_COMMITTED drops shared locks as soon as a row has
/// been produced, and READ_UNCOMMITTED never takes shared locks at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction lifecycle states. A transaction is born GROWING, moves to
/// SHRINKING on its first unlock, and ends in one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Transaction {0} not found")]
    NotFound(TxnId),
}

/// An active transaction: immutable identity plus the mutable lock-tracking
/// state shared between the executor layer, the lock manager, and the
/// deadlock detector.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    /// Transition the lifecycle state. Terminal states are never left, so a
    /// racing setter cannot resurrect a committed or aborted transaction.
    pub fn set_state(&self, new_state: TransactionState) {
        let mut state = self.state.write();
        if state.is_terminal() {
            return;
        }
        *state = new_state;
    }

    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub fn shared_rids(&self) -> Vec<Rid> {
        self.shared_lock_set.lock().iter().copied().collect()
    }

    pub fn exclusive_rids(&self) -> Vec<Rid> {
        self.exclusive_lock_set.lock().iter().copied().collect()
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    /// Migrate a rid from the shared to the exclusive set after an upgrade
    pub(crate) fn promote_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
        self.exclusive_lock_set.lock().insert(rid);
    }

    /// Forget a rid entirely (used by unlock)
    pub(crate) fn remove_lock(&self, rid: &Rid) {
        self.shared_lock_set.lock().remove(rid);
        self.exclusive_lock_set.lock().remove(rid);
    }
}
