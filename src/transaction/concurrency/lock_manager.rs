use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

/// Per-RID queue of lock requests. Ordering determines the grant policy:
/// a shared request is grantable when no exclusive request is ahead of it,
/// an exclusive request only when it is at the head.
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct QueueState {
    requests: VecDeque<LockRequest>,
    upgrading: bool,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                upgrading: false,
            }),
            cond: Condvar::new(),
        }
    }
}

/// Row-level lock manager: shared/exclusive locking with two-phase-locking
/// state tracking per transaction and wait-for deadlock detection.
///
/// Blocked requests wait on their queue's condition variable and re-check
/// the grant predicate and their transaction's state on every wake-up; the
/// only asynchronous termination is an abort by the deadlock detector.
pub struct LockManager {
    lock_table: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    /// Wait-for graph: edges from waiting to holding transactions. Rebuilt
    /// by every detection pass; also driven directly by the edge inspection
    /// methods in tests.
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    /// Every transaction the manager has seen, so the detector can abort by id
    txn_table: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    cycle_detection_interval: Duration,
    running: AtomicBool,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(cycle_detection_interval: Duration) -> Self {
        Self {
            lock_table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            txn_table: Mutex::new(HashMap::new()),
            cycle_detection_interval,
            running: AtomicBool::new(false),
            detector: Mutex::new(None),
        }
    }

    /// Acquire a shared lock on `rid`. Blocks until granted or the
    /// transaction is aborted; returns whether the lock was granted.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        // READ_UNCOMMITTED never takes shared locks
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        self.register_txn(txn);

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        state.requests.push_back(LockRequest::new(txn.id(), LockMode::Shared));

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::remove_request(&mut state, txn.id());
                queue.cond.notify_all();
                return false;
            }

            // grantable iff nothing exclusive sits ahead of us in the queue
            let mut grantable = false;
            for request in state.requests.iter() {
                if request.txn_id == txn.id() {
                    grantable = true;
                    break;
                }
                if request.mode == LockMode::Exclusive {
                    break;
                }
            }

            if grantable {
                if let Some(request) = state.requests.iter_mut().find(|r| r.txn_id == txn.id()) {
                    request.granted = true;
                }
                txn.add_shared_lock(rid);
                debug!("txn {} granted S on {}", txn.id(), rid);
                return true;
            }
            queue.cond.wait(&mut state);
        }
    }

    /// Acquire an exclusive lock on `rid`. Blocks until granted or the
    /// transaction is aborted; returns whether the lock was granted.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        self.register_txn(txn);

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        state
            .requests
            .push_back(LockRequest::new(txn.id(), LockMode::Exclusive));

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::remove_request(&mut state, txn.id());
                queue.cond.notify_all();
                return false;
            }

            // exclusive grants only at the head of the queue
            if state.requests.front().map(|r| r.txn_id) == Some(txn.id()) {
                if let Some(request) = state.requests.front_mut() {
                    request.granted = true;
                }
                txn.add_exclusive_lock(rid);
                debug!("txn {} granted X on {}", txn.id(), rid);
                return true;
            }
            queue.cond.wait(&mut state);
        }
    }

    /// Upgrade an already-held shared lock to exclusive. Only one upgrade
    /// may be in flight per RID; a second concurrent upgrade fails.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        match txn.state() {
            TransactionState::Shrinking | TransactionState::Aborted => return false,
            _ => {}
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        if state.upgrading {
            return false;
        }

        let position = match state.requests.iter().position(|r| r.txn_id == txn.id()) {
            Some(position) => position,
            None => return false,
        };
        state.upgrading = true;

        // Rewrite our request as an ungranted exclusive and move it forward,
        // just behind the remaining holders: immediately before the first
        // other request that is exclusive or not yet granted.
        let mut request = match state.requests.remove(position) {
            Some(request) => request,
            None => {
                state.upgrading = false;
                return false;
            }
        };
        request.mode = LockMode::Exclusive;
        request.granted = false;
        let insert_at = state
            .requests
            .iter()
            .position(|r| r.mode == LockMode::Exclusive || !r.granted)
            .unwrap_or(state.requests.len());
        state.requests.insert(insert_at, request);

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::remove_request(&mut state, txn.id());
                state.upgrading = false;
                queue.cond.notify_all();
                return false;
            }

            if state.requests.front().map(|r| r.txn_id) == Some(txn.id()) {
                if let Some(request) = state.requests.front_mut() {
                    request.granted = true;
                }
                state.upgrading = false;
                txn.promote_lock(rid);
                debug!("txn {} upgraded to X on {}", txn.id(), rid);
                return true;
            }
            queue.cond.wait(&mut state);
        }
    }

    /// Release `txn`'s lock on `rid`. The first unlock moves the
    /// transaction from GROWING to SHRINKING.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();

        if !Self::remove_request(&mut state, txn.id()) {
            return false;
        }

        if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }
        txn.remove_lock(&rid);
        queue.cond.notify_all();
        debug!("txn {} released lock on {}", txn.id(), rid);
        true
    }

    fn remove_request(state: &mut QueueState, txn_id: TxnId) -> bool {
        match state.requests.iter().position(|r| r.txn_id == txn_id) {
            Some(position) => {
                state.requests.remove(position);
                true
            }
            None => false,
        }
    }

    fn queue_for(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut table = self.lock_table.lock();
        Arc::clone(
            table
                .entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn register_txn(&self, txn: &Arc<Transaction>) {
        self.txn_table
            .lock()
            .entry(txn.id())
            .or_insert_with(|| Arc::clone(txn));
    }

    /// Drop a finished transaction from the registry
    pub fn forget_txn(&self, txn_id: TxnId) {
        self.txn_table.lock().remove(&txn_id);
    }

    // ---- wait-for graph ----

    pub fn add_edge(&self, waiter: TxnId, holder: TxnId) {
        self.waits_for
            .lock()
            .entry(waiter)
            .or_default()
            .insert(holder);
    }

    pub fn remove_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut graph = self.waits_for.lock();
        if let Some(holders) = graph.get_mut(&waiter) {
            holders.remove(&holder);
        }
    }

    /// All edges, waiter first, in deterministic order
    pub fn get_edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        graph
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&holder| (waiter, holder)))
            .collect()
    }

    /// Search the wait-for graph for a cycle. Traversal is deterministic:
    /// starting vertices and neighbours are visited in ascending id order.
    /// Returns the youngest transaction in the first cycle found.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let graph = self.waits_for.lock();
        let mut visited = HashSet::new();

        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = Self::dfs(&graph, start, &mut visited, &mut path) {
                return cycle.into_iter().max();
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        vertex: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        visited.insert(vertex);
        path.push(vertex);

        if let Some(neighbours) = graph.get(&vertex) {
            for &next in neighbours {
                if let Some(start) = path.iter().position(|&v| v == next) {
                    // back-edge: everything from `next` onward is the cycle
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = Self::dfs(graph, next, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        None
    }

    /// One full detection pass: rebuild the wait-for graph from the lock
    /// queues, then abort the youngest member of every cycle until the graph
    /// is acyclic.
    pub fn run_cycle_detection(&self) {
        self.build_waits_for();

        while let Some(victim) = self.has_cycle() {
            warn!("deadlock detected; aborting youngest txn {}", victim);
            if let Some(txn) = self.txn_table.lock().get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            self.remove_vertex(victim);
            self.notify_all_queues();
        }
    }

    fn build_waits_for(&self) {
        let queues: Vec<Arc<LockRequestQueue>> =
            self.lock_table.lock().values().cloned().collect();
        let aborted: HashSet<TxnId> = {
            let table = self.txn_table.lock();
            table
                .iter()
                .filter(|(_, txn)| txn.state() == TransactionState::Aborted)
                .map(|(&id, _)| id)
                .collect()
        };

        let mut graph = self.waits_for.lock();
        graph.clear();
        for queue in queues {
            let state = queue.state.lock();
            let holders: Vec<TxnId> = state
                .requests
                .iter()
                .filter(|r| r.granted && !aborted.contains(&r.txn_id))
                .map(|r| r.txn_id)
                .collect();
            for waiter in state
                .requests
                .iter()
                .filter(|r| !r.granted && !aborted.contains(&r.txn_id))
            {
                for &holder in &holders {
                    if holder != waiter.txn_id {
                        graph.entry(waiter.txn_id).or_default().insert(holder);
                    }
                }
            }
        }
    }

    fn remove_vertex(&self, txn_id: TxnId) {
        let mut graph = self.waits_for.lock();
        graph.remove(&txn_id);
        for holders in graph.values_mut() {
            holders.remove(&txn_id);
        }
    }

    fn notify_all_queues(&self) {
        let queues: Vec<Arc<LockRequestQueue>> =
            self.lock_table.lock().values().cloned().collect();
        for queue in queues {
            queue.cond.notify_all();
        }
    }

    // ---- background detection thread ----

    /// Spawn the background detection thread. Idempotent.
    pub fn start_cycle_detection(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while manager.running.load(Ordering::SeqCst) {
                std::thread::sleep(manager.cycle_detection_interval);
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                manager.run_cycle_detection();
            }
        });
        *self.detector.lock() = Some(handle);
    }

    /// Stop and join the detection thread
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, IsolationLevel::RepeatableRead))
    }

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(10))
    }

    #[test]
    fn test_shared_then_shared_grants() {
        let lm = manager();
        let t1 = txn(1);
        let t2 = txn(2);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t2, rid));
        assert!(t1.is_shared_locked(&rid));
        assert!(t2.is_shared_locked(&rid));
    }

    #[test]
    fn test_unlock_transitions_to_shrinking() {
        let lm = manager();
        let t1 = txn(1);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_exclusive(&t1, rid));
        assert!(lm.unlock(&t1, rid));
        assert_eq!(t1.state(), TransactionState::Shrinking);
        assert!(!t1.is_exclusive_locked(&rid));

        // 2PL: no lock may be acquired after the first unlock
        assert!(!lm.lock_shared(&t1, Rid::new(1, 2)));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_unlock_unknown_rid_fails() {
        let lm = manager();
        let t1 = txn(1);
        assert!(!lm.unlock(&t1, Rid::new(9, 9)));
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn test_read_uncommitted_shared_lock_aborts() {
        let lm = manager();
        let t1 = Arc::new(Transaction::new(1, IsolationLevel::ReadUncommitted));
        assert!(!lm.lock_shared(&t1, Rid::new(1, 1)));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_sole_holder_upgrade_succeeds_inline() {
        let lm = manager();
        let t1 = txn(1);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_upgrade(&t1, rid));
        assert!(t1.is_exclusive_locked(&rid));
        assert!(!t1.is_shared_locked(&rid));
    }

    #[test]
    fn test_upgrade_without_prior_lock_fails() {
        let lm = manager();
        let t1 = txn(1);
        assert!(!lm.lock_upgrade(&t1, Rid::new(1, 1)));
    }

    #[test]
    fn test_edge_list_is_deterministic() {
        let lm = manager();
        lm.add_edge(3, 1);
        lm.add_edge(1, 2);
        lm.add_edge(1, 0);
        assert_eq!(lm.get_edge_list(), vec![(1, 0), (1, 2), (3, 1)]);

        lm.remove_edge(1, 0);
        assert_eq!(lm.get_edge_list(), vec![(1, 2), (3, 1)]);
    }

    #[test]
    fn test_has_cycle_finds_youngest() {
        let lm = manager();
        lm.add_edge(1, 2);
        lm.add_edge(2, 3);
        assert_eq!(lm.has_cycle(), None);

        lm.add_edge(3, 1);
        // cycle 1 -> 2 -> 3 -> 1: youngest member is 3
        assert_eq!(lm.has_cycle(), Some(3));
    }

    #[test]
    fn test_has_cycle_self_loop_and_empty_graph() {
        let lm = manager();
        assert_eq!(lm.has_cycle(), None);

        lm.add_edge(5, 5);
        assert_eq!(lm.has_cycle(), Some(5));
    }

    #[test]
    fn test_detection_pass_clears_all_cycles() {
        let lm = manager();
        let t1 = txn(1);
        let t2 = txn(2);
        lm.register_txn(&t1);
        lm.register_txn(&t2);

        lm.add_edge(1, 2);
        lm.add_edge(2, 1);
        while let Some(victim) = lm.has_cycle() {
            if let Some(t) = lm.txn_table.lock().get(&victim) {
                t.set_state(TransactionState::Aborted);
            }
            lm.remove_vertex(victim);
        }
        assert_eq!(lm.has_cycle(), None);
        // the youngest participant was the victim
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert_eq!(t1.state(), TransactionState::Growing);
    }
}
