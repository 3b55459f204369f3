//! Deterministic lock manager.
//!
//! Locks are granted strictly in the order transactions request them: if X
//! appears before Y in the local log, X acquires every contended lock before
//! Y. Given the same ordered sequence of register/acquire/release calls, two
//! runs produce identical sets of newly-ready transactions.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{Key, LockMode, TxnId, LOCK_TABLE_SIZE_LIMIT};

/// Locking state of a single key: current mode, holders, and the FIFO queue
/// of waiters with the mode each requested.
#[derive(Debug, Default)]
pub struct LockState {
    mode: LockMode,
    holders: HashSet<TxnId>,
    waiters: HashSet<TxnId>,
    waiter_queue: VecDeque<(TxnId, LockMode)>,
}

impl LockState {
    pub fn acquire_read_lock(&mut self, txn_id: TxnId) -> bool {
        match self.mode {
            LockMode::Unlocked => {
                self.holders.insert(txn_id);
                self.mode = LockMode::Read;
                true
            }
            LockMode::Read => {
                // A reader may share only if no writer is already queued,
                // otherwise it would starve the writer and break log order.
                if self.waiter_queue.is_empty() {
                    self.holders.insert(txn_id);
                    true
                } else {
                    self.enqueue(txn_id, LockMode::Read);
                    false
                }
            }
            LockMode::Write => {
                self.enqueue(txn_id, LockMode::Read);
                false
            }
        }
    }

    pub fn acquire_write_lock(&mut self, txn_id: TxnId) -> bool {
        match self.mode {
            LockMode::Unlocked => {
                self.holders.insert(txn_id);
                self.mode = LockMode::Write;
                true
            }
            LockMode::Read | LockMode::Write => {
                self.enqueue(txn_id, LockMode::Write);
                false
            }
        }
    }

    fn enqueue(&mut self, txn_id: TxnId, mode: LockMode) {
        self.waiters.insert(txn_id);
        self.waiter_queue.push_back((txn_id, mode));
    }

    /// Whether the transaction already holds or awaits this lock. Used to
    /// make re-acquisition by the same transaction idempotent.
    pub fn is_queued(&self, txn_id: TxnId) -> bool {
        self.holders.contains(&txn_id) || self.waiters.contains(&txn_id)
    }

    /// Drop `txn_id` from this key, whether holding or waiting, and promote
    /// waiters if the lock became free. Returns the set of new holders.
    pub fn release(&mut self, txn_id: TxnId) -> HashSet<TxnId> {
        if !self.holders.remove(&txn_id) {
            self.waiter_queue.retain(|(id, _)| *id != txn_id);
            self.waiters.remove(&txn_id);
            return HashSet::new();
        }

        if !self.holders.is_empty() {
            return HashSet::new();
        }

        let Some(&(front_id, front_mode)) = self.waiter_queue.front() else {
            self.mode = LockMode::Unlocked;
            return HashSet::new();
        };

        match front_mode {
            LockMode::Read => {
                // Grant the read lock to every consecutive reader at the head.
                while let Some(&(id, LockMode::Read)) = self.waiter_queue.front() {
                    self.waiter_queue.pop_front();
                    self.waiters.remove(&id);
                    self.holders.insert(id);
                }
                self.mode = LockMode::Read;
            }
            LockMode::Write => {
                self.waiter_queue.pop_front();
                self.waiters.remove(&front_id);
                self.holders.insert(front_id);
                self.mode = LockMode::Write;
            }
            LockMode::Unlocked => unreachable!("waiter queued with Unlocked mode"),
        }
        self.holders.clone()
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holders(&self) -> &HashSet<TxnId> {
        &self.holders
    }

    pub fn waiters(&self) -> &VecDeque<(TxnId, LockMode)> {
        &self.waiter_queue
    }

    /// Invariant check used by tests: `waiters` mirrors `waiter_queue`.
    pub fn waiter_sets_consistent(&self) -> bool {
        let queued: HashSet<TxnId> = self.waiter_queue.iter().map(|(id, _)| *id).collect();
        queued == self.waiters && self.waiter_queue.len() == self.waiters.len()
    }
}

pub struct DeterministicLockManager {
    lock_table: HashMap<Key, LockState>,
    /// Outstanding lock count per transaction. May go negative while a
    /// multi-home transaction's lock-only pieces acquire ahead of the main
    /// transaction being registered.
    num_locks_waited: HashMap<TxnId, i64>,
    lock_table_size_limit: usize,
}

impl Default for DeterministicLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicLockManager {
    pub fn new() -> Self {
        Self::with_table_size_limit(LOCK_TABLE_SIZE_LIMIT)
    }

    pub fn with_table_size_limit(lock_table_size_limit: usize) -> Self {
        Self {
            lock_table: HashMap::new(),
            num_locks_waited: HashMap::new(),
            lock_table_size_limit,
        }
    }

    /// Count the locks a transaction needs on this partition. Returns true
    /// when the transaction already has every lock, which happens when its
    /// lock-only pieces acquired everything before the main transaction
    /// arrived.
    pub fn register_txn(&mut self, txn_id: TxnId, keys: &[(Key, LockMode)]) -> bool {
        if keys.is_empty() {
            return false;
        }
        let waited = self.num_locks_waited.entry(txn_id).or_insert(0);
        *waited += keys.len() as i64;
        if *waited == 0 {
            self.num_locks_waited.remove(&txn_id);
            return true;
        }
        false
    }

    /// Try to take every listed lock; queue behind the current holders where
    /// contended. Returns true when the transaction now holds all its locks.
    pub fn acquire_locks(&mut self, txn_id: TxnId, keys: &[(Key, LockMode)]) -> bool {
        if keys.is_empty() {
            return false;
        }
        for (key, mode) in keys {
            let state = self.lock_table.entry(key.clone()).or_default();
            if state.is_queued(txn_id) {
                continue;
            }
            let granted = match mode {
                LockMode::Read => state.acquire_read_lock(txn_id),
                LockMode::Write => state.acquire_write_lock(txn_id),
                LockMode::Unlocked => panic!("cannot acquire a lock in Unlocked mode"),
            };
            if granted {
                *self.num_locks_waited.entry(txn_id).or_insert(0) -= 1;
            }
        }
        match self.num_locks_waited.get(&txn_id).copied() {
            Some(0) => {
                self.num_locks_waited.remove(&txn_id);
                true
            }
            _ => false,
        }
    }

    pub fn register_txn_and_acquire_locks(
        &mut self,
        txn_id: TxnId,
        keys: &[(Key, LockMode)],
    ) -> bool {
        self.register_txn(txn_id, keys);
        self.acquire_locks(txn_id, keys)
    }

    /// Release every lock the transaction holds or awaits. Returns the ids
    /// of transactions that obtained their full lock set thanks to this
    /// release, each reported at most once per run.
    pub fn release_locks(&mut self, txn_id: TxnId, keys: &[(Key, LockMode)]) -> HashSet<TxnId> {
        let mut ready = HashSet::new();
        for (key, _) in keys {
            let Some(state) = self.lock_table.get_mut(key) else {
                continue;
            };
            for holder in state.release(txn_id) {
                let waited = self.num_locks_waited.entry(holder).or_insert(0);
                *waited -= 1;
                if *waited == 0 {
                    self.num_locks_waited.remove(&holder);
                    ready.insert(holder);
                }
            }
            if state.mode() == LockMode::Unlocked
                && self.lock_table.len() > self.lock_table_size_limit
            {
                self.lock_table.remove(key);
            }
        }
        self.num_locks_waited.remove(&txn_id);
        ready
    }

    pub fn num_locked_keys(&self) -> usize {
        self.lock_table
            .values()
            .filter(|state| state.mode() != LockMode::Unlocked)
            .count()
    }

    pub fn num_waiting_txns(&self) -> usize {
        self.num_locks_waited.len()
    }

    pub fn stats(&self, level: u32) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "num_locked_keys": self.num_locked_keys(),
            "num_txns_waiting_for_lock": self.num_waiting_txns(),
        });
        if level >= 1 {
            stats["num_locks_waited_per_txn"] = self
                .num_locks_waited
                .iter()
                .map(|(txn, waited)| serde_json::json!([txn, waited]))
                .collect();
        }
        stats
    }

    #[cfg(test)]
    fn lock_state(&self, key: &str) -> Option<&LockState> {
        self.lock_table.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(entries: &[(&str, LockMode)]) -> Vec<(Key, LockMode)> {
        entries
            .iter()
            .map(|(key, mode)| (Key::from(*key), *mode))
            .collect()
    }

    fn w(names: &[&str]) -> Vec<(Key, LockMode)> {
        names
            .iter()
            .map(|n| (Key::from(*n), LockMode::Write))
            .collect()
    }

    fn r(names: &[&str]) -> Vec<(Key, LockMode)> {
        names
            .iter()
            .map(|n| (Key::from(*n), LockMode::Read))
            .collect()
    }

    #[test]
    fn readers_share() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &r(&["A"])));
        assert!(lm.register_txn_and_acquire_locks(2, &r(&["A"])));
        let state = lm.lock_state("A").unwrap();
        assert_eq!(state.mode(), LockMode::Read);
        assert_eq!(state.holders().len(), 2);
    }

    #[test]
    fn writer_excludes() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &w(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(2, &w(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(3, &r(&["A"])));
        let state = lm.lock_state("A").unwrap();
        assert_eq!(state.mode(), LockMode::Write);
        assert_eq!(state.holders().len(), 1);
        assert!(state.waiter_sets_consistent());
    }

    #[test]
    fn reader_cannot_overtake_queued_writer() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &r(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(2, &w(&["A"])));
        // Txn 3 requested after writer 2, so it must queue even though the
        // lock is currently shared.
        assert!(!lm.register_txn_and_acquire_locks(3, &r(&["A"])));

        let ready = lm.release_locks(1, &r(&["A"]));
        assert_eq!(ready, HashSet::from([2]));
        assert_eq!(lm.lock_state("A").unwrap().mode(), LockMode::Write);

        let ready = lm.release_locks(2, &w(&["A"]));
        assert_eq!(ready, HashSet::from([3]));
        assert_eq!(lm.lock_state("A").unwrap().mode(), LockMode::Read);
    }

    #[test]
    fn queued_writer_is_promoted_as_writer() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &w(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(2, &w(&["A"])));
        let ready = lm.release_locks(1, &w(&["A"]));
        assert_eq!(ready, HashSet::from([2]));
        // The promoted transaction holds a write lock, not a read lock.
        assert_eq!(lm.lock_state("A").unwrap().mode(), LockMode::Write);
    }

    #[test]
    fn release_promotes_run_of_readers() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &w(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(2, &r(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(3, &r(&["A"])));
        assert!(!lm.register_txn_and_acquire_locks(4, &w(&["A"])));

        let ready = lm.release_locks(1, &w(&["A"]));
        assert_eq!(ready, HashSet::from([2, 3]));
        let state = lm.lock_state("A").unwrap();
        assert_eq!(state.mode(), LockMode::Read);
        assert_eq!(state.holders().len(), 2);
        assert_eq!(state.waiters().len(), 1);
    }

    // The multi-key scenario from the scheduler's public contract: released
    // waiters become ready only once they hold their entire lock set.
    #[test]
    fn release_reports_only_fully_granted_txns() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(100, &w(&["B", "C"])));
        assert!(!lm.register_txn_and_acquire_locks(200, &w(&["B"])));
        assert!(!lm.register_txn_and_acquire_locks(300, &r(&["B"])));
        assert!(!lm.register_txn_and_acquire_locks(400, &r(&["C"])));

        // Releasing a waiter frees nothing.
        assert!(lm.release_locks(300, &r(&["B"])).is_empty());

        let ready = lm.release_locks(100, &w(&["B", "C"]));
        assert_eq!(ready, HashSet::from([200, 400]));
    }

    #[test]
    fn ready_reported_at_most_once() {
        let mut lm = DeterministicLockManager::new();
        assert!(lm.register_txn_and_acquire_locks(1, &w(&["A", "B"])));
        assert!(!lm.register_txn_and_acquire_locks(2, &w(&["A", "B"])));
        let mut seen = 0;
        for key in [("A"), ("B")] {
            let ready = lm.release_locks(1, &keys(&[(key, LockMode::Write)]));
            seen += ready.len();
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn reacquisition_is_idempotent() {
        let mut lm = DeterministicLockManager::new();
        lm.register_txn(1, &w(&["A"]));
        assert!(lm.acquire_locks(1, &w(&["A"])));
        // A second acquisition attempt must not double-count the grant.
        assert!(!lm.acquire_locks(1, &w(&["A"])));
        assert_eq!(lm.lock_state("A").unwrap().holders().len(), 1);
    }

    #[test]
    fn lock_only_grants_before_registration() {
        let mut lm = DeterministicLockManager::new();
        // Lock-only pieces acquire first; the count dips negative.
        assert!(!lm.acquire_locks(9, &w(&["A"])));
        assert!(!lm.acquire_locks(9, &r(&["B"])));
        // Registering the main transaction brings the count back to zero.
        assert!(lm.register_txn(9, &keys(&[("A", LockMode::Write), ("B", LockMode::Read)])));
    }

    #[test]
    fn unlocked_entries_evicted_past_limit() {
        let mut lm = DeterministicLockManager::with_table_size_limit(1);
        assert!(lm.register_txn_and_acquire_locks(1, &w(&["A", "B"])));
        lm.release_locks(1, &w(&["A", "B"]));
        // Table shrank back below the limit.
        assert!(lm.lock_table.len() <= 1);
    }

    #[test]
    fn lock_table_invariants_hold_across_a_run() {
        let mut lm = DeterministicLockManager::new();
        lm.register_txn_and_acquire_locks(1, &w(&["A"]));
        lm.register_txn_and_acquire_locks(2, &r(&["A"]));
        lm.register_txn_and_acquire_locks(3, &r(&["A"]));
        for txn in [1, 2, 3] {
            let state = lm.lock_state("A").unwrap();
            match state.mode() {
                LockMode::Read => assert!(!state.holders().is_empty()),
                LockMode::Write => assert_eq!(state.holders().len(), 1),
                LockMode::Unlocked => assert!(state.holders().is_empty()),
            }
            assert!(state.waiter_sets_consistent());
            lm.release_locks(txn, &w(&["A"]));
        }
        assert_eq!(lm.lock_state("A").unwrap().mode(), LockMode::Unlocked);
    }
}
