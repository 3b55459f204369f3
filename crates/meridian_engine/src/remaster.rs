//! Mastership-counter verification and the queues of transactions blocked
//! behind pending remasters.
//!
//! Transactions are held in the order of their origin log: if a transaction
//! from region 1 is blocked, every later region-1 transaction queues behind
//! it, preserving log order while a remaster is in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::storage::Storage;
use crate::types::{Key, Metadata, ReplicaId, TxnId};

/// Identity of a single-home transaction or one lock-only piece of a
/// multi-home transaction: the transaction id plus the replica whose log
/// carries it.
pub type TxnLoId = (TxnId, ReplicaId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMasterResult {
    /// Counters match storage; the transaction can proceed to locking.
    Valid,
    /// A remaster the transaction observed has not been applied locally yet;
    /// it is queued until `remaster_occurred` unblocks it.
    Waiting,
    /// The transaction observed stale mastership and must abort.
    Abort,
}

#[derive(Debug, Default)]
pub struct RemasterOccurredResult {
    pub unblocked: Vec<TxnLoId>,
    pub should_abort: Vec<TxnLoId>,
}

#[derive(Debug)]
struct BlockedTxn {
    id: TxnLoId,
    /// Keys on this partition with the metadata the transaction observed.
    /// For the lock-only copy destined for a remaster's new master the
    /// counters are already adjusted to the post-remaster value.
    keys: Vec<(Key, Metadata)>,
}

/// Compare observed counters against storage. A counter behind storage
/// aborts; one ahead waits; equal counters with a mismatched master mean
/// divergent replicas and crash the process. Also used by workers for the
/// final pre-read check.
pub fn check_counters(storage: &dyn Storage, keys: &[(Key, Metadata)]) -> VerifyMasterResult {
    let mut any_waiting = false;
    for (key, observed) in keys {
        let record = storage.read(key);
        let storage_counter = record.as_ref().map_or(0, |r| r.metadata.counter);
        if observed.counter < storage_counter {
            return VerifyMasterResult::Abort;
        }
        if observed.counter > storage_counter {
            any_waiting = true;
        } else if let Some(record) = record {
            assert_eq!(
                observed.master, record.metadata.master,
                "masters disagree for key {key:?} at counter {storage_counter}"
            );
        }
    }
    if any_waiting {
        VerifyMasterResult::Waiting
    } else {
        VerifyMasterResult::Valid
    }
}

pub struct RemasterManager {
    storage: Arc<dyn Storage>,
    /// One queue per origin log.
    blocked_queue: HashMap<ReplicaId, VecDeque<BlockedTxn>>,
}

impl RemasterManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            blocked_queue: HashMap::new(),
        }
    }

    /// Check the transaction's observed counters against storage. Waiting
    /// transactions are queued on their origin log; the caller must not
    /// acquire locks until the id comes back via `remaster_occurred`.
    pub fn verify_master(&mut self, id: TxnLoId, keys: &[(Key, Metadata)]) -> VerifyMasterResult {
        if keys.is_empty() {
            return VerifyMasterResult::Valid;
        }
        let origin = id.1;

        // Order preservation: anything already blocked on this origin log
        // forces later transactions from the same log to queue behind it.
        if self
            .blocked_queue
            .get(&origin)
            .is_some_and(|queue| !queue.is_empty())
        {
            self.push_blocked(origin, id, keys);
            return VerifyMasterResult::Waiting;
        }

        let result = self.check_counters(keys);
        if result == VerifyMasterResult::Waiting {
            self.push_blocked(origin, id, keys);
        }
        result
    }

    /// A remaster of `key` was applied locally with the given new counter.
    /// Re-drive every queue whose head references the key.
    pub fn remaster_occurred(&mut self, key: &Key, _new_counter: u32) -> RemasterOccurredResult {
        let mut result = RemasterOccurredResult::default();
        let origins: Vec<ReplicaId> = self
            .blocked_queue
            .iter()
            .filter(|(_, queue)| {
                queue
                    .front()
                    .is_some_and(|head| head.keys.iter().any(|(k, _)| k == key))
            })
            .map(|(origin, _)| *origin)
            .collect();
        for origin in origins {
            self.try_to_unblock(origin, &mut result);
        }
        result
    }

    /// Remove a transaction from every queue it sits in, then re-drive the
    /// queues whose head changed. The released transaction is guaranteed not
    /// to appear in the returned result.
    pub fn release_transaction(&mut self, txn_id: TxnId) -> RemasterOccurredResult {
        let mut result = RemasterOccurredResult::default();
        let mut reopened = Vec::new();
        for (origin, queue) in self.blocked_queue.iter_mut() {
            let head_released = queue.front().is_some_and(|head| head.id.0 == txn_id);
            let before = queue.len();
            queue.retain(|entry| entry.id.0 != txn_id);
            if head_released && queue.len() != before {
                reopened.push(*origin);
            }
        }
        for origin in reopened {
            self.try_to_unblock(origin, &mut result);
        }
        result
    }

    fn push_blocked(&mut self, origin: ReplicaId, id: TxnLoId, keys: &[(Key, Metadata)]) {
        self.blocked_queue
            .entry(origin)
            .or_default()
            .push_back(BlockedTxn {
                id,
                keys: keys.to_vec(),
            });
    }

    /// Pop and report queue heads until one has to keep waiting.
    fn try_to_unblock(&mut self, origin: ReplicaId, result: &mut RemasterOccurredResult) {
        loop {
            let Some(head_keys) = self
                .blocked_queue
                .get(&origin)
                .and_then(|queue| queue.front())
                .map(|head| head.keys.clone())
            else {
                return;
            };
            let verdict = self.check_counters(&head_keys);
            if verdict == VerifyMasterResult::Waiting {
                return;
            }
            let head = self
                .blocked_queue
                .get_mut(&origin)
                .and_then(VecDeque::pop_front)
                .expect("queue head vanished");
            match verdict {
                VerifyMasterResult::Valid => result.unblocked.push(head.id),
                VerifyMasterResult::Abort => result.should_abort.push(head.id),
                VerifyMasterResult::Waiting => unreachable!(),
            }
        }
    }

    fn check_counters(&self, keys: &[(Key, Metadata)]) -> VerifyMasterResult {
        check_counters(self.storage.as_ref(), keys)
    }

    pub fn num_blocked(&self) -> usize {
        self.blocked_queue.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use crate::types::Record;

    fn manager_with(records: &[(&str, ReplicaId, u32)]) -> (RemasterManager, Arc<MemStorage>) {
        let storage = Arc::new(MemStorage::new());
        for (key, master, counter) in records {
            storage.write(&Key::from(*key), Record::new("v", *master, *counter));
        }
        (RemasterManager::new(storage.clone()), storage)
    }

    fn key_meta(key: &str, master: ReplicaId, counter: u32) -> Vec<(Key, Metadata)> {
        vec![(Key::from(key), Metadata::new(master, counter))]
    }

    #[test]
    fn matching_counter_is_valid() {
        let (mut rm, _) = manager_with(&[("A", 0, 1)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 1)),
            VerifyMasterResult::Valid
        );
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn missing_key_counts_as_zero() {
        let (mut rm, _) = manager_with(&[]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("NEW", 0, 0)),
            VerifyMasterResult::Valid
        );
    }

    #[test]
    fn behind_counter_aborts_ahead_counter_waits() {
        let (mut rm, _) = manager_with(&[("A", 0, 1)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 0)),
            VerifyMasterResult::Abort
        );
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("A", 0, 2)),
            VerifyMasterResult::Waiting
        );
        assert_eq!(rm.num_blocked(), 1);
    }

    #[test]
    fn later_txns_queue_behind_blocked_origin() {
        let (mut rm, _) = manager_with(&[("A", 0, 1), ("B", 0, 0)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 2)),
            VerifyMasterResult::Waiting
        );
        // Valid on its own, but queued behind txn 1 from the same log.
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("B", 0, 0)),
            VerifyMasterResult::Waiting
        );
        // A different origin log is unaffected.
        assert_eq!(
            rm.verify_master((3, 1), &key_meta("B", 0, 0)),
            VerifyMasterResult::Valid
        );
    }

    // The remaster scenario: a transaction ahead of the remaster unblocks,
    // one behind it aborts.
    #[test]
    fn remaster_unblocks_head_and_aborts_stale_follower() {
        let (mut rm, storage) = manager_with(&[("A", 0, 1)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 2)),
            VerifyMasterResult::Waiting
        );
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("A", 0, 1)),
            VerifyMasterResult::Waiting
        );

        storage.write(&Key::from("A"), Record::new("v", 0, 2));
        let result = rm.remaster_occurred(&Key::from("A"), 2);
        assert_eq!(result.unblocked, vec![(1, 0)]);
        assert_eq!(result.should_abort, vec![(2, 0)]);
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn unblocking_continues_past_popped_heads() {
        let (mut rm, storage) = manager_with(&[("A", 0, 0), ("B", 0, 0)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 1)),
            VerifyMasterResult::Waiting
        );
        // Blocked purely by queue order.
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("B", 0, 0)),
            VerifyMasterResult::Waiting
        );

        storage.write(&Key::from("A"), Record::new("v", 0, 1));
        let result = rm.remaster_occurred(&Key::from("A"), 1);
        assert_eq!(result.unblocked, vec![(1, 0), (2, 0)]);
        assert!(result.should_abort.is_empty());
    }

    #[test]
    fn released_txn_never_returned() {
        let (mut rm, _) = manager_with(&[("A", 0, 0)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 1)),
            VerifyMasterResult::Waiting
        );
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("A", 0, 0)),
            VerifyMasterResult::Waiting
        );

        let result = rm.release_transaction(1);
        assert!(!result.unblocked.contains(&(1, 0)));
        assert!(!result.should_abort.contains(&(1, 0)));
        // The follower was valid all along and surfaces once the head goes.
        assert_eq!(result.unblocked, vec![(2, 0)]);
    }

    #[test]
    fn release_of_non_head_keeps_queue_blocked() {
        let (mut rm, _) = manager_with(&[("A", 0, 0)]);
        assert_eq!(
            rm.verify_master((1, 0), &key_meta("A", 0, 2)),
            VerifyMasterResult::Waiting
        );
        assert_eq!(
            rm.verify_master((2, 0), &key_meta("A", 0, 0)),
            VerifyMasterResult::Waiting
        );
        let result = rm.release_transaction(2);
        assert!(result.unblocked.is_empty() && result.should_abort.is_empty());
        assert_eq!(rm.num_blocked(), 1);
    }

    #[test]
    #[should_panic(expected = "masters disagree")]
    fn master_mismatch_at_equal_counter_is_fatal() {
        let (mut rm, _) = manager_with(&[("A", 0, 1)]);
        rm.verify_master((1, 1), &key_meta("A", 1, 1));
    }
}
