//! The transaction wire object and the operations the pipeline performs on
//! it: type resolution, validation, key extraction, and sub-transaction
//! merging.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::{Key, LockMode, MachineId, Metadata, PartitionId, ReplicaId, TxnId, Value};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Master metadata is not complete yet; the forwarder resolves this.
    #[default]
    Unknown,
    SingleHome,
    MultiHome,
    /// Projection of a multi-home transaction onto one replica's log.
    LockOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[default]
    NotStarted,
    Committed,
    Aborted,
}

/// What the transaction does once all its inputs are collected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    /// Key-value command script, e.g. `"SET a foo SET b bar"`.
    Code(String),
    /// Move mastership of the single key in the write set to `new_master`.
    Remaster { new_master: ReplicaId },
}

impl Default for Procedure {
    fn default() -> Self {
        Procedure::Code(String::new())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub read_set: BTreeMap<Key, Value>,
    pub write_set: BTreeMap<Key, Value>,
    pub delete_set: Vec<Key>,
    pub procedure: Procedure,
    /// Mastership of each accessed key as observed by the submitter.
    pub master_metadata: BTreeMap<Key, Metadata>,
    pub txn_type: TransactionType,
    /// Replica whose log carries this transaction. Meaningful for
    /// single-home and lock-only transactions.
    pub home: ReplicaId,
    /// Replicas mastering at least one accessed key, ascending.
    pub involved_replicas: Vec<ReplicaId>,
    pub coordinating_server: MachineId,
    pub status: TransactionStatus,
    pub abort_reason: String,
    /// Set on the lock-only copy that a remaster transaction sends through
    /// its destination replica's log.
    pub new_master_lock_only: bool,
}

impl Transaction {
    pub fn is_remaster(&self) -> bool {
        matches!(self.procedure, Procedure::Remaster { .. })
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.status = TransactionStatus::Aborted;
        self.abort_reason = reason.into();
    }

    /// All keys this transaction touches, with the lock mode each needs.
    /// A key in both sets takes a write lock.
    pub fn keys_with_modes(&self) -> impl Iterator<Item = (&Key, LockMode)> {
        let reads = self
            .read_set
            .keys()
            .filter(|k| !self.write_set.contains_key(*k))
            .map(|k| (k, LockMode::Read));
        let writes = self.write_set.keys().map(|k| (k, LockMode::Write));
        reads.chain(writes)
    }

    /// Keys of this transaction stored on the local partition, with modes.
    pub fn keys_in_partition(&self, config: &Config) -> Vec<(Key, LockMode)> {
        self.keys_with_modes()
            .filter(|(key, _)| config.key_is_in_local_partition(key))
            .map(|(key, mode)| (key.clone(), mode))
            .collect()
    }

    /// Partitions holding at least one accessed key.
    pub fn involved_partitions(&self, config: &Config) -> BTreeSet<PartitionId> {
        self.keys_with_modes()
            .map(|(key, _)| config.partition_of_key(key))
            .collect()
    }
}

/// Classify a transaction once its master metadata is complete and fill in
/// `home` and `involved_replicas`. Returns `Unknown` when metadata for some
/// accessed key is still missing.
pub fn set_transaction_type(txn: &mut Transaction) -> TransactionType {
    let metadata_complete = txn
        .keys_with_modes()
        .all(|(key, _)| txn.master_metadata.contains_key(key));
    if !metadata_complete {
        txn.txn_type = TransactionType::Unknown;
        return txn.txn_type;
    }

    let mut masters: BTreeSet<ReplicaId> =
        txn.master_metadata.values().map(|m| m.master).collect();
    if let Procedure::Remaster { new_master } = txn.procedure {
        // A remaster flows through both the current and the destination
        // replica's logs.
        masters.insert(new_master);
    }

    txn.involved_replicas = masters.iter().copied().collect();
    if masters.len() == 1 {
        txn.txn_type = TransactionType::SingleHome;
        txn.home = txn.involved_replicas[0];
    } else {
        txn.txn_type = TransactionType::MultiHome;
    }
    txn.txn_type
}

/// Server-side admission checks. Failures short-circuit into an immediate
/// aborted response without entering the pipeline.
pub fn validate_transaction(txn: &Transaction) -> Result<(), String> {
    if txn.read_set.is_empty() && txn.write_set.is_empty() {
        return Err("transaction accesses no keys".into());
    }
    if txn.is_remaster() && (txn.write_set.len() != 1 || !txn.read_set.is_empty()) {
        return Err("remaster transaction must write exactly one key and read none".into());
    }
    Ok(())
}

/// Merge a completed sub-transaction from another partition into the primary
/// one. An aborted sub-transaction dominates; conflicting values for the
/// same key indicate divergent replicas and crash the process.
pub fn merge_transaction(txn: &mut Transaction, other: &Transaction) {
    assert_eq!(
        txn.id, other.id,
        "cannot merge transactions with different ids"
    );

    merge_sets(&mut txn.read_set, &other.read_set, other.id);
    merge_sets(&mut txn.write_set, &other.write_set, other.id);
    for key in &other.delete_set {
        if !txn.delete_set.contains(key) {
            txn.delete_set.push(key.clone());
        }
    }

    if txn.status != TransactionStatus::Aborted {
        txn.status = other.status;
    }
    if other.status == TransactionStatus::Aborted && !other.abort_reason.is_empty() {
        txn.abort_reason = other.abort_reason.clone();
    }
}

fn merge_sets(into: &mut BTreeMap<Key, Value>, from: &BTreeMap<Key, Value>, txn_id: TxnId) {
    for (key, value) in from {
        match into.get(key) {
            Some(existing) => assert_eq!(
                existing, value,
                "conflicting values for key {key:?} while merging sub-transactions of txn {txn_id}"
            ),
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Build a transaction from literal key sets. Used by tests and the workload
/// generator.
pub fn make_transaction<K: Into<Key> + Clone>(
    read_keys: &[K],
    write_keys: &[K],
    code: impl Into<String>,
) -> Transaction {
    let mut txn = Transaction {
        procedure: Procedure::Code(code.into()),
        ..Default::default()
    };
    for key in read_keys {
        txn.read_set.insert(key.clone().into(), Value::new());
    }
    for key in write_keys {
        txn.write_set.insert(key.clone().into(), Value::new());
    }
    txn
}

/// Stamp every accessed key with the same master metadata.
pub fn fill_metadata(txn: &mut Transaction, master: ReplicaId, counter: u32) {
    let keys: Vec<Key> = txn
        .read_set
        .keys()
        .chain(txn.write_set.keys())
        .cloned()
        .collect();
    for key in keys {
        txn.master_metadata
            .insert(key, Metadata::new(master, counter));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_unknown_until_metadata_complete() {
        let mut txn = make_transaction(&["A"], &["B"], "SET B x");
        assert_eq!(set_transaction_type(&mut txn), TransactionType::Unknown);

        txn.master_metadata
            .insert("A".into(), Metadata::new(0, 0));
        assert_eq!(set_transaction_type(&mut txn), TransactionType::Unknown);

        txn.master_metadata
            .insert("B".into(), Metadata::new(0, 0));
        assert_eq!(set_transaction_type(&mut txn), TransactionType::SingleHome);
        assert_eq!(txn.home, 0);
        assert_eq!(txn.involved_replicas, vec![0]);
    }

    #[test]
    fn multi_home_when_masters_differ() {
        let mut txn = make_transaction(&["A", "C"], &[] as &[&str], "");
        txn.master_metadata
            .insert("A".into(), Metadata::new(0, 0));
        txn.master_metadata
            .insert("C".into(), Metadata::new(1, 0));
        assert_eq!(set_transaction_type(&mut txn), TransactionType::MultiHome);
        assert_eq!(txn.involved_replicas, vec![0, 1]);
    }

    #[test]
    fn remaster_involves_both_masters() {
        let mut txn = Transaction {
            procedure: Procedure::Remaster { new_master: 1 },
            ..Default::default()
        };
        txn.write_set.insert("A".into(), Value::new());
        txn.master_metadata
            .insert("A".into(), Metadata::new(0, 1));
        assert_eq!(set_transaction_type(&mut txn), TransactionType::MultiHome);
        assert_eq!(txn.involved_replicas, vec![0, 1]);
    }

    #[test]
    fn validation_rejects_empty_and_malformed_remaster() {
        let empty = Transaction::default();
        assert!(validate_transaction(&empty).is_err());

        let mut remaster = Transaction {
            procedure: Procedure::Remaster { new_master: 1 },
            ..Default::default()
        };
        remaster.write_set.insert("A".into(), Value::new());
        assert!(validate_transaction(&remaster).is_ok());

        remaster.read_set.insert("B".into(), Value::new());
        assert!(validate_transaction(&remaster).is_err());
    }

    #[test]
    fn merge_prefers_abort() {
        let mut primary = make_transaction(&["A"], &[] as &[&str], "");
        primary.id = 7;
        primary.status = TransactionStatus::Committed;

        let mut other = make_transaction(&["B"], &[] as &[&str], "");
        other.id = 7;
        other.read_set.insert("B".into(), "vb".into());
        other.abort("stale counter");

        merge_transaction(&mut primary, &other);
        assert_eq!(primary.status, TransactionStatus::Aborted);
        assert_eq!(primary.abort_reason, "stale counter");
        assert_eq!(primary.read_set.get("B").map(String::as_str), Some("vb"));
    }

    #[test]
    #[should_panic(expected = "conflicting values")]
    fn merge_panics_on_divergent_values() {
        let mut primary = make_transaction(&["A"], &[] as &[&str], "");
        primary.read_set.insert("A".into(), "x".into());
        let mut other = primary.clone();
        other.read_set.insert("A".into(), "y".into());
        merge_transaction(&mut primary, &other);
    }

    #[test]
    fn write_dominates_read_in_key_modes() {
        let txn = make_transaction(&["A", "B"], &["B"], "SET B x");
        let modes: Vec<_> = txn.keys_with_modes().collect();
        assert!(modes.contains(&(&"A".to_string(), LockMode::Read)));
        assert!(modes.contains(&(&"B".to_string(), LockMode::Write)));
        assert_eq!(modes.len(), 2);
    }
}
