//! Scheduler-side bundle of one transaction identity: the main transaction,
//! its lock-only projections, and dispatch bookkeeping.

use crate::config::Config;
use crate::messages::Request;
use crate::txn::Transaction;
use crate::types::{Key, LockMode, Metadata, PartitionId, ReplicaId, TxnId};

/// Container the scheduler keeps per transaction id.
///
/// A holder is created when the scheduler first sees either the main
/// transaction or one of its lock-only pieces, and garbage-collected once
/// the transaction is done and every expected lock-only piece has been
/// accounted for.
#[derive(Debug)]
pub struct TxnHolder {
    txn_id: TxnId,
    main: Option<Transaction>,
    /// Lock-only projections, indexed by the replica whose log carried them.
    lo_txns: Vec<Option<Transaction>>,
    num_lo_txns: usize,
    /// Known once the main transaction arrives.
    expected_num_lo_txns: Option<usize>,
    /// Lockable keys of this partition, cached from the main transaction.
    keys_in_partition: Vec<(Key, LockMode)>,
    involved_partitions: Vec<PartitionId>,
    /// Remote reads that arrived before the transaction was dispatched.
    early_remote_reads: Vec<Request>,
    worker: Option<usize>,
    aborting: bool,
    done: bool,
    num_dispatches: u32,
}

impl TxnHolder {
    pub fn new(txn_id: TxnId, num_replicas: u32) -> Self {
        Self {
            txn_id,
            main: None,
            lo_txns: (0..num_replicas).map(|_| None).collect(),
            num_lo_txns: 0,
            expected_num_lo_txns: None,
            keys_in_partition: Vec::new(),
            involved_partitions: Vec::new(),
            early_remote_reads: Vec::new(),
            worker: None,
            aborting: false,
            done: false,
            num_dispatches: 0,
        }
    }

    /// Install the main transaction. Must happen exactly once.
    pub fn set_main(&mut self, config: &Config, txn: Transaction) {
        assert!(
            self.main.is_none(),
            "main transaction {} installed twice",
            self.txn_id
        );
        assert_eq!(self.txn_id, txn.id);
        self.keys_in_partition = txn.keys_in_partition(config);
        self.involved_partitions = txn.involved_partitions(config).into_iter().collect();
        self.expected_num_lo_txns = Some(txn.involved_replicas.len().max(1));
        self.main = Some(txn);
    }

    /// Record the arrival of a lock-only piece. Returns false for a
    /// duplicate, which is dropped by the caller.
    pub fn add_lock_only(&mut self, txn: Transaction) -> bool {
        let home = txn.home as usize;
        assert!(
            home < self.lo_txns.len(),
            "lock-only txn {} names replica {home} outside the topology",
            self.txn_id
        );
        if self.lo_txns[home].is_some() {
            return false;
        }
        self.lo_txns[home] = Some(txn);
        self.num_lo_txns += 1;
        true
    }

    /// A single-home transaction is its own single "lock-only" piece: count
    /// its arrival without storing a second copy.
    pub fn count_main_as_lock_only(&mut self) {
        self.num_lo_txns += 1;
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn txn(&self) -> &Transaction {
        self.main.as_ref().expect("holder has no main transaction")
    }

    pub fn txn_mut(&mut self) -> &mut Transaction {
        self.main.as_mut().expect("holder has no main transaction")
    }

    pub fn has_main(&self) -> bool {
        self.main.is_some()
    }

    /// Hand the main transaction out for the completion path and drop the
    /// lock-only copies. The holder stays alive until gc-ready.
    pub fn release(&mut self) -> Transaction {
        for lo in &mut self.lo_txns {
            *lo = None;
        }
        self.main.take().expect("holder released twice")
    }

    pub fn keys_in_partition(&self) -> &[(Key, LockMode)] {
        &self.keys_in_partition
    }

    pub fn lock_only_txn(&self, replica: ReplicaId) -> Option<&Transaction> {
        self.lo_txns.get(replica as usize).and_then(Option::as_ref)
    }

    pub fn lock_only_txns(&self) -> impl Iterator<Item = &Transaction> {
        self.lo_txns.iter().filter_map(Option::as_ref)
    }

    pub fn involved_partitions(&self) -> &[PartitionId] {
        &self.involved_partitions
    }

    pub fn early_remote_reads(&mut self) -> &mut Vec<Request> {
        &mut self.early_remote_reads
    }

    pub fn set_worker(&mut self, worker: usize) {
        self.worker = Some(worker);
    }

    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn set_aborting(&mut self) {
        self.aborting = true;
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn inc_num_dispatches(&mut self) {
        self.num_dispatches += 1;
    }

    pub fn num_dispatches(&self) -> u32 {
        self.num_dispatches
    }

    pub fn num_lock_only_txns(&self) -> usize {
        self.num_lo_txns
    }

    pub fn expected_num_lock_only_txns(&self) -> Option<usize> {
        self.expected_num_lo_txns
    }

    /// A holder may be collected once the transaction finished and every
    /// expected lock-only piece has arrived.
    pub fn is_ready_for_gc(&self) -> bool {
        self.done && self.expected_num_lo_txns == Some(self.num_lo_txns)
    }
}

/// The keys a lock-only (or single-home) transaction contributes on this
/// partition, paired with the metadata it observed. The copy routed through
/// a remaster's destination replica represents the post-remaster state, so
/// it is checked against the new master at the next counter.
pub fn remaster_check_keys(config: &Config, txn: &Transaction) -> Vec<(Key, Metadata)> {
    let post_remaster = match (&txn.procedure, txn.new_master_lock_only) {
        (crate::txn::Procedure::Remaster { new_master }, true) => Some(*new_master),
        _ => None,
    };
    txn.keys_with_modes()
        .filter(|(key, _)| config.key_is_in_local_partition(key))
        .filter_map(|(key, _)| {
            txn.master_metadata.get(key).map(|meta| {
                let observed = match post_remaster {
                    Some(new_master) => Metadata::new(new_master, meta.counter + 1),
                    None => *meta,
                };
                (key.clone(), observed)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::txn::{fill_metadata, make_transaction, set_transaction_type};

    fn config() -> Config {
        Config::new(
            ConfigFile {
                protocol: "tcp".into(),
                broker_port: 0,
                server_port: 0,
                num_replicas: 2,
                num_partitions: 1,
                addresses: vec![vec!["127.0.0.1".into()], vec!["127.0.0.1".into()]],
                batch_duration_ms: 1,
                num_workers: 1,
                replication_delay_percent: 0,
                replication_delay_amount_ticks: 0,
            },
            0,
            0,
        )
    }

    #[test]
    fn single_home_holder_gc_after_done() {
        let config = config();
        let mut txn = make_transaction(&["A"], &[] as &[&str], "");
        txn.id = 5;
        fill_metadata(&mut txn, 0, 0);
        set_transaction_type(&mut txn);

        let mut holder = TxnHolder::new(5, 2);
        holder.set_main(&config, txn);
        holder.count_main_as_lock_only();
        assert!(!holder.is_ready_for_gc());
        holder.set_done();
        assert!(holder.is_ready_for_gc());
    }

    #[test]
    fn multi_home_holder_waits_for_all_lock_onlys() {
        let config = config();
        let mut txn = make_transaction(&["A", "C"], &[] as &[&str], "");
        txn.id = 9;
        txn.master_metadata.insert("A".into(), Metadata::new(0, 0));
        txn.master_metadata.insert("C".into(), Metadata::new(1, 0));
        set_transaction_type(&mut txn);

        let mut holder = TxnHolder::new(9, 2);
        holder.set_main(&config, txn);
        assert_eq!(holder.expected_num_lock_only_txns(), Some(2));

        let mut lo0 = make_transaction(&["A"], &[] as &[&str], "");
        lo0.id = 9;
        lo0.home = 0;
        assert!(holder.add_lock_only(lo0.clone()));
        assert!(!holder.add_lock_only(lo0));

        holder.set_done();
        assert!(!holder.is_ready_for_gc());

        let mut lo1 = make_transaction(&["C"], &[] as &[&str], "");
        lo1.id = 9;
        lo1.home = 1;
        assert!(holder.add_lock_only(lo1));
        assert!(holder.is_ready_for_gc());
    }

    #[test]
    fn new_master_lock_only_checked_against_post_remaster_state() {
        let config = config();
        let mut txn = make_transaction(&[] as &[&str], &["A"], "");
        txn.procedure = crate::txn::Procedure::Remaster { new_master: 1 };
        txn.master_metadata.insert("A".into(), Metadata::new(0, 3));
        txn.new_master_lock_only = true;
        let keys = remaster_check_keys(&config, &txn);
        assert_eq!(keys, vec![("A".to_string(), Metadata::new(1, 4))]);
    }
}
