//! Executes dispatched transactions: local reads, the cross-partition
//! remote-read exchange, the command body, and the storage commit.

use std::collections::BTreeMap;

use meridian_engine::commands::{Commands, KeyValueCommands};
use meridian_engine::config::ConfigPtr;
use meridian_engine::holder::remaster_check_keys;
use meridian_engine::messages::Request;
use meridian_engine::remaster::{check_counters, VerifyMasterResult};
use meridian_engine::storage::Storage;
use meridian_engine::txn::{Procedure, Transaction, TransactionStatus};
use meridian_engine::types::{Key, Metadata, PartitionId, Record, TxnId, SCHEDULER_CHANNEL};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::broker::Sender;

/// Work sent from the scheduler to a worker.
#[derive(Debug)]
pub enum WorkerRequest {
    ProcessTxn {
        txn: Transaction,
        involved_partitions: Vec<PartitionId>,
        early_remote_reads: Vec<Request>,
    },
    RemoteReads {
        txn_id: TxnId,
        will_abort: bool,
        reads: BTreeMap<Key, String>,
    },
}

/// Completions flowing back into the scheduler's event stream.
#[derive(Debug)]
pub enum SchedulerEvent {
    WorkerReady { worker: usize },
    WorkerDone { worker: usize, txn: Transaction },
}

pub struct Worker {
    id: usize,
    config: ConfigPtr,
    storage: Arc<dyn Storage>,
    sender: Sender,
    commands: KeyValueCommands,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: ConfigPtr,
        storage: Arc<dyn Storage>,
        sender: Sender,
        requests: mpsc::UnboundedReceiver<WorkerRequest>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            id,
            config,
            storage,
            sender,
            commands: KeyValueCommands::new(),
            requests,
            events,
        }
    }

    pub async fn run(mut self) {
        let _ = self.events.send(SchedulerEvent::WorkerReady { worker: self.id });
        while let Some(request) = self.requests.recv().await {
            match request {
                WorkerRequest::ProcessTxn {
                    txn,
                    involved_partitions,
                    early_remote_reads,
                } => {
                    let txn = self
                        .process(txn, involved_partitions, early_remote_reads)
                        .await;
                    if self
                        .events
                        .send(SchedulerEvent::WorkerDone {
                            worker: self.id,
                            txn,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                WorkerRequest::RemoteReads { txn_id, .. } => {
                    // Remote reads for a transaction this worker already
                    // finished; idempotent arrival, drop.
                    debug!(txn_id, "dropping remote reads with no active txn");
                }
            }
        }
    }

    /// Drive one transaction through
    /// read-local -> wait-remote -> execute -> commit.
    async fn process(
        &mut self,
        mut txn: Transaction,
        involved_partitions: Vec<PartitionId>,
        early_remote_reads: Vec<Request>,
    ) -> Transaction {
        let txn_id = txn.id;
        let local_partition = self.config.local_partition();
        debug!(txn_id, worker = self.id, "processing txn");

        // The scheduler verified counters before granting locks, but a
        // remaster may have landed between verification and dispatch.
        let will_abort = match check_counters(
            self.storage.as_ref(),
            &remaster_check_keys(&self.config, &txn),
        ) {
            VerifyMasterResult::Valid => false,
            VerifyMasterResult::Abort => true,
            VerifyMasterResult::Waiting => {
                error!(txn_id, "txn dispatched with a counter ahead of storage");
                false
            }
        };
        if will_abort {
            txn.abort("stale mastership counter");
        }

        // Drop the keys other partitions own; their values arrive through
        // remote reads, and the completed sub-txn carries only this
        // partition's view.
        txn.read_set
            .retain(|key, _| self.config.key_is_in_local_partition(key));
        txn.write_set
            .retain(|key, _| self.config.key_is_in_local_partition(key));

        if !will_abort {
            for (key, value) in txn.read_set.iter_mut().chain(txn.write_set.iter_mut()) {
                if let Some(record) = self.storage.read(key) {
                    *value = record.value;
                }
            }
        }

        // Tell every other participating partition what this one read.
        let reads = if will_abort {
            BTreeMap::new()
        } else {
            txn.read_set.clone()
        };
        for partition in &involved_partitions {
            if *partition == local_partition {
                continue;
            }
            let machine = self
                .config
                .machine_id(self.config.local_replica(), *partition);
            self.sender.send_request_to(
                machine,
                SCHEDULER_CHANNEL,
                SCHEDULER_CHANNEL,
                Request::RemoteReadResult {
                    txn_id,
                    partition: local_partition,
                    will_abort,
                    reads: reads.clone(),
                },
            );
        }

        let mut waiting_on = involved_partitions
            .iter()
            .filter(|p| **p != local_partition)
            .count();

        for request in early_remote_reads {
            if let Request::RemoteReadResult {
                txn_id: early_id,
                will_abort,
                reads,
                ..
            } = request
            {
                if early_id == txn_id && waiting_on > 0 {
                    self.apply_remote_reads(&mut txn, will_abort, reads);
                    waiting_on -= 1;
                }
            }
        }

        while waiting_on > 0 {
            match self.requests.recv().await {
                Some(WorkerRequest::RemoteReads {
                    txn_id: incoming,
                    will_abort,
                    reads,
                }) => {
                    if incoming != txn_id {
                        debug!(txn_id = incoming, "remote reads for an inactive txn");
                        continue;
                    }
                    self.apply_remote_reads(&mut txn, will_abort, reads);
                    waiting_on -= 1;
                }
                Some(WorkerRequest::ProcessTxn { .. }) => {
                    panic!("worker {} dispatched while busy", self.id)
                }
                None => return txn,
            }
        }

        self.execute(&mut txn);
        self.commit(&txn);
        debug!(txn_id, status = ?txn.status, "finished txn");
        txn
    }

    fn apply_remote_reads(
        &self,
        txn: &mut Transaction,
        will_abort: bool,
        reads: BTreeMap<Key, String>,
    ) {
        if will_abort {
            if txn.status != TransactionStatus::Aborted {
                txn.abort("aborted on a remote partition");
            }
            return;
        }
        for (key, value) in reads {
            txn.read_set.insert(key, value);
        }
    }

    fn execute(&mut self, txn: &mut Transaction) {
        if txn.status == TransactionStatus::Aborted {
            return;
        }
        match txn.procedure {
            Procedure::Code(_) => self.commands.execute(txn),
            Procedure::Remaster { .. } => txn.status = TransactionStatus::Committed,
        }
    }

    fn commit(&self, txn: &Transaction) {
        if txn.status != TransactionStatus::Committed {
            return;
        }
        match txn.procedure {
            Procedure::Code(_) => {
                for (key, value) in &txn.write_set {
                    if !self.config.key_is_in_local_partition(key) {
                        continue;
                    }
                    let mut record = self.storage.read(key).unwrap_or_else(|| {
                        let metadata = txn
                            .master_metadata
                            .get(key)
                            .copied()
                            .unwrap_or_else(|| panic!("master metadata missing for key {key:?}"));
                        Record {
                            value: String::new(),
                            metadata,
                        }
                    });
                    record.value = value.clone();
                    self.storage.write(key, record);
                }
                for key in &txn.delete_set {
                    if self.config.key_is_in_local_partition(key) {
                        self.storage.delete(key);
                    }
                }
            }
            Procedure::Remaster { new_master } => {
                let key = txn
                    .write_set
                    .keys()
                    .next()
                    .expect("remaster txn has an empty write set");
                if !self.config.key_is_in_local_partition(key) {
                    return;
                }
                let Some(mut record) = self.storage.read(key) else {
                    warn!(?key, "remastering a key that does not exist");
                    return;
                };
                let observed = txn
                    .master_metadata
                    .get(key)
                    .copied()
                    .unwrap_or(record.metadata);
                record.metadata = Metadata::new(new_master, observed.counter + 1);
                self.storage.write(key, record);
            }
        }
    }
}
