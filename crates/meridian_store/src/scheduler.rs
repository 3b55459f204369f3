//! Consumes the serial log: resolves mastership, drives the lock manager,
//! and dispatches ready transactions to the worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use meridian_engine::config::ConfigPtr;
use meridian_engine::holder::{remaster_check_keys, TxnHolder};
use meridian_engine::lock_manager::DeterministicLockManager;
use meridian_engine::messages::{ForwardBatch, Request, Response};
use meridian_engine::remaster::{RemasterManager, RemasterOccurredResult, VerifyMasterResult};
use meridian_engine::storage::Storage;
use meridian_engine::txn::{Transaction, TransactionStatus, TransactionType};
use meridian_engine::types::{
    Channel, Key, LockMode, MachineId, ReplicaId, TxnId, SCHEDULER_CHANNEL, SERVER_CHANNEL,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;
use crate::worker::{SchedulerEvent, Worker, WorkerRequest};

pub struct Scheduler {
    config: ConfigPtr,
    sender: Sender,
    lock_manager: DeterministicLockManager,
    remaster_manager: RemasterManager,
    holders: HashMap<TxnId, TxnHolder>,
    ready_txns: VecDeque<TxnId>,
    ready_workers: VecDeque<usize>,
    worker_txs: Vec<mpsc::UnboundedSender<WorkerRequest>>,
    /// Workers waiting to be spawned by `initialize`.
    pending_workers: Vec<Worker>,
}

impl Scheduler {
    /// Build the scheduler and its worker pool. The returned receiver is the
    /// scheduler's event stream and must be handed to the module runner.
    pub fn new(
        config: ConfigPtr,
        storage: Arc<dyn Storage>,
        sender: Sender,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut worker_txs = Vec::new();
        let mut pending_workers = Vec::new();
        for id in 0..config.num_workers() {
            let (tx, rx) = mpsc::unbounded_channel();
            worker_txs.push(tx);
            pending_workers.push(Worker::new(
                id,
                config.clone(),
                storage.clone(),
                sender.clone(),
                rx,
                event_tx.clone(),
            ));
        }
        let scheduler = Self {
            config,
            sender,
            lock_manager: DeterministicLockManager::new(),
            remaster_manager: RemasterManager::new(storage),
            holders: HashMap::new(),
            ready_txns: VecDeque::new(),
            ready_workers: VecDeque::new(),
            worker_txs,
            pending_workers,
        };
        (scheduler, event_rx)
    }

    fn num_replicas(&self) -> u32 {
        self.config.num_replicas()
    }

    fn process_txn(&mut self, txn: Transaction) {
        match txn.txn_type {
            TransactionType::SingleHome => self.process_single_home(txn),
            TransactionType::MultiHome => self.process_multi_home(txn),
            TransactionType::LockOnly => self.process_lock_only(txn),
            TransactionType::Unknown => warn!(txn_id = txn.id, "untyped txn in the local log"),
        }
    }

    fn process_single_home(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let home = txn.home;
        let num_replicas = self.num_replicas();
        let holder = self
            .holders
            .entry(txn_id)
            .or_insert_with(|| TxnHolder::new(txn_id, num_replicas));
        if holder.has_main() {
            warn!(txn_id, "duplicate single-home txn dropped");
            return;
        }
        holder.set_main(&self.config, txn);
        holder.count_main_as_lock_only();

        if holder.keys_in_partition().is_empty() {
            holder.set_done();
            self.gc_if_ready(txn_id);
            return;
        }

        let check_keys = remaster_check_keys(&self.config, holder.txn());
        let lock_keys = holder.keys_in_partition().to_vec();
        match self.remaster_manager.verify_master((txn_id, home), &check_keys) {
            VerifyMasterResult::Valid => {
                if self
                    .lock_manager
                    .register_txn_and_acquire_locks(txn_id, &lock_keys)
                {
                    self.enqueue_txn(txn_id);
                }
            }
            VerifyMasterResult::Waiting => {
                // Register now so the lock count is in place when the
                // remaster unblocks this txn.
                self.lock_manager.register_txn(txn_id, &lock_keys);
            }
            VerifyMasterResult::Abort => self.abort_txn(txn_id),
        }
    }

    fn process_multi_home(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let num_replicas = self.num_replicas();
        let holder = self
            .holders
            .entry(txn_id)
            .or_insert_with(|| TxnHolder::new(txn_id, num_replicas));
        if holder.has_main() {
            warn!(txn_id, "duplicate multi-home txn dropped");
            return;
        }
        holder.set_main(&self.config, txn);

        if holder.is_aborting() {
            // One of its lock-only pieces already failed verification here;
            // with the main txn in hand the abort can be reported.
            self.finish_abort_reporting(txn_id);
            return;
        }
        if holder.keys_in_partition().is_empty() {
            holder.set_done();
            self.gc_if_ready(txn_id);
            return;
        }
        let lock_keys = holder.keys_in_partition().to_vec();
        if self.lock_manager.register_txn(txn_id, &lock_keys) {
            self.enqueue_txn(txn_id);
        }
    }

    fn process_lock_only(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let home = txn.home;
        let check_keys = remaster_check_keys(&self.config, &txn);
        let lock_keys = txn.keys_in_partition(&self.config);
        let num_replicas = self.num_replicas();
        let holder = self
            .holders
            .entry(txn_id)
            .or_insert_with(|| TxnHolder::new(txn_id, num_replicas));
        if !holder.add_lock_only(txn) {
            debug!(txn_id, home, "duplicate lock-only txn dropped");
            return;
        }
        if holder.is_done() || holder.is_aborting() {
            self.gc_if_ready(txn_id);
            return;
        }
        if lock_keys.is_empty() {
            return;
        }
        match self.remaster_manager.verify_master((txn_id, home), &check_keys) {
            VerifyMasterResult::Valid => {
                if self.lock_manager.acquire_locks(txn_id, &lock_keys) {
                    self.enqueue_txn(txn_id);
                }
            }
            VerifyMasterResult::Waiting => {}
            VerifyMasterResult::Abort => self.abort_txn(txn_id),
        }
    }

    fn enqueue_txn(&mut self, txn_id: TxnId) {
        let Some(holder) = self.holders.get(&txn_id) else {
            return;
        };
        if holder.is_aborting() || holder.is_done() {
            return;
        }
        if !holder.has_main() {
            warn!(txn_id, "txn ready before its main transaction arrived");
            return;
        }
        debug!(txn_id, "txn ready for dispatch");
        self.ready_txns.push_back(txn_id);
        self.maybe_dispatch();
    }

    fn maybe_dispatch(&mut self) {
        while !self.ready_workers.is_empty() && !self.ready_txns.is_empty() {
            let txn_id = self.ready_txns.pop_front().expect("checked non-empty");
            let Some(holder) = self.holders.get_mut(&txn_id) else {
                continue;
            };
            if holder.is_aborting() || holder.is_done() {
                continue;
            }
            let worker = self.ready_workers.pop_front().expect("checked non-empty");
            holder.set_worker(worker);
            holder.inc_num_dispatches();
            debug!(txn_id, worker, "dispatching txn");
            let request = WorkerRequest::ProcessTxn {
                txn: holder.txn().clone(),
                involved_partitions: holder.involved_partitions().to_vec(),
                early_remote_reads: std::mem::take(holder.early_remote_reads()),
            };
            if self.worker_txs[worker].send(request).is_err() {
                warn!(worker, "worker channel closed");
            }
        }
    }

    fn route_remote_reads(&mut self, request: Request) {
        let Request::RemoteReadResult {
            txn_id,
            partition,
            will_abort,
            reads,
        } = request
        else {
            return;
        };
        let num_replicas = self.num_replicas();
        let holder = self
            .holders
            .entry(txn_id)
            .or_insert_with(|| TxnHolder::new(txn_id, num_replicas));
        match holder.worker() {
            Some(worker) => {
                let _ = self.worker_txs[worker].send(WorkerRequest::RemoteReads {
                    txn_id,
                    will_abort,
                    reads,
                });
            }
            None => {
                // The reads outran the txn; hold them for dispatch time.
                debug!(txn_id, "early remote reads buffered");
                holder.early_remote_reads().push(Request::RemoteReadResult {
                    txn_id,
                    partition,
                    will_abort,
                    reads,
                });
            }
        }
    }

    /// A worker finished a transaction: release locks, apply remaster
    /// effects, and return the sub-transaction to the coordinating server.
    fn complete_txn(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        if !self.holders.contains_key(&txn_id) {
            warn!(txn_id, "completion for an unknown txn");
            return;
        }

        let lock_keys = self
            .holders
            .get(&txn_id)
            .map(|h| h.keys_in_partition().to_vec())
            .unwrap_or_default();
        let newly_ready = self.release_and_sort(txn_id, &lock_keys);

        // Retire the holder before driving remaster queues so nothing this
        // txn left behind can re-acquire locks under its id.
        let local_partition = self.config.local_partition();
        let committed_remaster = txn.is_remaster() && txn.status == TransactionStatus::Committed;
        let remaster_key = txn.write_set.keys().next().cloned();
        let remaster_counter = remaster_key
            .as_ref()
            .and_then(|key| txn.master_metadata.get(key))
            .map_or(1, |meta| meta.counter + 1);
        if let Some(holder) = self.holders.get_mut(&txn_id) {
            let _ = holder.release();
            let participants = holder.involved_partitions().to_vec();
            holder.set_done();
            if participants.contains(&local_partition) {
                self.sender.send_request_to(
                    txn.coordinating_server,
                    SERVER_CHANNEL,
                    SCHEDULER_CHANNEL,
                    Request::CompletedSubtxn {
                        txn,
                        partition: local_partition,
                        involved_partitions: participants,
                    },
                );
            }
        }
        self.gc_if_ready(txn_id);

        if committed_remaster {
            if let Some(key) = remaster_key {
                let result = self
                    .remaster_manager
                    .remaster_occurred(&key, remaster_counter);
                self.process_remaster_result(result);
            }
        }
        // Pieces of this txn may still sit in remaster queues, e.g. the
        // lock-only copy bound for a remaster's new master.
        let result = self.remaster_manager.release_transaction(txn_id);
        self.process_remaster_result(result);

        for ready in newly_ready {
            self.enqueue_txn(ready);
        }
    }

    /// Release a txn's locks and return the newly-ready set in a stable
    /// order so every machine dispatches identically.
    fn release_and_sort(&mut self, txn_id: TxnId, lock_keys: &[(Key, LockMode)]) -> Vec<TxnId> {
        let mut newly_ready: Vec<TxnId> = self
            .lock_manager
            .release_locks(txn_id, lock_keys)
            .into_iter()
            .collect();
        newly_ready.sort_unstable();
        newly_ready
    }

    fn process_remaster_result(&mut self, result: RemasterOccurredResult) {
        for (txn_id, replica) in result.unblocked {
            self.proceed_to_lock(txn_id, replica);
        }
        for (txn_id, _) in result.should_abort {
            self.abort_txn(txn_id);
        }
    }

    /// A txn cleared the remaster queues; move it on to lock acquisition.
    fn proceed_to_lock(&mut self, txn_id: TxnId, replica: ReplicaId) {
        let Some(holder) = self.holders.get(&txn_id) else {
            return;
        };
        if holder.is_done() || holder.is_aborting() {
            return;
        }
        let single_home = holder.has_main()
            && holder.txn().txn_type == TransactionType::SingleHome
            && holder.txn().home == replica;
        let granted = if single_home {
            let keys = holder.keys_in_partition().to_vec();
            // Registration happened when the txn entered the queue.
            self.lock_manager.acquire_locks(txn_id, &keys)
        } else {
            let Some(lock_only) = holder.lock_only_txn(replica) else {
                warn!(txn_id, replica, "unblocked piece has no lock-only txn");
                return;
            };
            let keys = lock_only.keys_in_partition(&self.config);
            self.lock_manager.acquire_locks(txn_id, &keys)
        };
        if granted {
            self.enqueue_txn(txn_id);
        }
    }

    /// Deterministic abort before dispatch: stale mastership.
    fn abort_txn(&mut self, txn_id: TxnId) {
        let Some(holder) = self.holders.get_mut(&txn_id) else {
            return;
        };
        if holder.is_aborting() || holder.is_done() {
            return;
        }
        if holder.worker().is_some() {
            // Already dispatched; the worker's own counter check settles it.
            return;
        }
        holder.set_aborting();
        debug!(txn_id, "aborting txn");

        let lock_keys: Vec<(Key, LockMode)> = if holder.has_main() {
            holder.keys_in_partition().to_vec()
        } else {
            // Only lock-only pieces arrived so far; release whatever they
            // could have locked.
            let mut keys: Vec<(Key, LockMode)> = holder
                .lock_only_txns()
                .flat_map(|lo| lo.keys_in_partition(&self.config))
                .collect();
            keys.sort();
            keys.dedup_by(|a, b| a.0 == b.0);
            keys
        };
        let newly_ready = self.release_and_sort(txn_id, &lock_keys);
        let result = self.remaster_manager.release_transaction(txn_id);
        self.process_remaster_result(result);

        if self
            .holders
            .get(&txn_id)
            .is_some_and(TxnHolder::has_main)
        {
            self.finish_abort_reporting(txn_id);
        }

        for ready in newly_ready {
            self.enqueue_txn(ready);
        }
    }

    /// Send the aborted sub-txn to the coordinating server and unblock the
    /// other participating partitions through the will-abort signal.
    fn finish_abort_reporting(&mut self, txn_id: TxnId) {
        let local_partition = self.config.local_partition();
        let local_replica = self.config.local_replica();
        let Some(holder) = self.holders.get_mut(&txn_id) else {
            return;
        };
        let mut txn = holder.release();
        txn.abort("stale mastership counter");
        // The sub-txn reports only this partition's view, like the ones
        // workers produce.
        txn.read_set
            .retain(|key, _| self.config.key_is_in_local_partition(key));
        txn.write_set
            .retain(|key, _| self.config.key_is_in_local_partition(key));
        let participants = holder.involved_partitions().to_vec();
        holder.set_done();

        for partition in &participants {
            if *partition == local_partition {
                continue;
            }
            let machine = self.config.machine_id(local_replica, *partition);
            self.sender.send_request_to(
                machine,
                SCHEDULER_CHANNEL,
                SCHEDULER_CHANNEL,
                Request::RemoteReadResult {
                    txn_id,
                    partition: local_partition,
                    will_abort: true,
                    reads: Default::default(),
                },
            );
        }
        if participants.contains(&local_partition) {
            self.sender.send_request_to(
                txn.coordinating_server,
                SERVER_CHANNEL,
                SCHEDULER_CHANNEL,
                Request::CompletedSubtxn {
                    txn,
                    partition: local_partition,
                    involved_partitions: participants,
                },
            );
        }
        self.gc_if_ready(txn_id);
    }

    fn gc_if_ready(&mut self, txn_id: TxnId) {
        if self
            .holders
            .get(&txn_id)
            .is_some_and(TxnHolder::is_ready_for_gc)
        {
            self.holders.remove(&txn_id);
        }
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "num_all_txns": self.holders.len(),
            "num_ready_txns": self.ready_txns.len(),
            "num_ready_workers": self.ready_workers.len(),
            "num_blocked_on_remaster": self.remaster_manager.num_blocked(),
            "lock_manager": self.lock_manager.stats(level),
        });
        if level >= 1 {
            stats["all_txns"] = self.holders.keys().copied().collect::<Vec<_>>().into();
        }
        stats.to_string()
    }
}

#[async_trait]
impl Module for Scheduler {
    type Event = SchedulerEvent;

    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        for worker in self.pending_workers.drain(..) {
            tokio::spawn(worker.run());
        }
        Ok(())
    }

    async fn handle_request(
        &mut self,
        request: Request,
        from: MachineId,
        _from_channel: Channel,
    ) -> anyhow::Result<()> {
        match request {
            Request::ForwardBatch(ForwardBatch::Data { batch, .. }) => {
                for txn in batch.transactions {
                    self.process_txn(txn);
                }
            }
            remote_reads @ Request::RemoteReadResult { .. } => {
                self.route_remote_reads(remote_reads)
            }
            Request::Stats { id, level } => {
                let json = self.stats(level);
                self.sender.send_response_to(
                    from,
                    SERVER_CHANNEL,
                    SCHEDULER_CHANNEL,
                    Response::Stats { id, json },
                );
            }
            other => warn!(?other, "unexpected request at scheduler"),
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: SchedulerEvent) -> anyhow::Result<()> {
        match event {
            SchedulerEvent::WorkerReady { worker } => {
                self.ready_workers.push_back(worker);
                self.maybe_dispatch();
            }
            SchedulerEvent::WorkerDone { worker, txn } => {
                self.ready_workers.push_back(worker);
                self.complete_txn(txn);
                self.maybe_dispatch();
            }
        }
        Ok(())
    }
}
