//! Batches locally-mastered transactions and projects multi-home
//! transactions into lock-only pieces for the local replica's log.
//!
//! On every tick the current batch is stamped with the next origin-tagged
//! batch id, its origin partition is proposed to local paxos, and the batch
//! data is replicated to the interleaver of every machine.

use async_trait::async_trait;
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{Batch, ForwardBatch, Request};
use meridian_engine::txn::{Procedure, Transaction, TransactionType};
use meridian_engine::types::{
    BatchId, Channel, MachineId, INTERLEAVER_CHANNEL, LOCAL_PAXOS_CHANNEL, MAX_NUM_MACHINES,
    SEQUENCER_CHANNEL,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;

/// A batch held back to simulate cross-region replication lag.
struct DelayedBatch {
    ticks_left: u32,
    request: Request,
    destinations: Vec<MachineId>,
}

pub struct Sequencer {
    config: ConfigPtr,
    sender: Sender,
    batch: Batch,
    batch_id_counter: u32,
    delayed_batches: Vec<DelayedBatch>,
    rng: SmallRng,
}

impl Sequencer {
    pub fn new(config: ConfigPtr, sender: Sender) -> Self {
        let seed = u64::from(config.local_machine_id());
        Self {
            config,
            sender,
            batch: Batch::new(TransactionType::SingleHome),
            batch_id_counter: 0,
            delayed_batches: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn next_batch_id(&mut self) -> BatchId {
        self.batch_id_counter += 1;
        self.batch_id_counter * MAX_NUM_MACHINES + self.config.local_machine_id()
    }

    fn put_into_batch(&mut self, txn: Transaction) {
        assert!(
            matches!(
                txn.txn_type,
                TransactionType::SingleHome | TransactionType::LockOnly
            ),
            "sequencer batch can only contain single-home or lock-only txns, got {:?}",
            txn.txn_type
        );
        self.batch.transactions.push(txn);
    }

    /// Project a multi-home transaction onto this replica: the subset of its
    /// keys mastered here. A remaster transaction destined for this replica
    /// ships as a full copy so the new master's log carries it too.
    fn lock_only_projection(&self, txn: &Transaction) -> Option<Transaction> {
        let local_replica = self.config.local_replica();
        let mut lock_only = Transaction {
            id: txn.id,
            procedure: txn.procedure.clone(),
            txn_type: TransactionType::LockOnly,
            home: local_replica,
            ..Default::default()
        };

        if let Procedure::Remaster { new_master } = txn.procedure {
            let current_master = txn.master_metadata.values().next().map(|m| m.master);
            if new_master == local_replica && current_master != Some(local_replica) {
                lock_only.read_set = txn.read_set.clone();
                lock_only.write_set = txn.write_set.clone();
                lock_only.master_metadata = txn.master_metadata.clone();
                lock_only.new_master_lock_only = true;
                return Some(lock_only);
            }
        }

        for (key, value) in &txn.read_set {
            if let Some(meta) = txn.master_metadata.get(key) {
                if meta.master == local_replica {
                    lock_only.read_set.insert(key.clone(), value.clone());
                    lock_only.master_metadata.insert(key.clone(), *meta);
                }
            }
        }
        for (key, value) in &txn.write_set {
            if let Some(meta) = txn.master_metadata.get(key) {
                if meta.master == local_replica {
                    lock_only.write_set.insert(key.clone(), value.clone());
                    lock_only.master_metadata.insert(key.clone(), *meta);
                }
            }
        }

        if lock_only.read_set.is_empty() && lock_only.write_set.is_empty() {
            return None;
        }
        Some(lock_only)
    }

    /// Multi-home batch from the orderer: synthesize lock-only pieces into
    /// the current single-home batch and replicate the batch itself to every
    /// interleaver of this region.
    fn process_multi_home_batch(&mut self, batch: Batch) {
        if batch.txn_type != TransactionType::MultiHome {
            warn!("sequencer received a non-multi-home batch from the orderer");
            return;
        }
        for txn in &batch.transactions {
            if let Some(lock_only) = self.lock_only_projection(txn) {
                self.put_into_batch(lock_only);
            }
        }

        let local_replica = self.config.local_replica();
        let request = Request::ForwardBatch(ForwardBatch::Data {
            batch,
            same_origin_position: 0,
        });
        for part in 0..self.config.num_partitions() {
            let machine = self.config.machine_id(local_replica, part);
            self.sender.send_request_to(
                machine,
                INTERLEAVER_CHANNEL,
                SEQUENCER_CHANNEL,
                request.clone(),
            );
        }
    }

    fn send_delayed_batches(&mut self) {
        let mut still_delayed = Vec::new();
        for mut delayed in self.delayed_batches.drain(..) {
            if delayed.ticks_left > 0 {
                delayed.ticks_left -= 1;
                still_delayed.push(delayed);
                continue;
            }
            for machine in &delayed.destinations {
                self.sender.send_request_to(
                    *machine,
                    INTERLEAVER_CHANNEL,
                    SEQUENCER_CHANNEL,
                    delayed.request.clone(),
                );
            }
        }
        self.delayed_batches = still_delayed;
    }
}

#[async_trait]
impl Module for Sequencer {
    type Event = ();

    fn name(&self) -> &'static str {
        "sequencer"
    }

    fn tick_interval(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_millis(
            self.config.batch_duration_ms(),
        ))
    }

    async fn handle_request(
        &mut self,
        request: Request,
        _from: MachineId,
        _from_channel: Channel,
    ) -> anyhow::Result<()> {
        match request {
            Request::ForwardTxn { txn } => self.put_into_batch(txn),
            Request::ForwardBatch(ForwardBatch::Data { batch, .. }) => {
                self.process_multi_home_batch(batch)
            }
            other => warn!(?other, "unexpected request at sequencer"),
        }
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.send_delayed_batches();

        if self.batch.transactions.is_empty() {
            return Ok(());
        }
        let batch_id = self.next_batch_id();
        let mut batch = std::mem::replace(&mut self.batch, Batch::new(TransactionType::SingleHome));
        batch.id = batch_id;
        debug!(
            batch_id,
            num_txns = batch.transactions.len(),
            "sealed single-home batch"
        );

        // Propose this batch's origin so local paxos orders it within the
        // replica's log.
        self.sender.send_request(
            LOCAL_PAXOS_CHANNEL,
            SEQUENCER_CHANNEL,
            Request::PaxosPropose {
                value: self.config.local_partition(),
            },
        );

        let request = Request::ForwardBatch(ForwardBatch::Data {
            batch,
            same_origin_position: self.batch_id_counter - 1,
        });

        let local_replica = self.config.local_replica();
        let mut prompt = Vec::new();
        let mut delayed = Vec::new();
        for machine in self.config.all_machine_ids() {
            if self.config.replica_of(machine) == local_replica {
                prompt.push(machine);
            } else {
                delayed.push(machine);
            }
        }

        let delay_remote = self.config.replication_delay_percent() > 0
            && self
                .rng
                .gen_range(0..100)
                < self.config.replication_delay_percent();
        if delay_remote {
            debug!("delaying cross-region replication of this batch");
            self.delayed_batches.push(DelayedBatch {
                ticks_left: self.config.replication_delay_amount_ticks(),
                request: request.clone(),
                destinations: delayed,
            });
        } else {
            prompt.append(&mut delayed);
        }

        for machine in prompt {
            self.sender.send_request_to(
                machine,
                INTERLEAVER_CHANNEL,
                SEQUENCER_CHANNEL,
                request.clone(),
            );
        }
        Ok(())
    }
}
