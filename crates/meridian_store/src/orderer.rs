//! Multi-home orderer: batches multi-home transactions and totally orders
//! the batches across replicas through the global paxos group.

use async_trait::async_trait;
use meridian_engine::batch_log::BatchLog;
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{Batch, ForwardBatch, Request};
use meridian_engine::txn::{Transaction, TransactionType};
use meridian_engine::types::{
    BatchId, Channel, MachineId, GLOBAL_PAXOS_CHANNEL, MAX_NUM_MACHINES,
    MULTI_HOME_ORDERER_CHANNEL, SEQUENCER_CHANNEL,
};
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;

pub struct MultiHomeOrderer {
    config: ConfigPtr,
    sender: Sender,
    batch: Batch,
    batch_id_counter: u32,
    batch_log: BatchLog,
}

impl MultiHomeOrderer {
    pub fn new(config: ConfigPtr, sender: Sender) -> Self {
        Self {
            config,
            sender,
            batch: Batch::new(TransactionType::MultiHome),
            batch_id_counter: 0,
            batch_log: BatchLog::new(),
        }
    }

    fn next_batch_id(&mut self) -> BatchId {
        self.batch_id_counter += 1;
        self.batch_id_counter * MAX_NUM_MACHINES + self.config.local_machine_id()
    }

    fn add_txn(&mut self, txn: Transaction) {
        assert_eq!(
            txn.txn_type,
            TransactionType::MultiHome,
            "orderer batch can only contain multi-home txns"
        );
        self.batch.transactions.push(txn);
    }

    /// Drain globally ordered batches towards this region's sequencer. The
    /// batch id is replaced by its global slot so every region sees the same
    /// multi-home order.
    fn emit_ordered_batches(&mut self) {
        while self.batch_log.has_next() {
            let (slot, mut batch) = self.batch_log.next_batch();
            batch.id = slot;
            debug!(slot, "multi-home batch ordered");
            self.sender.send_request(
                SEQUENCER_CHANNEL,
                MULTI_HOME_ORDERER_CHANNEL,
                Request::ForwardBatch(ForwardBatch::Data {
                    batch,
                    same_origin_position: 0,
                }),
            );
        }
    }
}

#[async_trait]
impl Module for MultiHomeOrderer {
    type Event = ();

    fn name(&self) -> &'static str {
        "multi-home-orderer"
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
            Request::ForwardTxn { txn } => self.add_txn(txn),
            Request::ForwardBatch(ForwardBatch::Data { batch, .. }) => {
                self.batch_log.add_batch(batch)
            }
            Request::ForwardBatch(ForwardBatch::Order { batch_id, slot }) => {
                self.batch_log.add_slot(slot, batch_id)
            }
            other => warn!(?other, "unexpected request at multi-home orderer"),
        }
        self.emit_ordered_batches();
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        if self.batch.transactions.is_empty() {
            return Ok(());
        }
        let batch_id = self.next_batch_id();
        let mut batch = std::mem::replace(&mut self.batch, Batch::new(TransactionType::MultiHome));
        batch.id = batch_id;
        debug!(
            batch_id,
            num_txns = batch.transactions.len(),
            "sealed multi-home batch"
        );

        // Ask global paxos for this batch's slot in the multi-home order.
        self.sender.send_request(
            GLOBAL_PAXOS_CHANNEL,
            MULTI_HOME_ORDERER_CHANNEL,
            Request::PaxosPropose { value: batch_id },
        );

        // Replicate the batch data to the orderer of every region.
        let part = self.config.leader_partition_for_multi_home_ordering();
        let request = Request::ForwardBatch(ForwardBatch::Data {
            batch,
            same_origin_position: 0,
        });
        for rep in 0..self.config.num_replicas() {
            let machine = self.config.machine_id(rep, part);
            self.sender.send_request_to(
                machine,
                MULTI_HOME_ORDERER_CHANNEL,
                MULTI_HOME_ORDERER_CHANNEL,
                request.clone(),
            );
        }
        Ok(())
    }
}
