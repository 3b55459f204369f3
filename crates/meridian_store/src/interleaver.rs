//! Builds the serial log the scheduler consumes.
//!
//! Three inputs meet here: single-home batch data replicated by sequencers
//! everywhere, local paxos decisions interleaving this replica's own
//! batches, and globally ordered multi-home batches. Batches leave towards
//! the scheduler strictly in log order; for the local replica's log the
//! decided order is additionally replicated to the same partition of every
//! other region so they can replay it.

use std::collections::HashMap;

use async_trait::async_trait;
use meridian_engine::batch_log::{BatchLog, LocalLog};
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{Batch, ForwardBatch, Request};
use meridian_engine::txn::TransactionType;
use meridian_engine::types::{
    Channel, MachineId, ReplicaId, INTERLEAVER_CHANNEL, SCHEDULER_CHANNEL,
};
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;

pub struct Interleaver {
    config: ConfigPtr,
    sender: Sender,
    /// This replica's own log, interleaved by local paxos decisions.
    local_log: LocalLog,
    /// One replayed log per origin replica.
    single_home_logs: HashMap<ReplicaId, BatchLog>,
    multi_home_log: BatchLog,
}

impl Interleaver {
    pub fn new(config: ConfigPtr, sender: Sender) -> Self {
        Self {
            config,
            sender,
            local_log: LocalLog::new(),
            single_home_logs: HashMap::new(),
            multi_home_log: BatchLog::new(),
        }
    }

    fn process_batch_data(&mut self, batch: Batch, same_origin_position: u32, from: MachineId) {
        let from_replica = self.config.replica_of(from);
        match batch.txn_type {
            TransactionType::SingleHome => {
                debug!(
                    batch_id = batch.id,
                    from_replica,
                    num_txns = batch.transactions.len(),
                    "received single-home batch"
                );
                if from_replica == self.config.local_replica() {
                    self.local_log.add_batch_id(
                        self.config.partition_of(from),
                        same_origin_position,
                        batch.id,
                    );
                }
                self.single_home_logs
                    .entry(from_replica)
                    .or_default()
                    .add_batch(batch);
            }
            TransactionType::MultiHome => {
                // Multi-home batches arrive with their global slot already
                // stamped as the id.
                debug!(slot = batch.id, "received multi-home batch");
                self.multi_home_log.add_slot(batch.id, batch.id);
                self.multi_home_log.add_batch(batch);
            }
            other => warn!(?other, "batch with invalid transaction type"),
        }
    }

    fn advance_logs(&mut self) {
        // Local paxos decided more of this replica's log: tell the same
        // partition in every region (ourselves included) where each batch
        // landed.
        let local_partition = self.config.local_partition();
        while self.local_log.has_next() {
            let (slot, batch_id) = self.local_log.next_batch();
            for rep in 0..self.config.num_replicas() {
                let machine = self.config.machine_id(rep, local_partition);
                self.sender.send_request_to(
                    machine,
                    INTERLEAVER_CHANNEL,
                    INTERLEAVER_CHANNEL,
                    Request::ForwardBatch(ForwardBatch::Order { batch_id, slot }),
                );
            }
        }

        // Emit whatever became contiguous, per log, in slot order.
        for log in self
            .single_home_logs
            .values_mut()
            .chain(std::iter::once(&mut self.multi_home_log))
        {
            while log.has_next() {
                let (_, batch) = log.next_batch();
                self.sender.send_request(
                    SCHEDULER_CHANNEL,
                    INTERLEAVER_CHANNEL,
                    Request::ForwardBatch(ForwardBatch::Data {
                        batch,
                        same_origin_position: 0,
                    }),
                );
            }
        }
    }
}

#[async_trait]
impl Module for Interleaver {
    type Event = ();

    fn name(&self) -> &'static str {
        "interleaver"
    }

    async fn handle_request(
        &mut self,
        request: Request,
        from: MachineId,
        _from_channel: Channel,
    ) -> anyhow::Result<()> {
        match request {
            Request::ForwardBatch(ForwardBatch::Data {
                batch,
                same_origin_position,
            }) => self.process_batch_data(batch, same_origin_position, from),
            Request::ForwardBatch(ForwardBatch::Order { batch_id, slot }) => {
                let from_replica = self.config.replica_of(from);
                self.single_home_logs
                    .entry(from_replica)
                    .or_default()
                    .add_slot(slot, batch_id);
            }
            Request::LocalQueueOrder { slot, queue_id } => {
                debug!(slot, queue_id, "local queue order");
                self.local_log.add_slot(slot, queue_id);
            }
            other => warn!(?other, "unexpected request at interleaver"),
        }
        self.advance_logs();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_engine::config::{Config, ConfigFile};
    use meridian_engine::messages::{Envelope, Message};
    use meridian_engine::txn::{make_transaction, Transaction};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn setup() -> (
        Interleaver,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let config = Arc::new(Config::new(
            ConfigFile {
                protocol: "tcp".into(),
                broker_port: 0,
                server_port: 0,
                num_replicas: 1,
                num_partitions: 1,
                addresses: vec![vec!["127.0.0.1".into()]],
                batch_duration_ms: 1,
                num_workers: 1,
                replication_delay_percent: 0,
                replication_delay_amount_ticks: 0,
            },
            0,
            0,
        ));
        let mut broker = crate::broker::Broker::new(config.clone());
        let own_rx = broker.add_channel(INTERLEAVER_CHANNEL);
        let scheduler_rx = broker.add_channel(SCHEDULER_CHANNEL);
        let interleaver = Interleaver::new(config, broker.sender());
        (interleaver, own_rx, scheduler_rx)
    }

    fn single_home_batch(id: u32, txn_id: u32) -> Batch {
        let mut txn: Transaction = make_transaction(&["A"], &[] as &[&str], "");
        txn.id = txn_id;
        Batch {
            id,
            txn_type: TransactionType::SingleHome,
            transactions: vec![txn],
        }
    }

    async fn pump(interleaver: &mut Interleaver, rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        while let Ok(envelope) = rx.try_recv() {
            if let Message::Request(request) = envelope.message {
                interleaver
                    .handle_request(request, envelope.from, envelope.from_channel)
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn local_batches_flow_out_in_paxos_order() {
        let (mut interleaver, mut own_rx, mut scheduler_rx) = setup();

        // Two batches from the local sequencer, then the paxos decisions
        // placing them in the local log.
        for (position, batch_id) in [(0, 1000), (1, 2000)] {
            interleaver
                .handle_request(
                    Request::ForwardBatch(ForwardBatch::Data {
                        batch: single_home_batch(batch_id, batch_id + 1),
                        same_origin_position: position,
                    }),
                    0,
                    INTERLEAVER_CHANNEL,
                )
                .await
                .unwrap();
        }
        for slot in [0, 1] {
            interleaver
                .handle_request(Request::LocalQueueOrder { slot, queue_id: 0 }, 0, 0)
                .await
                .unwrap();
        }
        // Batch-order messages loop back through our own channel.
        pump(&mut interleaver, &mut own_rx).await;

        let mut emitted = Vec::new();
        while let Ok(envelope) = scheduler_rx.try_recv() {
            if let Message::Request(Request::ForwardBatch(ForwardBatch::Data { batch, .. })) =
                envelope.message
            {
                emitted.push(batch.id);
            }
        }
        assert_eq!(emitted, vec![1000, 2000]);
    }

    #[tokio::test]
    async fn multi_home_batches_follow_their_global_slots() {
        let (mut interleaver, _own_rx, mut scheduler_rx) = setup();

        // Slot-stamped multi-home batches arriving out of order.
        for slot in [1, 0] {
            let mut batch = single_home_batch(slot, slot + 1);
            batch.txn_type = TransactionType::MultiHome;
            interleaver
                .handle_request(
                    Request::ForwardBatch(ForwardBatch::Data {
                        batch,
                        same_origin_position: 0,
                    }),
                    0,
                    INTERLEAVER_CHANNEL,
                )
                .await
                .unwrap();
        }

        let mut emitted = Vec::new();
        while let Ok(envelope) = scheduler_rx.try_recv() {
            if let Message::Request(Request::ForwardBatch(ForwardBatch::Data { batch, .. })) =
                envelope.message
            {
                emitted.push(batch.id);
            }
        }
        assert_eq!(emitted, vec![0, 1]);
    }
}
