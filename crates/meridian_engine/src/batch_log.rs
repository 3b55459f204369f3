//! Ordered batch delivery: `BatchLog` pairs out-of-order batch data with an
//! ordered sequence of batch ids; `LocalLog` interleaves per-partition batch
//! queues by paxos decisions.

use std::collections::{HashMap, VecDeque};

use crate::async_log::AsyncLog;
use crate::messages::Batch;
use crate::types::{BatchId, SlotId};

/// Joins two independent streams, batch data and slot assignments, and
/// yields batches in slot order once both halves of a slot have arrived.
#[derive(Debug, Default)]
pub struct BatchLog {
    slots: AsyncLog<BatchId>,
    batches: HashMap<BatchId, Batch>,
    ready: VecDeque<(SlotId, BatchId)>,
}

impl BatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, batch: Batch) {
        self.batches.insert(batch.id, batch);
        self.update_ready();
    }

    pub fn add_slot(&mut self, slot: SlotId, batch_id: BatchId) {
        self.slots.insert(slot, batch_id);
        self.update_ready();
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn next_batch(&mut self) -> (SlotId, Batch) {
        let (slot, batch_id) = self
            .ready
            .pop_front()
            .expect("next_batch called with no ready batch");
        let batch = self
            .batches
            .remove(&batch_id)
            .expect("ready batch disappeared from the data map");
        (slot, batch)
    }

    fn update_ready(&mut self) {
        while self.slots.has_next() {
            let batch_id = *self.slots.peek().expect("has_next implies peekable");
            if !self.batches.contains_key(&batch_id) {
                break;
            }
            let (slot, batch_id) = self.slots.next();
            self.ready.push_back((slot, batch_id));
        }
    }

    pub fn num_buffered_slots(&self) -> usize {
        self.slots.num_buffered()
    }

    pub fn num_buffered_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Interleaves the single-home batch queues of every partition in a replica.
///
/// Each paxos decision names the partition whose next batch occupies the
/// decided slot; batches within one partition's queue are consumed in
/// per-origin position order.
#[derive(Debug, Default)]
pub struct LocalLog {
    /// Slot -> origin partition, as decided by local paxos.
    slots: AsyncLog<u32>,
    /// Per-origin-partition queues of batch ids, keyed by same-origin position.
    batch_queues: HashMap<u32, AsyncLog<BatchId>>,
    ready: VecDeque<(SlotId, BatchId)>,
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_id(&mut self, queue_id: u32, position: SlotId, batch_id: BatchId) {
        self.batch_queues
            .entry(queue_id)
            .or_default()
            .insert(position, batch_id);
        self.update_ready();
    }

    pub fn add_slot(&mut self, slot: SlotId, queue_id: u32) {
        self.slots.insert(slot, queue_id);
        self.update_ready();
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn next_batch(&mut self) -> (SlotId, BatchId) {
        self.ready
            .pop_front()
            .expect("next_batch called with no ready batch")
    }

    fn update_ready(&mut self) {
        while self.slots.has_next() {
            let queue_id = *self.slots.peek().expect("has_next implies peekable");
            let Some(queue) = self.batch_queues.get_mut(&queue_id) else {
                break;
            };
            if !queue.has_next() {
                break;
            }
            let (_, batch_id) = queue.next();
            let (slot, _) = self.slots.next();
            self.ready.push_back((slot, batch_id));
        }
    }

    pub fn num_buffered_slots(&self) -> usize {
        self.slots.num_buffered()
    }

    pub fn num_buffered_batches_per_queue(&self) -> HashMap<u32, usize> {
        self.batch_queues
            .iter()
            .map(|(queue_id, queue)| (*queue_id, queue.num_buffered()))
            .collect()
    }
}
