//! Wire objects: the closed internal request/response sum, the envelope that
//! carries them between machines, and the client-facing API frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::txn::{Transaction, TransactionType};
use crate::types::{BatchId, Channel, Key, MachineId, Metadata, PartitionId, SlotId, TxnId, Value};

/// An ordered group of transactions stamped by its producing sequencer or
/// orderer. Batch ids are globally unique and monotone per origin machine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub txn_type: TransactionType,
    pub transactions: Vec<Transaction>,
}

impl Batch {
    pub fn new(txn_type: TransactionType) -> Self {
        Self {
            id: 0,
            txn_type,
            transactions: Vec::new(),
        }
    }
}

/// Batch replication carries either the data or, separately, its position in
/// an ordered log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ForwardBatch {
    Data {
        batch: Batch,
        /// Zero-based position of this batch among batches from the same
        /// origin machine.
        same_origin_position: SlotId,
    },
    Order {
        batch_id: BatchId,
        slot: SlotId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ForwardTxn {
        txn: Transaction,
    },
    ForwardBatch(ForwardBatch),
    /// A local paxos decision: the log slot at which the next batch from
    /// `queue_id` (an origin partition) enters the local log.
    LocalQueueOrder {
        slot: SlotId,
        queue_id: u32,
    },
    RemoteReadResult {
        txn_id: TxnId,
        partition: PartitionId,
        will_abort: bool,
        reads: BTreeMap<Key, Value>,
    },
    CompletedSubtxn {
        txn: Transaction,
        partition: PartitionId,
        involved_partitions: Vec<PartitionId>,
    },
    PaxosPropose {
        value: u32,
    },
    PaxosAccept {
        ballot: u32,
        slot: SlotId,
        value: u32,
    },
    PaxosCommit {
        ballot: u32,
        slot: SlotId,
        value: u32,
    },
    LookupMaster {
        txn_id: TxnId,
        keys: Vec<Key>,
    },
    Stats {
        id: u32,
        level: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    LookupMaster {
        txn_id: TxnId,
        metadata: BTreeMap<Key, Metadata>,
        new_keys: Vec<Key>,
    },
    PaxosAccepted {
        ballot: u32,
        slot: SlotId,
    },
    Stats {
        id: u32,
        json: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// One hop between two module channels, possibly across machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MachineId,
    pub from_channel: Channel,
    pub to_channel: Channel,
    pub message: Message,
}

/// Which module a stats request is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsModule {
    Server,
    Scheduler,
}

/// Client-facing request frame. The server echoes `stream_id` so clients can
/// match responses to in-flight requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ApiRequest {
    Txn {
        stream_id: u32,
        txn: Transaction,
    },
    Stats {
        stream_id: u32,
        module: StatsModule,
        level: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ApiResponse {
    Txn { stream_id: u32, txn: Transaction },
    Stats { stream_id: u32, json: String },
}
