//! Shared identifiers, value types, and process-wide constants.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by every layer of the pipeline, from the wire envelopes down to the
//! lock table.

use serde::{Deserialize, Serialize};

/// Record key. Opaque to the engine; partitioning hashes its bytes.
pub type Key = String;
/// Record value.
pub type Value = String;
/// Globally unique transaction identifier.
pub type TxnId = u32;
/// Origin-tagged batch identifier assigned by a sequencer.
pub type BatchId = u32;
/// Position in a total order produced by a paxos group.
pub type SlotId = u32;
/// Geographical region holding a full copy of the data.
pub type ReplicaId = u32;
/// Horizontal shard of keys within a replica.
pub type PartitionId = u32;
/// Flat machine identifier: `replica * num_partitions + partition`.
pub type MachineId = u32;
/// Logical destination of a message within one machine.
pub type Channel = u32;

pub const SERVER_CHANNEL: Channel = 1;
pub const FORWARDER_CHANNEL: Channel = 2;
pub const SEQUENCER_CHANNEL: Channel = 3;
pub const MULTI_HOME_ORDERER_CHANNEL: Channel = 4;
pub const INTERLEAVER_CHANNEL: Channel = 5;
pub const SCHEDULER_CHANNEL: Channel = 6;
pub const LOCAL_PAXOS_CHANNEL: Channel = 7;
pub const GLOBAL_PAXOS_CHANNEL: Channel = 8;

/// Upper bound on machines in a deployment. Batch and transaction ids are
/// made globally unique by `counter * MAX_NUM_MACHINES + machine_id`.
pub const MAX_NUM_MACHINES: u32 = 1000;

/// The lock table evicts unlocked entries once it grows past this.
pub const LOCK_TABLE_SIZE_LIMIT: usize = 1_000_000;

/// Position in the member list of the machine elected leader of a paxos group.
pub const PAXOS_LEADER_POSITION: usize = 0;

/// Master assigned to keys that do not exist anywhere yet.
pub const DEFAULT_MASTER_REGION_OF_NEW_KEY: ReplicaId = 0;

/// Mastership metadata attached to every record and carried per key by
/// transactions. The counter increases by one on each successful remaster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub master: ReplicaId,
    pub counter: u32,
}

impl Metadata {
    pub fn new(master: ReplicaId, counter: u32) -> Self {
        Self { master, counter }
    }
}

/// A stored record: the value plus its mastership metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub metadata: Metadata,
}

impl Record {
    pub fn new(value: impl Into<Value>, master: ReplicaId, counter: u32) -> Self {
        Self {
            value: value.into(),
            metadata: Metadata::new(master, counter),
        }
    }
}

/// Lock mode of a key in the lock table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    Unlocked,
    Read,
    Write,
}
