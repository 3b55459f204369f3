//! Deployment configuration: topology, addresses, ports, and the
//! key-to-partition mapping.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{Key, MachineId, PartitionId, ReplicaId};

/// On-disk configuration shared by every machine in a deployment.
///
/// `addresses[replica][partition]` is the host (or loopback address) of that
/// machine; all machines listen on the same `broker_port` / `server_port`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub protocol: String,
    pub broker_port: u16,
    pub server_port: u16,
    pub num_replicas: u32,
    pub num_partitions: u32,
    pub addresses: Vec<Vec<String>>,
    pub batch_duration_ms: u64,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Percent of single-home batches whose cross-region replication is
    /// artificially delayed. Zero disables delay injection.
    #[serde(default)]
    pub replication_delay_percent: u32,
    /// How many sequencer ticks a delayed batch is held back.
    #[serde(default)]
    pub replication_delay_amount_ticks: u32,
}

fn default_num_workers() -> usize {
    3
}

/// A machine's view of the deployment: the shared file plus its own identity.
#[derive(Debug)]
pub struct Config {
    file: ConfigFile,
    local_replica: ReplicaId,
    local_partition: PartitionId,
}

pub type ConfigPtr = Arc<Config>;

impl Config {
    pub fn new(file: ConfigFile, local_replica: ReplicaId, local_partition: PartitionId) -> Self {
        assert!(
            local_replica < file.num_replicas && local_partition < file.num_partitions,
            "local machine {local_replica}:{local_partition} is outside the configured topology"
        );
        Self {
            file,
            local_replica,
            local_partition,
        }
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        local_replica: ReplicaId,
        local_partition: PartitionId,
    ) -> anyhow::Result<ConfigPtr> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config file {}", path.as_ref().display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.as_ref().display()))?;
        anyhow::ensure!(
            file.addresses.len() == file.num_replicas as usize
                && file
                    .addresses
                    .iter()
                    .all(|r| r.len() == file.num_partitions as usize),
            "config addresses must be a num_replicas x num_partitions grid"
        );
        Ok(Arc::new(Self::new(file, local_replica, local_partition)))
    }

    pub fn protocol(&self) -> &str {
        &self.file.protocol
    }

    pub fn broker_port(&self) -> u16 {
        self.file.broker_port
    }

    pub fn server_port(&self) -> u16 {
        self.file.server_port
    }

    pub fn num_replicas(&self) -> u32 {
        self.file.num_replicas
    }

    pub fn num_partitions(&self) -> u32 {
        self.file.num_partitions
    }

    pub fn num_workers(&self) -> usize {
        self.file.num_workers.max(1)
    }

    pub fn batch_duration_ms(&self) -> u64 {
        self.file.batch_duration_ms.max(1)
    }

    pub fn replication_delay_percent(&self) -> u32 {
        self.file.replication_delay_percent.min(100)
    }

    pub fn replication_delay_amount_ticks(&self) -> u32 {
        self.file.replication_delay_amount_ticks
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local_replica
    }

    pub fn local_partition(&self) -> PartitionId {
        self.local_partition
    }

    pub fn local_machine_id(&self) -> MachineId {
        self.machine_id(self.local_replica, self.local_partition)
    }

    pub fn machine_id(&self, replica: ReplicaId, partition: PartitionId) -> MachineId {
        replica * self.file.num_partitions + partition
    }

    pub fn replica_of(&self, machine: MachineId) -> ReplicaId {
        machine / self.file.num_partitions
    }

    pub fn partition_of(&self, machine: MachineId) -> PartitionId {
        machine % self.file.num_partitions
    }

    pub fn num_machines(&self) -> u32 {
        self.file.num_replicas * self.file.num_partitions
    }

    pub fn all_machine_ids(&self) -> Vec<MachineId> {
        (0..self.num_machines()).collect()
    }

    pub fn address_of(&self, replica: ReplicaId, partition: PartitionId) -> &str {
        &self.file.addresses[replica as usize][partition as usize]
    }

    pub fn broker_addr(&self, machine: MachineId) -> String {
        let host = self.address_of(self.replica_of(machine), self.partition_of(machine));
        format!("{host}:{}", self.file.broker_port)
    }

    pub fn server_addr(&self, machine: MachineId) -> String {
        let host = self.address_of(self.replica_of(machine), self.partition_of(machine));
        format!("{host}:{}", self.file.server_port)
    }

    pub fn local_broker_addr(&self) -> String {
        self.broker_addr(self.local_machine_id())
    }

    pub fn local_server_addr(&self) -> String {
        self.server_addr(self.local_machine_id())
    }

    /// The fixed partition whose machines form the global paxos group and run
    /// the multi-home orderers.
    pub fn leader_partition_for_multi_home_ordering(&self) -> PartitionId {
        0
    }

    pub fn partition_of_key(&self, key: &Key) -> PartitionId {
        fnv_hash(key.as_bytes()) % self.file.num_partitions
    }

    pub fn key_is_in_local_partition(&self, key: &Key) -> bool {
        self.partition_of_key(key) == self.local_partition
    }
}

/// 32-bit FNV-1. Chosen so that every language binding computes the same
/// partition for the same key.
fn fnv_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in bytes {
        hash = hash.wrapping_mul(0x01000193);
        hash ^= u32::from(*b);
    }
    hash
}

/// Human-readable machine id, `"<replica>:<partition>"`.
pub fn machine_id_to_string(config: &Config, machine: MachineId) -> String {
    format!(
        "{}:{}",
        config.replica_of(machine),
        config.partition_of(machine)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(num_replicas: u32, num_partitions: u32) -> Config {
        let addresses = (0..num_replicas)
            .map(|_| (0..num_partitions).map(|_| "127.0.0.1".to_string()).collect())
            .collect();
        Config::new(
            ConfigFile {
                protocol: "tcp".into(),
                broker_port: 21000,
                server_port: 22000,
                num_replicas,
                num_partitions,
                addresses,
                batch_duration_ms: 5,
                num_workers: 2,
                replication_delay_percent: 0,
                replication_delay_amount_ticks: 0,
            },
            0,
            0,
        )
    }

    #[test]
    fn machine_id_round_trip() {
        let config = test_config(3, 4);
        for rep in 0..3 {
            for part in 0..4 {
                let id = config.machine_id(rep, part);
                assert_eq!(config.replica_of(id), rep);
                assert_eq!(config.partition_of(id), part);
            }
        }
        assert_eq!(machine_id_to_string(&config, 7), "1:3");
    }

    #[test]
    fn key_partitioning_is_stable() {
        let config = test_config(2, 4);
        let key = Key::from("some-key");
        let first = config.partition_of_key(&key);
        for _ in 0..10 {
            assert_eq!(config.partition_of_key(&key), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn single_partition_owns_everything() {
        let config = test_config(2, 1);
        for key in ["A", "B", "C", "some-longer-key"] {
            assert!(config.key_is_in_local_partition(&Key::from(key)));
        }
    }
}
