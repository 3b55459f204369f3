//! Shared helpers for integration tests: spin up full in-process clusters
//! on loopback addresses and pre-seed their storages.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_engine::config::{Config, ConfigFile, ConfigPtr};
use meridian_engine::storage::{MemStorage, Storage};
use meridian_engine::types::{Key, Record};
use meridian_store::client::Client;
use meridian_store::{start_node, wait_for_ready, NodeHandle};

/// Timeout for cluster startup and end-to-end round trips.
pub const E2E_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_PORT_SLOT: AtomicU16 = AtomicU16::new(0);

/// Two ports per cluster, spread by pid so concurrently running test
/// binaries stay out of each other's way.
fn alloc_ports() -> (u16, u16) {
    let slot = NEXT_PORT_SLOT.fetch_add(1, Ordering::Relaxed);
    let pid_offset = (std::process::id() % 499) as u16;
    let base = 21000 + pid_offset * 64 + slot * 2;
    (base, base + 1)
}

pub struct TestCluster {
    pub configs: Vec<ConfigPtr>,
    pub storages: Vec<Arc<MemStorage>>,
    nodes: Vec<NodeHandle>,
}

impl TestCluster {
    /// Start `num_replicas * num_partitions` machines, each on its own
    /// loopback address, with every machine's storage seeded from `data`
    /// (key, value, master, counter) wherever the key's partition lands.
    pub async fn start(
        num_replicas: u32,
        num_partitions: u32,
        data: &[(&str, &str, u32, u32)],
    ) -> Self {
        let (broker_port, server_port) = alloc_ports();
        let addresses: Vec<Vec<String>> = (0..num_replicas)
            .map(|rep| {
                (0..num_partitions)
                    .map(|part| format!("127.0.0.{}", 1 + rep * num_partitions + part))
                    .collect()
            })
            .collect();
        let file = ConfigFile {
            protocol: "tcp".into(),
            broker_port,
            server_port,
            num_replicas,
            num_partitions,
            addresses,
            batch_duration_ms: 1,
            num_workers: 2,
            replication_delay_percent: 0,
            replication_delay_amount_ticks: 0,
        };

        let mut configs = Vec::new();
        let mut storages = Vec::new();
        let mut nodes = Vec::new();
        for rep in 0..num_replicas {
            for part in 0..num_partitions {
                let config = Arc::new(Config::new(file.clone(), rep, part));
                let storage = Arc::new(MemStorage::new());
                for (key, value, master, counter) in data {
                    let key = Key::from(*key);
                    if config.key_is_in_local_partition(&key) {
                        storage.write(&key, Record::new(*value, *master, *counter));
                    }
                }
                let node = start_node(config.clone(), storage.clone())
                    .await
                    .expect("start node");
                configs.push(config);
                storages.push(storage);
                nodes.push(node);
            }
        }
        for config in &configs {
            wait_for_ready(config, E2E_TIMEOUT)
                .await
                .expect("node did not become ready");
        }
        Self {
            configs,
            storages,
            nodes,
        }
    }

    pub fn config(&self, replica: u32, partition: u32) -> &ConfigPtr {
        let index = self.configs[0].machine_id(replica, partition) as usize;
        &self.configs[index]
    }

    /// Connect a client to the machine at (replica, partition).
    pub async fn client(&self, replica: u32, partition: u32) -> Client {
        let config = self.config(replica, partition);
        Client::connect(&config.local_server_addr())
            .await
            .expect("connect client")
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Find a key that hashes to the requested partition, for tests that need
/// keys spread across partitions.
pub fn key_for_partition(num_partitions: u32, partition: u32, prefix: &str) -> String {
    let file = ConfigFile {
        protocol: "tcp".into(),
        broker_port: 0,
        server_port: 0,
        num_replicas: 1,
        num_partitions,
        addresses: vec![(0..num_partitions).map(|_| "127.0.0.1".into()).collect()],
        batch_duration_ms: 1,
        num_workers: 1,
        replication_delay_percent: 0,
        replication_delay_amount_ticks: 0,
    };
    let probe = Config::new(file, 0, 0);
    for i in 0..10_000 {
        let key = format!("{prefix}{i}");
        if probe.partition_of_key(&key) == partition {
            return key;
        }
    }
    panic!("no key found for partition {partition}");
}
