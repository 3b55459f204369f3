//! Workload generator for exercising a Meridian deployment.
//!
//! Generates key-value transactions with tunable multi-home and
//! multi-partition percentages, drives them through one machine's server
//! port, and reports throughput and latency at the end of the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use meridian_engine::config::{Config, ConfigPtr};
use meridian_engine::txn::{Transaction, TransactionStatus};
use meridian_engine::types::{Key, PartitionId, ReplicaId};
use meridian_store::client::Client;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Parser, Debug, Clone)]
#[command(name = "meridian-bench", about = "Generate load against a Meridian deployment")]
struct Args {
    /// Path to the deployment configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Replica of the machine whose server port receives the load.
    #[arg(long, default_value_t = 0)]
    replica: u32,

    /// Partition of the machine whose server port receives the load.
    #[arg(long, default_value_t = 0)]
    partition: u32,

    /// Target transactions per second across all clients. 0 means unthrottled.
    #[arg(long, default_value_t = 0)]
    rate: u64,

    /// How long to run. Ignored when --num-txns is set.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Stop after this many transactions instead of after --duration.
    #[arg(long)]
    num_txns: Option<u64>,

    /// Percent of transactions spanning two home regions.
    #[arg(long, default_value_t = 0)]
    mh: u32,

    /// Percent of transactions spanning two partitions.
    #[arg(long, default_value_t = 0)]
    mp: u32,

    /// Concurrent closed-loop clients.
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Hot keys per (replica, partition) pool.
    #[arg(long, default_value_t = 100)]
    keys: usize,

    /// Random seed; 0 derives one per client.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Pre-generated keys bucketed by the partition they hash to, one pool per
/// (replica, partition). A key's home region is real only once data has been
/// loaded with matching masters; on a fresh store every new key is mastered
/// at the default region.
struct KeyPools {
    pools: Vec<Vec<Vec<Key>>>,
}

impl KeyPools {
    fn generate(config: &Config, keys_per_pool: usize) -> Self {
        let mut pools: Vec<Vec<Vec<Key>>> = (0..config.num_replicas())
            .map(|_| (0..config.num_partitions()).map(|_| Vec::new()).collect())
            .collect();
        for rep in 0..config.num_replicas() {
            let mut counter = 0u64;
            let mut filled = 0;
            while filled < config.num_partitions() as usize * keys_per_pool {
                let key = format!("r{rep}x{counter}");
                counter += 1;
                let part = config.partition_of_key(&key) as usize;
                let pool = &mut pools[rep as usize][part];
                if pool.len() < keys_per_pool {
                    pool.push(key);
                    filled += 1;
                }
            }
        }
        Self { pools }
    }

    fn pick(&self, rng: &mut SmallRng, replica: ReplicaId, partition: PartitionId) -> Key {
        let pool = &self.pools[replica as usize][partition as usize];
        pool[rng.gen_range(0..pool.len())].clone()
    }
}

struct Counters {
    committed: AtomicU64,
    aborted: AtomicU64,
    latency_us: AtomicU64,
}

fn generate_txn(rng: &mut SmallRng, config: &Config, pools: &KeyPools, args: &Args) -> Transaction {
    let num_replicas = config.num_replicas();
    let num_partitions = config.num_partitions();

    let home0 = rng.gen_range(0..num_replicas);
    let part0 = rng.gen_range(0..num_partitions);
    let multi_home = num_replicas > 1 && rng.gen_range(0..100) < args.mh;
    let multi_partition = num_partitions > 1 && rng.gen_range(0..100) < args.mp;

    let read_key = pools.pick(rng, home0, part0);
    let write_key = if multi_partition {
        let part1 = (part0 + 1 + rng.gen_range(0..num_partitions - 1)) % num_partitions;
        pools.pick(rng, home0, part1)
    } else {
        pools.pick(rng, home0, part0)
    };

    let mut txn = Transaction::default();
    txn.read_set.insert(read_key, String::new());
    if multi_home {
        let home1 = (home0 + 1 + rng.gen_range(0..num_replicas - 1)) % num_replicas;
        let part = rng.gen_range(0..num_partitions);
        txn.read_set.insert(pools.pick(rng, home1, part), String::new());
    }
    let value = format!("v{}", rng.gen::<u32>());
    txn.procedure =
        meridian_engine::txn::Procedure::Code(format!("SET {write_key} {value}"));
    txn.write_set.insert(write_key, String::new());
    txn
}

async fn run_client(
    id: usize,
    args: Args,
    config: ConfigPtr,
    pools: Arc<KeyPools>,
    counters: Arc<Counters>,
    deadline: Instant,
    quota: Option<Arc<AtomicU64>>,
) -> anyhow::Result<()> {
    let addr = config.server_addr(config.machine_id(args.replica, args.partition));
    let mut client = Client::connect(&addr).await?;
    let seed = if args.seed == 0 {
        id as u64 + 1
    } else {
        args.seed.wrapping_add(id as u64)
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let pacing = if args.rate > 0 {
        Some(Duration::from_secs_f64(
            args.clients as f64 / args.rate as f64,
        ))
    } else {
        None
    };

    loop {
        if let Some(quota) = &quota {
            if quota.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                left.checked_sub(1)
            })
            .is_err()
            {
                return Ok(());
            }
        } else if Instant::now() >= deadline {
            return Ok(());
        }

        let txn = generate_txn(&mut rng, &config, &pools, &args);
        let started = Instant::now();
        let result = client.execute(txn).await?;
        let elapsed = started.elapsed().as_micros() as u64;
        counters.latency_us.fetch_add(elapsed, Ordering::Relaxed);
        match result.status {
            TransactionStatus::Committed => {
                counters.committed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(period) = pacing {
            tokio::time::sleep(period).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config, args.replica, args.partition)
        .context("load config")?;
    let pools = Arc::new(KeyPools::generate(&config, args.keys.max(1)));
    let counters = Arc::new(Counters {
        committed: AtomicU64::new(0),
        aborted: AtomicU64::new(0),
        latency_us: AtomicU64::new(0),
    });

    let deadline = Instant::now() + *args.duration;
    let quota = args.num_txns.map(|n| Arc::new(AtomicU64::new(n)));

    let started = Instant::now();
    let mut handles = Vec::new();
    for id in 0..args.clients.max(1) {
        handles.push(tokio::spawn(run_client(
            id,
            args.clone(),
            config.clone(),
            pools.clone(),
            counters.clone(),
            deadline,
            quota.clone(),
        )));
    }
    for handle in handles {
        if let Err(err) = handle.await.context("client task panicked")? {
            tracing::warn!(error = ?err, "client exited with error");
        }
    }
    let elapsed = started.elapsed();

    let committed = counters.committed.load(Ordering::Relaxed);
    let aborted = counters.aborted.load(Ordering::Relaxed);
    let total = committed + aborted;
    let avg_latency_ms = if total > 0 {
        counters.latency_us.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
    } else {
        0.0
    };
    println!("elapsed:      {:.2}s", elapsed.as_secs_f64());
    println!("committed:    {committed}");
    println!("aborted:      {aborted}");
    println!(
        "throughput:   {:.1} txn/s",
        total as f64 / elapsed.as_secs_f64()
    );
    println!("avg latency:  {avg_latency_ms:.2} ms");
    Ok(())
}
