//! Node binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use meridian_engine::config::Config;
use meridian_engine::storage::MemStorage;
use meridian_store::start_node;

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Run one Meridian machine")]
struct Args {
    /// Path to the deployment configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Replica (region) this machine belongs to.
    #[arg(long)]
    replica: u32,

    /// Partition this machine serves within its replica.
    #[arg(long)]
    partition: u32,
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
    let config =
        Config::from_file(&args.config, args.replica, args.partition).context("load config")?;
    tracing::info!(
        replica = args.replica,
        partition = args.partition,
        machine_id = config.local_machine_id(),
        "starting meridian node"
    );

    let storage = Arc::new(MemStorage::new());
    let node = start_node(config, storage).await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    node.shutdown();
    Ok(())
}
