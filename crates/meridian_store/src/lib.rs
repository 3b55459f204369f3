//! Meridian node: wires the engine's deterministic components into
//! cooperative tasks connected by the broker, and exposes an embedded-node
//! API so tests and other processes can run full machines in-process.

use std::sync::Arc;
use std::time::Duration;

use meridian_engine::config::ConfigPtr;
use meridian_engine::storage::MemStorage;
use meridian_engine::types::{
    FORWARDER_CHANNEL, GLOBAL_PAXOS_CHANNEL, INTERLEAVER_CHANNEL, LOCAL_PAXOS_CHANNEL,
    MULTI_HOME_ORDERER_CHANNEL, SCHEDULER_CHANNEL, SEQUENCER_CHANNEL, SERVER_CHANNEL,
};
use tokio::task::JoinHandle;

pub mod broker;
pub mod client;
pub mod forwarder;
pub mod interleaver;
pub mod module;
pub mod orderer;
pub mod paxos;
pub mod scheduler;
pub mod sequencer;
pub mod server;
pub mod worker;

use broker::Broker;
use forwarder::Forwarder;
use interleaver::Interleaver;
use module::spawn_module;
use orderer::MultiHomeOrderer;
use paxos::SimpleMultiPaxos;
use scheduler::Scheduler;
use sequencer::Sequencer;
use server::Server;

/// A running machine. Dropping the handle leaves the tasks running; call
/// [`NodeHandle::shutdown`] to stop them.
pub struct NodeHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Assemble and start every module of one machine on the current runtime.
pub async fn start_node(config: ConfigPtr, storage: Arc<MemStorage>) -> anyhow::Result<NodeHandle> {
    let mut broker = Broker::new(config.clone());
    let server_rx = broker.add_channel(SERVER_CHANNEL);
    let forwarder_rx = broker.add_channel(FORWARDER_CHANNEL);
    let sequencer_rx = broker.add_channel(SEQUENCER_CHANNEL);
    let orderer_rx = broker.add_channel(MULTI_HOME_ORDERER_CHANNEL);
    let interleaver_rx = broker.add_channel(INTERLEAVER_CHANNEL);
    let scheduler_rx = broker.add_channel(SCHEDULER_CHANNEL);
    let local_paxos_rx = broker.add_channel(LOCAL_PAXOS_CHANNEL);
    let global_paxos_rx = broker.add_channel(GLOBAL_PAXOS_CHANNEL);
    let sender = broker.sender();

    let (server, client_events) = Server::new(config.clone(), sender.clone(), storage.clone());
    let forwarder = Forwarder::new(config.clone(), sender.clone());
    let sequencer = Sequencer::new(config.clone(), sender.clone());
    let orderer = MultiHomeOrderer::new(config.clone(), sender.clone());
    let interleaver = Interleaver::new(config.clone(), sender.clone());
    let (scheduler, scheduler_events) =
        Scheduler::new(config.clone(), storage.clone(), sender.clone());
    let local_paxos = SimpleMultiPaxos::local(&config, sender.clone());
    let global_paxos = SimpleMultiPaxos::global(&config, sender.clone());

    let mut tasks = broker.start().await?;
    tasks.push(spawn_module(server, server_rx, Some(client_events)));
    tasks.push(spawn_module(forwarder, forwarder_rx, None));
    tasks.push(spawn_module(sequencer, sequencer_rx, None));
    tasks.push(spawn_module(orderer, orderer_rx, None));
    tasks.push(spawn_module(interleaver, interleaver_rx, None));
    tasks.push(spawn_module(scheduler, scheduler_rx, Some(scheduler_events)));
    tasks.push(spawn_module(local_paxos, local_paxos_rx, None));
    tasks.push(spawn_module(global_paxos, global_paxos_rx, None));

    Ok(NodeHandle { tasks })
}

/// Wait until a node's server listener accepts connections.
pub async fn wait_for_ready(config: &ConfigPtr, timeout: Duration) -> anyhow::Result<()> {
    let addr = config.local_server_addr();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for server listener at {addr}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
