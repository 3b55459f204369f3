//! The module capability set and the generic runner that drives it.
//!
//! Every pipeline stage is a single-threaded cooperative task: it suspends
//! only in its inbox receive, with an optional interval for timed work such
//! as the sequencer's batching tick. Modules that consume an extra
//! in-process stream (client connections, worker completions) declare an
//! event type; everything else uses `()`.

use std::time::Duration;

use async_trait::async_trait;
use meridian_engine::messages::{Envelope, Message, Request, Response};
use meridian_engine::types::{Channel, MachineId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[async_trait]
pub trait Module: Send + 'static {
    /// Extra in-process events this module consumes besides envelopes.
    type Event: Send + 'static;

    fn name(&self) -> &'static str;

    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_request(
        &mut self,
        request: Request,
        from: MachineId,
        from_channel: Channel,
    ) -> anyhow::Result<()>;

    async fn handle_response(
        &mut self,
        _response: Response,
        from: MachineId,
    ) -> anyhow::Result<()> {
        warn!(module = self.name(), from, "unexpected response");
        Ok(())
    }

    async fn handle_event(&mut self, _event: Self::Event) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

/// Drive a module until its inbox closes.
pub fn spawn_module<M: Module>(
    module: M,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    events: Option<mpsc::UnboundedReceiver<M::Event>>,
) -> JoinHandle<()> {
    tokio::spawn(run_module(module, inbox, events))
}

async fn run_module<M: Module>(
    mut module: M,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    mut events: Option<mpsc::UnboundedReceiver<M::Event>>,
) {
    if let Err(err) = module.initialize().await {
        error!(module = module.name(), error = ?err, "module initialization failed");
        return;
    }
    info!(module = module.name(), "module started");

    let mut interval = tokio::time::interval(
        module
            .tick_interval()
            .unwrap_or(Duration::from_secs(3600)),
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let has_tick = module.tick_interval().is_some();

    loop {
        let result = tokio::select! {
            envelope = inbox.recv() => match envelope {
                Some(envelope) => dispatch(&mut module, envelope).await,
                None => break,
            },
            event = next_event(&mut events) => match event {
                Some(event) => module.handle_event(event).await,
                // The event source closed; keep serving envelopes.
                None => { events = None; Ok(()) }
            },
            _ = interval.tick(), if has_tick => module.tick().await,
        };
        if let Err(err) = result {
            error!(module = module.name(), error = ?err, "module handler failed");
        }
    }
    info!(module = module.name(), "module stopped");
}

async fn dispatch<M: Module>(module: &mut M, envelope: Envelope) -> anyhow::Result<()> {
    match envelope.message {
        Message::Request(request) => {
            module
                .handle_request(request, envelope.from, envelope.from_channel)
                .await
        }
        Message::Response(response) => module.handle_response(response, envelope.from).await,
    }
}

async fn next_event<E>(events: &mut Option<mpsc::UnboundedReceiver<E>>) -> Option<E> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
