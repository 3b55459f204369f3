//! Message plumbing for one machine: an in-process channel registry for
//! local module-to-module traffic and a framed TCP fabric for everything
//! crossing machines.
//!
//! Frames are length-delimited JSON envelopes. Outbound traffic funnels
//! through one router task that owns a lazily-connected pipeline per peer;
//! a peer pipeline never drops a message, it reconnects and retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{Envelope, Message, Request, Response};
use meridian_engine::types::{Channel, MachineId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_millis(100);

type ChannelMap = HashMap<Channel, mpsc::UnboundedSender<Envelope>>;

/// Handle modules use to send envelopes anywhere in the deployment. Local
/// destinations short-circuit through the channel registry.
#[derive(Clone)]
pub struct Sender {
    local_machine: MachineId,
    channels: Arc<ChannelMap>,
    remote_tx: mpsc::UnboundedSender<(MachineId, Envelope)>,
}

impl Sender {
    pub fn local_machine(&self) -> MachineId {
        self.local_machine
    }

    /// Send a request to a channel on this machine.
    pub fn send_request(&self, to_channel: Channel, from_channel: Channel, request: Request) {
        self.send_request_to(self.local_machine, to_channel, from_channel, request);
    }

    pub fn send_request_to(
        &self,
        machine: MachineId,
        to_channel: Channel,
        from_channel: Channel,
        request: Request,
    ) {
        self.route(
            machine,
            Envelope {
                from: self.local_machine,
                from_channel,
                to_channel,
                message: Message::Request(request),
            },
        );
    }

    pub fn send_response_to(
        &self,
        machine: MachineId,
        to_channel: Channel,
        from_channel: Channel,
        response: Response,
    ) {
        self.route(
            machine,
            Envelope {
                from: self.local_machine,
                from_channel,
                to_channel,
                message: Message::Response(response),
            },
        );
    }

    fn route(&self, machine: MachineId, envelope: Envelope) {
        if machine == self.local_machine {
            deliver_local(&self.channels, envelope);
        } else if self.remote_tx.send((machine, envelope)).is_err() {
            debug!("broker router is gone; dropping outbound envelope");
        }
    }
}

fn deliver_local(channels: &ChannelMap, envelope: Envelope) {
    match channels.get(&envelope.to_channel) {
        Some(tx) => {
            if tx.send(envelope).is_err() {
                debug!("local channel closed; dropping envelope");
            }
        }
        None => warn!(
            channel = envelope.to_channel,
            "envelope addressed to unregistered channel"
        ),
    }
}

/// Per-machine message hub. Register every module channel, hand out
/// [`Sender`]s, then call [`Broker::start`] to bring up the TCP fabric.
pub struct Broker {
    config: ConfigPtr,
    channels: ChannelMap,
    remote_tx: mpsc::UnboundedSender<(MachineId, Envelope)>,
    remote_rx: Option<mpsc::UnboundedReceiver<(MachineId, Envelope)>>,
}

impl Broker {
    pub fn new(config: ConfigPtr) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            config,
            channels: HashMap::new(),
            remote_tx,
            remote_rx: Some(remote_rx),
        }
    }

    /// Register a module's inbound channel. Must happen before `start`.
    pub fn add_channel(&mut self, channel: Channel) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self.channels.insert(channel, tx);
        assert!(replaced.is_none(), "channel {channel} registered twice");
        rx
    }

    pub fn sender(&self) -> Sender {
        Sender {
            local_machine: self.config.local_machine_id(),
            channels: Arc::new(self.channels.clone()),
            remote_tx: self.remote_tx.clone(),
        }
    }

    /// Bind the listener and spawn the inbound and outbound network tasks.
    pub async fn start(mut self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let addr = self.config.local_broker_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind broker listener on {addr}"))?;
        info!(%addr, "broker listening");

        let channels = Arc::new(self.channels.clone());
        let accept_task = tokio::spawn(accept_loop(listener, channels));

        let remote_rx = self.remote_rx.take().expect("broker started twice");
        let router_task = tokio::spawn(route_outbound(self.config.clone(), remote_rx));

        Ok(vec![accept_task, router_task])
    }
}

async fn accept_loop(listener: TcpListener, channels: Arc<ChannelMap>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "broker accepted connection");
                let channels = channels.clone();
                tokio::spawn(read_envelopes(stream, channels));
            }
            Err(err) => {
                warn!(error = ?err, "broker accept failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn read_envelopes(stream: TcpStream, channels: Arc<ChannelMap>) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => deliver_local(&channels, envelope),
                Err(err) => warn!(error = ?err, "dropping undecodable envelope"),
            },
            Err(err) => {
                debug!(error = ?err, "broker connection closed");
                return;
            }
        }
    }
}

/// Fan outbound envelopes into one ordered pipeline per destination machine.
async fn route_outbound(
    config: ConfigPtr,
    mut remote_rx: mpsc::UnboundedReceiver<(MachineId, Envelope)>,
) {
    let mut peers: HashMap<MachineId, mpsc::UnboundedSender<Envelope>> = HashMap::new();
    while let Some((machine, envelope)) = remote_rx.recv().await {
        let tx = peers.entry(machine).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let addr = config.broker_addr(machine);
            tokio::spawn(peer_pipeline(addr, rx));
            tx
        });
        if tx.send(envelope).is_err() {
            warn!(machine, "peer pipeline died; dropping envelope");
        }
    }
}

/// Write envelopes to one peer in order, reconnecting as needed. The current
/// envelope is held until it has been written successfully.
async fn peer_pipeline(addr: String, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut writer = None;
    while let Some(envelope) = rx.recv().await {
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(error = ?err, "dropping unencodable envelope");
                continue;
            }
        };
        loop {
            if writer.is_none() {
                writer = connect(&addr).await;
            }
            let Some(sink) = writer.as_mut() else {
                continue;
            };
            match sink.send(bytes.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    debug!(%addr, error = ?err, "peer write failed; reconnecting");
                    writer = None;
                }
            }
        }
    }
}

async fn connect(addr: &str) -> Option<FramedWrite<TcpStream, LengthDelimitedCodec>> {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Some(FramedWrite::new(stream, LengthDelimitedCodec::new()))
        }
        Err(err) => {
            debug!(%addr, error = ?err, "peer connect failed; retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            None
        }
    }
}
