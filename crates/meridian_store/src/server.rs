//! Client-facing surface: accepts framed API requests, assigns transaction
//! ids, answers master lookups, and merges completed sub-transactions into
//! the final client response.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{ApiRequest, ApiResponse, Request, Response, StatsModule};
use meridian_engine::storage::MasterLookup;
use meridian_engine::txn::{merge_transaction, validate_transaction, Transaction};
use meridian_engine::types::{
    Channel, Key, MachineId, Metadata, PartitionId, TxnId, FORWARDER_CHANNEL, MAX_NUM_MACHINES,
    SCHEDULER_CHANNEL, SERVER_CHANNEL,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::broker::Sender;
use crate::module::Module;

/// One client request plus the pipe back to its connection.
pub struct ClientEvent {
    pub request: ApiRequest,
    pub reply: mpsc::UnboundedSender<ApiResponse>,
}

struct PendingResponse {
    stream_id: u32,
    reply: mpsc::UnboundedSender<ApiResponse>,
}

/// Merge state for a txn whose sub-transactions are still arriving.
struct CompletedTransaction {
    txn: Transaction,
    awaited_partitions: HashSet<PartitionId>,
}

pub struct Server {
    config: ConfigPtr,
    sender: Sender,
    master_lookup: Arc<dyn MasterLookup>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    txn_id_counter: u32,
    pending_responses: HashMap<TxnId, PendingResponse>,
    completed_txns: HashMap<TxnId, CompletedTransaction>,
}

impl Server {
    /// Build the server module; the returned receiver is its client-event
    /// stream and must be handed to the module runner.
    pub fn new(
        config: ConfigPtr,
        sender: Sender,
        master_lookup: Arc<dyn MasterLookup>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = Self {
            config,
            sender,
            master_lookup,
            events_tx,
            txn_id_counter: 0,
            pending_responses: HashMap::new(),
            completed_txns: HashMap::new(),
        };
        (server, events_rx)
    }

    fn next_txn_id(&mut self) -> TxnId {
        self.txn_id_counter += 1;
        self.txn_id_counter * MAX_NUM_MACHINES + self.config.local_machine_id()
    }

    fn process_txn_request(&mut self, mut txn: Transaction, stream_id: u32, reply: mpsc::UnboundedSender<ApiResponse>) {
        if let Err(reason) = validate_transaction(&txn) {
            txn.abort(reason);
            let _ = reply.send(ApiResponse::Txn { stream_id, txn });
            return;
        }
        let txn_id = self.next_txn_id();
        txn.id = txn_id;
        txn.coordinating_server = self.config.local_machine_id();
        self.pending_responses
            .insert(txn_id, PendingResponse { stream_id, reply });
        debug!(txn_id, "accepted txn from client");
        self.sender.send_request(
            FORWARDER_CHANNEL,
            SERVER_CHANNEL,
            Request::ForwardTxn { txn },
        );
    }

    fn process_stats_request(
        &mut self,
        module: StatsModule,
        level: u32,
        stream_id: u32,
        reply: mpsc::UnboundedSender<ApiResponse>,
    ) {
        match module {
            StatsModule::Server => {
                let json = self.stats(level);
                let _ = reply.send(ApiResponse::Stats { stream_id, json });
            }
            StatsModule::Scheduler => {
                let id = self.next_txn_id();
                self.pending_responses
                    .insert(id, PendingResponse { stream_id, reply });
                self.sender.send_request(
                    SCHEDULER_CHANNEL,
                    SERVER_CHANNEL,
                    Request::Stats { id, level },
                );
            }
        }
    }

    fn process_lookup_master(
        &mut self,
        txn_id: TxnId,
        keys: Vec<Key>,
        from: MachineId,
        from_channel: Channel,
    ) {
        let mut metadata: BTreeMap<Key, Metadata> = BTreeMap::new();
        let mut new_keys = Vec::new();
        for key in keys {
            if !self.config.key_is_in_local_partition(&key) {
                continue;
            }
            match self.master_lookup.master_metadata(&key) {
                Some(meta) => {
                    metadata.insert(key, meta);
                }
                None => new_keys.push(key),
            }
        }
        self.sender.send_response_to(
            from,
            from_channel,
            SERVER_CHANNEL,
            Response::LookupMaster {
                txn_id,
                metadata,
                new_keys,
            },
        );
    }

    /// Fold one partition's completed sub-txn into the pending response;
    /// reply to the client once every awaited partition has reported.
    fn process_completed_subtxn(
        &mut self,
        txn: Transaction,
        partition: PartitionId,
        involved_partitions: Vec<PartitionId>,
    ) {
        let txn_id = txn.id;
        if !self.pending_responses.contains_key(&txn_id) {
            // Duplicate report from another replica's replay; already answered.
            debug!(txn_id, "dropping sub-txn for an untracked txn");
            return;
        }

        match self.completed_txns.entry(txn_id) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                let awaited_partitions = involved_partitions
                    .iter()
                    .copied()
                    .filter(|p| *p != partition)
                    .collect();
                entry.insert(CompletedTransaction {
                    txn,
                    awaited_partitions,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if entry.get_mut().awaited_partitions.remove(&partition) {
                    merge_transaction(&mut entry.get_mut().txn, &txn);
                }
            }
        }

        let finished = self
            .completed_txns
            .get(&txn_id)
            .is_some_and(|c| c.awaited_partitions.is_empty());
        if finished {
            let completed = self.completed_txns.remove(&txn_id).expect("checked above");
            let pending = self
                .pending_responses
                .remove(&txn_id)
                .expect("checked above");
            debug!(txn_id, status = ?completed.txn.status, "responding to client");
            let _ = pending.reply.send(ApiResponse::Txn {
                stream_id: pending.stream_id,
                txn: completed.txn,
            });
        }
    }

    fn stats(&self, level: u32) -> String {
        let mut stats = serde_json::json!({
            "txn_id_counter": self.txn_id_counter,
            "num_pending_responses": self.pending_responses.len(),
            "num_partially_completed_txns": self.completed_txns.len(),
        });
        if level >= 1 {
            stats["pending_responses"] = self
                .pending_responses
                .keys()
                .copied()
                .collect::<Vec<_>>()
                .into();
            stats["partially_completed_txns"] = self
                .completed_txns
                .keys()
                .copied()
                .collect::<Vec<_>>()
                .into();
        }
        stats.to_string()
    }
}

#[async_trait]
impl Module for Server {
    type Event = ClientEvent;

    fn name(&self) -> &'static str {
        "server"
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        let addr = self.config.local_server_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind server listener on {addr}"))?;
        info!(%addr, "server listening");
        tokio::spawn(accept_clients(listener, self.events_tx.clone()));
        Ok(())
    }

    async fn handle_request(
        &mut self,
        request: Request,
        from: MachineId,
        from_channel: Channel,
    ) -> anyhow::Result<()> {
        match request {
            Request::LookupMaster { txn_id, keys } => {
                self.process_lookup_master(txn_id, keys, from, from_channel)
            }
            Request::CompletedSubtxn {
                txn,
                partition,
                involved_partitions,
            } => self.process_completed_subtxn(txn, partition, involved_partitions),
            other => warn!(?other, "unexpected request at server"),
        }
        Ok(())
    }

    async fn handle_response(
        &mut self,
        response: Response,
        _from: MachineId,
    ) -> anyhow::Result<()> {
        let Response::Stats { id, json } = response else {
            warn!("unexpected response at server");
            return Ok(());
        };
        if let Some(pending) = self.pending_responses.remove(&id) {
            let _ = pending.reply.send(ApiResponse::Stats {
                stream_id: pending.stream_id,
                json,
            });
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ClientEvent) -> anyhow::Result<()> {
        match event.request {
            ApiRequest::Txn { stream_id, txn } => {
                self.process_txn_request(txn, stream_id, event.reply)
            }
            ApiRequest::Stats {
                stream_id,
                module,
                level,
            } => self.process_stats_request(module, level, stream_id, event.reply),
        }
        Ok(())
    }
}

async fn accept_clients(listener: TcpListener, events: mpsc::UnboundedSender<ClientEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "client connected");
                tokio::spawn(serve_client(stream, events.clone()));
            }
            Err(err) => warn!(error = ?err, "client accept failed"),
        }
    }
}

/// One task per connection: decode requests into the server's event stream
/// and write responses back as they complete.
async fn serve_client(stream: TcpStream, events: mpsc::UnboundedSender<ClientEvent>) {
    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut frames_out = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ApiResponse>();

    let writer = tokio::spawn(async move {
        while let Some(response) = reply_rx.recv().await {
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    if frames_out.send(Bytes::from(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(err) => warn!(error = ?err, "failed to encode api response"),
            }
        }
    });

    while let Some(frame) = frames_in.next().await {
        let Ok(bytes) = frame else { break };
        match serde_json::from_slice::<ApiRequest>(&bytes) {
            Ok(request) => {
                if events
                    .send(ClientEvent {
                        request,
                        reply: reply_tx.clone(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!(error = ?err, "dropping undecodable api request"),
        }
    }
    drop(reply_tx);
    let _ = writer.await;
}
