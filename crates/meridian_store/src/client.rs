//! Minimal client for the framed API: submit transactions and stats
//! requests, match responses by stream id.

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use meridian_engine::messages::{ApiRequest, ApiResponse, StatsModule};
use meridian_engine::txn::Transaction;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub struct Client {
    frames: Framed<TcpStream, LengthDelimitedCodec>,
    next_stream_id: u32,
}

impl Client {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to server at {addr}"))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            frames: Framed::new(stream, LengthDelimitedCodec::new()),
            next_stream_id: 0,
        })
    }

    async fn send(&mut self, request: &ApiRequest) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(request).context("encode api request")?;
        self.frames
            .send(Bytes::from(bytes))
            .await
            .context("send api request")
    }

    async fn recv(&mut self) -> anyhow::Result<ApiResponse> {
        let frame = self
            .frames
            .next()
            .await
            .context("connection closed")?
            .context("read api response")?;
        serde_json::from_slice(&frame).context("decode api response")
    }

    /// Fire a transaction without waiting for its response.
    pub async fn send_txn(&mut self, txn: Transaction) -> anyhow::Result<u32> {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.send(&ApiRequest::Txn { stream_id, txn }).await?;
        Ok(stream_id)
    }

    /// Wait for the transaction response matching `stream_id`.
    pub async fn recv_txn(&mut self, stream_id: u32) -> anyhow::Result<Transaction> {
        loop {
            match self.recv().await? {
                ApiResponse::Txn {
                    stream_id: got,
                    txn,
                } if got == stream_id => return Ok(txn),
                _ => continue,
            }
        }
    }

    /// Submit a transaction and wait for its final state.
    pub async fn execute(&mut self, txn: Transaction) -> anyhow::Result<Transaction> {
        let stream_id = self.send_txn(txn).await?;
        self.recv_txn(stream_id).await
    }

    pub async fn stats(&mut self, module: StatsModule, level: u32) -> anyhow::Result<String> {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.send(&ApiRequest::Stats {
            stream_id,
            module,
            level,
        })
        .await?;
        loop {
            match self.recv().await? {
                ApiResponse::Stats {
                    stream_id: got,
                    json,
                } if got == stream_id => return Ok(json),
                _ => continue,
            }
        }
    }
}
