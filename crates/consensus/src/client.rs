//! Outbound peer calls
//!
//! [`PeerClient`] is what discovery, relay and sync talk to. The network
//! implementation opens one WebSocket per call; tests swap in an in-memory
//! client.

use crate::wire::PeerMessage;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chain_runtime::{SignedBlock, SignedGenesis};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Default bound on a single remote call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocks streamed back by a sync request
pub type BlockStream = BoxStream<'static, anyhow::Result<SignedBlock>>;

/// Outbound stream of relayed messages to one peer
#[async_trait]
pub trait RelaySink: Send {
    async fn send(&mut self, message: PeerMessage) -> anyhow::Result<()>;

    /// Close the stream and return how many messages the peer accepted
    async fn finish(self: Box<Self>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask `peer` who it knows, announcing ourselves as `caller`
    async fn discover(&self, peer: &str, caller: &str) -> anyhow::Result<Vec<String>>;

    async fn fetch_genesis(&self, peer: &str) -> anyhow::Result<SignedGenesis>;

    /// Stream every block `peer` has from `from_number` on
    async fn fetch_blocks(&self, peer: &str, from_number: u64) -> anyhow::Result<BlockStream>;

    async fn open_relay(&self, peer: &str) -> anyhow::Result<Box<dyn RelaySink>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`PeerClient`] over WebSocket binary frames
#[derive(Debug, Clone)]
pub struct WsPeerClient {
    request_timeout: Duration,
}

impl WsPeerClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    async fn connect(&self, peer: &str) -> anyhow::Result<WsStream> {
        let url = format!("ws://{}", peer);
        let (ws_stream, _) = timeout(self.request_timeout, connect_async(&url))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", peer))?
            .with_context(|| format!("connect to {}", peer))?;
        Ok(ws_stream)
    }

    /// One request, one reply
    async fn request(&self, peer: &str, message: PeerMessage) -> anyhow::Result<PeerMessage> {
        let mut ws_stream = self.connect(peer).await?;
        send_frame(&mut ws_stream, &message, self.request_timeout).await?;
        let reply = recv_frame(&mut ws_stream, self.request_timeout).await?;
        let _ = ws_stream.close(None).await;
        Ok(reply)
    }
}

impl Default for WsPeerClient {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

async fn send_frame(
    ws_stream: &mut WsStream,
    message: &PeerMessage,
    limit: Duration,
) -> anyhow::Result<()> {
    timeout(limit, ws_stream.send(Message::Binary(message.to_bytes())))
        .await
        .map_err(|_| anyhow!("send timed out"))??;
    Ok(())
}

/// Next binary frame, skipping pings; a peer-side `Error` becomes an error
async fn recv_frame(ws_stream: &mut WsStream, limit: Duration) -> anyhow::Result<PeerMessage> {
    loop {
        let frame = timeout(limit, ws_stream.next())
            .await
            .map_err(|_| anyhow!("reply timed out"))?;

        match frame {
            Some(Ok(Message::Binary(data))) => {
                let message = PeerMessage::from_bytes(&data).context("decode peer message")?;
                if let PeerMessage::Error { message } = message {
                    bail!("peer error: {}", message);
                }
                return Ok(message);
            }
            Some(Ok(Message::Close(_))) | None => bail!("connection closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl PeerClient for WsPeerClient {
    async fn discover(&self, peer: &str, caller: &str) -> anyhow::Result<Vec<String>> {
        let request = PeerMessage::Discover {
            caller: caller.to_string(),
        };
        match self.request(peer, request).await? {
            PeerMessage::Peers { peers } => Ok(peers),
            other => bail!("unexpected reply to discover: {}", other.kind()),
        }
    }

    async fn fetch_genesis(&self, peer: &str) -> anyhow::Result<SignedGenesis> {
        match self.request(peer, PeerMessage::GenesisRequest).await? {
            PeerMessage::Genesis { genesis } => Ok(genesis),
            other => bail!("unexpected reply to genesis request: {}", other.kind()),
        }
    }

    async fn fetch_blocks(&self, peer: &str, from_number: u64) -> anyhow::Result<BlockStream> {
        let mut ws_stream = self.connect(peer).await?;
        send_frame(
            &mut ws_stream,
            &PeerMessage::BlockSyncRequest { from_number },
            self.request_timeout,
        )
        .await?;

        let limit = self.request_timeout;
        let stream = futures::stream::unfold(Some(ws_stream), move |state| async move {
            let mut ws_stream = state?;
            match recv_frame(&mut ws_stream, limit).await {
                Ok(PeerMessage::Block { block }) => Some((Ok(block), Some(ws_stream))),
                Ok(PeerMessage::EndOfStream) => {
                    let _ = ws_stream.close(None).await;
                    None
                }
                Ok(other) => Some((
                    Err(anyhow!("unexpected frame in block sync: {}", other.kind())),
                    None,
                )),
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn open_relay(&self, peer: &str) -> anyhow::Result<Box<dyn RelaySink>> {
        let ws_stream = self.connect(peer).await?;
        Ok(Box::new(WsRelaySink {
            ws_stream,
            request_timeout: self.request_timeout,
        }))
    }
}

struct WsRelaySink {
    ws_stream: WsStream,
    request_timeout: Duration,
}

#[async_trait]
impl RelaySink for WsRelaySink {
    async fn send(&mut self, message: PeerMessage) -> anyhow::Result<()> {
        send_frame(&mut self.ws_stream, &message, self.request_timeout).await
    }

    async fn finish(mut self: Box<Self>) -> anyhow::Result<u64> {
        send_frame(
            &mut self.ws_stream,
            &PeerMessage::EndOfStream,
            self.request_timeout,
        )
        .await?;
        let reply = recv_frame(&mut self.ws_stream, self.request_timeout).await?;
        let _ = self.ws_stream.close(None).await;

        match reply {
            PeerMessage::Ack { accepted } => Ok(accepted),
            other => bail!("unexpected reply to relay stream: {}", other.kind()),
        }
    }
}
