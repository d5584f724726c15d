//! WebSocket Server
//!
//! One listener carries two protocols. Binary frames are Borsh peer messages
//! answered by a [`PeerSession`]; text frames are JSON-RPC from clients, with
//! event subscriptions pushed back as `streamNotification` messages.

use crate::http_server::{dispatch_method, parse_params, JsonRpcResponse};
use crate::methods::{handle_block_search, handle_tx_search, RpcContext, RpcError};
use chain_consensus::{PeerMessage, PeerService};
use chain_runtime::{EventKind, EventNotification, SubscriptionId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Frames waiting for the socket writer
const OUTBOUND_CAPACITY: usize = 256;

/// WebSocket JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct WsJsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StreamSubscribeRequest {
    /// Empty means every kind
    #[serde(default)]
    pub kinds: Vec<EventKind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamUnsubscribeRequest {
    pub subscription: SubscriptionId,
}

/// WebSocket Server
pub struct WebSocketServer {
    context: Arc<RpcContext>,
    peer_service: Arc<PeerService>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(context: Arc<RpcContext>, peer_service: Arc<PeerService>) -> Self {
        Self {
            context,
            peer_service,
        }
    }

    /// Run the WebSocket server
    pub async fn run(self, addr: &str, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("WebSocket server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections on a bound listener until shutdown
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("WebSocket accept failed: {}", e);
                            continue;
                        }
                    };
                    let ctx = self.context.clone();
                    let service = self.peer_service.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx, service).await {
                            tracing::debug!("WebSocket connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    context: Arc<RpcContext>,
    peer_service: Arc<PeerService>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Replies and subscription pushes share one writer
    let (out, mut outbound) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut session = peer_service.session();
    let mut connection = Connection::new(context, out);

    let result = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg? {
                Message::Binary(data) => {
                    let replies = match PeerMessage::from_bytes(&data) {
                        Ok(message) => session.handle(message).await,
                        Err(e) => vec![PeerMessage::Error {
                            message: format!("malformed frame: {}", e),
                        }],
                    };
                    for reply in replies {
                        connection.send(Message::Binary(reply.to_bytes())).await?;
                    }
                }
                Message::Text(text) => connection.handle_text(&text).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        anyhow::Ok(())
    }
    .await;

    // Clean up subscriptions on disconnect
    connection.close();
    drop(connection);
    let _ = writer.await;

    result
}

/// Client-side JSON-RPC state for one connection
struct Connection {
    context: Arc<RpcContext>,
    out: mpsc::Sender<Message>,
    forwarders: HashMap<SubscriptionId, JoinHandle<()>>,
}

impl Connection {
    fn new(context: Arc<RpcContext>, out: mpsc::Sender<Message>) -> Self {
        Self {
            context,
            out,
            forwarders: HashMap::new(),
        }
    }

    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.out
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    async fn send_json(&self, value: &impl Serialize) -> anyhow::Result<()> {
        self.send(Message::Text(serde_json::to_string(value)?)).await
    }

    async fn handle_text(&mut self, text: &str) -> anyhow::Result<()> {
        let request: WsJsonRpcRequest = match serde_json::from_str(text) {
            Ok(req) => req,
            Err(_) => {
                return self
                    .send_json(&error_response(&Value::Null, -32700, "Parse error"))
                    .await
            }
        };

        let result = self.handle_ws_method(&request).await;
        self.send_json(&JsonRpcResponse::from_result(request.id, result))
            .await
    }

    /// Handle WebSocket JSON-RPC method
    async fn handle_ws_method(&mut self, request: &WsJsonRpcRequest) -> Result<Value, RpcError> {
        let params = request.params.clone();
        match request.method.as_str() {
            "streamSubscribe" => {
                let params: StreamSubscribeRequest = parse_params(params)?;
                Ok(json!(self.subscribe(&params.kinds)))
            }

            "streamUnsubscribe" => {
                let params: StreamUnsubscribeRequest = parse_params(params)?;
                Ok(json!(self.unsubscribe(params.subscription)))
            }

            "txSearch" => {
                let records = handle_tx_search(&self.context, parse_params(params)?)?;
                self.stream_results(&request.id, &records).await
            }

            "blockSearch" => {
                let records = handle_block_search(&self.context, parse_params(params)?)?;
                self.stream_results(&request.id, &records).await
            }

            method => dispatch_method(&self.context, method, params).await,
        }
    }

    /// One `searchResult` notification per match; the response is the count
    async fn stream_results<T: Serialize>(
        &self,
        request_id: &Value,
        results: &[T],
    ) -> Result<Value, RpcError> {
        for result in results {
            self.send_json(&json!({
                "jsonrpc": "2.0",
                "method": "searchResult",
                "params": {
                    "request": request_id,
                    "result": result,
                }
            }))
            .await
            .map_err(|e| RpcError::InternalError(e.to_string()))?;
        }
        Ok(json!(results.len()))
    }

    fn subscribe(&mut self, kinds: &[EventKind]) -> SubscriptionId {
        let (sub_id, mut receiver) = self.context.ingress.events().subscribe(kinds);
        let out = self.out.clone();

        // Forward notifications until the connection or subscription goes away
        let forwarder = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        let text = format_stream_notification(&notification).to_string();
                        if out.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subscription {} skipped {} events", sub_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.forwarders.insert(sub_id, forwarder);
        tracing::debug!("Subscription {} opened for {:?}", sub_id, kinds);
        sub_id
    }

    /// Only subscriptions opened on this connection can be closed from it
    fn unsubscribe(&mut self, sub_id: SubscriptionId) -> bool {
        match self.forwarders.remove(&sub_id) {
            Some(forwarder) => {
                forwarder.abort();
                self.context.ingress.events().unsubscribe(sub_id)
            }
            None => false,
        }
    }

    fn close(&mut self) {
        let ids: Vec<_> = self.forwarders.keys().copied().collect();
        for sub_id in ids {
            self.unsubscribe(sub_id);
        }
    }
}

/// Create error response
fn error_response(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Format event notification for WebSocket
pub fn format_stream_notification(notification: &EventNotification) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "streamNotification",
        "params": {
            "result": notification.event,
            "subscription": notification.subscription_id
        }
    })
}
