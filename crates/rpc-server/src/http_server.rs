//! HTTP JSON-RPC Server
//!
//! Provides HTTP endpoint for JSON-RPC methods.
//!
//! Params may be a named object or a one-element array holding that object.

use crate::methods::{
    handle_account_balance, handle_account_create, handle_block_search, handle_block_send,
    handle_genesis_sync, handle_get_health, handle_get_peers, handle_get_status,
    handle_tx_search, handle_tx_send, handle_tx_sign, RpcContext, RpcError,
};
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn from_result(id: Value, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: error_code(&e),
                    message: e.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
}

impl HttpRpcServer {
    /// Create a new HTTP RPC server
    pub fn new(context: Arc<RpcContext>) -> Self {
        Self { context }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        // CORS layer to allow browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.context)
    }

    /// Run the server until `shutdown` resolves
    pub async fn run(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Handle JSON-RPC request
async fn handle_rpc(
    State(context): State<Arc<RpcContext>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let result = dispatch_method(&context, &request.method, request.params).await;
    (StatusCode::OK, Json(JsonRpcResponse::from_result(request.id, result)))
}

/// Dispatch to appropriate method handler
pub(crate) async fn dispatch_method(
    ctx: &RpcContext,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    tracing::debug!("RPC method called: {}", method);
    match method {
        "accountCreate" => to_json(handle_account_create(ctx, parse_params(params)?).await?),

        "accountBalance" => to_json(handle_account_balance(ctx, parse_params(params)?)?),

        "txSign" => to_json(handle_tx_sign(ctx, parse_params(params)?).await?),

        "txSend" => to_json(handle_tx_send(ctx, parse_params(params)?).await?),

        "blockSend" => to_json(handle_block_send(ctx, parse_params(params)?).await?),

        "txSearch" => to_json(handle_tx_search(ctx, parse_params(params)?)?),

        "blockSearch" => to_json(handle_block_search(ctx, parse_params(params)?)?),

        "genesisSync" => to_json(handle_genesis_sync(ctx)?),

        "getPeers" => to_json(handle_get_peers(ctx)?),

        "getStatus" => to_json(handle_get_status(ctx)?),

        "getHealth" => {
            let health = handle_get_health()?;
            Ok(json!(health))
        }

        "getVersion" => Ok(json!({
            "chain-node": env!("CARGO_PKG_VERSION"),
        })),

        _ => Err(RpcError::MethodNotFound(method.to_string())),
    }
}

/// Accept `{..}`, `[{..}]` or no params at all
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

/// Map error to JSON-RPC error code
pub(crate) fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
        RpcError::TxRejected(_) => -32003,
        RpcError::BlockRejected(_) => -32004,
    }
}
