//! RPC Server - JSON-RPC and WebSocket for the chain node
//!
//! - HTTP JSON-RPC: accountCreate, txSign, txSend, txSearch, blockSearch, etc.
//! - WebSocket: peer protocol (binary frames) plus streamSubscribe and
//!   streamUnsubscribe (text frames)

pub mod http_server;
pub mod methods;
pub mod ws_server;

#[cfg(test)]
mod testing;

pub use http_server::{HttpRpcServer, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use methods::{RpcContext, RpcError};
pub use ws_server::WebSocketServer;
