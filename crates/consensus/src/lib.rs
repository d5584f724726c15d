//! Chain Consensus - single-authority block production and gossip
//!
//! Architecture:
//! - PeerDirectory learns peers through push-pull discovery
//! - One MessageRelay per message type fans transactions and blocks out each tick
//! - The authority's BlockProposer commits blocks on a jittered timer
//! - StateSync bootstraps a node from genesis, its local log and its peers
//! - Ingress is where every transaction and block enters the ledger

pub mod client;
pub mod ingress;
pub mod peers;
pub mod proposer;
pub mod relay;
pub mod service;
pub mod sync;
pub mod wire;

#[cfg(test)]
mod testing;

pub use client::{BlockStream, PeerClient, RelaySink, WsPeerClient, DEFAULT_REQUEST_TIMEOUT};
pub use ingress::{Admission, Ingress};
pub use peers::{DiscoveryConfig, PeerDirectory};
pub use proposer::{BlockProposer, ProposerConfig};
pub use relay::{relay_channel, MessageRelay, RelayClosed, RelayConfig, RelayHandle, TickReport};
pub use service::{PeerService, PeerSession};
pub use sync::{ChainState, StateSync, SyncConfig, SyncError};
pub use wire::{PeerMessage, Relayable};
