//! Serving side of the peer protocol
//!
//! The transport hands every decoded inbound frame of one connection to a
//! [`PeerSession`] and writes back whatever replies it returns.

use crate::ingress::Ingress;
use crate::peers::PeerDirectory;
use crate::wire::PeerMessage;
use chain_runtime::SignedGenesis;
use std::sync::Arc;

pub struct PeerService {
    peers: Arc<PeerDirectory>,
    ingress: Arc<Ingress>,
    genesis: SignedGenesis,
}

impl PeerService {
    pub fn new(peers: Arc<PeerDirectory>, ingress: Arc<Ingress>, genesis: SignedGenesis) -> Self {
        Self {
            peers,
            ingress,
            genesis,
        }
    }

    pub fn session(self: &Arc<Self>) -> PeerSession {
        PeerSession {
            service: self.clone(),
            accepted: 0,
        }
    }
}

/// Per-connection state; counts accepted relay frames until `EndOfStream`
pub struct PeerSession {
    service: Arc<PeerService>,
    accepted: u64,
}

impl PeerSession {
    pub async fn handle(&mut self, message: PeerMessage) -> Vec<PeerMessage> {
        let service = &self.service;
        match message {
            PeerMessage::Discover { caller } => vec![PeerMessage::Peers {
                peers: service.peers.handle_discover(&caller),
            }],

            PeerMessage::GenesisRequest => vec![PeerMessage::Genesis {
                genesis: service.genesis.clone(),
            }],

            PeerMessage::BlockSyncRequest { from_number } => {
                let blocks = service.ingress.blocks().blocks_from(from_number);
                tracing::debug!("Serving {} blocks from {}", blocks.len(), from_number);
                blocks
                    .into_iter()
                    .map(|block| PeerMessage::Block { block })
                    .chain(std::iter::once(PeerMessage::EndOfStream))
                    .collect()
            }

            PeerMessage::Transaction { tx } => {
                if let Ok(admission) = service.ingress.submit_transaction(tx).await {
                    if admission.is_accepted() {
                        self.accepted += 1;
                    }
                }
                Vec::new()
            }

            PeerMessage::Block { block } => {
                if let Ok(admission) = service.ingress.receive_block(block).await {
                    if admission.is_accepted() {
                        self.accepted += 1;
                    }
                }
                Vec::new()
            }

            PeerMessage::EndOfStream => {
                let accepted = std::mem::take(&mut self.accepted);
                vec![PeerMessage::Ack { accepted }]
            }

            other @ (PeerMessage::Peers { .. }
            | PeerMessage::Genesis { .. }
            | PeerMessage::Ack { .. }
            | PeerMessage::Error { .. }) => vec![PeerMessage::Error {
                message: format!("unexpected {} request", other.kind()),
            }],
        }
    }
}
