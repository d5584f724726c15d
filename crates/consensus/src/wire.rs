//! Peer wire protocol
//!
//! Every WebSocket binary frame between two nodes carries exactly one
//! Borsh-encoded [`PeerMessage`].

use borsh::{BorshDeserialize, BorshSerialize};
use chain_runtime::{SignedBlock, SignedGenesis, SignedTransaction};

/// Message types exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PeerMessage {
    /// Ask a peer who it knows; `caller` is the asker's listen address
    Discover { caller: String },

    /// Reply to `Discover`
    Peers { peers: Vec<String> },

    /// Ask for the signed genesis
    GenesisRequest,

    /// Reply to `GenesisRequest`
    Genesis { genesis: SignedGenesis },

    /// Ask for every block numbered `from_number` and above
    BlockSyncRequest { from_number: u64 },

    /// One block, either a sync reply or a relayed block
    Block { block: SignedBlock },

    /// A relayed transaction
    Transaction { tx: SignedTransaction },

    /// Ends a block sync reply or a relay stream
    EndOfStream,

    /// Reply to a finished relay stream
    Ack { accepted: u64 },

    /// Request could not be served
    Error { message: String },
}

impl PeerMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("PeerMessage serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Discover { .. } => "discover",
            PeerMessage::Peers { .. } => "peers",
            PeerMessage::GenesisRequest => "genesis_request",
            PeerMessage::Genesis { .. } => "genesis",
            PeerMessage::BlockSyncRequest { .. } => "block_sync_request",
            PeerMessage::Block { .. } => "block",
            PeerMessage::Transaction { .. } => "transaction",
            PeerMessage::EndOfStream => "end_of_stream",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::Error { .. } => "error",
        }
    }
}

/// Something a [`crate::MessageRelay`] can fan out
pub trait Relayable: Clone + Send + Sync + 'static {
    /// Used in log lines
    const KIND: &'static str;

    fn to_message(&self) -> PeerMessage;
}

impl Relayable for SignedTransaction {
    const KIND: &'static str = "transaction";

    fn to_message(&self) -> PeerMessage {
        PeerMessage::Transaction { tx: self.clone() }
    }
}

impl Relayable for SignedBlock {
    const KIND: &'static str = "block";

    fn to_message(&self) -> PeerMessage {
        PeerMessage::Block {
            block: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_runtime::{Genesis, Identity, Transaction};

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PeerMessage::from_bytes(&[0xff, 0x00, 0x01]).is_err());
        assert!(PeerMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_signed_payloads_survive_the_wire() {
        let authority = Identity::generate().unwrap();
        let genesis = authority.sign_payload(Genesis::new("wire", authority.address(), 10));
        let tx = authority.sign_payload(Transaction::new(
            authority.address(),
            authority.address(),
            1,
            1,
        ));

        for message in [
            PeerMessage::Genesis {
                genesis: genesis.clone(),
            },
            tx.to_message(),
        ] {
            let decoded = PeerMessage::from_bytes(&message.to_bytes()).unwrap();
            assert_eq!(decoded, message);
        }

        let PeerMessage::Genesis { genesis: decoded } =
            PeerMessage::from_bytes(&PeerMessage::Genesis { genesis }.to_bytes()).unwrap()
        else {
            panic!("expected genesis");
        };
        assert_eq!(decoded.signer().unwrap(), authority.address());
    }
}
