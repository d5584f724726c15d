//! Ingress - single entry point for state-changing inputs
//!
//! Transactions and blocks reach the ledger through here whether they come
//! from a client, a peer's relay stream, the local proposer or state sync.
//! Every outcome is published on the event bus.

use crate::relay::{RelayClosed, RelayHandle};
use chain_runtime::{
    BlockStore, ChainEvent, EventBus, Hash, Ledger, LedgerError, SignedBlock,
    SignedTransaction, TxError,
};
use std::sync::Arc;

/// What happened to an accepted input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Newly applied
    Accepted(Hash),
    /// Already known; nothing changed
    Duplicate(Hash),
}

impl Admission {
    pub fn hash(&self) -> Hash {
        match self {
            Admission::Accepted(hash) | Admission::Duplicate(hash) => *hash,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }
}

pub struct Ingress {
    ledger: Arc<Ledger>,
    blocks: Arc<BlockStore>,
    events: Arc<EventBus>,
    tx_relay: RelayHandle<SignedTransaction>,
    block_relay: RelayHandle<SignedBlock>,
}

impl Ingress {
    pub fn new(
        ledger: Arc<Ledger>,
        blocks: Arc<BlockStore>,
        events: Arc<EventBus>,
        tx_relay: RelayHandle<SignedTransaction>,
        block_relay: RelayHandle<SignedBlock>,
    ) -> Self {
        Self {
            ledger,
            blocks,
            events,
            tx_relay,
            block_relay,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Validate a transaction into pending and queue it for relay
    pub async fn submit_transaction(&self, stx: SignedTransaction) -> Result<Admission, TxError> {
        let hash = stx.hash();
        if self.ledger.knows_transaction(&hash) {
            tracing::trace!("Ignoring known transaction {}", hash);
            return Ok(Admission::Duplicate(hash));
        }

        if let Err(e) = self.ledger.submit_transaction(&stx) {
            // Lost a race with the same transaction from another peer
            if self.ledger.knows_transaction(&hash) {
                return Ok(Admission::Duplicate(hash));
            }
            tracing::warn!("Rejected transaction {}: {}", hash, e);
            self.events.publish(ChainEvent::tx_rejected(hash, &e));
            return Err(e);
        }

        tracing::debug!(
            "Accepted transaction {} ({} -> {}, value {})",
            hash,
            stx.sender(),
            stx.recipient(),
            stx.value()
        );
        self.events.publish(ChainEvent::tx_validated(hash));
        self.relay_or_warn(self.tx_relay.enqueue(stx).await);

        Ok(Admission::Accepted(hash))
    }

    /// Commit a block from a peer or the local proposer, then relay it onward
    pub async fn receive_block(&self, block: SignedBlock) -> Result<Admission, LedgerError> {
        let admission = self.commit_block(&block)?;
        if admission.is_accepted() {
            self.relay_or_warn(self.block_relay.enqueue(block).await);
        }
        Ok(admission)
    }

    /// Validate, persist and commit a block without relaying it
    pub fn commit_block(&self, block: &SignedBlock) -> Result<Admission, LedgerError> {
        let hash = block.hash();
        if block.number() <= self.ledger.last_block_number() && self.blocks.contains_hash(&hash) {
            tracing::trace!("Ignoring known block {} ({})", block.number(), hash);
            return Ok(Admission::Duplicate(hash));
        }

        let result = self
            .ledger
            .apply_block_with(block, |block| self.blocks.append(block));

        match result {
            Ok(()) => {
                tracing::info!(
                    "Committed block {} ({} txs, hash {})",
                    block.number(),
                    block.txs().len(),
                    hash
                );
                self.events.publish(ChainEvent::block_validated(block));
                Ok(Admission::Accepted(hash))
            }
            Err(e) => {
                if let LedgerError::Persist { .. } = e {
                    tracing::error!("Block {} not committed: {}", block.number(), e);
                } else {
                    tracing::warn!("Rejected block {} ({}): {}", block.number(), hash, e);
                }
                self.events.publish(ChainEvent::block_rejected(block, &e));
                Err(e)
            }
        }
    }

    fn relay_or_warn(&self, result: Result<(), RelayClosed>) {
        if let Err(e) = result {
            tracing::warn!("{}", e);
        }
    }
}
