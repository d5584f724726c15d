//! Ledger state machine
//!
//! A [`LedgerState`] is one view of balances and nonces. The [`Ledger`] owns
//! two of them behind separate locks:
//! - confirmed: only changes when a validated block is committed
//! - pending: confirmed plus every accepted-but-unconfirmed transaction
//!
//! Expensive work (block assembly, block re-validation) runs on a private
//! clone; only the final swap in [`Ledger::commit`] takes the write locks.

use crate::identity::{Address, Hash, Identity};
use crate::types::{
    now_millis, sort_canonical, Block, SignedBlock, SignedGenesis, SignedTransaction,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

/// Rejection of a single transaction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid nonce for {from}: expected {expected}, got {got}")]
    InvalidNonce { from: Address, expected: u64, got: u64 },

    #[error("Insufficient funds for {from}: balance {balance}, value {value}")]
    InsufficientFunds { from: Address, balance: u64, value: u64 },

    #[error("Balance overflow crediting {to}")]
    BalanceOverflow { to: Address },
}

/// Rejection of a whole block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("Invalid block signature: {0}")]
    InvalidBlockSignature(String),

    #[error("Invalid block number: expected {expected}, got {got}")]
    InvalidBlockNumber { expected: u64, got: u64 },

    #[error("Invalid parent hash: expected {expected}, got {got}")]
    InvalidParentHash { expected: Hash, got: Hash },

    #[error("Transaction {index} ({hash}) rejected: {source}")]
    InvalidTransaction {
        index: usize,
        hash: Hash,
        #[source]
        source: TxError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenesisError {
    #[error("Invalid genesis signature: {0}")]
    InvalidSignature(String),

    #[error("Genesis supply overflows u64")]
    SupplyOverflow,

    #[error("Genesis grants no balance")]
    ZeroSupply,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("{signer} is not the chain authority {authority}")]
    NotAuthority { signer: Address, authority: Address },

    #[error("Stale commit: confirmed tip is {tip}, clone ends at {got}")]
    StaleCommit { tip: u64, got: u64 },

    #[error("Failed to persist block {number}: {reason}")]
    Persist { number: u64, reason: String },
}

/// One view of the ledger: balances, nonces, chain tip and transaction pool
#[derive(Debug, Clone)]
pub struct LedgerState {
    balances: HashMap<Address, u64>,
    nonces: HashMap<Address, u64>,
    last_block: Option<SignedBlock>,
    genesis_hash: Hash,
    authority: Address,
    applied_tx_hashes: HashSet<Hash>,
    pending_txs: HashMap<Hash, SignedTransaction>,
}

impl LedgerState {
    /// Build the initial state from a verified genesis
    pub fn from_genesis(genesis: &SignedGenesis) -> Result<Self, GenesisError> {
        let authority = genesis
            .signer()
            .map_err(|e| GenesisError::InvalidSignature(e.to_string()))?;

        match genesis.payload.total_supply() {
            None => return Err(GenesisError::SupplyOverflow),
            Some(0) => return Err(GenesisError::ZeroSupply),
            Some(_) => {}
        }

        Ok(Self {
            balances: genesis
                .payload
                .balances
                .iter()
                .map(|(address, balance)| (*address, *balance))
                .collect(),
            nonces: HashMap::new(),
            last_block: None,
            genesis_hash: genesis.hash(),
            authority,
            applied_tx_hashes: HashSet::new(),
            pending_txs: HashMap::new(),
        })
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    pub fn last_block(&self) -> Option<&SignedBlock> {
        self.last_block.as_ref()
    }

    /// 0 while only genesis exists
    pub fn last_block_number(&self) -> u64 {
        self.last_block.as_ref().map_or(0, |block| block.number())
    }

    /// Hash the next block must name as its parent
    pub fn tip_hash(&self) -> Hash {
        self.last_block
            .as_ref()
            .map_or(self.genesis_hash, |block| block.hash())
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    pub fn authority(&self) -> Address {
        self.authority
    }

    pub fn total_supply(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }

    pub fn has_applied(&self, hash: &Hash) -> bool {
        self.applied_tx_hashes.contains(hash)
    }

    /// Pool contents in canonical order
    pub fn pending_transactions(&self) -> Vec<SignedTransaction> {
        let mut txs: Vec<_> = self.pending_txs.values().cloned().collect();
        sort_canonical(&mut txs);
        txs
    }

    pub fn pending_len(&self) -> usize {
        self.pending_txs.len()
    }

    /// Validate and apply one transaction. Never partially applies.
    pub fn apply_transaction(&mut self, stx: &SignedTransaction) -> Result<Hash, TxError> {
        let tx = &stx.payload;

        stx.verify_signer(&tx.from)
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;

        let current = self.nonce(&tx.from);
        if Some(tx.nonce) != current.checked_add(1) {
            return Err(TxError::InvalidNonce {
                from: tx.from,
                expected: current.saturating_add(1),
                got: tx.nonce,
            });
        }

        let balance = self.balance(&tx.from);
        if balance < tx.value {
            return Err(TxError::InsufficientFunds {
                from: tx.from,
                balance,
                value: tx.value,
            });
        }

        if tx.from != tx.to {
            let credited = self
                .balance(&tx.to)
                .checked_add(tx.value)
                .ok_or(TxError::BalanceOverflow { to: tx.to })?;
            self.balances.insert(tx.from, balance - tx.value);
            self.balances.insert(tx.to, credited);
        }
        self.nonces.insert(tx.from, tx.nonce);

        let hash = stx.hash();
        self.applied_tx_hashes.insert(hash);
        Ok(hash)
    }

    /// Apply a transaction and keep it in the pool for the next block
    pub fn add_pending(&mut self, stx: &SignedTransaction) -> Result<Hash, TxError> {
        let hash = self.apply_transaction(stx)?;
        self.pending_txs.insert(hash, stx.clone());
        Ok(hash)
    }

    /// Assemble and sign the next block from the pool.
    ///
    /// Must run on a private clone of the confirmed state carrying the pool
    /// (see [`Ledger::block_candidate`]). Transactions are re-applied in
    /// canonical order; any that no longer validate are dropped.
    pub fn create_block(&mut self, authority: &Identity) -> Result<SignedBlock, LedgerError> {
        if authority.address() != self.authority {
            return Err(LedgerError::NotAuthority {
                signer: authority.address(),
                authority: self.authority,
            });
        }

        let mut candidates: Vec<SignedTransaction> =
            self.pending_txs.drain().map(|(_, tx)| tx).collect();
        sort_canonical(&mut candidates);

        let mut included = Vec::with_capacity(candidates.len());
        for stx in candidates {
            match self.apply_transaction(&stx) {
                Ok(_) => included.push(stx),
                Err(e) => {
                    tracing::warn!("Dropping transaction {} from block: {}", stx.hash(), e);
                }
            }
        }

        let block = Block {
            number: self.last_block_number() + 1,
            parent: self.tip_hash(),
            timestamp: now_millis(),
            txs: included,
        };

        Ok(authority.sign_payload(block))
    }

    /// Validate a block against this state and apply all of its
    /// transactions in listed order. On error the state is unchanged.
    pub fn apply_block(
        &mut self,
        block: &SignedBlock,
        authority: &Address,
    ) -> Result<(), BlockError> {
        block
            .verify_signer(authority)
            .map_err(|e| BlockError::InvalidBlockSignature(e.to_string()))?;

        let expected = self.last_block_number() + 1;
        if block.number() != expected {
            return Err(BlockError::InvalidBlockNumber {
                expected,
                got: block.number(),
            });
        }

        let parent = self.tip_hash();
        if block.parent() != &parent {
            return Err(BlockError::InvalidParentHash {
                expected: parent,
                got: *block.parent(),
            });
        }

        let mut next = self.clone();
        for (index, stx) in block.txs().iter().enumerate() {
            let hash = next
                .apply_transaction(stx)
                .map_err(|source| BlockError::InvalidTransaction {
                    index,
                    hash: stx.hash(),
                    source,
                })?;
            next.pending_txs.remove(&hash);
        }
        next.last_block = Some(block.clone());

        *self = next;
        Ok(())
    }
}

/// Live ledger shared by every task of a node
pub struct Ledger {
    confirmed: RwLock<LedgerState>,
    pending: RwLock<LedgerState>,
    /// Serialises clone -> apply -> commit units
    commit_lock: Mutex<()>,
    authority: Address,
    genesis_hash: Hash,
}

impl Ledger {
    pub fn from_genesis(genesis: &SignedGenesis) -> Result<Self, GenesisError> {
        let state = LedgerState::from_genesis(genesis)?;
        let authority = state.authority;
        let genesis_hash = state.genesis_hash;

        tracing::info!(
            "Ledger initialised from genesis {} (authority {}, supply {})",
            genesis_hash,
            authority,
            state.total_supply()
        );

        Ok(Self {
            pending: RwLock::new(state.clone()),
            confirmed: RwLock::new(state),
            commit_lock: Mutex::new(()),
            authority,
            genesis_hash,
        })
    }

    pub fn authority(&self) -> Address {
        self.authority
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Private copy of the confirmed view
    pub fn confirmed(&self) -> LedgerState {
        self.confirmed.read().clone()
    }

    /// Private copy of the pending view
    pub fn pending(&self) -> LedgerState {
        self.pending.read().clone()
    }

    /// Confirmed view carrying a copy of the pending pool, ready for
    /// [`LedgerState::create_block`]
    pub fn block_candidate(&self) -> LedgerState {
        let mut candidate = self.confirmed.read().clone();
        candidate.pending_txs = self.pending.read().pending_txs.clone();
        candidate
    }

    /// Validate a transaction into the pending view
    pub fn submit_transaction(&self, stx: &SignedTransaction) -> Result<Hash, TxError> {
        self.pending.write().add_pending(stx)
    }

    /// True once a transaction has been accepted into pending or confirmed
    pub fn knows_transaction(&self, hash: &Hash) -> bool {
        self.pending.read().has_applied(hash)
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.confirmed.read().balance(address)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.confirmed.read().nonce(address)
    }

    pub fn pending_balance(&self, address: &Address) -> u64 {
        self.pending.read().balance(address)
    }

    pub fn pending_nonce(&self, address: &Address) -> u64 {
        self.pending.read().nonce(address)
    }

    pub fn last_block(&self) -> Option<SignedBlock> {
        self.confirmed.read().last_block.clone()
    }

    pub fn last_block_number(&self) -> u64 {
        self.confirmed.read().last_block_number()
    }

    pub fn pending_transactions(&self) -> Vec<SignedTransaction> {
        self.pending.read().pending_transactions()
    }

    /// Clone confirmed, apply `block`, commit.
    pub fn apply_block(&self, block: &SignedBlock) -> Result<(), LedgerError> {
        self.apply_block_with(block, |_| Ok::<(), std::convert::Infallible>(()))
    }

    /// Like [`Ledger::apply_block`], running `persist` after validation and
    /// before the commit. A persist failure leaves the ledger untouched.
    pub fn apply_block_with<F, E>(&self, block: &SignedBlock, persist: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&SignedBlock) -> Result<(), E>,
        E: std::fmt::Display,
    {
        let _guard = self.commit_lock.lock();

        let mut working = self.confirmed();
        working.apply_block(block, &self.authority)?;

        persist(block).map_err(|e| LedgerError::Persist {
            number: block.number(),
            reason: e.to_string(),
        })?;

        self.commit(working)
    }

    /// Swap in a clone that successfully ran `apply_block`, then rebuild
    /// pending on top of it, keeping transactions the block did not include.
    pub fn commit(&self, applied: LedgerState) -> Result<(), LedgerError> {
        let Some(block) = applied.last_block.clone() else {
            return Err(LedgerError::StaleCommit {
                tip: self.last_block_number(),
                got: 0,
            });
        };
        let included: HashSet<Hash> = block.txs().iter().map(|tx| tx.hash()).collect();

        // Re-validate the surviving pool outside the locks.
        let snapshot = self.pending.read().pending_txs.clone();
        let mut rebuilt = applied.clone();
        rebuilt.pending_txs.clear();
        let dropped = readd_pool(&mut rebuilt, snapshot.values().cloned(), &included);

        let mut confirmed = self.confirmed.write();
        let tip = confirmed.last_block_number();
        if block.number() != tip + 1 || block.parent() != &confirmed.tip_hash() {
            return Err(LedgerError::StaleCommit {
                tip,
                got: block.number(),
            });
        }

        let mut new_confirmed = applied;
        new_confirmed.pending_txs.clear();
        *confirmed = new_confirmed;

        let mut pending = self.pending.write();
        // Transactions that reached pending after the snapshot.
        let late: Vec<SignedTransaction> = pending
            .pending_txs
            .iter()
            .filter(|(hash, _)| !snapshot.contains_key(*hash))
            .map(|(_, tx)| tx.clone())
            .collect();
        let dropped = dropped + readd_pool(&mut rebuilt, late.into_iter(), &included);
        *pending = rebuilt;

        tracing::debug!(
            "Committed block {} ({} txs), {} pending kept, {} dropped",
            block.number(),
            block.txs().len(),
            pending.pending_txs.len(),
            dropped
        );

        Ok(())
    }
}

/// Re-apply pool transactions onto `state` in canonical order, skipping the
/// ones a block just included. Returns how many no longer validate.
fn readd_pool(
    state: &mut LedgerState,
    txs: impl Iterator<Item = SignedTransaction>,
    included: &HashSet<Hash>,
) -> usize {
    let mut txs: Vec<_> = txs.filter(|tx| !included.contains(&tx.hash())).collect();
    sort_canonical(&mut txs);

    let mut dropped = 0;
    for tx in txs {
        if let Err(e) = state.add_pending(&tx) {
            tracing::debug!("Dropping pending transaction {}: {}", tx.hash(), e);
            dropped += 1;
        }
    }
    dropped
}
