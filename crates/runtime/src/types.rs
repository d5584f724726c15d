//! Core chain types: transactions, blocks and genesis

use crate::identity::{Address, Hash, Signed};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A value transfer between two addresses
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: u64,
    /// Must equal the sender's current nonce + 1
    pub nonce: u64,
    /// Unix millis
    pub timestamp: u64,
}

impl Transaction {
    pub fn new(from: Address, to: Address, value: u64, nonce: u64) -> Self {
        Self {
            from,
            to,
            value,
            nonce,
            timestamp: now_millis(),
        }
    }
}

pub type SignedTransaction = Signed<Transaction>;

impl Signed<Transaction> {
    pub fn sender(&self) -> &Address {
        &self.payload.from
    }

    pub fn recipient(&self) -> &Address {
        &self.payload.to
    }

    pub fn value(&self) -> u64 {
        self.payload.value
    }

    pub fn nonce(&self) -> u64 {
        self.payload.nonce
    }
}

/// Sort transactions by `(from, nonce)`, hash as the final tie-break.
///
/// Every ordered view of a pool goes through here so block contents never
/// depend on map iteration order.
pub fn sort_canonical(txs: &mut [SignedTransaction]) {
    txs.sort_by_cached_key(|tx| (tx.payload.from, tx.payload.nonce, tx.hash()));
}

/// An ordered batch of transactions chained to its predecessor
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    /// Starts at 1
    pub number: u64,
    /// Hash of the previous block, or the genesis hash for block 1
    pub parent: Hash,
    pub timestamp: u64,
    pub txs: Vec<SignedTransaction>,
}

pub type SignedBlock = Signed<Block>;

impl Signed<Block> {
    pub fn number(&self) -> u64 {
        self.payload.number
    }

    pub fn parent(&self) -> &Hash {
        &self.payload.parent
    }

    pub fn txs(&self) -> &[SignedTransaction] {
        &self.payload.txs
    }
}

/// Founding record; its signer is the chain authority
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_name: String,
    pub timestamp: u64,
    /// Initial owner of the supply
    pub owner: Address,
    pub balances: BTreeMap<Address, u64>,
}

impl Genesis {
    /// Genesis granting the whole supply to `owner`
    pub fn new(chain_name: impl Into<String>, owner: Address, balance: u64) -> Self {
        let mut balances = BTreeMap::new();
        balances.insert(owner, balance);
        Self {
            chain_name: chain_name.into(),
            timestamp: now_millis(),
            owner,
            balances,
        }
    }

    /// Sum of all balances, `None` on overflow
    pub fn total_supply(&self) -> Option<u64> {
        self.balances
            .values()
            .try_fold(0u64, |acc, value| acc.checked_add(*value))
    }
}

pub type SignedGenesis = Signed<Genesis>;
