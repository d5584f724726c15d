//! Chain Runtime - Core state machine of the permissioned chain
//!
//! This crate provides everything a node needs that does not touch the network:
//! - Identities, addresses and recoverable signatures
//! - Transactions, blocks and genesis
//! - The two-view ledger with clone-validate-commit
//! - Block log, genesis file and encrypted account keys on disk
//! - Event subscriptions for validated/rejected transactions and blocks

pub mod events;
pub mod identity;
pub mod keystore;
pub mod ledger;
pub mod persistence;
pub mod types;

pub use events::{ChainEvent, EventBus, EventKind, EventNotification, SubscriptionId};
pub use identity::{Address, Hash, Identity, IdentityError, Signature, Signed};
pub use keystore::{Keystore, KeystoreError, MIN_PASSWORD_LEN};
pub use ledger::{BlockError, GenesisError, Ledger, LedgerError, LedgerState, TxError};
pub use persistence::{
    BlockQuery, BlockRecord, BlockStore, GenesisStore, StoreError, TxQuery, TxRecord,
    BLOCK_LOG_FILE, GENESIS_FILE,
};
pub use types::{
    now_millis, Block, Genesis, SignedBlock, SignedGenesis, SignedTransaction, Transaction,
};

/// Chain name used when none is configured
pub const DEFAULT_CHAIN_NAME: &str = "permissioned";

/// Keystore directory under the data dir
pub const KEYSTORE_DIR: &str = "keystore";
