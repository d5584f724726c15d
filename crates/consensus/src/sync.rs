//! State sync - node bootstrap
//!
//! 1. Load the local genesis, or create it (bootstrap node) or fetch it from
//!    the seed (joining node)
//! 2. Build the ledger from genesis
//! 3. Replay the local block log; any failure here is fatal
//! 4. Pull newer blocks from known peers; failures are per peer

use crate::client::PeerClient;
use crate::ingress::Ingress;
use chain_runtime::{
    keystore::check_password, Address, BlockStore, Genesis, GenesisError, GenesisStore,
    Identity, Keystore, KeystoreError, Ledger, LedgerError, SignedGenesis, StoreError,
    BLOCK_LOG_FILE, DEFAULT_CHAIN_NAME, GENESIS_FILE, KEYSTORE_DIR,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub chain_name: String,
    /// Authority node that creates genesis
    pub bootstrap: bool,
    /// Peer to fetch genesis from when joining
    pub seed: Option<String>,
    /// Supply granted to the owner in a new genesis
    pub owner_balance: u64,
    pub authority_password: Option<String>,
    pub owner_password: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            chain_name: DEFAULT_CHAIN_NAME.to_string(),
            bootstrap: false,
            seed: None,
            owner_balance: 1_000_000,
            authority_password: None,
            owner_password: None,
        }
    }
}

impl SyncConfig {
    /// Startup checks; every failure here aborts the node
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.bootstrap {
            if self.owner_balance == 0 {
                return Err(SyncError::ZeroBalance);
            }
            check_password(self.authority_password()?)?;
            check_password(self.owner_password()?)?;
        } else if self.seed.as_deref().map_or(true, str::is_empty) {
            return Err(SyncError::MissingSeed);
        }
        Ok(())
    }

    fn authority_password(&self) -> Result<&str, SyncError> {
        self.authority_password
            .as_deref()
            .ok_or(SyncError::MissingPassword("authority"))
    }

    fn owner_password(&self) -> Result<&str, SyncError> {
        self.owner_password
            .as_deref()
            .ok_or(SyncError::MissingPassword("owner"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("A joining node needs a seed peer")]
    MissingSeed,

    #[error("Owner balance must be greater than zero")]
    ZeroBalance,

    #[error("Missing {0} password")]
    MissingPassword(&'static str),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid genesis: {0}")]
    Genesis(#[from] GenesisError),

    #[error("Failed to fetch genesis from {peer}: {reason}")]
    GenesisFetch { peer: String, reason: String },

    #[error("Local block {number} does not replay: {source}")]
    Replay {
        number: u64,
        #[source]
        source: LedgerError,
    },
}

/// Everything a node runs on once bootstrapped
pub struct ChainState {
    pub genesis: SignedGenesis,
    pub ledger: Arc<Ledger>,
    pub blocks: Arc<BlockStore>,
    pub keystore: Arc<Keystore>,
    /// Present only on the node holding the authority key
    pub authority: Option<Identity>,
}

pub struct StateSync {
    config: SyncConfig,
    client: Arc<dyn PeerClient>,
}

impl StateSync {
    pub fn new(config: SyncConfig, client: Arc<dyn PeerClient>) -> Self {
        Self { config, client }
    }

    /// Steps 1 to 3: genesis, ledger, local replay
    pub async fn bootstrap(&self) -> Result<ChainState, SyncError> {
        self.config.validate()?;

        let data_dir = &self.config.data_dir;
        let keystore = Keystore::open(data_dir.join(KEYSTORE_DIR))?;
        let genesis_store = GenesisStore::new(data_dir.join(GENESIS_FILE));

        let (genesis, created_authority, stored) = match genesis_store.load()? {
            Some(genesis) => {
                tracing::info!("Loaded genesis {}", genesis.hash());
                (genesis, None, true)
            }
            None if self.config.bootstrap => {
                let (genesis, authority) = self.create_genesis(&keystore)?;
                (genesis, Some(authority), false)
            }
            None => (self.fetch_genesis().await?, None, false),
        };

        // Verifies the genesis signature before anything is persisted
        let ledger = Ledger::from_genesis(&genesis)?;
        if !stored {
            genesis_store.store(&genesis)?;
        }

        let authority = match created_authority {
            Some(authority) => Some(authority),
            None => self.load_authority(&keystore, &ledger.authority())?,
        };

        let blocks = BlockStore::open(data_dir.join(BLOCK_LOG_FILE))?;
        for block in blocks.blocks() {
            ledger
                .apply_block(&block)
                .map_err(|source| SyncError::Replay {
                    number: block.number(),
                    source,
                })?;
        }
        if !blocks.is_empty() {
            tracing::info!("Replayed {} blocks from the local log", blocks.len());
        }

        Ok(ChainState {
            genesis,
            ledger: Arc::new(ledger),
            blocks: Arc::new(blocks),
            keystore: Arc::new(keystore),
            authority,
        })
    }

    fn create_genesis(&self, keystore: &Keystore) -> Result<(SignedGenesis, Identity), SyncError> {
        let authority = keystore.create(self.config.authority_password()?)?;
        let owner = keystore.create(self.config.owner_password()?)?;

        let genesis = authority.sign_payload(Genesis::new(
            self.config.chain_name.clone(),
            owner.address(),
            self.config.owner_balance,
        ));

        tracing::info!(
            "Created genesis {} for chain {:?}: authority {}, owner {} with {}",
            genesis.hash(),
            self.config.chain_name,
            authority.address(),
            owner.address(),
            self.config.owner_balance
        );
        Ok((genesis, authority))
    }

    async fn fetch_genesis(&self) -> Result<SignedGenesis, SyncError> {
        let seed = self.config.seed.as_deref().ok_or(SyncError::MissingSeed)?;
        let genesis = self
            .client
            .fetch_genesis(seed)
            .await
            .map_err(|e| SyncError::GenesisFetch {
                peer: seed.to_string(),
                reason: format!("{:#}", e),
            })?;
        tracing::info!("Fetched genesis {} from {}", genesis.hash(), seed);
        Ok(genesis)
    }

    /// Load the authority key if this node's keystore holds it
    fn load_authority(
        &self,
        keystore: &Keystore,
        authority: &Address,
    ) -> Result<Option<Identity>, SyncError> {
        if !keystore.contains(authority) {
            return Ok(None);
        }
        let identity = keystore.load(authority, self.config.authority_password()?)?;
        tracing::info!("Loaded authority key {}", authority);
        Ok(Some(identity))
    }

    /// Step 4: stream newer blocks from each peer in discovery order.
    /// Returns how many blocks were committed.
    pub async fn pull_from_peers(&self, peers: &[String], ingress: &Ingress) -> u64 {
        let mut pulled = 0;
        for peer in peers {
            match self.pull_from(peer, ingress).await {
                Ok(count) => pulled += count,
                Err(e) => tracing::warn!("Block sync from {} aborted: {:#}", peer, e),
            }
        }
        if pulled > 0 {
            tracing::info!(
                "Synced {} blocks, tip is now {}",
                pulled,
                ingress.ledger().last_block_number()
            );
        }
        pulled
    }

    /// Blocks committed before a failure still count
    async fn pull_from(&self, peer: &str, ingress: &Ingress) -> anyhow::Result<u64> {
        let from_number = ingress.ledger().last_block_number() + 1;
        let mut stream = self.client.fetch_blocks(peer, from_number).await?;

        let mut committed = 0;
        while let Some(block) = stream.next().await {
            let outcome = block.and_then(|block| Ok(ingress.commit_block(&block)?));
            match outcome {
                Ok(admission) => {
                    if admission.is_accepted() {
                        committed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Block sync from {} stopped after {} blocks: {:#}",
                        peer,
                        committed,
                        e
                    );
                    break;
                }
            }
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_chain, ingress_fixture, MemoryClient, MemoryPeer, NullClient};
    use chain_runtime::BlockRecord;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn bootstrap_config(data_dir: PathBuf) -> SyncConfig {
        SyncConfig {
            data_dir,
            bootstrap: true,
            owner_balance: 500,
            authority_password: Some("authority-pw".into()),
            owner_password: Some("owner-pw".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let joining = SyncConfig::default();
        assert!(matches!(joining.validate(), Err(SyncError::MissingSeed)));

        let mut config = bootstrap_config(PathBuf::from("unused"));
        assert!(config.validate().is_ok());

        config.owner_balance = 0;
        assert!(matches!(config.validate(), Err(SyncError::ZeroBalance)));

        config.owner_balance = 1;
        config.owner_password = Some("1234".into());
        assert!(matches!(
            config.validate(),
            Err(SyncError::Keystore(KeystoreError::WeakPassword { .. }))
        ));

        config.owner_password = None;
        assert!(matches!(config.validate(), Err(SyncError::MissingPassword("owner"))));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_then_reloads_genesis() {
        let dir = tempdir().unwrap();
        let sync = StateSync::new(bootstrap_config(dir.path().to_path_buf()), Arc::new(NullClient));

        let first = sync.bootstrap().await.unwrap();
        let authority = first.authority.as_ref().unwrap().address();
        assert_eq!(first.ledger.authority(), authority);
        assert_eq!(first.ledger.balance(&first.genesis.payload.owner), 500);
        assert!(first.keystore.contains(&first.genesis.payload.owner));
        let genesis_hash = first.genesis.hash();
        drop(first);

        let second = sync.bootstrap().await.unwrap();
        assert_eq!(second.genesis.hash(), genesis_hash);
        assert_eq!(second.authority.unwrap().address(), authority);
    }

    #[tokio::test]
    async fn test_restart_replays_local_blocks() {
        let dir = tempdir().unwrap();
        let sync = StateSync::new(bootstrap_config(dir.path().to_path_buf()), Arc::new(NullClient));

        let state = sync.bootstrap().await.unwrap();
        let authority = state.authority.unwrap();
        let owner = state
            .keystore
            .load(&state.genesis.payload.owner, "owner-pw")
            .unwrap();
        for block in build_chain(&state.genesis, &authority, &owner, 3) {
            state.blocks.append(&block).unwrap();
        }
        drop(state.blocks);

        let restarted = sync.bootstrap().await.unwrap();
        assert_eq!(restarted.ledger.last_block_number(), 3);
        assert_eq!(restarted.ledger.balance(&owner.address()), 497);
        assert_eq!(restarted.ledger.nonce(&owner.address()), 3);
    }

    #[tokio::test]
    async fn test_corrupt_local_log_is_fatal() {
        let dir = tempdir().unwrap();
        let sync = StateSync::new(bootstrap_config(dir.path().to_path_buf()), Arc::new(NullClient));

        let state = sync.bootstrap().await.unwrap();
        let authority = state.authority.unwrap();
        let owner = state
            .keystore
            .load(&state.genesis.payload.owner, "owner-pw")
            .unwrap();
        let chain = build_chain(&state.genesis, &authority, &owner, 3);
        drop(state.blocks);

        // Block 2 is missing from the log
        let lines: String = [&chain[0], &chain[2]]
            .iter()
            .map(|block| {
                let record = BlockRecord {
                    hash: block.hash(),
                    block: (*block).clone(),
                };
                format!("{}\n", serde_json::to_string(&record).unwrap())
            })
            .collect();
        std::fs::write(dir.path().join(BLOCK_LOG_FILE), lines).unwrap();

        assert!(matches!(
            sync.bootstrap().await,
            Err(SyncError::Replay { number: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_joining_node_fetches_genesis_and_pulls_blocks() {
        let f = ingress_fixture();
        let chain = build_chain(&f.genesis, &f.authority, &f.owner, 4);

        let client = MemoryClient {
            peers: HashMap::from([
                (
                    "seed:1".to_string(),
                    MemoryPeer {
                        genesis: Some(f.genesis.clone()),
                        blocks: chain[..2].to_vec(),
                        ..Default::default()
                    },
                ),
                (
                    "other:1".to_string(),
                    MemoryPeer {
                        blocks: chain.clone(),
                        ..Default::default()
                    },
                ),
            ]),
        };

        let dir = tempdir().unwrap();
        let config = SyncConfig {
            data_dir: dir.path().to_path_buf(),
            seed: Some("seed:1".into()),
            ..Default::default()
        };
        let sync = StateSync::new(config, Arc::new(client));
        let state = sync.bootstrap().await.unwrap();
        assert_eq!(state.genesis, f.genesis);
        assert!(state.authority.is_none());
        assert!(dir.path().join(GENESIS_FILE).exists());

        // The fixture's ingress runs on the same genesis
        let peers = vec!["dead:1".to_string(), "seed:1".to_string(), "other:1".to_string()];
        let pulled = sync.pull_from_peers(&peers, &f.ingress).await;
        assert_eq!(pulled, 4);
        assert_eq!(f.ingress.ledger().last_block(), chain.last().cloned());
        assert_eq!(f.ingress.blocks().len(), 4);
        assert_eq!(f.ingress.ledger().balance(&f.owner.address()), 96);
    }

    #[tokio::test]
    async fn test_forged_genesis_is_fatal() {
        let f = ingress_fixture();
        let mut forged = f.genesis.clone();
        forged.payload.balances.insert(f.authority.address(), 1_000);

        let client = MemoryClient {
            peers: HashMap::from([(
                "seed:1".to_string(),
                MemoryPeer {
                    genesis: Some(forged),
                    ..Default::default()
                },
            )]),
        };
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            data_dir: dir.path().to_path_buf(),
            seed: Some("seed:1".into()),
            ..Default::default()
        };

        let result = StateSync::new(config, Arc::new(client)).bootstrap().await;
        assert!(matches!(
            result,
            Err(SyncError::Genesis(GenesisError::InvalidSignature(_)))
        ));
        assert!(!dir.path().join(GENESIS_FILE).exists());
    }

    #[tokio::test]
    async fn test_pull_stops_at_bad_block() {
        let f = ingress_fixture();
        let mut chain = build_chain(&f.genesis, &f.authority, &f.owner, 2);
        // Re-signed by the owner: fails the authority check
        chain[1] = f.owner.sign_payload(chain[1].payload.clone());

        let client = MemoryClient {
            peers: HashMap::from([(
                "seed:1".to_string(),
                MemoryPeer {
                    blocks: chain,
                    ..Default::default()
                },
            )]),
        };
        let sync = StateSync::new(SyncConfig::default(), Arc::new(client));

        let pulled = sync.pull_from_peers(&["seed:1".to_string()], &f.ingress).await;
        assert_eq!(pulled, 1);
        assert_eq!(f.ingress.ledger().last_block_number(), 1);
    }
}
