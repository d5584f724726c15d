//! In-memory peers and fixtures shared by the unit tests

use crate::client::{BlockStream, PeerClient, RelaySink};
use crate::ingress::Ingress;
use crate::relay::{relay_channel, MessageRelay, RelayConfig};
use crate::PeerDirectory;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chain_runtime::{
    BlockStore, EventBus, Genesis, Identity, Ledger, SignedBlock, SignedGenesis,
    SignedTransaction, BLOCK_LOG_FILE,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// Every peer is unreachable
pub struct NullClient;

#[async_trait]
impl PeerClient for NullClient {
    async fn discover(&self, peer: &str, _caller: &str) -> anyhow::Result<Vec<String>> {
        bail!("{} unreachable", peer)
    }

    async fn fetch_genesis(&self, peer: &str) -> anyhow::Result<SignedGenesis> {
        bail!("{} unreachable", peer)
    }

    async fn fetch_blocks(&self, peer: &str, _from_number: u64) -> anyhow::Result<BlockStream> {
        bail!("{} unreachable", peer)
    }

    async fn open_relay(&self, peer: &str) -> anyhow::Result<Box<dyn RelaySink>> {
        bail!("{} unreachable", peer)
    }
}

/// What one in-memory peer serves
#[derive(Default, Clone)]
pub struct MemoryPeer {
    pub genesis: Option<SignedGenesis>,
    pub blocks: Vec<SignedBlock>,
    pub peers: Vec<String>,
}

/// Serves discovery, genesis and block sync from a fixed table
#[derive(Default)]
pub struct MemoryClient {
    pub peers: HashMap<String, MemoryPeer>,
}

impl MemoryClient {
    fn peer(&self, addr: &str) -> anyhow::Result<&MemoryPeer> {
        self.peers
            .get(addr)
            .ok_or_else(|| anyhow!("{} unreachable", addr))
    }
}

#[async_trait]
impl PeerClient for MemoryClient {
    async fn discover(&self, peer: &str, _caller: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.peer(peer)?.peers.clone())
    }

    async fn fetch_genesis(&self, peer: &str) -> anyhow::Result<SignedGenesis> {
        self.peer(peer)?
            .genesis
            .clone()
            .ok_or_else(|| anyhow!("{} has no genesis", peer))
    }

    async fn fetch_blocks(&self, peer: &str, from_number: u64) -> anyhow::Result<BlockStream> {
        let blocks: Vec<_> = self
            .peer(peer)?
            .blocks
            .iter()
            .filter(|block| block.number() >= from_number)
            .cloned()
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(blocks).boxed())
    }

    async fn open_relay(&self, peer: &str) -> anyhow::Result<Box<dyn RelaySink>> {
        bail!("{} does not accept relay streams", peer)
    }
}

/// A chain `len` blocks long, each holding one owner transfer
pub fn build_chain(
    genesis: &SignedGenesis,
    authority: &Identity,
    owner: &Identity,
    len: u64,
) -> Vec<SignedBlock> {
    let ledger = Ledger::from_genesis(genesis).unwrap();
    let mut blocks = Vec::new();
    for nonce in 1..=len {
        let tx = owner.sign_payload(chain_runtime::Transaction::new(
            owner.address(),
            authority.address(),
            1,
            nonce,
        ));
        ledger.submit_transaction(&tx).unwrap();
        let block = ledger.block_candidate().create_block(authority).unwrap();
        ledger.apply_block(&block).unwrap();
        blocks.push(block);
    }
    blocks
}

pub struct IngressFixture {
    pub dir: TempDir,
    pub authority: Identity,
    pub owner: Identity,
    pub genesis: SignedGenesis,
    pub peers: Arc<PeerDirectory>,
    pub ingress: Arc<Ingress>,
    pub tx_relay: MessageRelay<SignedTransaction>,
    pub block_relay: MessageRelay<SignedBlock>,
}

/// Fresh chain with 100 units granted to `owner`; relays go nowhere
pub fn ingress_fixture() -> IngressFixture {
    let dir = tempdir().unwrap();
    let authority = Identity::generate().unwrap();
    let owner = Identity::generate().unwrap();
    let genesis = authority.sign_payload(Genesis::new("test", owner.address(), 100));

    let peers = Arc::new(PeerDirectory::bootstrap("self:1"));
    let client: Arc<dyn PeerClient> = Arc::new(NullClient);
    let (tx_handle, tx_relay) =
        relay_channel(peers.clone(), client.clone(), RelayConfig::default());
    let (block_handle, block_relay) =
        relay_channel(peers.clone(), client, RelayConfig::default());

    let ingress = Arc::new(Ingress::new(
        Arc::new(Ledger::from_genesis(&genesis).unwrap()),
        Arc::new(BlockStore::open(dir.path().join(BLOCK_LOG_FILE)).unwrap()),
        Arc::new(EventBus::new()),
        tx_handle,
        block_handle,
    ));

    IngressFixture {
        dir,
        authority,
        owner,
        genesis,
        peers,
        ingress,
        tx_relay,
        block_relay,
    }
}
