//! Shared fixture for handler and server tests

use crate::methods::RpcContext;
use chain_consensus::{
    relay_channel, Ingress, MessageRelay, PeerClient, PeerDirectory, PeerService, RelayConfig,
    WsPeerClient,
};
use chain_runtime::{
    Address, BlockStore, EventBus, Genesis, Identity, Keystore, Ledger, SignedBlock,
    SignedTransaction, BLOCK_LOG_FILE, KEYSTORE_DIR,
};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

pub struct ContextFixture {
    pub dir: TempDir,
    pub authority: Identity,
    pub owner: Address,
    pub owner_key: Identity,
    pub owner_password: String,
    pub ctx: Arc<RpcContext>,
    pub service: Arc<PeerService>,
    pub tx_relay: MessageRelay<SignedTransaction>,
    pub block_relay: MessageRelay<SignedBlock>,
}

/// Bootstrap node on chain "rpc" with 100 units granted to a keystored owner
pub fn context_fixture() -> ContextFixture {
    let dir = tempdir().unwrap();
    let authority = Identity::generate().unwrap();
    let owner_key = Identity::generate().unwrap();
    let owner = owner_key.address();
    let owner_password = "owner-password".to_string();
    let genesis = authority.sign_payload(Genesis::new("rpc", owner, 100));

    let keystore = Keystore::open(dir.path().join(KEYSTORE_DIR)).unwrap();
    keystore.store(&owner_key, &owner_password).unwrap();

    // Relays are never run, so the client is never dialled
    let peers = Arc::new(PeerDirectory::bootstrap("127.0.0.1:1"));
    let client: Arc<dyn PeerClient> = Arc::new(WsPeerClient::default());
    let (tx_handle, tx_relay) =
        relay_channel(peers.clone(), client.clone(), RelayConfig::default());
    let (block_handle, block_relay) = relay_channel(peers.clone(), client, RelayConfig::default());

    let ingress = Arc::new(Ingress::new(
        Arc::new(Ledger::from_genesis(&genesis).unwrap()),
        Arc::new(BlockStore::open(dir.path().join(BLOCK_LOG_FILE)).unwrap()),
        Arc::new(EventBus::new()),
        tx_handle,
        block_handle,
    ));
    let service = Arc::new(PeerService::new(
        peers.clone(),
        ingress.clone(),
        genesis.clone(),
    ));
    let ctx = Arc::new(RpcContext::new(
        ingress,
        Arc::new(keystore),
        peers,
        genesis,
    ));

    ContextFixture {
        dir,
        authority,
        owner,
        owner_key,
        owner_password,
        ctx,
        service,
        tx_relay,
        block_relay,
    }
}
