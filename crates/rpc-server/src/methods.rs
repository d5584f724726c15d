//! RPC Methods - JSON-RPC method handlers
//!
//! Signed transactions and blocks travel as base64 of their Borsh encoding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chain_consensus::{Ingress, PeerDirectory};
use chain_runtime::{
    Address, BlockQuery, BlockRecord, Hash, Keystore, KeystoreError, LedgerError, SignedBlock, SignedGenesis,
    SignedTransaction, Transaction, TxError, TxQuery, TxRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// RPC context shared across handlers
pub struct RpcContext {
    pub ingress: Arc<Ingress>,
    pub keystore: Arc<Keystore>,
    pub peers: Arc<PeerDirectory>,
    pub genesis: SignedGenesis,
    pub started_at: Instant,
}

impl RpcContext {
    pub fn new(
        ingress: Arc<Ingress>,
        keystore: Arc<Keystore>,
        peers: Arc<PeerDirectory>,
        genesis: SignedGenesis,
    ) -> Self {
        Self {
            ingress,
            keystore,
            peers,
            genesis,
            started_at: Instant::now(),
        }
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCreateRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCreateResponse {
    pub address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountBalanceRequest {
    pub address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalanceResponse {
    pub address: Address,
    /// Confirmed balance
    pub balance: u64,
    pub nonce: u64,
    /// Including accepted but unconfirmed transactions
    pub pending_balance: u64,
    pub pending_nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSignRequest {
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub password: String,
    /// Defaults to the sender's pending nonce + 1
    #[serde(default)]
    pub nonce: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSignResponse {
    /// Base64 Borsh encoding of the signed transaction
    pub tx: String,
    pub hash: Hash,
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncodedRequest {
    /// Base64 Borsh encoding
    pub tx: Option<String>,
    pub block: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub hash: Hash,
    /// False when the node already knew it
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisResponse {
    pub hash: Hash,
    pub genesis: SignedGenesis,
    /// Base64 Borsh encoding, as served to peers
    pub bytes: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeersResponse {
    pub self_addr: String,
    pub bootstrap: bool,
    pub peers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub chain_name: String,
    pub genesis_hash: Hash,
    pub authority: Address,
    pub last_block_number: u64,
    pub last_block_hash: Hash,
    pub pending_transactions: usize,
    pub peers: usize,
    pub subscriptions: usize,
    pub uptime_secs: u64,
}

// ============ RPC Handlers ============

/// Handle accountCreate RPC method
pub async fn handle_account_create(
    ctx: &RpcContext,
    params: AccountCreateRequest,
) -> Result<AccountCreateResponse, RpcError> {
    let keystore = ctx.keystore.clone();
    // Key derivation is deliberately slow
    let identity = tokio::task::spawn_blocking(move || keystore.create(&params.password))
        .await
        .map_err(|e| RpcError::InternalError(e.to_string()))??;

    Ok(AccountCreateResponse {
        address: identity.address(),
    })
}

/// Handle accountBalance RPC method
pub fn handle_account_balance(
    ctx: &RpcContext,
    params: AccountBalanceRequest,
) -> Result<AccountBalanceResponse, RpcError> {
    let ledger = ctx.ingress.ledger();
    let address = params.address;

    Ok(AccountBalanceResponse {
        address,
        balance: ledger.balance(&address),
        nonce: ledger.nonce(&address),
        pending_balance: ledger.pending_balance(&address),
        pending_nonce: ledger.pending_nonce(&address),
    })
}

/// Handle txSign RPC method
pub async fn handle_tx_sign(
    ctx: &RpcContext,
    params: TxSignRequest,
) -> Result<TxSignResponse, RpcError> {
    let keystore = ctx.keystore.clone();
    let from = params.from;
    let password = params.password;
    let identity = tokio::task::spawn_blocking(move || keystore.load(&from, &password))
        .await
        .map_err(|e| RpcError::InternalError(e.to_string()))??;

    let nonce = match params.nonce {
        Some(nonce) => nonce,
        None => ctx.ingress.ledger().pending_nonce(&from) + 1,
    };
    let stx = identity.sign_payload(Transaction::new(from, params.to, params.value, nonce));

    Ok(TxSignResponse {
        tx: BASE64.encode(stx.to_bytes()),
        hash: stx.hash(),
        nonce,
    })
}

/// Handle txSend RPC method
pub async fn handle_tx_send(
    ctx: &RpcContext,
    params: EncodedRequest,
) -> Result<SendResponse, RpcError> {
    let encoded = params
        .tx
        .ok_or_else(|| RpcError::InvalidParams("Missing tx".to_string()))?;
    let stx: SignedTransaction = decode(&encoded, "transaction")?;

    let admission = ctx.ingress.submit_transaction(stx).await?;
    Ok(SendResponse {
        hash: admission.hash(),
        accepted: admission.is_accepted(),
    })
}

/// Handle blockSend RPC method
pub async fn handle_block_send(
    ctx: &RpcContext,
    params: EncodedRequest,
) -> Result<SendResponse, RpcError> {
    let encoded = params
        .block
        .ok_or_else(|| RpcError::InvalidParams("Missing block".to_string()))?;
    let block: SignedBlock = decode(&encoded, "block")?;

    let admission = ctx.ingress.receive_block(block).await?;
    Ok(SendResponse {
        hash: admission.hash(),
        accepted: admission.is_accepted(),
    })
}

/// Handle txSearch RPC method
pub fn handle_tx_search(ctx: &RpcContext, query: TxQuery) -> Result<Vec<TxRecord>, RpcError> {
    if query.is_empty() {
        return Err(RpcError::InvalidParams(
            "Give at least one of hash, from, to, account".to_string(),
        ));
    }
    Ok(ctx.ingress.blocks().search_transactions(&query))
}

/// Handle blockSearch RPC method
pub fn handle_block_search(
    ctx: &RpcContext,
    query: BlockQuery,
) -> Result<Vec<BlockRecord>, RpcError> {
    Ok(ctx
        .ingress
        .blocks()
        .search_blocks(&query)
        .into_iter()
        .map(|block| BlockRecord {
            hash: block.hash(),
            block,
        })
        .collect())
}

/// Handle genesisSync RPC method
pub fn handle_genesis_sync(ctx: &RpcContext) -> Result<GenesisResponse, RpcError> {
    Ok(GenesisResponse {
        hash: ctx.genesis.hash(),
        genesis: ctx.genesis.clone(),
        bytes: BASE64.encode(ctx.genesis.to_bytes()),
    })
}

/// Handle getPeers RPC method
pub fn handle_get_peers(ctx: &RpcContext) -> Result<PeersResponse, RpcError> {
    Ok(PeersResponse {
        self_addr: ctx.peers.self_addr().to_string(),
        bootstrap: ctx.peers.is_bootstrap(),
        peers: ctx.peers.snapshot(),
    })
}

/// Handle getStatus RPC method
pub fn handle_get_status(ctx: &RpcContext) -> Result<StatusResponse, RpcError> {
    let ledger = ctx.ingress.ledger();
    let last_block = ledger.last_block();

    Ok(StatusResponse {
        chain_name: ctx.genesis.payload.chain_name.clone(),
        genesis_hash: ledger.genesis_hash(),
        authority: ledger.authority(),
        last_block_number: last_block.as_ref().map_or(0, |block| block.number()),
        last_block_hash: last_block.map_or(ledger.genesis_hash(), |block| block.hash()),
        pending_transactions: ledger.pending_transactions().len(),
        peers: ctx.peers.len(),
        subscriptions: ctx.ingress.events().subscription_count(),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
    })
}

/// Handle getHealth RPC method
pub fn handle_get_health() -> Result<String, RpcError> {
    Ok("ok".to_string())
}

fn decode<T: borsh::BorshDeserialize>(encoded: &str, kind: &str) -> Result<T, RpcError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| RpcError::InvalidParams("Invalid base64 encoding".to_string()))?;
    borsh::from_slice(&bytes)
        .map_err(|_| RpcError::InvalidParams(format!("Invalid {} format", kind)))
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Transaction rejected: {0}")]
    TxRejected(#[from] TxError),
    #[error("Block rejected: {0}")]
    BlockRejected(String),
}

impl From<KeystoreError> for RpcError {
    fn from(e: KeystoreError) -> Self {
        match e {
            KeystoreError::WeakPassword { .. }
            | KeystoreError::InvalidPassword
            | KeystoreError::NotFound(_) => RpcError::InvalidParams(e.to_string()),
            other => RpcError::InternalError(other.to_string()),
        }
    }
}

impl From<LedgerError> for RpcError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Persist { .. } => RpcError::InternalError(e.to_string()),
            other => RpcError::BlockRejected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context_fixture;
    use chain_runtime::Identity;

    #[tokio::test]
    async fn test_sign_send_and_balance() {
        let f = context_fixture();
        let to = Identity::generate().unwrap().address();

        let signed = handle_tx_sign(
            &f.ctx,
            TxSignRequest {
                from: f.owner,
                to,
                value: 30,
                password: f.owner_password.clone(),
                nonce: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(signed.nonce, 1);

        let sent = handle_tx_send(
            &f.ctx,
            EncodedRequest {
                tx: Some(signed.tx.clone()),
                block: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(sent.hash, signed.hash);
        assert!(sent.accepted);

        let balance = handle_account_balance(&f.ctx, AccountBalanceRequest { address: f.owner })
            .unwrap();
        assert_eq!(balance.balance, 100);
        assert_eq!(balance.pending_balance, 70);
        assert_eq!(balance.pending_nonce, 1);

        // Resending the same bytes is not an error
        let again = handle_tx_send(
            &f.ctx,
            EncodedRequest {
                tx: Some(signed.tx),
                block: None,
            },
        )
        .await
        .unwrap();
        assert!(!again.accepted);
    }

    #[tokio::test]
    async fn test_rejections_map_to_error_kinds() {
        let f = context_fixture();

        let wrong_password = handle_tx_sign(
            &f.ctx,
            TxSignRequest {
                from: f.owner,
                to: f.owner,
                value: 1,
                password: "not the password".into(),
                nonce: None,
            },
        )
        .await;
        assert!(matches!(wrong_password, Err(RpcError::InvalidParams(_))));

        let overdraft = handle_tx_sign(
            &f.ctx,
            TxSignRequest {
                from: f.owner,
                to: f.owner,
                value: 1_000,
                password: f.owner_password.clone(),
                nonce: None,
            },
        )
        .await
        .unwrap();
        let sent = handle_tx_send(
            &f.ctx,
            EncodedRequest {
                tx: Some(overdraft.tx),
                block: None,
            },
        )
        .await;
        assert!(matches!(
            sent,
            Err(RpcError::TxRejected(TxError::InsufficientFunds { .. }))
        ));

        let garbage = handle_tx_send(
            &f.ctx,
            EncodedRequest {
                tx: Some("AAAA".into()),
                block: None,
            },
        )
        .await;
        assert!(matches!(garbage, Err(RpcError::InvalidParams(_))));

        assert!(matches!(
            handle_tx_search(&f.ctx, TxQuery::default()),
            Err(RpcError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_weak_password_is_invalid_params() {
        let f = context_fixture();
        let result = handle_account_create(
            &f.ctx,
            AccountCreateRequest {
                password: "abc".into(),
            },
        )
        .await;
        assert!(matches!(result, Err(RpcError::InvalidParams(_))));
    }

    #[test]
    fn test_status_and_genesis() {
        let f = context_fixture();
        let status = handle_get_status(&f.ctx).unwrap();
        assert_eq!(status.last_block_number, 0);
        assert_eq!(status.last_block_hash, status.genesis_hash);
        assert_eq!(status.chain_name, "rpc");

        let genesis = handle_genesis_sync(&f.ctx).unwrap();
        let bytes = BASE64.decode(genesis.bytes).unwrap();
        assert_eq!(SignedGenesis::from_bytes(&bytes).unwrap(), f.ctx.genesis);
    }
}
