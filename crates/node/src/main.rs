//! Chain Node
//!
//! Main entry point for the permissioned chain node.
//! A bootstrap node holds the authority key and proposes blocks; joining
//! nodes fetch genesis from a seed, catch up and then follow the relay.
//! Blocks are persisted to disk and replayed on restart.

use anyhow::Result;
use chain_consensus::{
    relay_channel, BlockProposer, Ingress, PeerClient, PeerDirectory, PeerService, StateSync,
    WsPeerClient,
};
use chain_runtime::{EventBus, SignedBlock, SignedTransaction};
use clap::Parser;
use rpc_server::{HttpRpcServer, RpcContext, WebSocketServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Args, NodeConfig};

/// How long background loops get to wind down after Ctrl+C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::resolve(&args)?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    tracing::info!(
        "Starting chain node - {} MODE",
        if config.bootstrap { "BOOTSTRAP" } else { "JOINING" }
    );
    tracing::info!("  Peer/WebSocket: {}", config.listen_addr);
    tracing::info!("  HTTP RPC: {}", config.rpc_addr);
    tracing::info!("  Block period: {}ms", config.block_period_ms);
    tracing::info!("  Data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;

    let client: Arc<dyn PeerClient> = Arc::new(WsPeerClient::default());
    let sync = StateSync::new(config.sync_config(), client.clone());
    let state = sync.bootstrap().await?;

    let peers = Arc::new(match &config.seed {
        Some(seed) if !config.bootstrap => PeerDirectory::joining(&config.listen_addr, seed),
        _ => PeerDirectory::bootstrap(&config.listen_addr),
    });

    let (tx_handle, tx_relay) =
        relay_channel::<SignedTransaction>(peers.clone(), client.clone(), config.relay_config());
    let (block_handle, block_relay) =
        relay_channel::<SignedBlock>(peers.clone(), client.clone(), config.relay_config());

    let ingress = Arc::new(Ingress::new(
        state.ledger.clone(),
        state.blocks.clone(),
        Arc::new(EventBus::new()),
        tx_handle,
        block_handle,
    ));

    // Catch up with the network before serving
    peers.discover_round(client.as_ref()).await;
    let pulled = sync.pull_from_peers(&peers.snapshot(), &ingress).await;
    tracing::info!(
        "Synced {} blocks from peers, tip at block {}",
        pulled,
        ingress.ledger().last_block_number()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    handles.push(tokio::spawn(peers.clone().run(
        client.clone(),
        config.discovery_config(),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(tx_relay.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(block_relay.run(shutdown_rx.clone())));

    match state.authority {
        Some(authority) => {
            tracing::info!("Holding authority key {}; proposing blocks", authority.address());
            let proposer = BlockProposer::new(authority, ingress.clone(), config.proposer_config());
            handles.push(tokio::spawn(proposer.run(shutdown_rx.clone())));
        }
        None => tracing::info!("Following authority {}", ingress.ledger().authority()),
    }

    let rpc_context = Arc::new(RpcContext::new(
        ingress.clone(),
        state.keystore.clone(),
        peers.clone(),
        state.genesis.clone(),
    ));
    let peer_service = Arc::new(PeerService::new(
        peers.clone(),
        ingress.clone(),
        state.genesis.clone(),
    ));

    // Start HTTP RPC server
    let http_context = rpc_context.clone();
    let http_addr = config.rpc_addr.clone();
    let mut http_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let server = HttpRpcServer::new(http_context);
        let stopped = async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = server.run(&http_addr, stopped).await {
            tracing::error!("HTTP RPC server error: {}", e);
        }
    }));

    // Start WebSocket server
    let ws_addr = config.listen_addr.clone();
    let ws_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let server = WebSocketServer::new(rpc_context, peer_service);
        if let Err(e) = server.run(&ws_addr, ws_shutdown).await {
            tracing::error!("WebSocket server error: {}", e);
        }
    }));

    tracing::info!("Node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Task ended abnormally: {}", e);
            }
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!("Some tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    tracing::info!(
        "Node stopped at block {} ({} blocks on disk)",
        ingress.ledger().last_block_number(),
        state.blocks.len()
    );

    Ok(())
}
