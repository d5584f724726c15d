//! Peer directory and gossip discovery
//!
//! A bootstrap node starts with no peers and learns them from inbound
//! discovery calls. A joining node starts from its seed and periodically asks
//! every known peer who it knows, merging the answers.

use crate::client::PeerClient;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Time between discovery rounds
    pub period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
        }
    }
}

/// Known peer network addresses
pub struct PeerDirectory {
    /// Our own listen address, never stored as a peer
    self_addr: String,
    bootstrap: bool,
    /// Insertion order is discovery order
    peers: RwLock<Vec<String>>,
}

impl PeerDirectory {
    /// Directory of a bootstrap node: empty until peers call in
    pub fn bootstrap(self_addr: impl Into<String>) -> Self {
        Self {
            self_addr: self_addr.into(),
            bootstrap: true,
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Directory of a joining node, seeded with one known address
    pub fn joining(self_addr: impl Into<String>, seed: impl Into<String>) -> Self {
        let directory = Self {
            self_addr: self_addr.into(),
            bootstrap: false,
            peers: RwLock::new(Vec::new()),
        };
        directory.add(seed);
        directory
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Copy of the current peer set
    pub fn snapshot(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Returns true if the address was new
    pub fn add(&self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        if addr.is_empty() || addr == self.self_addr {
            return false;
        }

        let mut peers = self.peers.write();
        if peers.contains(&addr) {
            return false;
        }
        tracing::info!("Discovered peer {}", addr);
        peers.push(addr);
        true
    }

    /// Merge a reply into the set; returns how many addresses were new
    pub fn merge<I>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        addrs.into_iter().filter(|addr| self.add(addr.clone())).count()
    }

    /// Serve an inbound `Discover`. Only a bootstrap node records the caller.
    pub fn handle_discover(&self, caller: &str) -> Vec<String> {
        if self.bootstrap {
            self.add(caller);
        }
        self.snapshot()
    }

    /// Ask every known peer once. A failing peer is logged and skipped.
    pub async fn discover_round(&self, client: &dyn PeerClient) -> usize {
        let mut added = 0;
        for peer in self.snapshot() {
            match client.discover(&peer, &self.self_addr).await {
                Ok(reply) => added += self.merge(reply),
                Err(e) => tracing::warn!("Discovery with {} failed: {:#}", peer, e),
            }
        }
        if added > 0 {
            tracing::debug!("Discovery round added {} peers ({} known)", added, self.len());
        }
        added
    }

    /// Discovery loop, exits when `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        client: Arc<dyn PeerClient>,
        config: DiscoveryConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.period);
        tracing::info!("Peer discovery started (every {:?})", config.period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.discover_round(client.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Peer discovery stopped");
    }
}
