//! Periodic best-effort fan-out of transactions and blocks
//!
//! Each tick the relay snapshots the peer set, opens one stream per peer and
//! spends the tick (minus a safety margin) draining its queue into every open
//! stream. Streams are closed at the end of the tick, so newly discovered
//! peers join on the next one and a broken connection never outlives a tick.

use crate::client::PeerClient;
use crate::peers::PeerDirectory;
use crate::wire::{PeerMessage, Relayable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Length of one relay tick
    pub tick: Duration,
    /// Portion of the tick reserved for closing streams
    pub margin: Duration,
    /// Inbound queue capacity, also used per peer
    pub capacity: usize,
    /// Also deliver to our own listen address
    pub self_relay: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            margin: Duration::from_millis(200),
            capacity: 1024,
            self_relay: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} relay is closed")]
pub struct RelayClosed(&'static str);

/// Producer side of a relay queue
pub struct RelayHandle<M> {
    sender: mpsc::Sender<M>,
}

impl<M> Clone for RelayHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M: Relayable> RelayHandle<M> {
    /// Queue a message for the next tick; waits while the queue is full
    pub async fn enqueue(&self, message: M) -> Result<(), RelayClosed> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RelayClosed(M::KIND))
    }

    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Streams opened this tick
    pub targets: usize,
    /// Messages taken off the queue
    pub drained: usize,
    /// Peers whose stream failed or fell behind
    pub failed: usize,
}

/// Consumer side: the relay loop for one message type
pub struct MessageRelay<M> {
    receiver: mpsc::Receiver<M>,
    peers: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    config: RelayConfig,
}

/// Create a relay and the handle producers enqueue through
pub fn relay_channel<M: Relayable>(
    peers: Arc<PeerDirectory>,
    client: Arc<dyn PeerClient>,
    config: RelayConfig,
) -> (RelayHandle<M>, MessageRelay<M>) {
    let (sender, receiver) = mpsc::channel(config.capacity.max(1));
    let relay = MessageRelay {
        receiver,
        peers,
        client,
        config,
    };
    (RelayHandle { sender }, relay)
}

/// Stream one tick's messages to a single peer
async fn relay_to_peer(
    client: Arc<dyn PeerClient>,
    peer: String,
    mut messages: mpsc::Receiver<PeerMessage>,
) -> anyhow::Result<u64> {
    let mut sink = client.open_relay(&peer).await?;
    while let Some(message) = messages.recv().await {
        sink.send(message).await?;
    }
    sink.finish().await
}

impl<M: Relayable> MessageRelay<M> {
    /// Relay loop, exits when `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "{} relay started (tick {:?}, self-relay {})",
            M::KIND,
            self.config.tick,
            self.config.self_relay
        );

        loop {
            tokio::select! {
                open = self.run_tick() => {
                    if !open {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("{} relay stopped", M::KIND);
    }

    fn targets(&self) -> Vec<String> {
        let mut targets = self.peers.snapshot();
        if self.config.self_relay {
            targets.push(self.peers.self_addr().to_string());
        }
        targets
    }

    /// Run a single tick; returns false once every handle is gone
    pub async fn run_tick(&mut self) -> bool {
        self.tick().await.is_some()
    }

    /// Run a single tick and report on it; `None` once every handle is gone
    /// and the queue is empty
    pub async fn tick(&mut self) -> Option<TickReport> {
        let started = Instant::now();
        let tick_end = started + self.config.tick;
        let drain_end = tick_end
            .checked_sub(self.config.margin)
            .filter(|end| *end > started)
            .unwrap_or(started);

        let mut report = TickReport::default();
        let mut streams = Vec::new();
        let mut tasks = JoinSet::new();

        for peer in self.targets() {
            let (sender, receiver) = mpsc::channel(self.config.capacity.max(1));
            streams.push((peer.clone(), sender));
            tasks.spawn(relay_to_peer(self.client.clone(), peer, receiver));
        }
        report.targets = streams.len();

        let mut open = true;
        loop {
            let message = tokio::select! {
                message = self.receiver.recv() => message,
                _ = sleep_until(drain_end) => break,
            };
            let Some(message) = message else {
                open = false;
                break;
            };
            report.drained += 1;

            if streams.is_empty() {
                tracing::debug!("No peers, dropping {}", M::KIND);
                continue;
            }

            let frame = message.to_message();
            streams.retain(|(peer, sender)| match sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("{} stream to {} fell behind, abandoning it", M::KIND, peer);
                    false
                }
                // The peer task already failed and logged
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        // Closing the per-peer queues ends each stream
        drop(streams);

        let join_all = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(accepted)) => {
                        tracing::trace!("{} relay stream accepted {}", M::KIND, accepted);
                    }
                    Ok(Err(e)) => {
                        report.failed += 1;
                        tracing::warn!("{} relay stream failed: {:#}", M::KIND, e);
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!("{} relay task panicked: {}", M::KIND, e);
                    }
                }
            }
        };
        let grace = tick_end.saturating_duration_since(Instant::now()).max(self.config.margin);
        if timeout(grace, join_all).await.is_err() {
            tracing::warn!("{} relay abandoning {} slow streams", M::KIND, tasks.len());
            report.failed += tasks.len();
            tasks.abort_all();
        }

        if report.drained > 0 {
            tracing::debug!(
                "{} relay tick: {} messages to {} peers ({} failed)",
                M::KIND,
                report.drained,
                report.targets,
                report.failed
            );
        }

        if !open && report.drained == 0 {
            return None;
        }

        sleep_until(tick_end).await;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BlockStream, RelaySink};
    use async_trait::async_trait;
    use chain_runtime::{Identity, SignedGenesis, SignedTransaction, Transaction};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every relayed frame per peer; `down` peers refuse connections
    #[derive(Default)]
    struct RecordingClient {
        received: Arc<Mutex<HashMap<String, Vec<PeerMessage>>>>,
        down: Vec<String>,
    }

    struct RecordingSink {
        peer: String,
        frames: Vec<PeerMessage>,
        received: Arc<Mutex<HashMap<String, Vec<PeerMessage>>>>,
    }

    #[async_trait]
    impl RelaySink for RecordingSink {
        async fn send(&mut self, message: PeerMessage) -> anyhow::Result<()> {
            self.frames.push(message);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> anyhow::Result<u64> {
            let accepted = self.frames.len() as u64;
            self.received
                .lock()
                .entry(self.peer.clone())
                .or_default()
                .extend(self.frames);
            Ok(accepted)
        }
    }

    #[async_trait]
    impl PeerClient for RecordingClient {
        async fn discover(&self, _peer: &str, _caller: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn fetch_genesis(&self, _peer: &str) -> anyhow::Result<SignedGenesis> {
            anyhow::bail!("unused")
        }

        async fn fetch_blocks(&self, _peer: &str, _from: u64) -> anyhow::Result<BlockStream> {
            anyhow::bail!("unused")
        }

        async fn open_relay(&self, peer: &str) -> anyhow::Result<Box<dyn RelaySink>> {
            if self.down.iter().any(|down| down == peer) {
                anyhow::bail!("{} refused connection", peer);
            }
            Ok(Box::new(RecordingSink {
                peer: peer.to_string(),
                frames: Vec::new(),
                received: self.received.clone(),
            }))
        }
    }

    fn transactions(count: u64) -> Vec<SignedTransaction> {
        let sender = Identity::generate().unwrap();
        (1..=count)
            .map(|nonce| {
                sender.sign_payload(Transaction::new(sender.address(), sender.address(), 1, nonce))
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_fans_out_to_every_peer() {
        let peers = Arc::new(PeerDirectory::joining("self:1", "a:1"));
        peers.add("b:1");
        let client = Arc::new(RecordingClient::default());
        let (handle, mut relay) =
            relay_channel::<SignedTransaction>(peers, client.clone(), RelayConfig::default());

        let txs = transactions(3);
        for tx in &txs {
            handle.enqueue(tx.clone()).await.unwrap();
        }

        let report = relay.tick().await.unwrap();
        assert_eq!(report, TickReport { targets: 2, drained: 3, failed: 0 });

        let received = client.received.lock();
        let expected: Vec<_> = txs.iter().map(|tx| tx.to_message()).collect();
        assert_eq!(received["a:1"], expected);
        assert_eq!(received["b:1"], expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_peer_does_not_affect_others() {
        let peers = Arc::new(PeerDirectory::joining("self:1", "up:1"));
        peers.add("down:1");
        let client = Arc::new(RecordingClient {
            down: vec!["down:1".to_string()],
            ..Default::default()
        });
        let (handle, mut relay) =
            relay_channel::<SignedTransaction>(peers, client.clone(), RelayConfig::default());

        for tx in transactions(2) {
            handle.enqueue(tx).await.unwrap();
        }

        let report = relay.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(client.received.lock()["up:1"].len(), 2);
        assert!(!client.received.lock().contains_key("down:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_relay_and_empty_peer_set() {
        let peers = Arc::new(PeerDirectory::bootstrap("self:1"));
        let client = Arc::new(RecordingClient::default());

        let (handle, mut relay) = relay_channel::<SignedTransaction>(
            peers.clone(),
            client.clone(),
            RelayConfig::default(),
        );
        handle.enqueue(transactions(1).remove(0)).await.unwrap();
        let report = relay.tick().await.unwrap();
        assert_eq!(report, TickReport { targets: 0, drained: 1, failed: 0 });
        assert_eq!(handle.queued(), 0);

        let config = RelayConfig {
            self_relay: true,
            ..Default::default()
        };
        let (handle, mut relay) = relay_channel::<SignedTransaction>(peers, client.clone(), config);
        handle.enqueue(transactions(1).remove(0)).await.unwrap();
        relay.tick().await.unwrap();
        assert_eq!(client.received.lock()["self:1"].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_blocks_enqueue_until_drained() {
        let peers = Arc::new(PeerDirectory::bootstrap("self:1"));
        let client = Arc::new(RecordingClient::default());
        let config = RelayConfig {
            capacity: 1,
            ..Default::default()
        };
        let (handle, mut relay) = relay_channel::<SignedTransaction>(peers, client, config);

        let mut txs = transactions(2);
        let second = txs.pop().unwrap();
        handle.enqueue(txs.pop().unwrap()).await.unwrap();

        let blocked = handle.clone();
        let pending = tokio::spawn(async move { blocked.enqueue(second).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!pending.is_finished());
        assert_eq!(handle.queued(), 1);

        let report = relay.tick().await.unwrap();
        assert!(report.drained >= 1);
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_ends_when_handles_dropped() {
        let peers = Arc::new(PeerDirectory::bootstrap("self:1"));
        let client = Arc::new(RecordingClient::default());
        let (handle, relay) =
            relay_channel::<SignedTransaction>(peers, client, RelayConfig::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        drop(handle);
        relay.run(shutdown_rx).await;
    }
}
