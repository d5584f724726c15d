//! Block proposer - run by the authority node only
//!
//! On a jittered timer: assemble a block on a private clone of the ledger,
//! skip it if empty, otherwise commit it through [`Ingress`] which also
//! queues it for relay.

use crate::ingress::{Admission, Ingress};
use chain_runtime::{Identity, SignedBlock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// Mean time between proposals
    pub period: Duration,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
        }
    }
}

impl ProposerConfig {
    /// Draw the next wait uniformly from `[period / 2, period * 3 / 2)`
    pub fn next_interval<R: Rng>(&self, rng: &mut R) -> Duration {
        let half = self.period / 2;
        let span = self.period.as_micros().min(u64::MAX as u128) as u64;
        if span == 0 {
            return half;
        }
        half + Duration::from_micros(rng.gen_range(0..span))
    }
}

pub struct BlockProposer {
    authority: Identity,
    ingress: Arc<Ingress>,
    config: ProposerConfig,
}

impl BlockProposer {
    pub fn new(authority: Identity, ingress: Arc<Ingress>, config: ProposerConfig) -> Self {
        Self {
            authority,
            ingress,
            config,
        }
    }

    /// Assemble and commit one block. `None` if the pool was empty or the
    /// block did not validate.
    pub async fn propose_once(&self) -> Option<SignedBlock> {
        let mut candidate = self.ingress.ledger().block_candidate();
        let block = match candidate.create_block(&self.authority) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("Block assembly failed: {}", e);
                return None;
            }
        };

        if block.txs().is_empty() {
            return None;
        }

        match self.ingress.receive_block(block.clone()).await {
            Ok(Admission::Accepted(_)) => Some(block),
            Ok(Admission::Duplicate(hash)) => {
                tracing::warn!("Proposed block {} was already committed", hash);
                None
            }
            Err(e) => {
                tracing::warn!("Proposed block {} failed self-application: {}", block.number(), e);
                None
            }
        }
    }

    /// Proposal loop, exits when `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Block proposer started for authority {} (period {:?})",
            self.authority.address(),
            self.config.period
        );

        loop {
            let wait = self.config.next_interval(&mut rand::thread_rng());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Not raced against shutdown: a proposal always runs to completion
            if let Some(block) = self.propose_once().await {
                tracing::debug!("Proposed block {}", block.number());
            }
        }

        tracing::info!("Block proposer stopped");
    }
}
