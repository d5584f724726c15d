//! Event bus - chain event subscriptions
//!
//! Subscribers register for a set of event kinds and receive every matching
//! event published after that point.

use crate::identity::Hash;
use crate::types::{now_millis, SignedBlock};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Subscription ID
pub type SubscriptionId = u64;

const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TxValidated,
    TxRejected,
    BlockValidated,
    BlockRejected,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::TxValidated,
        EventKind::TxRejected,
        EventKind::BlockValidated,
        EventKind::BlockRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TxValidated => "tx_validated",
            EventKind::TxRejected => "tx_rejected",
            EventKind::BlockValidated => "block_validated",
            EventKind::BlockRejected => "block_rejected",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// A transaction or block outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub kind: EventKind,
    /// Transaction or block hash
    pub hash: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

impl ChainEvent {
    pub fn tx_validated(hash: Hash) -> Self {
        Self::new(EventKind::TxValidated, hash, None, None)
    }

    pub fn tx_rejected(hash: Hash, reason: impl ToString) -> Self {
        Self::new(EventKind::TxRejected, hash, None, Some(reason.to_string()))
    }

    pub fn block_validated(block: &SignedBlock) -> Self {
        Self::new(EventKind::BlockValidated, block.hash(), Some(block.number()), None)
    }

    pub fn block_rejected(block: &SignedBlock, reason: impl ToString) -> Self {
        Self::new(
            EventKind::BlockRejected,
            block.hash(),
            Some(block.number()),
            Some(reason.to_string()),
        )
    }

    fn new(kind: EventKind, hash: Hash, block_number: Option<u64>, reason: Option<String>) -> Self {
        Self {
            kind,
            hash,
            block_number,
            reason,
            timestamp: now_millis(),
        }
    }
}

/// Event delivered to one subscription
#[derive(Debug, Clone)]
pub struct EventNotification {
    pub subscription_id: SubscriptionId,
    pub event: ChainEvent,
}

#[derive(Debug, Clone)]
struct Subscription {
    kinds: Vec<EventKind>,
    sender: broadcast::Sender<EventNotification>,
}

/// Manages event subscriptions
pub struct EventBus {
    /// Active subscriptions by ID
    subscriptions: DashMap<SubscriptionId, Subscription>,
    /// Subscriptions by kind for efficient lookup
    kind_subscriptions: DashMap<EventKind, Vec<SubscriptionId>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            kind_subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to `kinds`; an empty filter means every kind
    pub fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> (SubscriptionId, broadcast::Receiver<EventNotification>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = broadcast::channel(SUBSCRIPTION_CAPACITY);

        let kinds = if kinds.is_empty() {
            EventKind::ALL.to_vec()
        } else {
            let mut kinds = kinds.to_vec();
            kinds.sort();
            kinds.dedup();
            kinds
        };

        for kind in &kinds {
            self.kind_subscriptions.entry(*kind).or_default().push(id);
        }
        tracing::debug!("Created subscription {} for {:?}", id, kinds);
        self.subscriptions.insert(id, Subscription { kinds, sender });

        (id, receiver)
    }

    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&subscription_id) {
            Some((_, sub)) => {
                for kind in sub.kinds {
                    if let Some(mut ids) = self.kind_subscriptions.get_mut(&kind) {
                        ids.retain(|&id| id != subscription_id);
                    }
                }
                tracing::debug!("Removed subscription {}", subscription_id);
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every matching subscription; returns how many
    /// subscriptions received it
    pub fn publish(&self, event: ChainEvent) -> usize {
        let Some(ids) = self.kind_subscriptions.get(&event.kind).map(|ids| ids.clone()) else {
            return 0;
        };

        let mut delivered = 0;
        for id in ids {
            if let Some(sub) = self.subscriptions.get(&id) {
                let notification = EventNotification {
                    subscription_id: id,
                    event: event.clone(),
                };
                // Subscriber might have disconnected
                if sub.sender.send(notification).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn has_subscription(&self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&subscription_id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
