//! Keel Events
//!
//! A typed single-producer-multi-consumer bus. Each event kind rides its
//! own bounded broadcast channel, so delivery is FIFO per kind and a slow
//! subscriber never blocks publishers — once its queue overflows it is
//! skipped ahead and observes [`BusError::SubscriberLagged`] instead.

use libipld::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default per-kind channel capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Identity of a peer on the replication network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> PeerId {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer together with its dialable addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

/// A block was merged into the local DAG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merge {
    pub doc_id: String,
    pub cid: Cid,
    pub schema_root: String,
    /// The peer that created the update.
    pub by_peer: PeerId,
    /// The peer it arrived from; absent for local writes.
    pub from_peer: Option<PeerId>,
}

/// A document update queued for replicator backfill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub cid: Cid,
    pub schema_root: String,
    pub block: Vec<u8>,
}

/// Replicator-set change. An empty `schemas` set removes the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replicator {
    pub info: PeerInfo,
    pub schemas: Vec<String>,
    /// Updates to push to the peer right away.
    pub docs: Option<Vec<DocUpdate>>,
}

/// Topic subscriptions to add or drop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct P2PTopic {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

/// Raw pubsub traffic was observed from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSub {
    pub peer: PeerId,
}

/// Completion markers emitted after the service has finished reacting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    P2PTopic,
    Replicator,
}

/// Errors observed by a subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The subscriber fell behind and `n` events were dropped for it.
    #[error("subscriber lagged, {0} events dropped")]
    SubscriberLagged(u64),

    /// All publishers are gone.
    #[error("bus closed")]
    Closed,

    /// Nothing buffered right now (non-blocking receive only).
    #[error("bus empty")]
    Empty,
}

/// A typed subscription to one event kind.
pub struct Subscriber<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscriber<T> {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<T, BusError> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(BusError::SubscriberLagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<T, BusError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(event),
            Err(broadcast::error::TryRecvError::Empty) => Err(BusError::Empty),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(BusError::SubscriberLagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
        }
    }
}

/// The event bus.
///
/// Publishing never blocks and never fails; events published with no live
/// subscriber are simply dropped.
pub struct Bus {
    merge: broadcast::Sender<Merge>,
    replicator: broadcast::Sender<Replicator>,
    p2p_topic: broadcast::Sender<P2PTopic>,
    pubsub: broadcast::Sender<PubSub>,
    completion: broadcast::Sender<Completion>,
}

impl Bus {
    pub fn new(capacity: usize) -> Bus {
        Bus {
            merge: broadcast::channel(capacity).0,
            replicator: broadcast::channel(capacity).0,
            p2p_topic: broadcast::channel(capacity).0,
            pubsub: broadcast::channel(capacity).0,
            completion: broadcast::channel(capacity).0,
        }
    }

    pub fn publish_merge(&self, event: Merge) {
        let _ = self.merge.send(event);
    }

    pub fn subscribe_merge(&self) -> Subscriber<Merge> {
        Subscriber {
            rx: self.merge.subscribe(),
        }
    }

    pub fn publish_replicator(&self, event: Replicator) {
        let _ = self.replicator.send(event);
    }

    pub fn subscribe_replicator(&self) -> Subscriber<Replicator> {
        Subscriber {
            rx: self.replicator.subscribe(),
        }
    }

    pub fn publish_p2p_topic(&self, event: P2PTopic) {
        let _ = self.p2p_topic.send(event);
    }

    pub fn subscribe_p2p_topic(&self) -> Subscriber<P2PTopic> {
        Subscriber {
            rx: self.p2p_topic.subscribe(),
        }
    }

    pub fn publish_pubsub(&self, event: PubSub) {
        let _ = self.pubsub.send(event);
    }

    pub fn subscribe_pubsub(&self) -> Subscriber<PubSub> {
        Subscriber {
            rx: self.pubsub.subscribe(),
        }
    }

    pub fn publish_completion(&self, event: Completion) {
        let _ = self.completion.send(event);
    }

    pub fn subscribe_completion(&self) -> Subscriber<Completion> {
        Subscriber {
            rx: self.completion.subscribe(),
        }
    }
}

impl Default for Bus {
    fn default() -> Bus {
        Bus::new(DEFAULT_CAPACITY)
    }
}
