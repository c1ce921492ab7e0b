//! Transport abstraction.
//!
//! The replication service speaks to the network through three traits: a
//! [`Host`] with a persistent peer identity, pubsub [`TopicHandle`]s, and
//! per-peer RPC [`LogClient`]s. Production wires a libp2p-style stack in
//! behind them; [`MemoryNetwork`] provides the complete in-process
//! implementation the tests run several peers on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use keel_events::{PeerId, PeerInfo};

use crate::error::{NetError, Result};
use crate::pb::{
    GetDocGraphReply, GetDocGraphRequest, GetHeadLogReply, GetHeadLogRequest, GetLogReply,
    GetLogRequest, PushDocGraphReply, PushDocGraphRequest, PushLogReply, PushLogRequest,
};

/// An inbound pubsub message.
#[derive(Clone, Debug)]
pub struct TopicMessage {
    pub from: PeerId,
    pub topic: String,
    pub data: Vec<u8>,
}

/// A joined pubsub topic.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    async fn publish(&self, data: Vec<u8>) -> Result<()>;

    /// Close the underlying topic. Idempotence is not required of callers;
    /// the service closes each handle exactly once.
    async fn close(&self) -> Result<()>;
}

/// The server half of the replication RPCs.
#[async_trait]
pub trait LogService: Send + Sync {
    async fn push_log(&self, from: PeerId, request: PushLogRequest) -> Result<PushLogReply>;
    async fn get_log(&self, from: PeerId, request: GetLogRequest) -> Result<GetLogReply>;
    async fn get_head_log(
        &self,
        from: PeerId,
        request: GetHeadLogRequest,
    ) -> Result<GetHeadLogReply>;
    async fn push_doc_graph(
        &self,
        from: PeerId,
        request: PushDocGraphRequest,
    ) -> Result<PushDocGraphReply>;
    async fn get_doc_graph(
        &self,
        from: PeerId,
        request: GetDocGraphRequest,
    ) -> Result<GetDocGraphReply>;
}

/// A client connection to one peer's [`LogService`].
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn push_log(&self, request: PushLogRequest) -> Result<PushLogReply>;
    async fn get_log(&self, request: GetLogRequest) -> Result<GetLogReply>;
    async fn get_head_log(&self, request: GetHeadLogRequest) -> Result<GetHeadLogReply>;

    /// True once the connection was closed, locally or externally.
    fn is_closed(&self) -> bool;

    fn close(&self);
}

impl std::fmt::Debug for dyn LogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogClient").field("closed", &self.is_closed()).finish()
    }
}

/// A network host with a persistent peer identity.
#[async_trait]
pub trait Host: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// False when the host runs without a pubsub layer; publishes become
    /// successful no-ops so writers never block on the network.
    fn pubsub_enabled(&self) -> bool;

    /// Join `topic`. Messages arrive on `inbox` only when `subscribe` is
    /// set; a publish-only join still returns a handle.
    async fn join_topic(
        &self,
        topic: &str,
        subscribe: bool,
        inbox: mpsc::Sender<TopicMessage>,
    ) -> Result<Arc<dyn TopicHandle>>;

    /// Record a peer's addresses with permanent TTL.
    fn add_peer_addrs(&self, info: &PeerInfo);

    fn clear_peer_addrs(&self, peer: &PeerId);

    async fn connect(&self, info: &PeerInfo) -> Result<()>;

    /// Open an RPC connection to a known peer.
    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn LogClient>>;
}

type Subscribers = HashMap<String, Vec<(PeerId, mpsc::Sender<TopicMessage>)>>;

#[derive(Default)]
struct NetworkState {
    services: HashMap<PeerId, Arc<dyn LogService>>,
    subscribers: Subscribers,
    peerstore: HashMap<PeerId, Vec<String>>,
    /// Close counts per (peer, topic), for the topic-hygiene tests.
    closes: HashMap<(PeerId, String), u32>,
}

/// An in-process network connecting [`MemoryHost`]s.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<MemoryNetwork> {
        Arc::new(MemoryNetwork::default())
    }

    /// Create a host. Bind its RPC service with [`MemoryNetwork::register`]
    /// once the service exists.
    pub fn host(self: &Arc<Self>, peer_id: impl Into<String>) -> Arc<MemoryHost> {
        Arc::new(MemoryHost {
            network: self.clone(),
            peer_id: PeerId::new(peer_id),
            pubsub: true,
        })
    }

    /// Bind the RPC service answering for `peer`.
    pub fn register(&self, peer: &PeerId, service: Arc<dyn LogService>) {
        self.state.lock().services.insert(peer.clone(), service);
    }

    /// How many times a (peer, topic) handle was closed.
    pub fn close_count(&self, peer: &PeerId, topic: &str) -> u32 {
        self.state
            .lock()
            .closes
            .get(&(peer.clone(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn subscribers_of(
        &self,
        from: &PeerId,
        topic: &str,
    ) -> Vec<(PeerId, mpsc::Sender<TopicMessage>)> {
        let state = self.state.lock();
        state
            .subscribers
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|(peer, _)| peer != from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A host on a [`MemoryNetwork`].
pub struct MemoryHost {
    network: Arc<MemoryNetwork>,
    peer_id: PeerId,
    pubsub: bool,
}

#[async_trait]
impl Host for MemoryHost {
    fn peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn pubsub_enabled(&self) -> bool {
        self.pubsub
    }

    async fn join_topic(
        &self,
        topic: &str,
        subscribe: bool,
        inbox: mpsc::Sender<TopicMessage>,
    ) -> Result<Arc<dyn TopicHandle>> {
        if subscribe {
            self.network
                .state
                .lock()
                .subscribers
                .entry(topic.to_string())
                .or_default()
                .push((self.peer_id.clone(), inbox));
        }
        Ok(Arc::new(MemoryTopicHandle {
            network: self.network.clone(),
            peer_id: self.peer_id.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    fn add_peer_addrs(&self, info: &PeerInfo) {
        self.network
            .state
            .lock()
            .peerstore
            .insert(info.id.clone(), info.addrs.clone());
    }

    fn clear_peer_addrs(&self, peer: &PeerId) {
        self.network.state.lock().peerstore.remove(peer);
    }

    async fn connect(&self, info: &PeerInfo) -> Result<()> {
        let known = self.network.state.lock().services.contains_key(&info.id);
        if known {
            Ok(())
        } else {
            Err(NetError::PeerNotFound(info.id.to_string()))
        }
    }

    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn LogClient>> {
        let service = self
            .network
            .state
            .lock()
            .services
            .get(peer)
            .cloned()
            .ok_or_else(|| NetError::PeerNotFound(peer.to_string()))?;
        Ok(Arc::new(MemoryClient {
            from: self.peer_id.clone(),
            service,
            closed: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }))
    }
}

struct MemoryTopicHandle {
    network: Arc<MemoryNetwork>,
    peer_id: PeerId,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl TopicHandle for MemoryTopicHandle {
    async fn publish(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Network(format!("topic {} closed", self.topic)));
        }
        let targets = self.network.subscribers_of(&self.peer_id, &self.topic);
        for (_, tx) in targets {
            let message = TopicMessage {
                from: self.peer_id.clone(),
                topic: self.topic.clone(),
                data: data.clone(),
            };
            let _ = tx.send(message).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.network.state.lock();
        if let Some(subs) = state.subscribers.get_mut(&self.topic) {
            subs.retain(|(peer, _)| peer != &self.peer_id);
        }
        *state
            .closes
            .entry((self.peer_id.clone(), self.topic.clone()))
            .or_insert(0) += 1;
        Ok(())
    }
}

/// A memory connection; `close` simulates an externally closed channel.
pub struct MemoryClient {
    from: PeerId,
    service: Arc<dyn LogService>,
    closed: AtomicBool,
    calls: AtomicU32,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NetError::ConnectionClosing)
        } else {
            Ok(())
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for MemoryClient {
    async fn push_log(&self, request: PushLogRequest) -> Result<PushLogReply> {
        self.ensure_open()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.service.push_log(self.from.clone(), request).await
    }

    async fn get_log(&self, request: GetLogRequest) -> Result<GetLogReply> {
        self.ensure_open()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.service.get_log(self.from.clone(), request).await
    }

    async fn get_head_log(&self, request: GetHeadLogRequest) -> Result<GetHeadLogReply> {
        self.ensure_open()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.service.get_head_log(self.from.clone(), request).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
