//! The replication service.
//!
//! One server per engine. It reacts to bus events — `Merge` pushes new
//! heads out over pubsub and to explicit replicators, `Replicator` and
//! `P2PTopic` maintain the peer and topic sets — and serves the log RPCs
//! for its peers, pulling missing ancestors until the local DAG is
//! complete.
//!
//! A single mutex guards each of the `topics`, `replicators`, and
//! `sessions` maps; locks are held for map mutation only, never across
//! I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use libipld::Cid;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use keel_engine::Engine;
use keel_events::{Completion, Merge, P2PTopic, PeerId, PubSub, Replicator};
use keel_merkle::{cid_for, ProcessOutcome};

use crate::dialer::Dialer;
use crate::error::{NetError, Result};
use crate::host::{Host, LogService, TopicHandle, TopicMessage};
use crate::pb::{
    GetDocGraphReply, GetDocGraphRequest, GetHeadLogReply, GetHeadLogRequest, GetLogReply,
    GetLogRequest, Log, PushDocGraphReply, PushDocGraphRequest, PushLogReply, PushLogRequest,
};
use crate::session::{Session, SessionTable};

const INBOX_CAPACITY: usize = 64;

struct PubsubTopic {
    handle: Arc<dyn TopicHandle>,
    subscribed: bool,
}

/// The request/response instance for all replication traffic of one engine.
pub struct Server {
    engine: Arc<Engine>,
    host: Arc<dyn Host>,
    dialer: Dialer,
    topics: Mutex<HashMap<String, PubsubTopic>>,
    /// schema root -> explicit push targets
    replicators: Mutex<HashMap<String, HashSet<PeerId>>>,
    sessions: Mutex<SessionTable>,
    inbox_tx: mpsc::Sender<TopicMessage>,
    inbox_rx: Mutex<Option<mpsc::Receiver<TopicMessage>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(engine: Arc<Engine>, host: Arc<dyn Host>) -> Arc<Server> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Arc::new(Server {
            engine,
            dialer: Dialer::new(host.clone()),
            host,
            topics: Mutex::new(HashMap::new()),
            replicators: Mutex::new(HashMap::new()),
            sessions: Mutex::new(SessionTable::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    /// Spawn the event loops. Call once.
    pub fn start(self: &Arc<Self>) {
        let mut inbox = self
            .inbox_rx
            .lock()
            .take()
            .expect("server started twice");

        let server = self.clone();
        let inbox_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    message = inbox.recv() => match message {
                        Some(message) => server.handle_topic_message(message).await,
                        None => break,
                    },
                }
            }
        });

        let server = self.clone();
        let mut merges = self.engine.bus().subscribe_merge();
        let merge_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    merge = merges.recv() => match merge {
                        Ok(merge) => server.handle_merge(merge).await,
                        Err(keel_events::BusError::SubscriberLagged(n)) => {
                            tracing::warn!(dropped = n, "merge subscriber lagged");
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        let server = self.clone();
        let mut replicators = self.engine.bus().subscribe_replicator();
        let replicator_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    event = replicators.recv() => match event {
                        Ok(event) => server.handle_replicator(event).await,
                        Err(keel_events::BusError::SubscriberLagged(n)) => {
                            tracing::warn!(dropped = n, "replicator subscriber lagged");
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        let server = self.clone();
        let mut topics = self.engine.bus().subscribe_p2p_topic();
        let topic_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    event = topics.recv() => match event {
                        Ok(event) => server.handle_p2p_topics(event).await,
                        Err(keel_events::BusError::SubscriberLagged(n)) => {
                            tracing::warn!(dropped = n, "topic subscriber lagged");
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        self.tasks
            .lock()
            .extend([inbox_task, merge_task, replicator_task, topic_task]);
    }

    /// Stop the loops and close every topic.
    pub async fn close(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.remove_all_pubsub_topics().await {
            tracing::warn!(error = %e, "failed closing topics");
        }
    }

    // ---- topic bookkeeping ----

    pub fn has_pubsub_topic(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Join a topic. Re-joining a publish-only topic with `subscribe` set
    /// closes the old handle and reopens it subscribed.
    pub async fn add_pubsub_topic(&self, topic: &str, subscribe: bool) -> Result<()> {
        if !self.host.pubsub_enabled() {
            return Ok(());
        }
        tracing::info!(peer = %self.peer_id(), topic, subscribe, "adding pubsub topic");

        let replaced = {
            let mut topics = self.topics.lock();
            match topics.get(topic) {
                Some(existing) if !existing.subscribed && subscribe => topics.remove(topic),
                Some(_) => return Ok(()),
                None => None,
            }
        };
        if let Some(old) = replaced {
            old.handle.close().await?;
        }

        let handle = self
            .host
            .join_topic(topic, subscribe, self.inbox_tx.clone())
            .await?;
        self.topics.lock().insert(
            topic.to_string(),
            PubsubTopic { handle, subscribed: subscribe },
        );
        Ok(())
    }

    /// Leave a topic, closing the underlying handle.
    pub async fn remove_pubsub_topic(&self, topic: &str) -> Result<()> {
        if !self.host.pubsub_enabled() {
            return Ok(());
        }
        tracing::info!(peer = %self.peer_id(), topic, "removing pubsub topic");

        let removed = self.topics.lock().remove(topic);
        match removed {
            Some(entry) => entry.handle.close().await,
            None => Ok(()),
        }
    }

    pub async fn remove_all_pubsub_topics(&self) -> Result<()> {
        if !self.host.pubsub_enabled() {
            return Ok(());
        }
        let drained: Vec<PubsubTopic> = {
            let mut topics = self.topics.lock();
            topics.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.handle.close().await?;
        }
        Ok(())
    }

    /// Current replicator peers for a schema root.
    pub fn replicators_of(&self, schema_root: &str) -> Vec<PeerId> {
        self.replicators
            .lock()
            .get(schema_root)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ---- push path ----

    async fn handle_merge(&self, merge: Merge) {
        let block = match self.engine.block_bytes(&merge.cid) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(cid = %merge.cid, error = %e, "merged block missing from store");
                return;
            }
        };
        let request = PushLogRequest {
            doc_id: merge.doc_id.clone().into_bytes(),
            cid: merge.cid.to_bytes(),
            creator: merge.by_peer.to_string(),
            schema_root: merge.schema_root.clone(),
            log: Some(Log { block }),
            session_id: String::new(),
        };

        // Announce on the document topic and the schema-root topic.
        if let Err(e) = self.publish_log(&merge.doc_id, &request).await {
            tracing::warn!(topic = %merge.doc_id, error = %e, "pubsub publish failed");
        }
        if let Err(e) = self.publish_log(&merge.schema_root, &request).await {
            tracing::warn!(topic = %merge.schema_root, error = %e, "pubsub publish failed");
        }

        // Dial every explicit replicator for this schema.
        for peer in self.replicators_of(&merge.schema_root) {
            if merge.from_peer.as_ref() == Some(&peer) {
                continue;
            }
            if let Err(e) = self.push_log_to_peer(&peer, request.clone()).await {
                tracing::warn!(%peer, error = %e, "replicator push failed");
            }
        }
    }

    async fn publish_log(&self, topic: &str, request: &PushLogRequest) -> Result<()> {
        // No pubsub layer: pushes succeed as no-ops so writers never block.
        if !self.host.pubsub_enabled() {
            return Ok(());
        }
        let handle = { self.topics.lock().get(topic).map(|t| t.handle.clone()) };
        let handle = match handle {
            Some(handle) => handle,
            None => {
                self.add_pubsub_topic(topic, false).await?;
                self.topics
                    .lock()
                    .get(topic)
                    .map(|t| t.handle.clone())
                    .ok_or_else(|| NetError::Network(format!("topic {topic} not joined")))?
            }
        };
        tracing::debug!(peer = %self.peer_id(), topic, "publishing log");
        handle.publish(request.encode_to_vec()).await
    }

    async fn push_log_to_peer(&self, peer: &PeerId, mut request: PushLogRequest) -> Result<()> {
        let session = Session::generate();
        request.session_id = session.id.clone();
        let session_id = session.id.clone();
        self.sessions.lock().insert(session);

        let client = self.dialer.dial(peer).await?;
        let result = client.push_log(request).await;
        self.sessions.lock().extract(&session_id);
        result.map(|_| ())
    }

    // ---- receive path ----

    async fn handle_topic_message(&self, message: TopicMessage) {
        self.engine.bus().publish_pubsub(PubSub {
            peer: message.from.clone(),
        });
        match PushLogRequest::decode(message.data.as_slice()) {
            Ok(request) => {
                if let Err(e) = self.handle_push_log(message.from.clone(), request).await {
                    tracing::warn!(from = %message.from, error = %e, "pushlog failed");
                }
            }
            Err(e) => {
                tracing::error!(from = %message.from, error = %e, "undecodable pubsub message");
            }
        }
    }

    async fn handle_push_log(&self, from: PeerId, request: PushLogRequest) -> Result<PushLogReply> {
        let doc_id = String::from_utf8(request.doc_id.clone())
            .map_err(|_| NetError::Malformed("doc id is not utf-8".to_string()))?;
        let head_cid = Cid::try_from(request.cid.as_slice())
            .map_err(|e| NetError::Malformed(format!("bad cid: {e}")))?;
        let log = request
            .log
            .as_ref()
            .ok_or_else(|| NetError::Malformed("missing log".to_string()))?;
        if cid_for(&log.block) != head_cid {
            return Err(NetError::Malformed(
                "block bytes do not match announced cid".to_string(),
            ));
        }

        tracing::info!(peer = %from, creator = %request.creator, doc = %doc_id, "received pushlog");

        let (_, outcome) = self.engine.process_remote_block(&log.block)?;
        if outcome == ProcessOutcome::AlreadyKnown {
            return Ok(PushLogReply {});
        }
        if let ProcessOutcome::Pending(missing) = outcome {
            self.sync_dag(&from, &doc_id, missing).await?;
        }
        tracing::info!(peer = %from, doc = %doc_id, "dag sync complete");

        // Follow the document unless its whole schema is already followed.
        if !self.has_pubsub_topic(&request.schema_root) {
            self.add_pubsub_topic(&doc_id, true).await?;
        }

        self.engine.bus().publish_merge(Merge {
            doc_id,
            cid: head_cid,
            schema_root: request.schema_root.clone(),
            by_peer: PeerId::new(request.creator.clone()),
            from_peer: Some(from),
        });
        Ok(PushLogReply {})
    }

    /// Pull missing ancestors from `from` until the document DAG closes.
    async fn sync_dag(&self, from: &PeerId, doc_id: &str, mut wanted: Vec<Cid>) -> Result<()> {
        let client = self.dialer.dial(from).await?;
        let session = Session::generate();
        let session_id = session.id.clone();
        self.sessions.lock().insert(session);

        while let Some(cid) = wanted.pop() {
            if self.cancel.is_cancelled() {
                return Err(NetError::Cancelled);
            }
            let reply = client
                .get_log(GetLogRequest {
                    cid: cid.to_bytes(),
                    session_id: session_id.clone(),
                })
                .await?;
            let log = reply
                .log
                .ok_or_else(|| NetError::NotFound(format!("peer has no block {cid}")))?;
            let (_, outcome) = self.engine.process_remote_block(&log.block)?;
            if let ProcessOutcome::Pending(missing) = outcome {
                wanted.extend(missing);
            }
            if wanted.is_empty() {
                // The parked frontier may still reference unresolved blocks.
                wanted = self.engine.missing_ancestors(doc_id, &cid)?;
            }
        }
        self.sessions.lock().extract(&session_id);
        Ok(())
    }

    // ---- peer set maintenance ----

    async fn handle_replicator(&self, event: Replicator) {
        if event.schemas.is_empty() {
            // Empty set means: forget this peer entirely.
            self.host.clear_peer_addrs(&event.info.id);
            self.dialer.forget(&event.info.id);
            let mut replicators = self.replicators.lock();
            for peers in replicators.values_mut() {
                peers.remove(&event.info.id);
            }
        } else {
            self.host.add_peer_addrs(&event.info);
            if let Err(e) = self.host.connect(&event.info).await {
                tracing::error!(peer = %event.info.id, error = %e, "failed to connect to replicator");
            }

            {
                let mut pending: HashSet<String> = event.schemas.iter().cloned().collect();
                let mut replicators = self.replicators.lock();
                for (schema, peers) in replicators.iter_mut() {
                    if pending.remove(schema) {
                        peers.insert(event.info.id.clone());
                    } else {
                        peers.remove(&event.info.id);
                    }
                }
                for schema in pending {
                    replicators
                        .entry(schema)
                        .or_default()
                        .insert(event.info.id.clone());
                }
            }

            // Backfill the named document updates right away.
            if let Some(docs) = event.docs {
                for update in docs {
                    let request = PushLogRequest {
                        doc_id: update.doc_id.clone().into_bytes(),
                        cid: update.cid.to_bytes(),
                        creator: self.peer_id().to_string(),
                        schema_root: update.schema_root.clone(),
                        log: Some(Log {
                            block: update.block,
                        }),
                        session_id: String::new(),
                    };
                    if let Err(e) = self.push_log_to_peer(&event.info.id, request).await {
                        tracing::error!(
                            peer = %event.info.id,
                            cid = %update.cid,
                            error = %e,
                            "failed to replicate log"
                        );
                    }
                }
            }
        }
        self.engine.bus().publish_completion(Completion::Replicator);
    }

    async fn handle_p2p_topics(&self, event: P2PTopic) {
        for topic in event.to_add {
            if let Err(e) = self.add_pubsub_topic(&topic, true).await {
                tracing::error!(topic = %topic, error = %e, "failed to add pubsub topic");
            }
        }
        for topic in event.to_remove {
            if let Err(e) = self.remove_pubsub_topic(&topic).await {
                tracing::error!(topic = %topic, error = %e, "failed to remove pubsub topic");
            }
        }
        self.engine.bus().publish_completion(Completion::P2PTopic);
    }
}

#[async_trait]
impl LogService for Server {
    async fn push_log(&self, from: PeerId, request: PushLogRequest) -> Result<PushLogReply> {
        self.handle_push_log(from, request).await
    }

    async fn get_log(&self, _from: PeerId, request: GetLogRequest) -> Result<GetLogReply> {
        let cid = Cid::try_from(request.cid.as_slice())
            .map_err(|e| NetError::Malformed(format!("bad cid: {e}")))?;
        match self.engine.block_bytes(&cid) {
            Ok(block) => Ok(GetLogReply {
                log: Some(Log { block }),
            }),
            Err(e) => Err(NetError::NotFound(format!("block {cid}: {e}"))),
        }
    }

    async fn get_head_log(
        &self,
        _from: PeerId,
        request: GetHeadLogRequest,
    ) -> Result<GetHeadLogReply> {
        let doc_id = String::from_utf8(request.doc_id)
            .map_err(|_| NetError::Malformed("doc id is not utf-8".to_string()))?;
        let heads = self.engine.composite_heads(&doc_id)?;
        Ok(GetHeadLogReply {
            cids: heads.iter().map(|(cid, _)| cid.to_bytes()).collect(),
            priorities: heads.iter().map(|(_, priority)| *priority).collect(),
        })
    }

    async fn push_doc_graph(
        &self,
        _from: PeerId,
        _request: PushDocGraphRequest,
    ) -> Result<PushDocGraphReply> {
        Ok(PushDocGraphReply {})
    }

    async fn get_doc_graph(
        &self,
        _from: PeerId,
        _request: GetDocGraphRequest,
    ) -> Result<GetDocGraphReply> {
        Ok(GetDocGraphReply {})
    }
}
