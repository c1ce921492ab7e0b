//! Connection caching.
//!
//! `dial` hands out one cached connection per peer. A cached connection
//! that was closed externally is not silently re-dialed; the caller gets
//! [`NetError::ConnectionClosing`] and decides what to do. `forget` evicts
//! the entry so the next dial starts fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use keel_events::PeerId;

use crate::error::{NetError, Result};
use crate::host::{Host, LogClient};

/// Default upper bound on a dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Dialer {
    host: Arc<dyn Host>,
    conns: Mutex<HashMap<PeerId, Arc<dyn LogClient>>>,
    dial_timeout: Duration,
}

impl Dialer {
    pub fn new(host: Arc<dyn Host>) -> Dialer {
        Dialer {
            host,
            conns: Mutex::new(HashMap::new()),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, dial_timeout: Duration) -> Dialer {
        self.dial_timeout = dial_timeout;
        self
    }

    pub async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn LogClient>> {
        if let Some(conn) = self.conns.lock().get(peer).cloned() {
            if conn.is_closed() {
                return Err(NetError::ConnectionClosing);
            }
            return Ok(conn);
        }

        let conn = tokio::time::timeout(self.dial_timeout, self.host.dial(peer))
            .await
            .map_err(|_| NetError::Network(format!("dial timeout to {peer}")))??;
        self.conns.lock().insert(peer.clone(), conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection for `peer`, if any.
    pub fn forget(&self, peer: &PeerId) {
        self.conns.lock().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LogService, MemoryNetwork};
    use crate::pb::*;
    use async_trait::async_trait;

    struct NullService;

    #[async_trait]
    impl LogService for NullService {
        async fn push_log(&self, _: PeerId, _: PushLogRequest) -> Result<PushLogReply> {
            Ok(PushLogReply {})
        }
        async fn get_log(&self, _: PeerId, _: GetLogRequest) -> Result<GetLogReply> {
            Ok(GetLogReply { log: None })
        }
        async fn get_head_log(&self, _: PeerId, _: GetHeadLogRequest) -> Result<GetHeadLogReply> {
            Ok(GetHeadLogReply {
                cids: vec![],
                priorities: vec![],
            })
        }
        async fn push_doc_graph(
            &self,
            _: PeerId,
            _: PushDocGraphRequest,
        ) -> Result<PushDocGraphReply> {
            Ok(PushDocGraphReply {})
        }
        async fn get_doc_graph(&self, _: PeerId, _: GetDocGraphRequest) -> Result<GetDocGraphReply> {
            Ok(GetDocGraphReply {})
        }
    }

    #[tokio::test]
    async fn test_dial_caches_connection() {
        let network = MemoryNetwork::new();
        let host_a = network.host("a");
        network.register(&PeerId::new("b"), Arc::new(NullService));

        let dialer = Dialer::new(host_a);
        let c1 = dialer.dial(&PeerId::new("b")).await.unwrap();
        let c2 = dialer.dial(&PeerId::new("b")).await.unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[tokio::test]
    async fn test_cached_closed_connection_surfaces_error() {
        let network = MemoryNetwork::new();
        let host_a = network.host("a");
        network.register(&PeerId::new("b"), Arc::new(NullService));

        let dialer = Dialer::new(host_a);
        let conn = dialer.dial(&PeerId::new("b")).await.unwrap();
        conn.close();

        let err = dialer.dial(&PeerId::new("b")).await.unwrap_err();
        assert_eq!(err.to_string(), "grpc: the client connection is closing");

        // After eviction, dialing works again.
        dialer.forget(&PeerId::new("b"));
        assert!(dialer.dial(&PeerId::new("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let host_a = network.host("a");
        let dialer = Dialer::new(host_a);
        assert!(dialer.dial(&PeerId::new("ghost")).await.is_err());
    }
}
