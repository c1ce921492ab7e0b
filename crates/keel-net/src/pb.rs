//! Wire messages for the replication RPCs.
//!
//! Hand-derived protobuf messages; field numbers are fixed and append-only
//! so peers on different builds stay wire-compatible. Block bytes travel
//! verbatim — content addressing depends on it.

/// A replicated log entry: the canonical block bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Log {
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,
}

/// Push one DAG head to a peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushLogRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub doc_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub cid: Vec<u8>,
    /// Peer id of the update's creator.
    #[prost(string, tag = "3")]
    pub creator: String,
    #[prost(string, tag = "4")]
    pub schema_root: String,
    #[prost(message, optional, tag = "5")]
    pub log: Option<Log>,
    /// Opaque session identifier for envelope encryption.
    #[prost(string, tag = "6")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushLogReply {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLogRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub cid: Vec<u8>,
    #[prost(string, tag = "2")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLogReply {
    #[prost(message, optional, tag = "1")]
    pub log: Option<Log>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHeadLogRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub doc_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHeadLogReply {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub cids: Vec<Vec<u8>>,
    #[prost(uint64, repeated, tag = "2")]
    pub priorities: Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushDocGraphRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub doc_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushDocGraphReply {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDocGraphRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub doc_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDocGraphReply {}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_push_log_roundtrip_preserves_block_bytes() {
        let request = PushLogRequest {
            doc_id: b"bae-123".to_vec(),
            cid: vec![1, 113, 18, 32, 7],
            creator: "peer-a".to_string(),
            schema_root: "root".to_string(),
            log: Some(Log {
                block: vec![0xa4, 0x63, 0x61, 0x67, 0x65],
            }),
            session_id: "s-1".to_string(),
        };
        let bytes = request.encode_to_vec();
        let decoded = PushLogRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.log.unwrap().block, vec![0xa4, 0x63, 0x61, 0x67, 0x65]);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        // A newer peer may append fields; decoding must not fail.
        let mut bytes = PushLogReply {}.encode_to_vec();
        let extra = GetLogRequest {
            cid: vec![9],
            session_id: String::new(),
        }
        .encode_to_vec();
        bytes.extend(extra);
        assert!(PushLogReply::decode(bytes.as_slice()).is_ok());
    }
}
