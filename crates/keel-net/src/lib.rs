//! Keel Net
//!
//! The replication service of the Keel document store:
//! - **pb**: protobuf wire messages with fixed field numbers
//! - **host**: the transport traits (host, pubsub topics, log RPC client)
//!   plus the in-process network every test runs on
//! - **Server**: topic bookkeeping, the replicator set, ephemeral crypto
//!   sessions, the push path driven by `Merge` events, and the pull path
//!   that walks missing ancestors until the DAG is complete
//! - **Dialer**: cached per-peer connections

pub mod dialer;
pub mod error;
pub mod host;
pub mod pb;
pub mod server;
pub mod session;

pub use dialer::{Dialer, DEFAULT_DIAL_TIMEOUT};
pub use error::{NetError, Result};
pub use host::{Host, LogClient, LogService, MemoryHost, MemoryNetwork, TopicHandle, TopicMessage};
pub use server::Server;
pub use session::{Session, SessionTable, SESSION_TIMEOUT};
