//! Keel Merkle
//!
//! The content-addressed causal history of the Keel document store:
//! - **Block**: a DAG node carrying one CRDT delta, ordered parent links,
//!   and the schema version, encoded to canonical DAG-CBOR under a CIDv1
//!   `dag-cbor`/`sha2-256` content identifier
//! - **MerkleClock**: per-(document, field) head tracking, delta appends,
//!   out-of-order block processing with a persisted pending queue, and the
//!   missing-ancestor walk that drives pulls

pub mod block;
pub mod clock;
pub mod error;

pub use block::{cid_for, Block, CrdtType, Delta, Link, DAG_CBOR, HEAD_LINK_NAME};
pub use clock::{DeltaMerger, FieldRef, MerkleClock, ProcessOutcome};
pub use error::{BlockError, Result};

pub use libipld::Cid;
