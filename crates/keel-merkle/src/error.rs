//! Error types for the DAG layer.

use libipld::Cid;
use thiserror::Error;

use keel_store::StoreError;

/// Errors produced by the block codec and the Merkle clock.
#[derive(Error, Debug)]
pub enum BlockError {
    /// Bytes that do not decode into a block, or a block carrying unknown
    /// tags. Terminal for the offending block; never retried.
    #[error("malformed block: {0}")]
    Malformed(String),

    /// A priority, cycle, or link violation. The block is quarantined.
    #[error("dag invariant violated for {cid}: {reason}")]
    DagInvariantViolated { cid: Cid, reason: String },

    /// A block was rejected before reaching the register layer.
    #[error("block {cid} rejected: {reason}")]
    BlockRejected { cid: Cid, reason: String },

    /// The register layer refused the delta.
    #[error("merge failed: {0}")]
    Merge(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BlockError>;
