//! Keel CRDT
//!
//! The register families behind every document field:
//! - **LwwRegister**: last-writer-wins, keyed by `(priority, cid)`
//! - **PnCounter**: positive/negative counter over `i64` or `f64`; the
//!   delta log is kept ordered so float sums converge bit-identically
//! - **CompositeRegister**: the document-level register anchoring every
//!   field head behind a single DAG head
//!
//! All three share the [`Register`] protocol. Merges are deterministic and
//! idempotent: any two replicas that have seen the same set of deltas hold
//! the same state, whatever the delivery order. Register payloads may be
//! ciphertext; the protocol never inspects payload bytes except where the
//! register family requires it (counters), in which case the engine
//! decrypts before merging.

pub mod composite;
pub mod counter;
pub mod lww;

use libipld::Cid;
use thiserror::Error;

pub use composite::{CompositeRegister, CompositeState};
pub use counter::{CounterValue, PnCounter, PnCounterState};
pub use lww::{LwwRegister, LwwState};

/// Errors produced by register operations.
#[derive(Error, Debug)]
pub enum RegisterError {
    /// Bytes that do not decode into the expected state or payload shape.
    #[error("malformed register data: {0}")]
    Malformed(String),

    /// A delta whose payload family does not match the register.
    #[error("register type mismatch: {0}")]
    TypeMismatch(String),
}

pub type Result<T> = std::result::Result<T, RegisterError>;

/// A delta accepted into the DAG, as seen by a register.
#[derive(Clone, Copy, Debug)]
pub struct AppliedDelta<'a> {
    pub payload: &'a [u8],
    pub priority: u64,
    pub cid: Cid,
}

/// The protocol every register family implements.
pub trait Register {
    /// What a writer hands in.
    type Input;
    /// The persisted register state.
    type State;
    /// What materialization yields.
    type Value;

    /// Build the delta payload for a new input.
    fn new_delta(&self, input: &Self::Input) -> Result<Vec<u8>>;

    /// Fold an accepted delta into the state. Deterministic and idempotent.
    fn merge(&self, state: Option<Self::State>, delta: AppliedDelta<'_>) -> Result<Self::State>;

    /// The register's current value.
    fn materialize(&self, state: &Self::State) -> Result<Self::Value>;
}
