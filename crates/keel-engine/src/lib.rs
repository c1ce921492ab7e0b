//! Keel Engine
//!
//! The document engine of the Keel store:
//! - **Schema**: content-addressed, immutable schema versions with
//!   append-only patching
//! - **Document**: `bae-` content-derived ids and materialized field maps
//! - **Engine**: the write path (normalize → register delta → encrypt →
//!   block → one atomic batch) and the read path (state → decrypt →
//!   materialize → denormalize), plus the hooks the replication service
//!   drives for remote blocks
//! - **LensRegistry**: read-time schema-migration transforms

pub mod document;
pub mod engine;
pub mod error;
pub mod lens;
pub mod schema;

pub use document::{derive_doc_id, is_valid_doc_id, Document, DOC_ID_PREFIX};
pub use engine::{Collection, CommitInfo, Engine};
pub use error::{EngineError, Result};
pub use lens::{LensRegistry, Migration};
pub use schema::{FieldDescription, Schema};
