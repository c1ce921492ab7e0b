//! Keel Store
//!
//! Storage plumbing for the Keel document store:
//! - **Datastore**: the contract the engine consumes from the external
//!   key-value engine, plus the in-memory reference implementation
//! - **Key**: the slash-joined key schema over the `/data`, `/heads`,
//!   `/blocks`, `/enc`, and `/queue` namespaces
//! - **DocEncryptor**: lazy per-document / per-field key issuance and
//!   authenticated encryption of field payloads

pub mod datastore;
pub mod encryption;
pub mod error;
pub mod key;

pub use datastore::{Batch, BatchOp, Datastore, MemoryDatastore};
pub use encryption::{DocEncryptor, EncryptionConfig, ENCRYPTION_KEY_LEN, NONCE_LEN};
pub use error::{EncryptionError, StoreError};
pub use key::{Key, COMPOSITE_FIELD_ID};
