//! Error types for the engine.

use thiserror::Error;

use keel_crdt::RegisterError;
use keel_merkle::BlockError;
use keel_store::{EncryptionError, StoreError};
use keel_values::CoercionError;

/// Errors surfaced by collection and document operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
