//! Error types for the storage layer.

use thiserror::Error;

/// Errors surfaced by the datastore contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key is absent. Callers usually fall through to generation or a
    /// remote pull rather than treating this as fatal.
    #[error("key not found: {0}")]
    NotFound(String),

    /// An underlying storage failure.
    #[error("store io error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors surfaced by the document encryptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// No key material exists for the requested document or field.
    #[error("no encryption key found for document")]
    NoKey,

    /// The encryptor has no backing keystore configured.
    #[error("no storage configured for encryption keys")]
    NoStorage,

    /// The ciphertext failed authentication or is otherwise unusable.
    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
