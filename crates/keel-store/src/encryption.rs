//! Field-payload encryption.
//!
//! Payloads are sealed with AES-256-GCM under a per-document (optionally
//! per-field) symmetric key. Keys live in the `/enc` keyspace and are
//! generated lazily on the first encrypt for a `(doc, field)` pair. The
//! additional authenticated data binds the document id and field name, so a
//! ciphertext taken from one field fails authentication anywhere else.
//!
//! Ciphertexts are opaque to the CRDT layer; replicas merge ciphertext
//! deltas untouched and only decrypt at materialization time.

use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key as AesKey, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::datastore::Datastore;
use crate::error::{EncryptionError, StoreError};
use crate::key::Key;

/// Length of a generated encryption key in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Length of the random nonce prepended to each ciphertext.
pub const NONCE_LEN: usize = 12;

/// Encryption configuration for a document write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Encrypt every field of the document under a document-level key.
    pub is_encrypted: bool,
    /// Fields that get their own key, independent of `is_encrypted`.
    pub encrypted_fields: Vec<String>,
}

impl EncryptionConfig {
    pub fn doc() -> EncryptionConfig {
        EncryptionConfig {
            is_encrypted: true,
            encrypted_fields: Vec::new(),
        }
    }

    pub fn fields(fields: impl IntoIterator<Item = impl Into<String>>) -> EncryptionConfig {
        EncryptionConfig {
            is_encrypted: false,
            encrypted_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Encrypts and decrypts field payloads with lazily issued keys.
#[derive(Default)]
pub struct DocEncryptor {
    store: Option<Arc<dyn Datastore>>,
    config: Option<EncryptionConfig>,
}

impl DocEncryptor {
    pub fn new() -> DocEncryptor {
        DocEncryptor::default()
    }

    pub fn set_store(&mut self, store: Arc<dyn Datastore>) {
        self.store = Some(store);
    }

    pub fn set_config(&mut self, config: Option<EncryptionConfig>) {
        self.config = config;
    }

    fn field_has_own_key(&self, field_name: &str) -> bool {
        !field_name.is_empty()
            && self
                .config
                .as_ref()
                .map(|c| c.encrypted_fields.iter().any(|f| f == field_name))
                .unwrap_or(false)
    }

    fn should_encrypt(&self, field_name: &str) -> bool {
        match &self.config {
            Some(config) => config.is_encrypted || self.field_has_own_key(field_name),
            None => false,
        }
    }

    fn store(&self) -> Result<&Arc<dyn Datastore>, EncryptionError> {
        self.store.as_ref().ok_or(EncryptionError::NoStorage)
    }

    /// Encrypt `plaintext` for `(doc_id, field_name)`.
    ///
    /// Generates and stores a fresh 256-bit key on the first use for the
    /// pair; later calls reuse it. Returns the plaintext unchanged when the
    /// configuration does not ask for encryption.
    pub fn encrypt(
        &self,
        doc_id: &str,
        field_name: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        if !self.should_encrypt(field_name) {
            return Ok(plaintext.to_vec());
        }
        let store = self.store()?;
        let store_key = self.key_location(doc_id, field_name);

        let key = match store.get(&store_key) {
            Ok(key) => key,
            Err(StoreError::NotFound(_)) => {
                let key = generate_key();
                store.put(&store_key, key.clone())?;
                tracing::debug!(doc_id, field_name, "generated field encryption key");
                key
            }
            Err(e) => return Err(e.into()),
        };

        seal(&key, doc_id, field_name, plaintext)
    }

    /// Decrypt `ciphertext` for `(doc_id, field_name)`.
    ///
    /// Looks for an exact per-field key first; when the field is not
    /// individually configured it falls back to the document-level key.
    pub fn decrypt(
        &self,
        doc_id: &str,
        field_name: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        if !self.should_encrypt(field_name) {
            return Ok(ciphertext.to_vec());
        }
        let store = self.store()?;

        let key = match store.get(&Key::enc(doc_id, Some(field_name))) {
            Ok(key) => key,
            Err(StoreError::NotFound(_)) if !self.field_has_own_key(field_name) => {
                match store.get(&Key::enc(doc_id, None)) {
                    Ok(key) => key,
                    Err(StoreError::NotFound(_)) => return Err(EncryptionError::NoKey),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(StoreError::NotFound(_)) => return Err(EncryptionError::NoKey),
            Err(e) => return Err(e.into()),
        };

        open(&key, doc_id, field_name, ciphertext)
    }

    fn key_location(&self, doc_id: &str, field_name: &str) -> Key {
        if self.field_has_own_key(field_name) {
            Key::enc(doc_id, Some(field_name))
        } else {
            Key::enc(doc_id, None)
        }
    }
}

fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; ENCRYPTION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// The associated data binding a ciphertext to its location.
fn aad(doc_id: &str, field_name: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(doc_id.len() + 1 + field_name.len());
    aad.extend_from_slice(doc_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(field_name.as_bytes());
    aad
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, EncryptionError> {
    if key.len() != ENCRYPTION_KEY_LEN {
        return Err(EncryptionError::Cipher(format!(
            "invalid key length {}",
            key.len()
        )));
    }
    Ok(Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key)))
}

fn seal(
    key: &[u8],
    doc_id: &str,
    field_name: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = cipher(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aad = aad(doc_id, field_name);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(
    key: &[u8],
    doc_id: &str,
    field_name: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if ciphertext.len() <= NONCE_LEN {
        return Err(EncryptionError::Cipher("ciphertext too short".to_string()));
    }
    let cipher = cipher(key)?;
    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    let aad = aad(doc_id, field_name);

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: &aad,
            },
        )
        .map_err(|e| EncryptionError::Cipher(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;

    const DOC_ID: &str = "bae-c9fb0fa4-1195-589c-aa54-e68333fb90b3";

    fn encryptor(config: EncryptionConfig) -> (DocEncryptor, Arc<MemoryDatastore>) {
        let store = Arc::new(MemoryDatastore::new());
        let mut enc = DocEncryptor::new();
        enc.set_store(store.clone());
        enc.set_config(Some(config));
        (enc, store)
    }

    #[test]
    fn test_first_encrypt_generates_and_stores_key() {
        let (enc, store) = encryptor(EncryptionConfig::doc());

        let ciphertext = enc.encrypt(DOC_ID, "", b"test").unwrap();
        assert_ne!(ciphertext, b"test");

        let stored = store.get(&Key::enc(DOC_ID, None)).unwrap();
        assert_eq!(stored.len(), ENCRYPTION_KEY_LEN);

        assert_eq!(enc.decrypt(DOC_ID, "", &ciphertext).unwrap(), b"test");
    }

    #[test]
    fn test_repeated_encrypts_reuse_the_key() {
        let (enc, store) = encryptor(EncryptionConfig::doc());

        let c1 = enc.encrypt(DOC_ID, "", b"test").unwrap();
        let key_after_first = store.get(&Key::enc(DOC_ID, None)).unwrap();
        let c2 = enc.encrypt(DOC_ID, "", b"test").unwrap();
        let key_after_second = store.get(&Key::enc(DOC_ID, None)).unwrap();

        assert_eq!(key_after_first, key_after_second);
        assert_eq!(enc.decrypt(DOC_ID, "", &c1).unwrap(), b"test");
        assert_eq!(enc.decrypt(DOC_ID, "", &c2).unwrap(), b"test");
    }

    #[test]
    fn test_unconfigured_encryptor_passes_through() {
        let store = Arc::new(MemoryDatastore::new());
        let mut enc = DocEncryptor::new();
        enc.set_store(store.clone());

        assert_eq!(enc.encrypt(DOC_ID, "", b"test").unwrap(), b"test");
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_field_config_uses_field_key() {
        let (enc, store) = encryptor(EncryptionConfig::fields(["name"]));

        let ciphertext = enc.encrypt(DOC_ID, "name", b"Bob").unwrap();
        assert!(store.has(&Key::enc(DOC_ID, Some("name"))).unwrap());
        assert!(!store.has(&Key::enc(DOC_ID, None)).unwrap());

        // A field outside the configured list is not encrypted.
        assert_eq!(enc.encrypt(DOC_ID, "age", b"31").unwrap(), b"31");

        assert_eq!(enc.decrypt(DOC_ID, "name", &ciphertext).unwrap(), b"Bob");
    }

    #[test]
    fn test_doc_level_key_covers_unlisted_fields() {
        let (enc, store) = encryptor(EncryptionConfig::doc());

        let ciphertext = enc.encrypt(DOC_ID, "name", b"Bob").unwrap();
        assert!(store.has(&Key::enc(DOC_ID, None)).unwrap());
        assert!(!store.has(&Key::enc(DOC_ID, Some("name"))).unwrap());
        assert_eq!(enc.decrypt(DOC_ID, "name", &ciphertext).unwrap(), b"Bob");
    }

    #[test]
    fn test_ciphertext_cannot_move_between_fields() {
        let (enc, _store) = encryptor(EncryptionConfig::doc());

        let ciphertext = enc.encrypt(DOC_ID, "name", b"Bob").unwrap();
        // Same key, different associated data: authentication fails.
        assert!(matches!(
            enc.decrypt(DOC_ID, "age", &ciphertext),
            Err(EncryptionError::Cipher(_))
        ));
    }

    #[test]
    fn test_decrypt_without_key_is_no_key() {
        let (enc, _store) = encryptor(EncryptionConfig::doc());
        assert_eq!(
            enc.decrypt(DOC_ID, "", b"0123456789abcdefXXXX"),
            Err(EncryptionError::NoKey)
        );
    }

    #[test]
    fn test_missing_store_is_no_storage() {
        let mut enc = DocEncryptor::new();
        enc.set_config(Some(EncryptionConfig::doc()));
        assert_eq!(
            enc.encrypt(DOC_ID, "", b"test"),
            Err(EncryptionError::NoStorage)
        );
    }
}
