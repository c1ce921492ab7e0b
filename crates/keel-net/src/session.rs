//! Per-request crypto sessions.
//!
//! Each RPC carries an opaque session id. The issuing side keeps an
//! ephemeral x25519 secret for it, used to seal sensitive fields of the
//! reply envelope. Sessions are short-lived: anything older than five
//! seconds is dropped on the next table access.

use std::time::{Duration, Instant};

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{ChaChaBox, PublicKey, SecretKey};
use rand::RngCore;

use crate::error::{NetError, Result};

/// Sessions older than this are garbage-collected on any lookup.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

const NONCE_LEN: usize = 24;

/// One ephemeral session.
pub struct Session {
    pub id: String,
    secret: SecretKey,
    pub established_at: Instant,
}

impl Session {
    /// A fresh session under a random id.
    pub fn generate() -> Session {
        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let id: String = id_bytes.iter().map(|b| format!("{b:02x}")).collect();
        Session::with_id(id)
    }

    pub fn with_id(id: impl Into<String>) -> Session {
        Session {
            id: id.into(),
            secret: SecretKey::generate(&mut OsRng),
            established_at: Instant::now(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Seal `plaintext` for the holder of `their_public`.
    pub fn seal_for(&self, their_public: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let shared = ChaChaBox::new(their_public, &self.secret);
        let nonce = ChaChaBox::generate_nonce(&mut OsRng);
        let sealed = shared
            .encrypt(&nonce, plaintext)
            .map_err(|e| NetError::Network(format!("seal failed: {e:?}")))?;
        let mut out = nonce.to_vec();
        out.extend(sealed);
        Ok(out)
    }

    /// Open a payload sealed by the holder of `their_public`.
    pub fn open_from(&self, their_public: &PublicKey, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(NetError::Malformed("sealed payload too short".to_string()));
        }
        let shared = ChaChaBox::new(their_public, &self.secret);
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("length checked above");
        shared
            .decrypt(&nonce.into(), ciphertext)
            .map_err(|e| NetError::Malformed(format!("open failed: {e:?}")))
    }
}

/// The in-memory session table.
#[derive(Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Take the session with `id`, dropping any other session past the
    /// timeout along the way.
    pub fn extract(&mut self, id: &str) -> Option<Session> {
        let mut result = None;
        let mut i = 0;
        while i < self.sessions.len() {
            if self.sessions[i].id == id {
                result = Some(self.sessions.swap_remove(i));
            } else if self.sessions[i].established_at.elapsed() > SESSION_TIMEOUT {
                self.sessions.swap_remove(i);
            } else {
                i += 1;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let a = Session::with_id("a");
        let b = Session::with_id("b");

        let sealed = a.seal_for(&b.public_key(), b"secret envelope").unwrap();
        let opened = b.open_from(&a.public_key(), &sealed).unwrap();
        assert_eq!(opened, b"secret envelope");

        // A third party cannot open it.
        let c = Session::with_id("c");
        assert!(c.open_from(&a.public_key(), &sealed).is_err());
    }

    #[test]
    fn test_extract_returns_match_and_drops_stale() {
        let mut table = SessionTable::new();
        let mut stale = Session::with_id("stale");
        stale.established_at = Instant::now() - SESSION_TIMEOUT - Duration::from_secs(1);
        table.insert(stale);
        table.insert(Session::with_id("fresh"));
        table.insert(Session::with_id("wanted"));

        let got = table.extract("wanted").expect("session present");
        assert_eq!(got.id, "wanted");
        // The stale session is gone; the fresh one survives.
        assert_eq!(table.len(), 1);
        assert!(table.extract("stale").is_none());
        assert!(table.extract("fresh").is_some());
    }

    #[test]
    fn test_extract_missing_id() {
        let mut table = SessionTable::new();
        table.insert(Session::with_id("a"));
        assert!(table.extract("b").is_none());
        assert_eq!(table.len(), 1);
    }
}
