//! Datastore key schema.
//!
//! Keys are slash-joined strings ordered byte-lexicographically, so a prefix
//! scan enumerates all documents of a collection, then all fields of a
//! document, then all heads of a field. Five namespaces coexist; each is
//! versioned by the single leading byte of its token (`d`, `h`, `b`, `e`,
//! `q`), and adding a namespace is additive.
//!
//! - `/data/<collection_id>/<doc_id>/<field_id>` — latest field values
//! - `/heads/<collection_id>/<doc_id>/<field_id>/<crdt>/<cid>` — head set
//! - `/blocks/<cid>` — block store
//! - `/enc/<doc_id>[/<field_name>]` — wrapped encryption keys
//! - `/queue/<doc_id>/<cid>` — blocks parked until their ancestors arrive

use std::fmt;

pub const DATA_NAMESPACE: &str = "/data";
pub const HEADS_NAMESPACE: &str = "/heads";
pub const BLOCKS_NAMESPACE: &str = "/blocks";
pub const ENC_NAMESPACE: &str = "/enc";
pub const QUEUE_NAMESPACE: &str = "/queue";

/// Field id reserved for the document-level composite register.
pub const COMPOSITE_FIELD_ID: u32 = 0;

/// A datastore key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// A raw key. Callers normally use the namespace constructors.
    pub fn raw(s: impl Into<String>) -> Key {
        Key(s.into())
    }

    pub fn data(collection_id: u32, doc_id: &str, field_id: u32) -> Key {
        Key(format!("{DATA_NAMESPACE}/{collection_id}/{doc_id}/{field_id}"))
    }

    pub fn data_doc_prefix(collection_id: u32, doc_id: &str) -> Key {
        Key(format!("{DATA_NAMESPACE}/{collection_id}/{doc_id}/"))
    }

    pub fn data_collection_prefix(collection_id: u32) -> Key {
        Key(format!("{DATA_NAMESPACE}/{collection_id}/"))
    }

    pub fn head(collection_id: u32, doc_id: &str, field_id: u32, crdt: u8, cid: &str) -> Key {
        Key(format!(
            "{HEADS_NAMESPACE}/{collection_id}/{doc_id}/{field_id}/{crdt}/{cid}"
        ))
    }

    pub fn heads_prefix(collection_id: u32, doc_id: &str, field_id: u32, crdt: u8) -> Key {
        Key(format!(
            "{HEADS_NAMESPACE}/{collection_id}/{doc_id}/{field_id}/{crdt}/"
        ))
    }

    pub fn block(cid: &str) -> Key {
        Key(format!("{BLOCKS_NAMESPACE}/{cid}"))
    }

    pub fn enc(doc_id: &str, field_name: Option<&str>) -> Key {
        match field_name {
            Some(field) if !field.is_empty() => Key(format!("{ENC_NAMESPACE}/{doc_id}/{field}")),
            _ => Key(format!("{ENC_NAMESPACE}/{doc_id}")),
        }
    }

    pub fn queue(doc_id: &str, cid: &str) -> Key {
        Key(format!("{QUEUE_NAMESPACE}/{doc_id}/{cid}"))
    }

    pub fn queue_doc_prefix(doc_id: &str) -> Key {
        Key(format!("{QUEUE_NAMESPACE}/{doc_id}/"))
    }

    pub fn queue_prefix() -> Key {
        Key(format!("{QUEUE_NAMESPACE}/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The trailing path segment (cid for head and queue keys).
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_have_distinct_leading_bytes() {
        let mut first_bytes: Vec<u8> = [
            DATA_NAMESPACE,
            HEADS_NAMESPACE,
            BLOCKS_NAMESPACE,
            ENC_NAMESPACE,
            QUEUE_NAMESPACE,
        ]
        .iter()
        .map(|ns| ns.as_bytes()[1])
        .collect();
        first_bytes.sort_unstable();
        first_bytes.dedup();
        assert_eq!(first_bytes.len(), 5);
    }

    #[test]
    fn test_prefix_scan_ordering() {
        // Keys of one collection group before another collection; fields of
        // one document group under the document.
        let k1 = Key::data(1, "bae-a", 1);
        let k2 = Key::data(1, "bae-a", 2);
        let k3 = Key::data(1, "bae-b", 1);

        assert!(k1 < k2);
        assert!(k2 < k3);
        assert!(k1.starts_with(&Key::data_doc_prefix(1, "bae-a")));
        assert!(k3.starts_with(&Key::data_collection_prefix(1)));
        assert!(!k3.starts_with(&Key::data_doc_prefix(1, "bae-a")));
    }

    #[test]
    fn test_enc_key_shapes() {
        assert_eq!(Key::enc("bae-x", None).as_str(), "/enc/bae-x");
        assert_eq!(Key::enc("bae-x", Some("")).as_str(), "/enc/bae-x");
        assert_eq!(Key::enc("bae-x", Some("name")).as_str(), "/enc/bae-x/name");
    }

    #[test]
    fn test_last_segment() {
        let k = Key::head(1, "bae-a", 2, 1, "bafyfoo");
        assert_eq!(k.last_segment(), "bafyfoo");
    }
}
