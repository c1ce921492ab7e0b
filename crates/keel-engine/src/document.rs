//! Documents and their stable identifiers.
//!
//! A document id is content-addressed per creation: `bae-` followed by a
//! UUIDv5 computed over the schema version, the content id of the initial
//! composite snapshot, and an optional caller-supplied key. Two writers
//! creating the same document under the same schema derive the same id.

use std::collections::BTreeMap;

use libipld::Cid;
use uuid::Uuid;

use keel_values::NormalValue;

/// Prefix of every document id.
pub const DOC_ID_PREFIX: &str = "bae-";

/// Fixed namespace for the UUIDv5 derivation.
const DOC_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2b, 0x6a, 0x1d, 0x5c, 0x88, 0x3e, 0x4f, 0x21, 0x9f, 0x07, 0x44, 0xd1, 0xab, 0x5e, 0x60,
    0x93,
]);

/// Derive the document id for a creation.
pub fn derive_doc_id(
    schema_version_id: &str,
    initial_cid: &Cid,
    user_key: Option<&str>,
) -> String {
    let mut name = Vec::new();
    name.extend_from_slice(schema_version_id.as_bytes());
    name.push(0);
    name.extend_from_slice(&initial_cid.to_bytes());
    if let Some(key) = user_key {
        name.push(0);
        name.extend_from_slice(key.as_bytes());
    }
    format!("{DOC_ID_PREFIX}{}", Uuid::new_v5(&DOC_ID_NAMESPACE, &name))
}

/// True for strings of the form `bae-<uuid>`.
pub fn is_valid_doc_id(id: &str) -> bool {
    id.strip_prefix(DOC_ID_PREFIX)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

/// A materialized document.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub doc_id: String,
    /// The schema version the document currently reads under.
    pub schema_version_id: String,
    pub fields: BTreeMap<String, NormalValue>,
    /// Composite heads; one entry unless writers raced.
    pub heads: Vec<Cid>,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&NormalValue> {
        self.fields.get(name)
    }

    /// The single head, when the document is not mid-conflict.
    pub fn head(&self) -> Option<&Cid> {
        match self.heads.as_slice() {
            [head] => Some(head),
            _ => None,
        }
    }
}
