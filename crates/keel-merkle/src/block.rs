//! DAG blocks and the canonical codec.
//!
//! A block carries one CRDT delta, an ordered set of links to its parents,
//! and the schema version it was written under. Blocks encode to canonical
//! DAG-CBOR — map keys sorted, links sorted by name then cid — so the same
//! block always yields the same bytes and therefore the same CID. The CID is
//! CIDv1 with the `dag-cbor` codec and a SHA-256 multihash; its textual form
//! is lower-case base32.

use std::collections::BTreeMap;

use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::multihash::{Code, MultihashDigest};
use libipld::{Cid, Ipld};
use serde::{Deserialize, Serialize};

use crate::error::{BlockError, Result};

/// Multicodec code for DAG-CBOR payloads.
pub const DAG_CBOR: u64 = 0x71;

/// Link name used for parents within the same register.
pub const HEAD_LINK_NAME: &str = "_head";

/// The CRDT family a delta belongs to. Tags are persisted; append-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrdtType {
    /// Last-Writer-Wins register.
    Lww,
    /// Positive/negative counter.
    Counter,
    /// Document-level composite register.
    Composite,
}

impl CrdtType {
    pub fn tag(self) -> u8 {
        match self {
            CrdtType::Lww => 1,
            CrdtType::Counter => 2,
            CrdtType::Composite => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<CrdtType> {
        match tag {
            1 => Some(CrdtType::Lww),
            2 => Some(CrdtType::Counter),
            3 => Some(CrdtType::Composite),
            _ => None,
        }
    }
}

/// The minimal information needed to advance a register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub doc_id: String,
    /// Absent for composite deltas.
    pub field_name: Option<String>,
    pub crdt: CrdtType,
    /// Monotone clock height; always 1 + max over the parents.
    pub priority: u64,
    /// The delta body, possibly ciphertext.
    pub payload: Vec<u8>,
}

/// A named link to a parent block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub cid: Cid,
}

impl Link {
    pub fn head(cid: Cid) -> Link {
        Link {
            name: HEAD_LINK_NAME.to_string(),
            cid,
        }
    }

    pub fn field(name: impl Into<String>, cid: Cid) -> Link {
        Link {
            name: name.into(),
            cid,
        }
    }
}

/// A node of the per-document DAG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub delta: Delta,
    /// Sorted by (name, cid); `_head` links point at the register's prior
    /// heads, field-named links at consumed field heads.
    pub links: Vec<Link>,
    pub schema_version_id: String,
}

impl Block {
    pub fn new(delta: Delta, mut links: Vec<Link>, schema_version_id: impl Into<String>) -> Block {
        links.sort_by(|a, b| (&a.name, a.cid.to_bytes()).cmp(&(&b.name, b.cid.to_bytes())));
        Block {
            delta,
            links,
            schema_version_id: schema_version_id.into(),
        }
    }

    /// Links in declaration (sorted) order.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Parents within the same register.
    pub fn head_links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|l| l.name == HEAD_LINK_NAME)
    }

    pub fn is_composite(&self) -> bool {
        self.delta.crdt == CrdtType::Composite
    }

    /// Encode to canonical bytes and compute the content identifier.
    pub fn encode(&self) -> Result<(Vec<u8>, Cid)> {
        let bytes = DagCborCodec
            .encode(&self.to_ipld())
            .map_err(|e| BlockError::Malformed(e.to_string()))?;
        let cid = cid_for(&bytes);
        Ok((bytes, cid))
    }

    /// The content identifier of the canonical encoding.
    pub fn cid(&self) -> Result<Cid> {
        Ok(self.encode()?.1)
    }

    pub fn decode(bytes: &[u8]) -> Result<Block> {
        let ipld: Ipld = DagCborCodec
            .decode(bytes)
            .map_err(|e| BlockError::Malformed(e.to_string()))?;
        Block::from_ipld(&ipld)
    }

    fn to_ipld(&self) -> Ipld {
        let mut delta = BTreeMap::new();
        delta.insert("crdt".to_string(), Ipld::Integer(self.delta.crdt.tag() as i128));
        delta.insert("docID".to_string(), Ipld::String(self.delta.doc_id.clone()));
        delta.insert(
            "fieldName".to_string(),
            match &self.delta.field_name {
                Some(name) => Ipld::String(name.clone()),
                None => Ipld::Null,
            },
        );
        delta.insert("payload".to_string(), Ipld::Bytes(self.delta.payload.clone()));
        delta.insert(
            "priority".to_string(),
            Ipld::Integer(self.delta.priority as i128),
        );

        let links = self
            .links
            .iter()
            .map(|link| {
                let mut map = BTreeMap::new();
                map.insert("cid".to_string(), Ipld::Link(link.cid));
                map.insert("name".to_string(), Ipld::String(link.name.clone()));
                Ipld::Map(map)
            })
            .collect();

        let mut block = BTreeMap::new();
        block.insert("delta".to_string(), Ipld::Map(delta));
        block.insert("links".to_string(), Ipld::List(links));
        block.insert(
            "schemaVersionID".to_string(),
            Ipld::String(self.schema_version_id.clone()),
        );
        Ipld::Map(block)
    }

    fn from_ipld(ipld: &Ipld) -> Result<Block> {
        let map = as_map(ipld, "block")?;
        let delta_map = as_map(require(map, "delta")?, "delta")?;

        let crdt_tag = as_integer(require(delta_map, "crdt")?, "crdt")?;
        let crdt = u8::try_from(crdt_tag)
            .ok()
            .and_then(CrdtType::from_tag)
            .ok_or_else(|| BlockError::Malformed(format!("unknown crdt tag {crdt_tag}")))?;

        let doc_id = as_string(require(delta_map, "docID")?, "docID")?;
        let field_name = match require(delta_map, "fieldName")? {
            Ipld::Null => None,
            other => Some(as_string(other, "fieldName")?),
        };
        let payload = match require(delta_map, "payload")? {
            Ipld::Bytes(bytes) => bytes.clone(),
            _ => return Err(BlockError::Malformed("payload must be bytes".to_string())),
        };
        let priority = as_integer(require(delta_map, "priority")?, "priority")?;
        let priority = u64::try_from(priority)
            .map_err(|_| BlockError::Malformed(format!("negative priority {priority}")))?;

        let links_list = match require(map, "links")? {
            Ipld::List(items) => items,
            _ => return Err(BlockError::Malformed("links must be a list".to_string())),
        };
        let mut links = Vec::with_capacity(links_list.len());
        for item in links_list {
            let link_map = as_map(item, "link")?;
            let name = as_string(require(link_map, "name")?, "link name")?;
            let cid = match require(link_map, "cid")? {
                Ipld::Link(cid) => *cid,
                _ => return Err(BlockError::Malformed("link cid must be a link".to_string())),
            };
            links.push(Link { name, cid });
        }

        let schema_version_id = as_string(require(map, "schemaVersionID")?, "schemaVersionID")?;

        Ok(Block {
            delta: Delta {
                doc_id,
                field_name,
                crdt,
                priority,
                payload,
            },
            links,
            schema_version_id,
        })
    }
}

/// CIDv1 over the canonical bytes.
pub fn cid_for(bytes: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(bytes))
}

fn as_map<'a>(ipld: &'a Ipld, what: &str) -> Result<&'a BTreeMap<String, Ipld>> {
    match ipld {
        Ipld::Map(map) => Ok(map),
        _ => Err(BlockError::Malformed(format!("{what} must be a map"))),
    }
}

fn require<'a>(map: &'a BTreeMap<String, Ipld>, key: &str) -> Result<&'a Ipld> {
    map.get(key)
        .ok_or_else(|| BlockError::Malformed(format!("missing key {key:?}")))
}

fn as_string(ipld: &Ipld, what: &str) -> Result<String> {
    match ipld {
        Ipld::String(s) => Ok(s.clone()),
        _ => Err(BlockError::Malformed(format!("{what} must be a string"))),
    }
}

fn as_integer(ipld: &Ipld, what: &str) -> Result<i128> {
    match ipld {
        Ipld::Integer(i) => Ok(*i),
        _ => Err(BlockError::Malformed(format!("{what} must be an integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block::new(
            Delta {
                doc_id: "bae-test".to_string(),
                field_name: Some("name".to_string()),
                crdt: CrdtType::Lww,
                priority: 3,
                payload: vec![1, 2, 3],
            },
            vec![
                Link::field("zzz", cid_for(b"z")),
                Link::head(cid_for(b"a")),
            ],
            "schema-v1",
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let block = sample_block();
        let (bytes, cid) = block.encode().unwrap();
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(decoded, block);

        let (bytes2, cid2) = decoded.encode().unwrap();
        assert_eq!(bytes, bytes2);
        assert_eq!(cid, cid2);
    }

    #[test]
    fn test_links_sorted_for_stable_cid() {
        let a = Block::new(
            sample_block().delta,
            vec![Link::head(cid_for(b"a")), Link::field("zzz", cid_for(b"z"))],
            "schema-v1",
        );
        let b = sample_block();
        assert_eq!(a.cid().unwrap(), b.cid().unwrap());
        // `_head` sorts before field names.
        assert_eq!(a.links[0].name, HEAD_LINK_NAME);
    }

    #[test]
    fn test_cid_is_base32_lower_v1() {
        let (_, cid) = sample_block().encode().unwrap();
        let text = cid.to_string();
        assert!(text.starts_with('b'), "v1 base32 text form: {text}");
        assert_eq!(text, text.to_lowercase());
        assert_eq!(cid.codec(), DAG_CBOR);
    }

    #[test]
    fn test_decode_rejects_unknown_crdt_tag() {
        let mut block = sample_block();
        block.delta.crdt = CrdtType::Lww;
        let (bytes, _) = block.encode().unwrap();

        // Re-encode with a bogus crdt tag.
        let ipld: Ipld = DagCborCodec.decode(&bytes).unwrap();
        let mut map = match ipld {
            Ipld::Map(map) => map,
            _ => unreachable!(),
        };
        let mut delta = match map.remove("delta").unwrap() {
            Ipld::Map(delta) => delta,
            _ => unreachable!(),
        };
        delta.insert("crdt".to_string(), Ipld::Integer(99));
        map.insert("delta".to_string(), Ipld::Map(delta));
        let bad = DagCborCodec.encode(&Ipld::Map(map)).unwrap();

        assert!(matches!(
            Block::decode(&bad),
            Err(BlockError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_keys() {
        let ipld = Ipld::Map(BTreeMap::from([(
            "links".to_string(),
            Ipld::List(vec![]),
        )]));
        let bytes = DagCborCodec.encode(&ipld).unwrap();
        assert!(matches!(
            Block::decode(&bytes),
            Err(BlockError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage_bytes() {
        assert!(matches!(
            Block::decode(&[0xff, 0x00, 0x13]),
            Err(BlockError::Malformed(_))
        ));
    }

    #[test]
    fn test_composite_delta_has_no_field_name() {
        let block = Block::new(
            Delta {
                doc_id: "bae-test".to_string(),
                field_name: None,
                crdt: CrdtType::Composite,
                priority: 1,
                payload: vec![],
            },
            vec![],
            "schema-v1",
        );
        let (bytes, _) = block.encode().unwrap();
        let decoded = Block::decode(&bytes).unwrap();
        assert!(decoded.is_composite());
        assert_eq!(decoded.delta.field_name, None);
    }
}
