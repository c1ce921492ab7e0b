//! Composite register.
//!
//! The document-level register. Its payload is the canonical snapshot of
//! the document's fields at the moment of the write; its block links every
//! field head it consumed, which makes the whole document reachable from a
//! single head. It holds no user data beyond the snapshot and merges like
//! an LWW register over `(priority, cid)`.

use std::collections::BTreeMap;

use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};

use keel_values::NormalValue;

use crate::{AppliedDelta, Register, RegisterError, Result};

/// Persisted composite state: the winning snapshot and its provenance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeState {
    pub payload: Vec<u8>,
    pub priority: u64,
    pub cid: Cid,
}

impl CompositeState {
    fn loses_to(&self, priority: u64, cid: &Cid) -> bool {
        (priority, cid.to_bytes()) > (self.priority, self.cid.to_bytes())
    }
}

/// The composite register family.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompositeRegister;

impl CompositeRegister {
    /// Canonical snapshot bytes for a field map: a DAG-CBOR map from field
    /// name to the field's canonical value form, keys sorted.
    pub fn snapshot_payload(fields: &BTreeMap<String, NormalValue>) -> Result<Vec<u8>> {
        let map: BTreeMap<String, Ipld> = fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_ipld()))
            .collect();
        DagCborCodec
            .encode(&Ipld::Map(map))
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }

    /// Decode a snapshot back into its field map.
    pub fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<String, Ipld>> {
        let ipld: Ipld = DagCborCodec
            .decode(bytes)
            .map_err(|e| RegisterError::Malformed(e.to_string()))?;
        match ipld {
            Ipld::Map(map) => Ok(map),
            _ => Err(RegisterError::Malformed(
                "snapshot must be a map".to_string(),
            )),
        }
    }
}

impl Register for CompositeRegister {
    type Input = BTreeMap<String, NormalValue>;
    type State = CompositeState;
    type Value = BTreeMap<String, Ipld>;

    fn new_delta(&self, input: &BTreeMap<String, NormalValue>) -> Result<Vec<u8>> {
        Self::snapshot_payload(input)
    }

    fn merge(&self, state: Option<CompositeState>, delta: AppliedDelta<'_>) -> Result<CompositeState> {
        match state {
            Some(state) if !state.loses_to(delta.priority, &delta.cid) => Ok(state),
            _ => Ok(CompositeState {
                payload: delta.payload.to_vec(),
                priority: delta.priority,
                cid: delta.cid,
            }),
        }
    }

    fn materialize(&self, state: &CompositeState) -> Result<BTreeMap<String, Ipld>> {
        Self::decode_snapshot(&state.payload)
    }
}
