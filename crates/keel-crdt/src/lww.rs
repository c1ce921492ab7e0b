//! Last-Writer-Wins register.
//!
//! The state keeps the winning payload together with the `(priority, cid)`
//! pair that won it. A delta is accepted iff its pair is strictly greater,
//! comparing priority first and breaking ties on the cid bytes. Payloads are
//! opaque — possibly ciphertext — so replicas agree on the winner without
//! ever reading the value.

use std::collections::BTreeMap;

use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};

use keel_values::NormalValue;

use crate::{AppliedDelta, Register, RegisterError, Result};

/// Persisted LWW state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LwwState {
    pub payload: Vec<u8>,
    pub priority: u64,
    pub cid: Cid,
}

impl LwwState {
    /// True if `(priority, cid)` beats this state.
    pub fn loses_to(&self, priority: u64, cid: &Cid) -> bool {
        (priority, cid.to_bytes()) > (self.priority, self.cid.to_bytes())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = BTreeMap::new();
        map.insert("cid".to_string(), Ipld::Link(self.cid));
        map.insert("payload".to_string(), Ipld::Bytes(self.payload.clone()));
        map.insert("priority".to_string(), Ipld::Integer(self.priority as i128));
        DagCborCodec
            .encode(&Ipld::Map(map))
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<LwwState> {
        let ipld: Ipld = DagCborCodec
            .decode(bytes)
            .map_err(|e| RegisterError::Malformed(e.to_string()))?;
        let map = match &ipld {
            Ipld::Map(map) => map,
            _ => return Err(RegisterError::Malformed("state must be a map".to_string())),
        };
        let cid = match map.get("cid") {
            Some(Ipld::Link(cid)) => *cid,
            _ => return Err(RegisterError::Malformed("missing state cid".to_string())),
        };
        let payload = match map.get("payload") {
            Some(Ipld::Bytes(bytes)) => bytes.clone(),
            _ => return Err(RegisterError::Malformed("missing state payload".to_string())),
        };
        let priority = match map.get("priority") {
            Some(Ipld::Integer(i)) => u64::try_from(*i)
                .map_err(|_| RegisterError::Malformed("negative priority".to_string()))?,
            _ => return Err(RegisterError::Malformed("missing state priority".to_string())),
        };
        Ok(LwwState {
            payload,
            priority,
            cid,
        })
    }
}

/// The LWW register family.
#[derive(Clone, Copy, Debug, Default)]
pub struct LwwRegister;

impl Register for LwwRegister {
    type Input = NormalValue;
    type State = LwwState;
    type Value = Ipld;

    /// The payload is the canonical encoding of the normalized value.
    fn new_delta(&self, input: &NormalValue) -> Result<Vec<u8>> {
        DagCborCodec
            .encode(&input.to_ipld())
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }

    fn merge(&self, state: Option<LwwState>, delta: AppliedDelta<'_>) -> Result<LwwState> {
        match state {
            Some(state) if !state.loses_to(delta.priority, &delta.cid) => Ok(state),
            _ => Ok(LwwState {
                payload: delta.payload.to_vec(),
                priority: delta.priority,
                cid: delta.cid,
            }),
        }
    }

    /// Decode the winning payload. Encrypted payloads must be decrypted
    /// before this is meaningful.
    fn materialize(&self, state: &LwwState) -> Result<Ipld> {
        DagCborCodec
            .decode(&state.payload)
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_merkle::cid_for;

    fn delta(payload: &[u8], priority: u64, seed: &[u8]) -> (Vec<u8>, u64, Cid) {
        (payload.to_vec(), priority, cid_for(seed))
    }

    fn apply(reg: &LwwRegister, state: Option<LwwState>, d: &(Vec<u8>, u64, Cid)) -> LwwState {
        reg.merge(
            state,
            AppliedDelta {
                payload: &d.0,
                priority: d.1,
                cid: d.2,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_higher_priority_wins() {
        let reg = LwwRegister;
        let d1 = delta(b"old", 1, b"a");
        let d2 = delta(b"new", 2, b"b");

        let state = apply(&reg, None, &d1);
        let state = apply(&reg, Some(state), &d2);
        assert_eq!(state.payload, b"new");

        // Stale delta does not regress the state.
        let state = apply(&reg, Some(state), &d1);
        assert_eq!(state.payload, b"new");
        assert_eq!(state.priority, 2);
    }

    #[test]
    fn test_tiebreak_on_cid_is_symmetric() {
        let reg = LwwRegister;
        let d1 = delta(b"one", 5, b"a");
        let d2 = delta(b"two", 5, b"b");

        let ab = apply(&reg, Some(apply(&reg, None, &d1)), &d2);
        let ba = apply(&reg, Some(apply(&reg, None, &d2)), &d1);
        assert_eq!(ab, ba);

        // The winner is exactly the delta with the greater cid bytes.
        let expected = if d1.2.to_bytes() > d2.2.to_bytes() {
            &d1
        } else {
            &d2
        };
        assert_eq!(ab.payload, expected.0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let reg = LwwRegister;
        let d = delta(b"x", 3, b"seed");
        let once = apply(&reg, None, &d);
        let twice = apply(&reg, Some(once.clone()), &d);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_state_encode_decode_roundtrip() {
        let state = LwwState {
            payload: vec![1, 2, 3],
            priority: 7,
            cid: cid_for(b"seed"),
        };
        let bytes = state.encode().unwrap();
        assert_eq!(LwwState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn test_new_delta_and_materialize() {
        let reg = LwwRegister;
        let value = NormalValue::new_string("Bob");
        let payload = reg.new_delta(&value).unwrap();
        let state = reg
            .merge(
                None,
                AppliedDelta {
                    payload: &payload,
                    priority: 1,
                    cid: cid_for(b"w"),
                },
            )
            .unwrap();
        assert_eq!(
            reg.materialize(&state).unwrap(),
            Ipld::String("Bob".to_string())
        );
    }
}
