//! Positive/negative counter register.
//!
//! The state is the full log of signed increments, kept sorted by
//! `(priority, cid)`. Increment payloads stay opaque in the log — they may
//! be ciphertext — and are only decoded at materialization time. Integer
//! addition commutes, but IEEE-754 addition does not under rounding, so
//! materialization always folds the log in its sorted order: every replica
//! that holds the same delta set computes a bit-identical sum.

use std::collections::BTreeMap;

use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};

use crate::{AppliedDelta, Register, RegisterError, Result};

/// A signed increment or a materialized sum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Int(i64),
    Float(f64),
}

impl CounterValue {
    fn to_ipld(self) -> Ipld {
        match self {
            CounterValue::Int(i) => Ipld::Integer(i as i128),
            CounterValue::Float(f) => Ipld::Float(f),
        }
    }

    fn from_ipld(ipld: &Ipld) -> Result<CounterValue> {
        match ipld {
            Ipld::Integer(i) => i64::try_from(*i)
                .map(CounterValue::Int)
                .map_err(|_| RegisterError::Malformed(format!("increment {i} overflows i64"))),
            Ipld::Float(f) => Ok(CounterValue::Float(*f)),
            _ => Err(RegisterError::TypeMismatch(
                "counter increment must be a number".to_string(),
            )),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<CounterValue> {
        let ipld: Ipld = DagCborCodec
            .decode(bytes)
            .map_err(|e| RegisterError::Malformed(e.to_string()))?;
        CounterValue::from_ipld(&ipld)
    }
}

/// One accepted increment, payload still opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterEntry {
    pub priority: u64,
    pub cid: Cid,
    pub payload: Vec<u8>,
}

/// The ordered increment log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PnCounterState {
    entries: Vec<CounterEntry>,
}

impl PnCounterState {
    pub fn entries(&self) -> &[CounterEntry] {
        &self.entries
    }

    /// Insert keeping `(priority, cid)` order; re-delivery is a no-op.
    fn insert(&mut self, entry: CounterEntry) {
        let key = (entry.priority, entry.cid.to_bytes());
        let position = self
            .entries
            .binary_search_by(|e| (e.priority, e.cid.to_bytes()).cmp(&key));
        match position {
            Ok(_) => {}
            Err(index) => self.entries.insert(index, entry),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let list = self
            .entries
            .iter()
            .map(|entry| {
                let mut map = BTreeMap::new();
                map.insert("cid".to_string(), Ipld::Link(entry.cid));
                map.insert(
                    "priority".to_string(),
                    Ipld::Integer(entry.priority as i128),
                );
                map.insert("payload".to_string(), Ipld::Bytes(entry.payload.clone()));
                Ipld::Map(map)
            })
            .collect();
        DagCborCodec
            .encode(&Ipld::List(list))
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<PnCounterState> {
        let ipld: Ipld = DagCborCodec
            .decode(bytes)
            .map_err(|e| RegisterError::Malformed(e.to_string()))?;
        let list = match &ipld {
            Ipld::List(list) => list,
            _ => {
                return Err(RegisterError::Malformed(
                    "counter state must be a list".to_string(),
                ))
            }
        };
        let mut state = PnCounterState::default();
        for item in list {
            let map = match item {
                Ipld::Map(map) => map,
                _ => {
                    return Err(RegisterError::Malformed(
                        "counter entry must be a map".to_string(),
                    ))
                }
            };
            let cid = match map.get("cid") {
                Some(Ipld::Link(cid)) => *cid,
                _ => return Err(RegisterError::Malformed("missing entry cid".to_string())),
            };
            let priority = match map.get("priority") {
                Some(Ipld::Integer(i)) => u64::try_from(*i)
                    .map_err(|_| RegisterError::Malformed("negative priority".to_string()))?,
                _ => {
                    return Err(RegisterError::Malformed(
                        "missing entry priority".to_string(),
                    ))
                }
            };
            let payload = match map.get("payload") {
                Some(Ipld::Bytes(bytes)) => bytes.clone(),
                _ => {
                    return Err(RegisterError::Malformed(
                        "missing entry payload".to_string(),
                    ))
                }
            };
            state.insert(CounterEntry {
                priority,
                cid,
                payload,
            });
        }
        Ok(state)
    }
}

/// The PN-counter register family.
#[derive(Clone, Copy, Debug, Default)]
pub struct PnCounter;

impl PnCounter {
    /// Fold the log in `(priority, cid)` order, passing each payload
    /// through `open` first (the decryption hook).
    ///
    /// Integer sums wrap on overflow; wrapping keeps replicas identical
    /// where saturation at different fold points would not.
    pub fn materialize_with<F>(&self, state: &PnCounterState, mut open: F) -> Result<CounterValue>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        let mut values = Vec::with_capacity(state.entries.len());
        let mut has_float = false;
        for entry in &state.entries {
            let plain = open(&entry.payload)?;
            let value = CounterValue::decode(&plain)?;
            has_float |= matches!(value, CounterValue::Float(_));
            values.push(value);
        }

        if has_float {
            let mut sum = 0f64;
            for value in values {
                sum += match value {
                    CounterValue::Int(i) => i as f64,
                    CounterValue::Float(f) => f,
                };
            }
            Ok(CounterValue::Float(sum))
        } else {
            let mut sum = 0i64;
            for value in values {
                if let CounterValue::Int(i) = value {
                    sum = sum.wrapping_add(i);
                }
            }
            Ok(CounterValue::Int(sum))
        }
    }
}

impl Register for PnCounter {
    type Input = CounterValue;
    type State = PnCounterState;
    type Value = CounterValue;

    fn new_delta(&self, input: &CounterValue) -> Result<Vec<u8>> {
        DagCborCodec
            .encode(&input.to_ipld())
            .map_err(|e| RegisterError::Malformed(e.to_string()))
    }

    /// Append the increment without inspecting it.
    fn merge(&self, state: Option<PnCounterState>, delta: AppliedDelta<'_>) -> Result<PnCounterState> {
        let mut state = state.unwrap_or_default();
        state.insert(CounterEntry {
            priority: delta.priority,
            cid: delta.cid,
            payload: delta.payload.to_vec(),
        });
        Ok(state)
    }

    fn materialize(&self, state: &PnCounterState) -> Result<CounterValue> {
        self.materialize_with(state, |bytes| Ok(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_merkle::cid_for;

    fn apply(
        state: Option<PnCounterState>,
        value: CounterValue,
        priority: u64,
        seed: &[u8],
    ) -> PnCounterState {
        let reg = PnCounter;
        let payload = reg.new_delta(&value).unwrap();
        reg.merge(
            state,
            AppliedDelta {
                payload: &payload,
                priority,
                cid: cid_for(seed),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_int_sum_with_negatives() {
        let state = apply(None, CounterValue::Int(10), 1, b"a");
        let state = apply(Some(state), CounterValue::Int(-3), 2, b"b");
        let state = apply(Some(state), CounterValue::Int(5), 3, b"c");
        assert_eq!(
            PnCounter.materialize(&state).unwrap(),
            CounterValue::Int(12)
        );
    }

    #[test]
    fn test_delivery_order_does_not_matter() {
        let deltas = [
            (CounterValue::Float(0.1), 1u64, b"a" as &[u8]),
            (CounterValue::Float(0.2), 2, b"b"),
            (CounterValue::Float(0.3), 2, b"c"),
            (CounterValue::Float(1e16), 3, b"d"),
        ];

        let mut forward = None;
        for (value, priority, seed) in deltas {
            forward = Some(apply(forward, value, priority, seed));
        }
        let mut backward = None;
        for (value, priority, seed) in deltas.into_iter().rev() {
            backward = Some(apply(backward, value, priority, seed));
        }

        let a = PnCounter.materialize(&forward.unwrap()).unwrap();
        let b = PnCounter.materialize(&backward.unwrap()).unwrap();
        // Bit-identical, not merely approximately equal.
        match (a, b) {
            (CounterValue::Float(a), CounterValue::Float(b)) => {
                assert_eq!(a.to_bits(), b.to_bits())
            }
            _ => panic!("expected float sums"),
        }
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let state = apply(None, CounterValue::Int(4), 1, b"a");
        let state = apply(Some(state), CounterValue::Int(4), 1, b"a");
        assert_eq!(state.entries().len(), 1);
        assert_eq!(PnCounter.materialize(&state).unwrap(), CounterValue::Int(4));
    }

    #[test]
    fn test_state_encode_decode_roundtrip() {
        let state = apply(None, CounterValue::Int(2), 1, b"a");
        let state = apply(Some(state), CounterValue::Int(-7), 2, b"b");
        let bytes = state.encode().unwrap();
        assert_eq!(PnCounterState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn test_mixed_family_promotes_to_float() {
        let state = apply(None, CounterValue::Int(2), 1, b"a");
        let state = apply(Some(state), CounterValue::Float(0.5), 2, b"b");
        assert_eq!(
            PnCounter.materialize(&state).unwrap(),
            CounterValue::Float(2.5)
        );
    }

    #[test]
    fn test_materialize_with_open_hook() {
        // Payloads XOR-masked to stand in for ciphertext.
        let reg = PnCounter;
        let masked: Vec<u8> = reg
            .new_delta(&CounterValue::Int(9))
            .unwrap()
            .iter()
            .map(|b| b ^ 0x5a)
            .collect();
        let state = reg
            .merge(
                None,
                AppliedDelta {
                    payload: &masked,
                    priority: 1,
                    cid: cid_for(b"m"),
                },
            )
            .unwrap();

        let sum = reg
            .materialize_with(&state, |bytes| {
                Ok(bytes.iter().map(|b| b ^ 0x5a).collect())
            })
            .unwrap();
        assert_eq!(sum, CounterValue::Int(9));
    }
}
