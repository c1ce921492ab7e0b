//! Normalized values.
//!
//! A [`NormalValue`] is the canonical, tagged representation of a field
//! value, aligned with the field's declared [`FieldKind`]. Construction goes
//! through [`NormalValue::from_wire`], which applies the coercion rules, or
//! through the per-variant builders. Accessors never panic: asking for a
//! variant the value does not hold returns `None`.

use libipld::Ipld;

use crate::error::{CoercionError, Result};
use crate::kind::{BaseKind, Container, FieldKind, ScalarKind};
use crate::wire::WireValue;

/// The stored representation. Which variant is legal is fixed by the kind.
#[derive(Clone, Debug, PartialEq)]
enum Repr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(String),
    /// Microseconds since the Unix epoch.
    Time(i64),
    DocId(String),
    ObjectRef(String),
    ObjectRefArray(Vec<String>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
    BytesArray(Vec<Vec<u8>>),
    JsonArray(Vec<String>),
    TimeArray(Vec<i64>),
    NillableBoolArray(Vec<Option<bool>>),
    NillableIntArray(Vec<Option<i64>>),
    NillableFloatArray(Vec<Option<f64>>),
    NillableStrArray(Vec<Option<String>>),
    NillableBytesArray(Vec<Option<Vec<u8>>>),
    NillableJsonArray(Vec<Option<String>>),
    NillableTimeArray(Vec<Option<i64>>),
}

/// A normalized field value.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalValue {
    kind: FieldKind,
    repr: Repr,
}

impl NormalValue {
    /// Normalize a wire value against the declared kind.
    pub fn from_wire(value: WireValue, kind: &FieldKind) -> Result<NormalValue> {
        if value.is_null() {
            return Self::new_nil(kind.clone());
        }
        let repr = match kind {
            FieldKind::None => return Err(CoercionError::of_kind(value, kind)),
            FieldKind::DocId => match &value {
                WireValue::String(s) => Repr::DocId(s.clone()),
                _ => return Err(CoercionError::of_kind(value, kind)),
            },
            FieldKind::Object(_) => match &value {
                WireValue::String(s) => Repr::ObjectRef(s.clone()),
                _ => return Err(CoercionError::of_kind(value, kind)),
            },
            FieldKind::ObjectArray(_) => match &value {
                WireValue::Array(items) => match coerce_elems(items, str_elem) {
                    Some(ids) => Repr::ObjectRefArray(ids),
                    None => return Err(CoercionError::of_kind(value, kind)),
                },
                _ => return Err(CoercionError::of_kind(value, kind)),
            },
            FieldKind::Scalar(s) => match s.container {
                Container::Scalar => match coerce_scalar(&value, s.base) {
                    Some(repr) => repr,
                    None => return Err(CoercionError::of_kind(value, kind)),
                },
                Container::Array | Container::NillableArray => {
                    let items = match &value {
                        WireValue::Array(items) => items,
                        _ => return Err(CoercionError::of_kind(value, kind)),
                    };
                    match coerce_array(items, s) {
                        Some(repr) => repr,
                        None => return Err(CoercionError::of_kind(value, kind)),
                    }
                }
            },
        };
        Ok(NormalValue {
            kind: kind.clone(),
            repr,
        })
    }

    /// A nil value of the given kind. Fails unless the kind is nillable.
    pub fn new_nil(kind: FieldKind) -> Result<NormalValue> {
        if !kind.is_nillable() {
            return Err(CoercionError::of_kind(WireValue::Null, &kind));
        }
        Ok(NormalValue {
            kind,
            repr: Repr::Nil,
        })
    }

    /// The declared kind of this value.
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.repr, Repr::Nil)
    }

    pub fn is_nillable(&self) -> bool {
        self.kind.is_nillable()
    }

    pub fn is_array(&self) -> bool {
        self.kind.is_array()
    }

    /// The untyped wire form of this value.
    pub fn unwrap(&self) -> WireValue {
        match &self.repr {
            Repr::Nil => WireValue::Null,
            Repr::Bool(b) => WireValue::Bool(*b),
            Repr::Int(i) => WireValue::Int(*i),
            Repr::Float(f) => WireValue::Float(*f),
            Repr::Str(s) => WireValue::String(s.clone()),
            Repr::Bytes(b) => WireValue::Bytes(b.clone()),
            Repr::Json(s) => WireValue::String(s.clone()),
            Repr::Time(t) => WireValue::DateTime(*t),
            Repr::DocId(s) | Repr::ObjectRef(s) => WireValue::String(s.clone()),
            Repr::ObjectRefArray(ids) => {
                WireValue::Array(ids.iter().cloned().map(WireValue::String).collect())
            }
            Repr::BoolArray(v) => WireValue::Array(v.iter().map(|b| WireValue::Bool(*b)).collect()),
            Repr::IntArray(v) => WireValue::Array(v.iter().map(|i| WireValue::Int(*i)).collect()),
            Repr::FloatArray(v) => {
                WireValue::Array(v.iter().map(|f| WireValue::Float(*f)).collect())
            }
            Repr::StrArray(v) => {
                WireValue::Array(v.iter().cloned().map(WireValue::String).collect())
            }
            Repr::BytesArray(v) => {
                WireValue::Array(v.iter().cloned().map(WireValue::Bytes).collect())
            }
            Repr::JsonArray(v) => {
                WireValue::Array(v.iter().cloned().map(WireValue::String).collect())
            }
            Repr::TimeArray(v) => {
                WireValue::Array(v.iter().map(|t| WireValue::DateTime(*t)).collect())
            }
            Repr::NillableBoolArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.map_or(WireValue::Null, WireValue::Bool))
                    .collect(),
            ),
            Repr::NillableIntArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.map_or(WireValue::Null, WireValue::Int))
                    .collect(),
            ),
            Repr::NillableFloatArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.map_or(WireValue::Null, WireValue::Float))
                    .collect(),
            ),
            Repr::NillableStrArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.clone().map_or(WireValue::Null, WireValue::String))
                    .collect(),
            ),
            Repr::NillableBytesArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.clone().map_or(WireValue::Null, WireValue::Bytes))
                    .collect(),
            ),
            Repr::NillableJsonArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.clone().map_or(WireValue::Null, WireValue::String))
                    .collect(),
            ),
            Repr::NillableTimeArray(v) => WireValue::Array(
                v.iter()
                    .map(|e| e.map_or(WireValue::Null, WireValue::DateTime))
                    .collect(),
            ),
        }
    }

    /// The canonical Ipld form used for block payloads and stored values.
    ///
    /// Numbers take their shortest integral form: a float that is a whole
    /// number within `i64` range encodes as an integer. Coercion at the
    /// declared kind restores the float on the way back in.
    pub fn to_ipld(&self) -> Ipld {
        match &self.repr {
            Repr::Nil => Ipld::Null,
            Repr::Bool(b) => Ipld::Bool(*b),
            Repr::Int(i) => Ipld::Integer(*i as i128),
            Repr::Float(f) => float_ipld(*f),
            Repr::Str(s) | Repr::Json(s) => Ipld::String(s.clone()),
            Repr::Bytes(b) => Ipld::Bytes(b.clone()),
            Repr::Time(t) => Ipld::Integer(*t as i128),
            Repr::DocId(s) | Repr::ObjectRef(s) => Ipld::String(s.clone()),
            Repr::ObjectRefArray(ids) => {
                Ipld::List(ids.iter().cloned().map(Ipld::String).collect())
            }
            Repr::BoolArray(v) => Ipld::List(v.iter().map(|b| Ipld::Bool(*b)).collect()),
            Repr::IntArray(v) => Ipld::List(v.iter().map(|i| Ipld::Integer(*i as i128)).collect()),
            Repr::FloatArray(v) => Ipld::List(v.iter().map(|f| float_ipld(*f)).collect()),
            Repr::StrArray(v) | Repr::JsonArray(v) => {
                Ipld::List(v.iter().cloned().map(Ipld::String).collect())
            }
            Repr::BytesArray(v) => Ipld::List(v.iter().cloned().map(Ipld::Bytes).collect()),
            Repr::TimeArray(v) => Ipld::List(v.iter().map(|t| Ipld::Integer(*t as i128)).collect()),
            Repr::NillableBoolArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.map_or(Ipld::Null, Ipld::Bool))
                    .collect(),
            ),
            Repr::NillableIntArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.map_or(Ipld::Null, |i| Ipld::Integer(i as i128)))
                    .collect(),
            ),
            Repr::NillableFloatArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.map_or(Ipld::Null, float_ipld))
                    .collect(),
            ),
            Repr::NillableStrArray(v) | Repr::NillableJsonArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.clone().map_or(Ipld::Null, Ipld::String))
                    .collect(),
            ),
            Repr::NillableBytesArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.clone().map_or(Ipld::Null, Ipld::Bytes))
                    .collect(),
            ),
            Repr::NillableTimeArray(v) => Ipld::List(
                v.iter()
                    .map(|e| e.map_or(Ipld::Null, |t| Ipld::Integer(t as i128)))
                    .collect(),
            ),
        }
    }

    /// Rebuild a normalized value from its canonical Ipld form.
    pub fn from_ipld(ipld: &Ipld, kind: &FieldKind) -> Result<NormalValue> {
        Self::from_wire(ipld_to_wire(ipld), kind)
    }

    // ---- typed builders ----

    pub fn new_bool(v: bool) -> NormalValue {
        Self::scalar(BaseKind::Bool, false, Repr::Bool(v))
    }

    pub fn new_int(v: i64) -> NormalValue {
        Self::scalar(BaseKind::Int, false, Repr::Int(v))
    }

    pub fn new_float(v: f64) -> NormalValue {
        Self::scalar(BaseKind::Float, false, Repr::Float(v))
    }

    pub fn new_string(v: impl Into<String>) -> NormalValue {
        Self::scalar(BaseKind::String, false, Repr::Str(v.into()))
    }

    pub fn new_bytes(v: Vec<u8>) -> NormalValue {
        Self::scalar(BaseKind::Blob, false, Repr::Bytes(v))
    }

    pub fn new_json(v: impl Into<String>) -> NormalValue {
        Self::scalar(BaseKind::Json, false, Repr::Json(v.into()))
    }

    /// Builds a DateTime value from microseconds since the Unix epoch.
    pub fn new_time(micros: i64) -> NormalValue {
        Self::scalar(BaseKind::DateTime, false, Repr::Time(micros))
    }

    pub fn new_doc_id(v: impl Into<String>) -> NormalValue {
        NormalValue {
            kind: FieldKind::DocId,
            repr: Repr::DocId(v.into()),
        }
    }

    pub fn new_bool_array(v: Vec<bool>) -> NormalValue {
        Self::array(BaseKind::Bool, false, Repr::BoolArray(v))
    }

    pub fn new_int_array(v: Vec<i64>) -> NormalValue {
        Self::array(BaseKind::Int, false, Repr::IntArray(v))
    }

    pub fn new_float_array(v: Vec<f64>) -> NormalValue {
        Self::array(BaseKind::Float, false, Repr::FloatArray(v))
    }

    pub fn new_string_array(v: Vec<String>) -> NormalValue {
        Self::array(BaseKind::String, false, Repr::StrArray(v))
    }

    pub fn new_bytes_array(v: Vec<Vec<u8>>) -> NormalValue {
        Self::array(BaseKind::Blob, false, Repr::BytesArray(v))
    }

    pub fn new_json_array(v: Vec<String>) -> NormalValue {
        Self::array(BaseKind::Json, false, Repr::JsonArray(v))
    }

    pub fn new_time_array(v: Vec<i64>) -> NormalValue {
        Self::array(BaseKind::DateTime, false, Repr::TimeArray(v))
    }

    pub fn new_nillable_bool_array(v: Vec<Option<bool>>) -> NormalValue {
        Self::array(BaseKind::Bool, true, Repr::NillableBoolArray(v))
    }

    pub fn new_nillable_int_array(v: Vec<Option<i64>>) -> NormalValue {
        Self::array(BaseKind::Int, true, Repr::NillableIntArray(v))
    }

    pub fn new_nillable_float_array(v: Vec<Option<f64>>) -> NormalValue {
        Self::array(BaseKind::Float, true, Repr::NillableFloatArray(v))
    }

    pub fn new_nillable_string_array(v: Vec<Option<String>>) -> NormalValue {
        Self::array(BaseKind::String, true, Repr::NillableStrArray(v))
    }

    pub fn new_nillable_bytes_array(v: Vec<Option<Vec<u8>>>) -> NormalValue {
        Self::array(BaseKind::Blob, true, Repr::NillableBytesArray(v))
    }

    pub fn new_nillable_json_array(v: Vec<Option<String>>) -> NormalValue {
        Self::array(BaseKind::Json, true, Repr::NillableJsonArray(v))
    }

    pub fn new_nillable_time_array(v: Vec<Option<i64>>) -> NormalValue {
        Self::array(BaseKind::DateTime, true, Repr::NillableTimeArray(v))
    }

    fn scalar(base: BaseKind, nillable: bool, repr: Repr) -> NormalValue {
        NormalValue {
            kind: FieldKind::Scalar(ScalarKind::new(base, nillable, Container::Scalar)),
            repr,
        }
    }

    fn array(base: BaseKind, nillable: bool, repr: Repr) -> NormalValue {
        NormalValue {
            kind: FieldKind::Scalar(ScalarKind::new(base, nillable, Container::Array)),
            repr,
        }
    }

    // ---- typed accessors ----

    pub fn as_bool(&self) -> Option<bool> {
        match self.repr {
            Repr::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.repr {
            Repr::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.repr {
            Repr::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match &self.repr {
            Repr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&str> {
        match &self.repr {
            Repr::Json(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<i64> {
        match self.repr {
            Repr::Time(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_doc_id(&self) -> Option<&str> {
        match &self.repr {
            Repr::DocId(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_ref(&self) -> Option<&str> {
        match &self.repr {
            Repr::ObjectRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_ref_array(&self) -> Option<&[String]> {
        match &self.repr {
            Repr::ObjectRefArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool_array(&self) -> Option<&[bool]> {
        match &self.repr {
            Repr::BoolArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[i64]> {
        match &self.repr {
            Repr::IntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_array(&self) -> Option<&[f64]> {
        match &self.repr {
            Repr::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match &self.repr {
            Repr::StrArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes_array(&self) -> Option<&[Vec<u8>]> {
        match &self.repr {
            Repr::BytesArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json_array(&self) -> Option<&[String]> {
        match &self.repr {
            Repr::JsonArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time_array(&self) -> Option<&[i64]> {
        match &self.repr {
            Repr::TimeArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_bool_array(&self) -> Option<&[Option<bool>]> {
        match &self.repr {
            Repr::NillableBoolArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_int_array(&self) -> Option<&[Option<i64>]> {
        match &self.repr {
            Repr::NillableIntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_float_array(&self) -> Option<&[Option<f64>]> {
        match &self.repr {
            Repr::NillableFloatArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_string_array(&self) -> Option<&[Option<String>]> {
        match &self.repr {
            Repr::NillableStrArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_bytes_array(&self) -> Option<&[Option<Vec<u8>>]> {
        match &self.repr {
            Repr::NillableBytesArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_json_array(&self) -> Option<&[Option<String>]> {
        match &self.repr {
            Repr::NillableJsonArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nillable_time_array(&self) -> Option<&[Option<i64>]> {
        match &self.repr {
            Repr::NillableTimeArray(v) => Some(v),
            _ => None,
        }
    }
}

/// Shortest-form number encoding: whole floats within `i64` range encode as
/// integers so the canonical bytes stay stable across writers.
fn float_ipld(f: f64) -> Ipld {
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64 {
        Ipld::Integer(f as i64 as i128)
    } else {
        Ipld::Float(f)
    }
}

fn ipld_to_wire(ipld: &Ipld) -> WireValue {
    match ipld {
        Ipld::Null => WireValue::Null,
        Ipld::Bool(b) => WireValue::Bool(*b),
        Ipld::Integer(i) => {
            if let Ok(v) = i64::try_from(*i) {
                WireValue::Int(v)
            } else if let Ok(v) = u64::try_from(*i) {
                WireValue::Uint(v)
            } else {
                WireValue::Float(*i as f64)
            }
        }
        Ipld::Float(f) => WireValue::Float(*f),
        Ipld::String(s) => WireValue::String(s.clone()),
        Ipld::Bytes(b) => WireValue::Bytes(b.clone()),
        Ipld::List(items) => WireValue::Array(items.iter().map(ipld_to_wire).collect()),
        Ipld::Map(map) => WireValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), ipld_to_wire(v)))
                .collect(),
        ),
        Ipld::Link(cid) => WireValue::String(cid.to_string()),
    }
}

// ---- element coercion ----

fn bool_elem(v: &WireValue) -> Option<bool> {
    match v {
        WireValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn int_elem(v: &WireValue) -> Option<i64> {
    match v {
        WireValue::Int(i) => Some(*i),
        WireValue::Uint(u) => i64::try_from(*u).ok(),
        WireValue::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64 => {
            Some(*f as i64)
        }
        _ => None,
    }
}

fn float_elem(v: &WireValue) -> Option<f64> {
    match v {
        WireValue::Int(i) => Some(*i as f64),
        WireValue::Uint(u) => Some(*u as f64),
        WireValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn str_elem(v: &WireValue) -> Option<String> {
    match v {
        WireValue::String(s) => Some(s.clone()),
        WireValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
        _ => None,
    }
}

fn bytes_elem(v: &WireValue) -> Option<Vec<u8>> {
    match v {
        WireValue::String(s) => Some(s.clone().into_bytes()),
        WireValue::Bytes(b) => Some(b.clone()),
        _ => None,
    }
}

fn time_elem(v: &WireValue) -> Option<i64> {
    match v {
        WireValue::DateTime(t) => Some(*t),
        WireValue::Int(i) => Some(*i),
        WireValue::Uint(u) => i64::try_from(*u).ok(),
        _ => None,
    }
}

fn coerce_scalar(value: &WireValue, base: BaseKind) -> Option<Repr> {
    match base {
        BaseKind::Bool => bool_elem(value).map(Repr::Bool),
        BaseKind::Int => int_elem(value).map(Repr::Int),
        BaseKind::Float => float_elem(value).map(Repr::Float),
        BaseKind::String => str_elem(value).map(Repr::Str),
        BaseKind::Blob => bytes_elem(value).map(Repr::Bytes),
        // JSON keeps the source text verbatim; it is never re-parsed.
        BaseKind::Json => str_elem(value).map(Repr::Json),
        BaseKind::DateTime => time_elem(value).map(Repr::Time),
    }
}

/// Coerce every element or fail the whole array.
fn coerce_elems<T>(items: &[WireValue], f: impl Fn(&WireValue) -> Option<T>) -> Option<Vec<T>> {
    items.iter().map(|v| f(v)).collect()
}

fn coerce_nillable_elems<T>(
    items: &[WireValue],
    f: impl Fn(&WireValue) -> Option<T>,
) -> Option<Vec<Option<T>>> {
    items
        .iter()
        .map(|v| {
            if v.is_null() {
                Some(None)
            } else {
                f(v).map(Some)
            }
        })
        .collect()
}

fn coerce_array(items: &[WireValue], s: &ScalarKind) -> Option<Repr> {
    if s.nillable {
        match s.base {
            BaseKind::Bool => coerce_nillable_elems(items, bool_elem).map(Repr::NillableBoolArray),
            BaseKind::Int => coerce_nillable_elems(items, int_elem).map(Repr::NillableIntArray),
            BaseKind::Float => {
                coerce_nillable_elems(items, float_elem).map(Repr::NillableFloatArray)
            }
            BaseKind::String => coerce_nillable_elems(items, str_elem).map(Repr::NillableStrArray),
            BaseKind::Blob => {
                coerce_nillable_elems(items, bytes_elem).map(Repr::NillableBytesArray)
            }
            BaseKind::Json => coerce_nillable_elems(items, str_elem).map(Repr::NillableJsonArray),
            BaseKind::DateTime => {
                coerce_nillable_elems(items, time_elem).map(Repr::NillableTimeArray)
            }
        }
    } else {
        match s.base {
            BaseKind::Bool => coerce_elems(items, bool_elem).map(Repr::BoolArray),
            BaseKind::Int => coerce_elems(items, int_elem).map(Repr::IntArray),
            BaseKind::Float => coerce_elems(items, float_elem).map(Repr::FloatArray),
            BaseKind::String => coerce_elems(items, str_elem).map(Repr::StrArray),
            BaseKind::Blob => coerce_elems(items, bytes_elem).map(Repr::BytesArray),
            BaseKind::Json => coerce_elems(items, str_elem).map(Repr::JsonArray),
            BaseKind::DateTime => coerce_elems(items, time_elem).map(Repr::TimeArray),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(s: &str) -> FieldKind {
        FieldKind::parse(s).unwrap()
    }

    #[test]
    fn test_integer_inputs_compare_equal_at_int64() {
        let k = kind("Int!");
        let a = NormalValue::from_wire(WireValue::Int(42), &k).unwrap();
        let b = NormalValue::from_wire(WireValue::Uint(42), &k).unwrap();
        let c = NormalValue::from_wire(WireValue::Float(42.0), &k).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_int(), Some(42));
    }

    #[test]
    fn test_roundtrip_through_unwrap() {
        let cases = vec![
            ("Boolean!", WireValue::Bool(true)),
            ("Int!", WireValue::Int(-7)),
            ("Float!", WireValue::Float(1.5)),
            ("String!", WireValue::String("hello".into())),
            ("Blob!", WireValue::Bytes(vec![0, 1, 2])),
            ("DateTime!", WireValue::DateTime(1_700_000_000_000_000)),
            (
                "[Int!]!",
                WireValue::Array(vec![WireValue::Int(1), WireValue::Int(2)]),
            ),
            (
                "[String]!",
                WireValue::Array(vec![WireValue::String("a".into()), WireValue::Null]),
            ),
        ];
        for (k, wire) in cases {
            let k = kind(k);
            let value = NormalValue::from_wire(wire, &k).unwrap();
            let back = NormalValue::from_wire(value.unwrap(), &k).unwrap();
            assert_eq!(value, back, "roundtrip failed for {k}");
        }
    }

    #[test]
    fn test_string_coerces_to_blob_and_json() {
        let blob = NormalValue::from_wire(WireValue::String("raw".into()), &kind("Blob!")).unwrap();
        assert_eq!(blob.as_bytes(), Some(b"raw".as_slice()));

        let source = r#"{"n":  1}"#;
        let json =
            NormalValue::from_wire(WireValue::String(source.into()), &kind("JSON!")).unwrap();
        // Verbatim: whitespace survives because the text is never re-parsed.
        assert_eq!(json.as_json(), Some(source));
    }

    #[test]
    fn test_nil_only_for_nillable_kinds() {
        assert!(NormalValue::from_wire(WireValue::Null, &kind("Int")).is_ok());
        assert!(NormalValue::from_wire(WireValue::Null, &kind("Int!")).is_err());
        assert!(NormalValue::from_wire(WireValue::Null, &kind("[Int]")).is_ok());
        assert!(NormalValue::from_wire(WireValue::Null, &kind("[Int]!")).is_err());
    }

    #[test]
    fn test_array_element_promotion() {
        // Mixed ints and a whole float all promote to i64.
        let wire = WireValue::Array(vec![
            WireValue::Int(1),
            WireValue::Uint(2),
            WireValue::Float(3.0),
        ]);
        let value = NormalValue::from_wire(wire, &kind("[Int!]!")).unwrap();
        assert_eq!(value.as_int_array(), Some([1i64, 2, 3].as_slice()));

        // A fractional float cannot join an int array.
        let wire = WireValue::Array(vec![WireValue::Int(1), WireValue::Float(1.5)]);
        assert!(NormalValue::from_wire(wire, &kind("[Int!]!")).is_err());
    }

    #[test]
    fn test_nillable_elements() {
        let wire = WireValue::Array(vec![WireValue::Bool(true), WireValue::Null]);
        let value = NormalValue::from_wire(wire.clone(), &kind("[Boolean]!")).unwrap();
        assert_eq!(
            value.as_nillable_bool_array(),
            Some([Some(true), None].as_slice())
        );

        // Null elements are rejected when elements are required.
        assert!(NormalValue::from_wire(wire, &kind("[Boolean!]!")).is_err());
    }

    #[test]
    fn test_accessor_mismatch_returns_none() {
        let value = NormalValue::new_int(5);
        assert_eq!(value.as_bool(), None);
        assert_eq!(value.as_string(), None);
        assert_eq!(value.as_int_array(), None);
        assert_eq!(value.as_int(), Some(5));
    }

    #[test]
    fn test_non_integral_uint_overflow_rejected() {
        assert!(NormalValue::from_wire(WireValue::Uint(u64::MAX), &kind("Int!")).is_err());
        // Floats widen fine.
        let f = NormalValue::from_wire(WireValue::Uint(u64::MAX), &kind("Float!")).unwrap();
        assert_eq!(f.as_float(), Some(u64::MAX as f64));
    }

    #[test]
    fn test_float_shortest_form_ipld() {
        assert_eq!(NormalValue::new_float(90.0).to_ipld(), Ipld::Integer(90));
        assert_eq!(NormalValue::new_float(1.5).to_ipld(), Ipld::Float(1.5));

        // The integral form coerces back to a float at the declared kind.
        let k = kind("Float!");
        let back = NormalValue::from_ipld(&Ipld::Integer(90), &k).unwrap();
        assert_eq!(back.as_float(), Some(90.0));
    }

    #[test]
    fn test_object_refs() {
        let k = kind("User");
        let v = NormalValue::from_wire(WireValue::String("bae-123".into()), &k).unwrap();
        assert_eq!(v.as_object_ref(), Some("bae-123"));
        assert!(v.is_nillable());

        let k = kind("[User]");
        let v = NormalValue::from_wire(
            WireValue::Array(vec![WireValue::String("bae-1".into())]),
            &k,
        )
        .unwrap();
        assert_eq!(v.as_object_ref_array().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_doc_id_kind() {
        let v = NormalValue::from_wire(WireValue::String("bae-abc".into()), &FieldKind::DocId)
            .unwrap();
        assert_eq!(v.as_doc_id(), Some("bae-abc"));
        assert!(NormalValue::from_wire(WireValue::Int(1), &FieldKind::DocId).is_err());
    }
}
