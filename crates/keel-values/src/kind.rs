//! Field kind taxonomy.
//!
//! A field kind is the cartesian product of a scalar base type, element
//! nillability, and a container shape, plus the special `ID` kind and the
//! object-reference kinds. Every scalar combination owns a stable integer
//! tag that is persisted in schema records; the tag space is append-only
//! and removed tags stay reserved.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoercionError;

/// Scalar base types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseKind {
    Bool,
    Int,
    Float,
    String,
    Blob,
    Json,
    DateTime,
}

impl BaseKind {
    /// The name used by the kind-string grammar.
    pub fn name(&self) -> &'static str {
        match self {
            BaseKind::Bool => "Boolean",
            BaseKind::Int => "Int",
            BaseKind::Float => "Float",
            BaseKind::String => "String",
            BaseKind::Blob => "Blob",
            BaseKind::Json => "JSON",
            BaseKind::DateTime => "DateTime",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Boolean" => Some(BaseKind::Bool),
            "Int" => Some(BaseKind::Int),
            "Float" => Some(BaseKind::Float),
            "String" => Some(BaseKind::String),
            "Blob" => Some(BaseKind::Blob),
            "JSON" => Some(BaseKind::Json),
            "DateTime" => Some(BaseKind::DateTime),
            _ => None,
        }
    }
}

/// Container shape of a scalar kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Container {
    /// A single value.
    Scalar,
    /// A required inline array.
    Array,
    /// An inline array that may itself be nil.
    NillableArray,
}

/// A scalar field kind.
///
/// `nillable` applies to the value itself for [`Container::Scalar`], and to
/// each element for the array containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScalarKind {
    pub base: BaseKind,
    pub nillable: bool,
    pub container: Container,
}

impl ScalarKind {
    pub fn new(base: BaseKind, nillable: bool, container: Container) -> Self {
        ScalarKind {
            base,
            nillable,
            container,
        }
    }
}

/// The kind of a schema field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// The unset kind. Reserved tag 0; never valid on a published schema.
    None,
    /// A stable document identifier (`ID` in the grammar).
    DocId,
    /// A scalar or inline-array kind.
    Scalar(ScalarKind),
    /// A reference to a single document of the named schema.
    Object(String),
    /// A reference to an array of documents of the named schema.
    ObjectArray(String),
}

/// Persisted tag table. Gaps are reserved values that must never be reused.
const SCALAR_TAGS: &[(u8, BaseKind, bool, Container)] = &[
    (2, BaseKind::Bool, true, Container::Scalar),
    (3, BaseKind::Bool, false, Container::Array),
    (4, BaseKind::Int, true, Container::Scalar),
    (5, BaseKind::Int, false, Container::Array),
    (6, BaseKind::Float, true, Container::Scalar),
    (7, BaseKind::Float, false, Container::Array),
    (10, BaseKind::DateTime, true, Container::Scalar),
    (11, BaseKind::String, true, Container::Scalar),
    (12, BaseKind::String, false, Container::Array),
    (13, BaseKind::Blob, true, Container::Scalar),
    (14, BaseKind::Json, true, Container::Scalar),
    (18, BaseKind::Bool, true, Container::Array),
    (19, BaseKind::Int, true, Container::Array),
    (20, BaseKind::Float, true, Container::Array),
    (21, BaseKind::String, true, Container::Array),
    (22, BaseKind::DateTime, true, Container::Array),
    (23, BaseKind::Blob, true, Container::Array),
    (24, BaseKind::Json, true, Container::Array),
    (25, BaseKind::Bool, false, Container::Scalar),
    (26, BaseKind::Int, false, Container::Scalar),
    (27, BaseKind::Float, false, Container::Scalar),
    (28, BaseKind::String, false, Container::Scalar),
    (29, BaseKind::DateTime, false, Container::Scalar),
    (30, BaseKind::Blob, false, Container::Scalar),
    (31, BaseKind::Json, false, Container::Scalar),
    (32, BaseKind::Bool, false, Container::NillableArray),
    (33, BaseKind::Int, false, Container::NillableArray),
    (34, BaseKind::Float, false, Container::NillableArray),
    (35, BaseKind::String, false, Container::NillableArray),
    (36, BaseKind::DateTime, false, Container::NillableArray),
    (37, BaseKind::Blob, false, Container::NillableArray),
    (38, BaseKind::Json, false, Container::NillableArray),
    (39, BaseKind::Bool, true, Container::NillableArray),
    (40, BaseKind::Int, true, Container::NillableArray),
    (41, BaseKind::Float, true, Container::NillableArray),
    (42, BaseKind::String, true, Container::NillableArray),
    (43, BaseKind::DateTime, true, Container::NillableArray),
    (44, BaseKind::Blob, true, Container::NillableArray),
    (45, BaseKind::Json, true, Container::NillableArray),
    (46, BaseKind::DateTime, false, Container::Array),
    (47, BaseKind::Blob, false, Container::Array),
    (48, BaseKind::Json, false, Container::Array),
];

impl FieldKind {
    /// The persisted integer tag of this kind.
    ///
    /// Object kinds carry the schema name instead of a tag and return `None`.
    pub fn tag(&self) -> Option<u8> {
        match self {
            FieldKind::None => Some(0),
            FieldKind::DocId => Some(1),
            FieldKind::Scalar(s) => SCALAR_TAGS
                .iter()
                .find(|(_, base, nillable, container)| {
                    *base == s.base && *nillable == s.nillable && *container == s.container
                })
                .map(|(tag, ..)| *tag),
            FieldKind::Object(_) | FieldKind::ObjectArray(_) => None,
        }
    }

    /// Resolve a persisted tag back to its kind.
    pub fn from_tag(tag: u8) -> Option<FieldKind> {
        match tag {
            0 => Some(FieldKind::None),
            1 => Some(FieldKind::DocId),
            _ => SCALAR_TAGS
                .iter()
                .find(|(t, ..)| *t == tag)
                .map(|(_, base, nillable, container)| {
                    FieldKind::Scalar(ScalarKind::new(*base, *nillable, *container))
                }),
        }
    }

    /// True if a nil value is legal for this kind.
    pub fn is_nillable(&self) -> bool {
        match self {
            FieldKind::None | FieldKind::DocId => false,
            FieldKind::Scalar(s) => match s.container {
                Container::Scalar => s.nillable,
                Container::Array => false,
                Container::NillableArray => true,
            },
            FieldKind::Object(_) | FieldKind::ObjectArray(_) => true,
        }
    }

    /// True if elements of this array kind may be nil. False for scalars.
    pub fn element_nillable(&self) -> bool {
        match self {
            FieldKind::Scalar(s) => s.container != Container::Scalar && s.nillable,
            _ => false,
        }
    }

    /// True for inline-array and object-array kinds.
    pub fn is_array(&self) -> bool {
        match self {
            FieldKind::Scalar(s) => s.container != Container::Scalar,
            FieldKind::ObjectArray(_) => true,
            _ => false,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, FieldKind::Object(_) | FieldKind::ObjectArray(_))
    }

    pub fn is_object_array(&self) -> bool {
        matches!(self, FieldKind::ObjectArray(_))
    }

    /// The element kind name, stripped of array brackets.
    pub fn underlying(&self) -> String {
        match self {
            FieldKind::Scalar(s) => {
                let bang = if s.nillable { "" } else { "!" };
                format!("{}{}", s.base.name(), bang)
            }
            FieldKind::Object(name) | FieldKind::ObjectArray(name) => name.clone(),
            _ => self.to_string(),
        }
    }

    /// Parse the strict kind-string grammar.
    ///
    /// Scalar forms: `Int`, `Int!`, `[Int]`, `[Int!]`, `[Int]!`, `[Int!]!`.
    /// `ID` is the document-id kind. Any other bare name parses as an object
    /// reference and `[Name]` as an object array; schema validation catches
    /// unknown names later.
    pub fn parse(s: &str) -> Result<FieldKind, CoercionError> {
        if s.is_empty() {
            return Err(CoercionError::unknown_kind(s));
        }
        if s == "ID" {
            return Ok(FieldKind::DocId);
        }

        let (inner, outer_required) = match s.strip_suffix('!') {
            Some(rest) if rest.starts_with('[') => (rest, true),
            _ => (s, false),
        };

        if let Some(body) = inner.strip_prefix('[') {
            let body = body
                .strip_suffix(']')
                .ok_or_else(|| CoercionError::unknown_kind(s))?;
            let (name, element_required) = match body.strip_suffix('!') {
                Some(name) => (name, true),
                None => (body, false),
            };
            if name.is_empty() || name.contains(['[', ']', '!']) {
                return Err(CoercionError::unknown_kind(s));
            }
            let container = if outer_required {
                Container::Array
            } else {
                Container::NillableArray
            };
            return match BaseKind::from_name(name) {
                Some(base) => Ok(FieldKind::Scalar(ScalarKind::new(
                    base,
                    !element_required,
                    container,
                ))),
                None if !element_required && !outer_required => {
                    Ok(FieldKind::ObjectArray(name.to_string()))
                }
                None => Err(CoercionError::unknown_kind(s)),
            };
        }

        let (name, required) = match s.strip_suffix('!') {
            Some(name) => (name, true),
            None => (s, false),
        };
        if name.is_empty() || name.contains(['[', ']', '!']) {
            return Err(CoercionError::unknown_kind(s));
        }
        match BaseKind::from_name(name) {
            Some(base) => Ok(FieldKind::Scalar(ScalarKind::new(
                base,
                !required,
                Container::Scalar,
            ))),
            None if !required => Ok(FieldKind::Object(name.to_string())),
            None => Err(CoercionError::unknown_kind(s)),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::None => write!(f, "None"),
            FieldKind::DocId => write!(f, "ID"),
            FieldKind::Scalar(s) => {
                let elem_bang = if s.nillable { "" } else { "!" };
                match s.container {
                    Container::Scalar => write!(f, "{}{}", s.base.name(), elem_bang),
                    Container::Array => write!(f, "[{}{}]!", s.base.name(), elem_bang),
                    Container::NillableArray => write!(f, "[{}{}]", s.base.name(), elem_bang),
                }
            }
            FieldKind::Object(name) => write!(f, "{}", name),
            FieldKind::ObjectArray(name) => write!(f, "[{}]", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_all_scalars() {
        for (tag, ..) in SCALAR_TAGS {
            let kind = FieldKind::from_tag(*tag).expect("known tag");
            assert_eq!(kind.tag(), Some(*tag));
        }
        assert_eq!(FieldKind::from_tag(0), Some(FieldKind::None));
        assert_eq!(FieldKind::from_tag(1), Some(FieldKind::DocId));
    }

    #[test]
    fn test_reserved_tags_stay_unmapped() {
        for tag in [8u8, 9, 15, 16, 17] {
            assert_eq!(FieldKind::from_tag(tag), None);
        }
    }

    #[test]
    fn test_parse_scalar_forms() {
        let nillable_int = FieldKind::parse("Int").unwrap();
        assert!(nillable_int.is_nillable());
        assert!(!nillable_int.is_array());
        assert_eq!(nillable_int.tag(), Some(4));

        let required_int = FieldKind::parse("Int!").unwrap();
        assert!(!required_int.is_nillable());
        assert_eq!(required_int.tag(), Some(26));
    }

    #[test]
    fn test_parse_array_forms() {
        // [Int]  -> nillable array of nillable elements
        let k = FieldKind::parse("[Int]").unwrap();
        assert!(k.is_array());
        assert!(k.is_nillable());
        assert!(k.element_nillable());
        assert_eq!(k.tag(), Some(40));

        // [Int!] -> nillable array of required elements
        let k = FieldKind::parse("[Int!]").unwrap();
        assert!(k.is_nillable());
        assert!(!k.element_nillable());
        assert_eq!(k.tag(), Some(33));

        // [Int]! -> required array of nillable elements
        let k = FieldKind::parse("[Int]!").unwrap();
        assert!(!k.is_nillable());
        assert!(k.element_nillable());
        assert_eq!(k.tag(), Some(19));

        // [Int!]! -> required array of required elements
        let k = FieldKind::parse("[Int!]!").unwrap();
        assert!(!k.is_nillable());
        assert!(!k.element_nillable());
        assert_eq!(k.tag(), Some(5));
    }

    #[test]
    fn test_parse_object_forms() {
        assert_eq!(
            FieldKind::parse("User").unwrap(),
            FieldKind::Object("User".to_string())
        );
        assert_eq!(
            FieldKind::parse("[User]").unwrap(),
            FieldKind::ObjectArray("User".to_string())
        );
        assert!(FieldKind::parse("User").unwrap().tag().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "[Int", "Int]", "[]", "[!]", "[User!]", "[User]!"] {
            assert!(FieldKind::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for s in [
            "ID",
            "Boolean",
            "Boolean!",
            "[Boolean]",
            "[Boolean!]",
            "[Boolean]!",
            "[Boolean!]!",
            "Int",
            "Float!",
            "[String]",
            "[DateTime!]!",
            "[Blob]!",
            "JSON",
            "User",
            "[User]",
        ] {
            let kind = FieldKind::parse(s).unwrap();
            assert_eq!(kind.to_string(), s);
        }
    }

    #[test]
    fn test_underlying() {
        assert_eq!(FieldKind::parse("[Int!]!").unwrap().underlying(), "Int!");
        assert_eq!(FieldKind::parse("[User]").unwrap().underlying(), "User");
        assert_eq!(FieldKind::parse("String").unwrap().underlying(), "String");
    }
}
