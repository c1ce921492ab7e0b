//! Error types for the value model.

use thiserror::Error;

use crate::kind::FieldKind;
use crate::wire::WireValue;

/// Errors produced while normalizing wire values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoercionError {
    /// The value has no normalized representation at all.
    #[error("cannot normalize value: {0:?}")]
    CannotNormalize(WireValue),

    /// The value cannot be coerced into the declared kind.
    #[error("cannot normalize value {value:?} of kind {kind}")]
    CannotNormalizeOfKind { value: WireValue, kind: FieldKind },

    /// A kind string did not match the grammar.
    #[error("unknown field kind: {0:?}")]
    UnknownKind(String),
}

impl CoercionError {
    pub(crate) fn of_kind(value: WireValue, kind: &FieldKind) -> Self {
        CoercionError::CannotNormalizeOfKind {
            value,
            kind: kind.clone(),
        }
    }

    pub(crate) fn unknown_kind(s: &str) -> Self {
        CoercionError::UnknownKind(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoercionError>;
