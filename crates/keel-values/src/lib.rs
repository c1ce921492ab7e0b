//! Keel Values
//!
//! The uniform value space of the Keel document store:
//! - **FieldKind**: the closed taxonomy of field kinds with stable persisted
//!   tags and the human-authored kind-string grammar
//! - **WireValue**: the untyped JSON-ish shape values have on the wire
//! - **NormalValue**: the canonical tagged representation aligned with a
//!   declared kind, with coercion on construction and non-panicking typed
//!   accessors

pub mod error;
pub mod kind;
pub mod value;
pub mod wire;

pub use error::{CoercionError, Result};
pub use kind::{BaseKind, Container, FieldKind, ScalarKind};
pub use value::NormalValue;
pub use wire::WireValue;
