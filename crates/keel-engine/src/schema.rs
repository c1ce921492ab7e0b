//! Schemas and their content-addressed versions.
//!
//! A schema is an ordered set of field descriptions. Published schemas are
//! immutable: the version id is the SHA-256 of the canonical serialized
//! definition, and evolution happens by publishing a new version whose
//! `root` stays the id of the first version. Patches only append fields, so
//! field ordinals — the ids used in datastore keys — never move.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use keel_merkle::CrdtType;
use keel_values::{BaseKind, Container, FieldKind};

use crate::error::{EngineError, Result};

/// One field of a schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub kind: FieldKind,
    pub crdt: CrdtType,
    /// The relationship this field takes part in, if any.
    pub relation_name: Option<String>,
    pub is_primary_relation: bool,
}

impl FieldDescription {
    /// A LWW field from a kind string (`"Int"`, `"[String!]"`, `"User"` …).
    pub fn new(name: impl Into<String>, kind: &str) -> Result<FieldDescription> {
        Ok(FieldDescription {
            name: name.into(),
            kind: FieldKind::parse(kind)?,
            crdt: CrdtType::Lww,
            relation_name: None,
            is_primary_relation: false,
        })
    }

    /// A counter field. Only `Int` and `Float` scalar kinds count.
    pub fn counter(name: impl Into<String>, kind: &str) -> Result<FieldDescription> {
        let mut field = FieldDescription::new(name, kind)?;
        field.crdt = CrdtType::Counter;
        Ok(field)
    }

    pub fn is_relation(&self) -> bool {
        self.relation_name.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.starts_with('_') {
            return Err(EngineError::InvalidSchema(format!(
                "illegal field name {:?}",
                self.name
            )));
        }
        if self.kind == FieldKind::None {
            return Err(EngineError::InvalidSchema(format!(
                "field {:?} has no kind",
                self.name
            )));
        }
        if self.crdt == CrdtType::Composite {
            return Err(EngineError::InvalidSchema(format!(
                "field {:?} cannot be composite",
                self.name
            )));
        }
        if self.crdt == CrdtType::Counter {
            let ok = matches!(
                &self.kind,
                FieldKind::Scalar(s)
                    if s.container == Container::Scalar
                        && matches!(s.base, BaseKind::Int | BaseKind::Float)
            );
            if !ok {
                return Err(EngineError::InvalidSchema(format!(
                    "counter field {:?} must be an Int or Float scalar",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// An immutable, content-addressed schema version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<FieldDescription>,
    /// SHA-256 (hex) of the canonical definition.
    pub version_id: String,
    /// The version id of the first published version.
    pub root: String,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescription>) -> Result<Schema> {
        let name = name.into();
        if name.is_empty() {
            return Err(EngineError::InvalidSchema("empty schema name".to_string()));
        }
        validate_fields(&fields)?;
        let version_id = compute_version_id(&name, &fields);
        Ok(Schema {
            name,
            root: version_id.clone(),
            version_id,
            fields,
        })
    }

    /// Publish a new version with one more field, under the same root.
    pub fn patch_add_field(&self, field: FieldDescription) -> Result<Schema> {
        let mut fields = self.fields.clone();
        fields.push(field);
        validate_fields(&fields)?;
        let version_id = compute_version_id(&self.name, &fields);
        Ok(Schema {
            name: self.name.clone(),
            fields,
            version_id,
            root: self.root.clone(),
        })
    }

    /// Look a field up by name, returning its stable id (1-based ordinal;
    /// 0 is reserved for the composite register).
    pub fn field(&self, name: &str) -> Option<(u32, &FieldDescription)> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|index| (index as u32 + 1, &self.fields[index]))
    }
}

fn validate_fields(fields: &[FieldDescription]) -> Result<()> {
    for (i, field) in fields.iter().enumerate() {
        field.validate()?;
        if fields[..i].iter().any(|f| f.name == field.name) {
            return Err(EngineError::InvalidSchema(format!(
                "duplicate field {:?}",
                field.name
            )));
        }
    }
    Ok(())
}

fn compute_version_id(name: &str, fields: &[FieldDescription]) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        name: &'a str,
        fields: &'a [FieldDescription],
    }
    let bytes = serde_json::to_vec(&Canonical { name, fields })
        .expect("schema definitions always serialize");
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_schema() -> Schema {
        Schema::new(
            "user",
            vec![
                FieldDescription::new("name", "String").unwrap(),
                FieldDescription::new("age", "Int").unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_version_id_is_content_addressed() {
        let a = user_schema();
        let b = user_schema();
        assert_eq!(a.version_id, b.version_id);
        assert_eq!(a.version_id.len(), 64);
        assert_eq!(a.root, a.version_id);

        let c = Schema::new(
            "user",
            vec![FieldDescription::new("name", "String").unwrap()],
        )
        .unwrap();
        assert_ne!(a.version_id, c.version_id);
    }

    #[test]
    fn test_patch_keeps_root_and_ordinals() {
        let v1 = user_schema();
        let v2 = v1
            .patch_add_field(FieldDescription::new("verified", "Boolean").unwrap())
            .unwrap();

        assert_ne!(v1.version_id, v2.version_id);
        assert_eq!(v2.root, v1.version_id);
        // Existing ordinals are unchanged; the new field appends.
        assert_eq!(v2.field("name").unwrap().0, 1);
        assert_eq!(v2.field("age").unwrap().0, 2);
        assert_eq!(v2.field("verified").unwrap().0, 3);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = Schema::new(
            "user",
            vec![
                FieldDescription::new("name", "String").unwrap(),
                FieldDescription::new("name", "Int").unwrap(),
            ],
        );
        assert!(matches!(result, Err(EngineError::InvalidSchema(_))));
    }

    #[test]
    fn test_counter_kind_restrictions() {
        assert!(FieldDescription::counter("points", "Int").is_ok());
        let bad = FieldDescription::counter("points", "String").unwrap();
        assert!(Schema::new("c", vec![bad]).is_err());
    }

    #[test]
    fn test_underscore_field_names_reserved() {
        let bad = FieldDescription::new("_version", "String").unwrap();
        assert!(Schema::new("user", vec![bad]).is_err());
    }
}
