//! Schema-migration hooks.
//!
//! The transform engine itself lives outside the core; the engine only
//! keeps a registry of `(from_version, to_version)` transforms and applies
//! one when a document written under an older schema version is read under
//! a newer one.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use keel_values::NormalValue;

use crate::error::Result;

/// A registered migration transform.
pub type Migration =
    Arc<dyn Fn(&mut BTreeMap<String, NormalValue>) -> Result<()> + Send + Sync>;

/// Registry of schema migrations.
#[derive(Default)]
pub struct LensRegistry {
    migrations: RwLock<HashMap<(String, String), Migration>>,
}

impl LensRegistry {
    pub fn new() -> LensRegistry {
        LensRegistry::default()
    }

    pub fn register(
        &self,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        migration: Migration,
    ) {
        self.migrations
            .write()
            .insert((from_version.into(), to_version.into()), migration);
    }

    /// Apply the migration for `(from, to)` if one is registered.
    /// Returns whether the fields were transformed.
    pub fn migrate(
        &self,
        from_version: &str,
        to_version: &str,
        fields: &mut BTreeMap<String, NormalValue>,
    ) -> Result<bool> {
        let migration = {
            let migrations = self.migrations.read();
            migrations
                .get(&(from_version.to_string(), to_version.to_string()))
                .cloned()
        };
        match migration {
            Some(migration) => {
                migration(fields)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_applies_registered_transform() {
        let registry = LensRegistry::new();
        registry.register(
            "v1",
            "v2",
            Arc::new(|fields| {
                fields.insert("verified".to_string(), NormalValue::new_bool(true));
                Ok(())
            }),
        );

        let mut fields = BTreeMap::new();
        assert!(registry.migrate("v1", "v2", &mut fields).unwrap());
        assert_eq!(
            fields.get("verified").and_then(|v| v.as_bool()),
            Some(true)
        );

        // No transform registered for this pair.
        assert!(!registry.migrate("v2", "v3", &mut fields).unwrap());
    }
}
