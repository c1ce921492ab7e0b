//! The datastore contract and the in-memory implementation.
//!
//! The engine consumes an ordered, prefix-scannable byte store with atomic
//! batch commits. Production deployments plug an embedded storage engine in
//! behind [`Datastore`]; [`MemoryDatastore`] backs every test and doubles as
//! the reference for the ordering semantics.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::key::Key;

/// A single operation inside a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// An ordered set of writes that commits atomically.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    pub fn put(&mut self, key: Key, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put(key, value));
        self
    }

    pub fn delete(&mut self, key: Key) -> &mut Self {
        self.ops.push(BatchOp::Delete(key));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Append every operation of `other`, preserving order.
    pub fn extend(&mut self, other: Batch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Prefix-scannable ordered byte store with atomic batch writes.
pub trait Datastore: Send + Sync {
    /// Fetch the value at `key`, or [`StoreError::NotFound`].
    fn get(&self, key: &Key) -> Result<Vec<u8>>;

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &Key) -> Result<()>;

    fn has(&self, key: &Key) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply every operation in the batch atomically and durably.
    fn commit(&self, batch: Batch) -> Result<()>;

    /// All entries whose key starts with `prefix`, in lexicographic order.
    fn query(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>>;
}

/// In-memory ordered datastore.
#[derive(Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> MemoryDatastore {
        MemoryDatastore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &Key) -> Result<Vec<u8>> {
        self.entries
            .read()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.as_str().to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<()> {
        self.entries.write().remove(key.as_str());
        Ok(())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        // One write lock for the whole batch keeps it atomic with respect to
        // readers and concurrent committers.
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key.as_str().to_string(), value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(key.as_str());
                }
            }
        }
        Ok(())
    }

    fn query(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let entries = self.entries.read();
        let range = entries.range::<String, _>((Bound::Included(prefix.as_str().to_string()), Bound::Unbounded));
        let mut out = Vec::new();
        for (k, v) in range {
            if !k.starts_with(prefix.as_str()) {
                break;
            }
            out.push((Key::raw(k.clone()), v.clone()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_delete() {
        let store = MemoryDatastore::new();
        let key = Key::raw("/data/1/doc/1");

        assert!(store.get(&key).unwrap_err().is_not_found());

        store.put(&key, vec![1, 2, 3]).unwrap();
        assert_eq!(store.get(&key).unwrap(), vec![1, 2, 3]);
        assert!(store.has(&key).unwrap());

        store.delete(&key).unwrap();
        assert!(!store.has(&key).unwrap());
    }

    #[test]
    fn test_query_is_ordered_and_prefix_bounded() {
        let store = MemoryDatastore::new();
        store.put(&Key::data(1, "bae-b", 1), vec![2]).unwrap();
        store.put(&Key::data(1, "bae-a", 2), vec![1]).unwrap();
        store.put(&Key::data(1, "bae-a", 1), vec![0]).unwrap();
        store.put(&Key::data(2, "bae-a", 1), vec![9]).unwrap();

        let results = store.query(&Key::data_collection_prefix(1)).unwrap();
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["/data/1/bae-a/1", "/data/1/bae-a/2", "/data/1/bae-b/1"]
        );

        let doc = store.query(&Key::data_doc_prefix(1, "bae-a")).unwrap();
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_batch_commit_is_atomic() {
        let store = MemoryDatastore::new();
        let existing = Key::raw("/data/1/doc/1");
        store.put(&existing, vec![0]).unwrap();

        let mut batch = Batch::new();
        batch
            .put(Key::raw("/data/1/doc/2"), vec![1])
            .put(Key::raw("/heads/1/doc/2/1/cid"), vec![2])
            .delete(existing.clone());
        assert_eq!(batch.len(), 3);
        store.commit(batch).unwrap();

        assert!(!store.has(&existing).unwrap());
        assert_eq!(store.get(&Key::raw("/data/1/doc/2")).unwrap(), vec![1]);
        assert_eq!(
            store.get(&Key::raw("/heads/1/doc/2/1/cid")).unwrap(),
            vec![2]
        );
    }
}
