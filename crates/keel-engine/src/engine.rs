//! The storage engine.
//!
//! Owns the write path (normalize → register delta → encrypt → block →
//! atomic batch) and the read path (state lookup → decrypt → materialize →
//! denormalize). One engine instance owns one datastore; a process may host
//! many engines, which is how the replication tests run several peers in
//! one binary.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};
use parking_lot::RwLock;

use keel_crdt::{
    AppliedDelta, CompositeRegister, CounterValue, LwwRegister, LwwState, PnCounter,
    PnCounterState, Register,
};
use keel_events::{Bus, Merge, PeerId};
use keel_merkle::{
    cid_for, Block, BlockError, CrdtType, DeltaMerger, FieldRef, Link, MerkleClock,
    ProcessOutcome,
};
use keel_store::{Batch, Datastore, DocEncryptor, EncryptionConfig, Key, StoreError,
    COMPOSITE_FIELD_ID};
use keel_values::{NormalValue, WireValue};

use crate::document::{derive_doc_id, Document};
use crate::error::{EngineError, Result};
use crate::lens::{LensRegistry, Migration};
use crate::schema::{FieldDescription, Schema};

/// A named collection bound to a schema version.
#[derive(Clone, Debug)]
pub struct Collection {
    pub id: u32,
    pub name: String,
    pub schema: Schema,
}

/// One commit of a document's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub cid: Cid,
    pub field_name: Option<String>,
    pub crdt: CrdtType,
    pub priority: u64,
    pub links: usize,
}

struct Shared {
    store: Arc<dyn Datastore>,
    encryptor: RwLock<DocEncryptor>,
    /// Collections by name, at their latest schema version.
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    /// Every published schema version, for resolving remote blocks.
    versions: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Shared {
    fn collection_for_version(&self, version_id: &str) -> Option<Arc<Collection>> {
        self.versions.read().get(version_id).cloned()
    }
}

/// Applies register semantics when the clock accepts a block.
struct EngineMerger {
    shared: Arc<Shared>,
}

impl EngineMerger {
    fn data_key(&self, target: &FieldRef) -> Key {
        Key::data(target.collection_id, &target.doc_id, target.field_id)
    }
}

impl DeltaMerger for EngineMerger {
    fn field_of(&self, block: &Block) -> keel_merkle::Result<FieldRef> {
        let collection = self
            .shared
            .collection_for_version(&block.schema_version_id)
            .ok_or_else(|| {
                BlockError::Malformed(format!(
                    "unknown schema version {}",
                    block.schema_version_id
                ))
            })?;

        if block.is_composite() {
            return Ok(FieldRef::new(
                collection.id,
                block.delta.doc_id.clone(),
                COMPOSITE_FIELD_ID,
                CrdtType::Composite,
            ));
        }

        let name = block
            .delta
            .field_name
            .as_deref()
            .ok_or_else(|| BlockError::Malformed("field delta without a name".to_string()))?;
        let (field_id, desc) = collection
            .schema
            .field(name)
            .ok_or_else(|| BlockError::Malformed(format!("unknown field {name:?}")))?;
        if desc.crdt != block.delta.crdt {
            return Err(BlockError::Malformed(format!(
                "field {name:?} is not a {:?} register",
                block.delta.crdt
            )));
        }
        Ok(FieldRef::new(
            collection.id,
            block.delta.doc_id.clone(),
            field_id,
            block.delta.crdt,
        ))
    }

    fn merge(&self, block: &Block, cid: &Cid, batch: &mut Batch) -> keel_merkle::Result<()> {
        // The composite anchors the DAG; its fields carry their own state.
        if block.is_composite() {
            return Ok(());
        }

        let target = self.field_of(block)?;
        let key = self.data_key(&target);
        let current = match self.shared.store.get(&key) {
            Ok(bytes) => Some(bytes),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let delta = AppliedDelta {
            payload: &block.delta.payload,
            priority: block.delta.priority,
            cid: *cid,
        };

        let next = match block.delta.crdt {
            CrdtType::Lww => {
                let state = current
                    .map(|bytes| LwwState::decode(&bytes))
                    .transpose()
                    .map_err(|e| BlockError::Merge(e.to_string()))?;
                LwwRegister
                    .merge(state, delta)
                    .and_then(|state| state.encode())
                    .map_err(|e| BlockError::Merge(e.to_string()))?
            }
            CrdtType::Counter => {
                let state = current
                    .map(|bytes| PnCounterState::decode(&bytes))
                    .transpose()
                    .map_err(|e| BlockError::Merge(e.to_string()))?;
                PnCounter
                    .merge(state, delta)
                    .and_then(|state| state.encode())
                    .map_err(|e| BlockError::Merge(e.to_string()))?
            }
            CrdtType::Composite => unreachable!("handled above"),
        };
        batch.put(key, next);
        Ok(())
    }
}

/// The engine: collections, documents, and their DAG-backed state.
pub struct Engine {
    shared: Arc<Shared>,
    clock: MerkleClock,
    bus: Arc<Bus>,
    peer_id: PeerId,
    lenses: LensRegistry,
    next_collection_id: AtomicU32,
}

impl Engine {
    pub fn new(store: Arc<dyn Datastore>, bus: Arc<Bus>, peer_id: PeerId) -> Engine {
        let mut encryptor = DocEncryptor::new();
        encryptor.set_store(store.clone());
        Engine {
            shared: Arc::new(Shared {
                store: store.clone(),
                encryptor: RwLock::new(encryptor),
                collections: RwLock::new(HashMap::new()),
                versions: RwLock::new(HashMap::new()),
            }),
            clock: MerkleClock::new(store),
            bus,
            peer_id,
            lenses: LensRegistry::new(),
            next_collection_id: AtomicU32::new(1),
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Set (or clear) the encryption configuration for subsequent writes.
    pub fn set_encryption(&self, config: Option<EncryptionConfig>) {
        self.shared.encryptor.write().set_config(config);
    }

    pub fn register_migration(
        &self,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        migration: Migration,
    ) {
        self.lenses.register(from_version, to_version, migration);
    }

    pub fn create_collection(&self, schema: Schema) -> Result<Arc<Collection>> {
        let mut collections = self.shared.collections.write();
        if collections.contains_key(&schema.name) {
            return Err(EngineError::InvalidSchema(format!(
                "collection {:?} already exists",
                schema.name
            )));
        }
        let id = self.next_collection_id.fetch_add(1, Ordering::SeqCst);
        let collection = Arc::new(Collection {
            id,
            name: schema.name.clone(),
            schema,
        });
        collections.insert(collection.name.clone(), collection.clone());
        self.shared
            .versions
            .write()
            .insert(collection.schema.version_id.clone(), collection.clone());
        tracing::info!(name = %collection.name, id, "created collection");
        Ok(collection)
    }

    /// Publish a new schema version appending one field.
    pub fn patch_schema(
        &self,
        collection_name: &str,
        field: FieldDescription,
    ) -> Result<Arc<Collection>> {
        let current = self.collection(collection_name)?;
        let schema = current.schema.patch_add_field(field)?;
        let patched = Arc::new(Collection {
            id: current.id,
            name: current.name.clone(),
            schema,
        });
        self.shared
            .collections
            .write()
            .insert(patched.name.clone(), patched.clone());
        self.shared
            .versions
            .write()
            .insert(patched.schema.version_id.clone(), patched.clone());
        tracing::info!(
            name = %patched.name,
            version = %patched.schema.version_id,
            "patched schema"
        );
        Ok(patched)
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.shared
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::CollectionNotFound(name.to_string()))
    }

    /// The schema root a version belongs to, if the version is known here.
    pub fn schema_root(&self, version_id: &str) -> Option<String> {
        self.shared
            .collection_for_version(version_id)
            .map(|c| c.schema.root.clone())
    }

    /// Create a document from its wire form.
    pub fn create_document(
        &self,
        collection_name: &str,
        value: serde_json::Value,
    ) -> Result<Document> {
        self.create_document_with_key(collection_name, value, None)
    }

    pub fn create_document_with_key(
        &self,
        collection_name: &str,
        value: serde_json::Value,
        user_key: Option<&str>,
    ) -> Result<Document> {
        let collection = self.collection(collection_name)?;
        let fields = self.normalize_input(&collection, value)?;
        if fields.is_empty() {
            return Err(EngineError::InvalidDocument(
                "document has no fields".to_string(),
            ));
        }

        let snapshot = CompositeRegister::snapshot_payload(&fields)?;
        let doc_id = derive_doc_id(&collection.schema.version_id, &cid_for(&snapshot), user_key);

        let composite = self.composite_target(&collection, &doc_id);
        if !self.clock.heads(&composite)?.is_empty() {
            return Err(EngineError::InvalidDocument(format!(
                "document {doc_id} already exists"
            )));
        }

        let head = self.write_document(&collection, &doc_id, &fields)?;
        self.announce(&collection, &doc_id, head);
        self.get_document(collection_name, &doc_id)
    }

    /// Apply a partial update. Counter fields treat the value as a signed
    /// increment; everything else is a plain overwrite.
    pub fn update_document(
        &self,
        collection_name: &str,
        doc_id: &str,
        value: serde_json::Value,
    ) -> Result<Document> {
        let collection = self.collection(collection_name)?;
        let composite = self.composite_target(&collection, doc_id);
        if self.clock.heads(&composite)?.is_empty() {
            return Err(EngineError::DocumentNotFound(doc_id.to_string()));
        }

        let changes = self.normalize_input(&collection, value)?;
        if changes.is_empty() {
            return Err(EngineError::InvalidDocument("empty update".to_string()));
        }

        let head = self.write_document(&collection, doc_id, &changes)?;
        self.announce(&collection, doc_id, head);
        self.get_document(collection_name, doc_id)
    }

    /// Materialize a document.
    pub fn get_document(&self, collection_name: &str, doc_id: &str) -> Result<Document> {
        let collection = self.collection(collection_name)?;
        let composite = self.composite_target(&collection, doc_id);
        let heads = self.clock.heads(&composite)?;
        if heads.is_empty() {
            return Err(EngineError::DocumentNotFound(doc_id.to_string()));
        }

        let encryptor = self.shared.encryptor.read();
        let mut fields = self.read_fields(&collection, doc_id, &encryptor)?;
        drop(encryptor);

        // The winning head tells us which schema version the document was
        // last written under.
        let winner = heads
            .iter()
            .max_by(|(a_cid, a_pri), (b_cid, b_pri)| {
                (a_pri, a_cid.to_bytes()).cmp(&(b_pri, b_cid.to_bytes()))
            })
            .expect("heads is non-empty");
        let head_block = Block::decode(&self.block_bytes(&winner.0)?)?;
        let stored_version = head_block.schema_version_id;

        let schema_version_id = if stored_version != collection.schema.version_id
            && self
                .lenses
                .migrate(&stored_version, &collection.schema.version_id, &mut fields)?
        {
            collection.schema.version_id.clone()
        } else {
            stored_version
        };

        Ok(Document {
            doc_id: doc_id.to_string(),
            schema_version_id,
            fields,
            heads: heads.into_iter().map(|(cid, _)| cid).collect(),
        })
    }

    /// Every block of the document's history, newest first.
    pub fn commits(&self, collection_name: &str, doc_id: &str) -> Result<Vec<CommitInfo>> {
        let collection = self.collection(collection_name)?;
        let composite = self.composite_target(&collection, doc_id);

        let mut frontier: Vec<Cid> = self
            .clock
            .heads(&composite)?
            .into_iter()
            .map(|(cid, _)| cid)
            .collect();
        let mut seen: Vec<Cid> = Vec::new();
        let mut commits = Vec::new();

        while let Some(cid) = frontier.pop() {
            if seen.contains(&cid) {
                continue;
            }
            seen.push(cid);
            let block = Block::decode(&self.block_bytes(&cid)?)?;
            frontier.extend(block.links().map(|l| l.cid));
            commits.push(CommitInfo {
                cid,
                field_name: block.delta.field_name.clone(),
                crdt: block.delta.crdt,
                priority: block.delta.priority,
                links: block.links.len(),
            });
        }

        commits.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.cid.to_bytes().cmp(&b.cid.to_bytes()))
        });
        Ok(commits)
    }

    /// Raw canonical bytes of a stored block.
    pub fn block_bytes(&self, cid: &Cid) -> Result<Vec<u8>> {
        Ok(self.shared.store.get(&Key::block(&cid.to_string()))?)
    }

    /// Composite heads of a document, wherever it lives.
    pub fn composite_heads(&self, doc_id: &str) -> Result<Vec<(Cid, u64)>> {
        let collections: Vec<Arc<Collection>> =
            self.shared.collections.read().values().cloned().collect();
        for collection in collections {
            let heads = self
                .clock
                .heads(&self.composite_target(&collection, doc_id))?;
            if !heads.is_empty() {
                return Ok(heads);
            }
        }
        Ok(Vec::new())
    }

    /// Feed a replicated block into the clock.
    pub fn process_remote_block(&self, bytes: &[u8]) -> Result<(Block, ProcessOutcome)> {
        let block = Block::decode(bytes)?;
        let merger = self.merger();
        let outcome = self.clock.process_block(&merger, &block, bytes)?;
        Ok((block, outcome))
    }

    /// Ancestors still unresolved under `cid`, for the pull path.
    pub fn missing_ancestors(&self, doc_id: &str, cid: &Cid) -> Result<Vec<Cid>> {
        Ok(self.clock.walk_missing(doc_id, cid)?)
    }

    /// Resume any sync interrupted before shutdown.
    pub fn resume_sync(&self) -> Result<()> {
        let merger = self.merger();
        Ok(self.clock.resume_pending(&merger)?)
    }

    fn merger(&self) -> EngineMerger {
        EngineMerger {
            shared: self.shared.clone(),
        }
    }

    fn composite_target(&self, collection: &Collection, doc_id: &str) -> FieldRef {
        FieldRef::new(
            collection.id,
            doc_id,
            COMPOSITE_FIELD_ID,
            CrdtType::Composite,
        )
    }

    fn normalize_input(
        &self,
        collection: &Collection,
        value: serde_json::Value,
    ) -> Result<BTreeMap<String, NormalValue>> {
        let object = match value {
            serde_json::Value::Object(object) => object,
            other => {
                return Err(EngineError::InvalidDocument(format!(
                    "expected an object, got {other}"
                )))
            }
        };
        let mut fields = BTreeMap::new();
        for (name, value) in object {
            let (_, desc) = collection
                .schema
                .field(&name)
                .ok_or_else(|| EngineError::FieldNotFound(name.clone()))?;
            let normalized = NormalValue::from_wire(WireValue::from(value), &desc.kind)?;
            fields.insert(name, normalized);
        }
        Ok(fields)
    }

    /// Write field deltas and the composite anchor for one logical change.
    fn write_document(
        &self,
        collection: &Collection,
        doc_id: &str,
        changes: &BTreeMap<String, NormalValue>,
    ) -> Result<Cid> {
        let merger = self.merger();
        let encryptor = self.shared.encryptor.read();

        let mut consumed = Vec::with_capacity(changes.len());
        for (name, value) in changes {
            let (field_id, desc) = collection
                .schema
                .field(name)
                .ok_or_else(|| EngineError::FieldNotFound(name.clone()))?;
            let plain = match desc.crdt {
                CrdtType::Lww => LwwRegister.new_delta(value)?,
                CrdtType::Counter => PnCounter.new_delta(&counter_input(value)?)?,
                CrdtType::Composite => {
                    return Err(EngineError::InvalidSchema(format!(
                        "field {name:?} cannot be written directly"
                    )))
                }
            };
            let payload = encryptor.encrypt(doc_id, name, &plain)?;
            let target = FieldRef::new(collection.id, doc_id, field_id, desc.crdt);
            let (cid, block) = self.clock.add_delta(
                &merger,
                &target,
                Some(name.clone()),
                payload,
                Vec::new(),
                &collection.schema.version_id,
            )?;
            consumed.push((Link::field(name.clone(), cid), block.delta.priority));
        }

        // The composite snapshot covers the whole materialized document,
        // not only the fields this change touched.
        let fields = self.read_fields(collection, doc_id, &encryptor)?;
        let snapshot = CompositeRegister::snapshot_payload(&fields)?;
        let payload = encryptor.encrypt(doc_id, "", &snapshot)?;
        let target = self.composite_target(collection, doc_id);
        let (cid, _) = self.clock.add_delta(
            &merger,
            &target,
            None,
            payload,
            consumed,
            &collection.schema.version_id,
        )?;
        Ok(cid)
    }

    fn read_fields(
        &self,
        collection: &Collection,
        doc_id: &str,
        encryptor: &DocEncryptor,
    ) -> Result<BTreeMap<String, NormalValue>> {
        let mut fields = BTreeMap::new();
        for (index, desc) in collection.schema.fields.iter().enumerate() {
            let field_id = index as u32 + 1;
            let bytes = match self
                .shared
                .store
                .get(&Key::data(collection.id, doc_id, field_id))
            {
                Ok(bytes) => bytes,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let value = match desc.crdt {
                CrdtType::Lww => {
                    let state = LwwState::decode(&bytes)?;
                    let plain = encryptor.decrypt(doc_id, &desc.name, &state.payload)?;
                    let ipld: Ipld = DagCborCodec
                        .decode(&plain)
                        .map_err(|e| BlockError::Malformed(e.to_string()))?;
                    NormalValue::from_ipld(&ipld, &desc.kind)?
                }
                CrdtType::Counter => {
                    let state = PnCounterState::decode(&bytes)?;
                    let sum = PnCounter.materialize_with(&state, |sealed| {
                        encryptor
                            .decrypt(doc_id, &desc.name, sealed)
                            .map_err(|e| keel_crdt::RegisterError::Malformed(e.to_string()))
                    })?;
                    counter_output(sum, desc)?
                }
                CrdtType::Composite => continue,
            };
            fields.insert(desc.name.clone(), value);
        }
        Ok(fields)
    }

    fn announce(&self, collection: &Collection, doc_id: &str, cid: Cid) {
        self.bus.publish_merge(Merge {
            doc_id: doc_id.to_string(),
            cid,
            schema_root: collection.schema.root.clone(),
            by_peer: self.peer_id.clone(),
            from_peer: None,
        });
    }
}

fn counter_input(value: &NormalValue) -> Result<CounterValue> {
    if let Some(i) = value.as_int() {
        Ok(CounterValue::Int(i))
    } else if let Some(f) = value.as_float() {
        Ok(CounterValue::Float(f))
    } else {
        Err(EngineError::InvalidDocument(
            "counter fields take numbers".to_string(),
        ))
    }
}

fn counter_output(sum: CounterValue, desc: &FieldDescription) -> Result<NormalValue> {
    let wire = match sum {
        CounterValue::Int(i) => WireValue::Int(i),
        CounterValue::Float(f) => WireValue::Float(f),
    };
    Ok(NormalValue::from_wire(wire, &desc.kind)?)
}
