//! Collections: documents, their secondary indexes and aggregate metadata
//! behind one API.
//!
//! Every mutation follows the same sequence:
//!
//! 1. validate and check unique indexes (nothing changes on failure)
//! 2. append the WAL record and wait until it is durable
//! 3. write the document through the storage manager
//! 4. move the document's keys in every secondary index
//! 5. update and persist the metadata
//!
//! Mutations of one collection are serialized by a write gate; reads never
//! take it.
//!
//! A change that fails after it was logged is undone with an inverse WAL
//! record, and the indexes are rebuilt from the documents. Until that
//! rebuild succeeds the indexes are marked stale and queries scan.

mod batch;
mod metadata;

pub use batch::{BatchFailure, BatchResult};
pub use metadata::{CollectionMetadata, METADATA_KEY};

use crate::config::Config;
use crate::document::{now_millis, Document, ID_FIELD, LAST_MODIFIED_FIELD, VERSION_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexKey, IndexOptions, SecondaryIndex, TreeShape};
use crate::query::{execute, Filter, Query, QueryPlan, QueryPlanner};
use crate::schema::{CollectionSchema, IndexDefinition, PrimaryKey};
use crate::stats::DatabaseStats;
use crate::storage::StorageManager;
use crate::wal::{WalManager, WalRecord};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Unique keys taken by earlier items of the same batch.
type Claims = BTreeMap<(String, IndexKey), String>;

/// Locks held by a document mutation: quiesce gate, write gate, indexes.
type WriteGuards<'a> = (
    RwLockReadGuard<'a, ()>,
    MutexGuard<'a, CollectionMetadata>,
    RwLockReadGuard<'a, Vec<SecondaryIndex>>,
);

/// A validated mutation, ready to be logged and applied.
#[derive(Debug)]
enum Change {
    Create(Document),
    Update { old: Document, new: Document },
    Delete(Document),
}

impl Change {
    fn id(&self) -> &str {
        let doc = match self {
            Self::Create(doc) | Self::Update { new: doc, .. } | Self::Delete(doc) => doc,
        };
        doc.id().unwrap_or_default()
    }

    fn record(&self, collection: &str) -> WalRecord {
        let collection = collection.to_string();
        let id = self.id().to_string();
        match self {
            Self::Create(doc) => WalRecord::Create {
                collection,
                id,
                document: doc.clone(),
            },
            Self::Update { new, .. } => WalRecord::Update {
                collection,
                id,
                document: new.clone(),
            },
            Self::Delete(_) => WalRecord::Delete { collection, id },
        }
    }

    /// The change that restores the state before this one.
    fn inverse(&self) -> Self {
        match self {
            Self::Create(doc) => Self::Delete(doc.clone()),
            Self::Update { old, new } => Self::Update {
                old: new.clone(),
                new: old.clone(),
            },
            Self::Delete(doc) => Self::Create(doc.clone()),
        }
    }

    fn into_document(self) -> Document {
        match self {
            Self::Create(doc) | Self::Update { new: doc, .. } | Self::Delete(doc) => doc,
        }
    }
}

/// Health of one index, as reported by [`Collection::verify`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    /// Canonical index name.
    pub index: String,
    /// Tree shape, when the structure is sound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<TreeShape>,
    /// First structural violation found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    /// Ids the index refers to that no longer exist.
    pub dangling: Vec<String>,
}

impl IndexReport {
    /// Returns true if the tree is sound and every entry resolves.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.violation.is_none() && self.dangling.is_empty()
    }
}

/// A named set of documents with its indexes.
///
/// Obtained from [`Database::collection`](crate::Database::collection).
/// Handles are shared; every method takes `&self`.
///
/// ```rust,ignore
/// let users = db.collection("users", CollectionSchema::parse("@id; &email")?)?;
/// let alice = users.insert(json!({"email": "alice@example.com", "age": 31}))?;
/// let adults = users.find(&Query::new(Filter::gte("age", 18)))?;
/// ```
pub struct Collection {
    name: String,
    dir: PathBuf,
    schema: CollectionSchema,
    storage: StorageManager,
    indexes: RwLock<Vec<SecondaryIndex>>,
    /// Write gate; also owns the metadata it protects.
    state: Mutex<CollectionMetadata>,
    wal: Arc<WalManager>,
    ops_gate: Arc<RwLock<()>>,
    index_options: IndexOptions,
    /// Set while the indexes may disagree with the documents.
    stale: AtomicBool,
    stats: Arc<DatabaseStats>,
    timeout: Duration,
}

impl Collection {
    /// Opens the collection stored in `dir`.
    ///
    /// Indexes declared by the schema or recorded in the metadata are
    /// opened; any that are new, or all of them when recovery flagged the
    /// collection, are rebuilt from the documents. The document count is
    /// reconciled against disk.
    pub(crate) fn open(
        name: &str,
        dir: PathBuf,
        schema: CollectionSchema,
        config: &Config,
        wal: Arc<WalManager>,
        ops_gate: Arc<RwLock<()>>,
        stats: Arc<DatabaseStats>,
    ) -> CoreResult<Self> {
        let storage = StorageManager::open(name, &dir, config, Arc::clone(&stats))?;
        let mut metadata = CollectionMetadata::load(&storage)?;
        reconcile(&storage, &schema, &mut metadata)?;

        let index_options = IndexOptions {
            order: config.btree_order,
            node_cache_capacity: config.node_cache_capacity,
            timeout: config.operation_timeout,
            sync_writes: config.sync_on_write,
        };

        let mut definitions = schema.indexes.clone();
        for index_name in &metadata.indexes {
            match IndexDefinition::from_name(index_name) {
                Ok(def) if !definitions.iter().any(|d| d.fields == def.fields) => {
                    definitions.push(def);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = name, index = %index_name, error = %e, "ignoring unreadable index name");
                }
            }
        }

        let deferred = metadata.needs_reindex && !config.reindex_on_open;
        let mut indexes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let index = SecondaryIndex::open(definition, &dir, &index_options)?;
            let built = metadata.indexes.contains(index.name());
            if !built || (metadata.needs_reindex && !deferred) {
                let count = index.rebuild(storage.read_all()?)?;
                info!(collection = name, index = index.name(), documents = count, "built index");
            }
            indexes.push(index);
        }
        if deferred {
            warn!(collection = name, "indexes opened as stored, reindex deferred");
        }

        metadata.indexes = indexes.iter().map(|i| i.name().to_string()).collect();
        metadata.needs_reindex = deferred;
        metadata.save(&storage)?;

        debug!(
            collection = name,
            documents = metadata.document_count,
            indexes = indexes.len(),
            "opened collection"
        );
        Ok(Self {
            name: name.to_string(),
            dir,
            schema,
            storage,
            indexes: RwLock::new(indexes),
            state: Mutex::new(metadata),
            wal,
            ops_gate,
            index_options,
            stale: AtomicBool::new(deferred),
            stats,
            timeout: config.operation_timeout,
        })
    }

    /// Name of the collection.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the collection.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Schema the collection was opened with.
    #[must_use]
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    // ========================================================================
    // Single-document operations
    // ========================================================================

    /// Inserts a new document and returns it as stored.
    ///
    /// A missing id is generated when the schema declares a UUID or
    /// auto-increment primary key. The stored copy carries `_version` 1 and
    /// `_lastModified`.
    ///
    /// # Errors
    ///
    /// - `Validation` if the value is not an object, fails the schema, or
    ///   its id is already taken
    /// - `Index` if a unique index already holds one of its keys
    /// - `WalWrite`/`Timeout` if the operation could not be made durable
    pub fn insert(&self, doc: impl Into<Value>) -> CoreResult<Document> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("insert")?;

        let doc = self.prepare_insert(&mut state, doc.into())?;
        check_unique(&indexes, &doc, &mut Claims::new())?;
        let change = Change::Create(doc);
        self.commit(&mut state, &indexes, &change)?;
        Ok(change.into_document())
    }

    /// Returns the document with `id`, or `None`.
    pub fn get(&self, id: &str) -> CoreResult<Option<Document>> {
        self.storage.read(id)
    }

    /// Merges `patch` into the document with `id` and returns the result.
    ///
    /// Top-level fields of the patch replace those of the document. When the
    /// patch carries `_version`, it must equal the stored version.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no document has this id
    /// - `VersionConflict` if the patch's `_version` is stale
    /// - `Validation` if the patch changes the id or breaks the schema
    /// - `Index` on a unique violation
    pub fn update(&self, id: &str, patch: impl Into<Value>) -> CoreResult<Document> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("update")?;

        let patch = into_object(patch.into())?;
        let change = self.prepare_update(id, patch, true)?;
        if let Change::Update { new, .. } = &change {
            check_unique(&indexes, new, &mut Claims::new())?;
        }
        self.commit(&mut state, &indexes, &change)?;
        Ok(change.into_document())
    }

    /// Replaces a whole document, keeping its id.
    ///
    /// # Errors
    ///
    /// As [`Collection::update`]; the replacement must carry the id.
    pub fn replace(&self, doc: impl Into<Value>) -> CoreResult<Document> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("replace")?;

        let fields = into_object(doc.into())?;
        let id = fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::validation("replacement has no string id"))?
            .to_string();
        let change = self.prepare_update(&id, fields, false)?;
        if let Change::Update { new, .. } = &change {
            check_unique(&indexes, new, &mut Claims::new())?;
        }
        self.commit(&mut state, &indexes, &change)?;
        Ok(change.into_document())
    }

    /// Deletes the document with `id`. Returns false if there was none.
    pub fn delete(&self, id: &str) -> CoreResult<bool> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("delete")?;

        let Some(old) = self.storage.read(id)? else {
            return Ok(false);
        };
        self.commit(&mut state, &indexes, &Change::Delete(old))?;
        Ok(true)
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Inserts every document that passes validation, logged as one batch.
    ///
    /// Failures are reported by input position; they never stop the rest.
    ///
    /// # Errors
    ///
    /// Only fails as a whole when the batch cannot be logged.
    pub fn insert_many<I>(&self, docs: I) -> CoreResult<BatchResult>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let (_quiesce, mut state, indexes) = self.begin_mutation("insert many")?;

        let mut result = BatchResult::default();
        let mut claims = Claims::new();
        let mut ids = HashSet::new();
        let mut changes = Vec::new();
        for (position, value) in docs.into_iter().enumerate() {
            let prepared = self
                .prepare_insert(&mut state, value.into())
                .and_then(|doc| {
                    let id = doc.id().unwrap_or_default().to_string();
                    if ids.contains(&id) {
                        return Err(CoreError::validation(format!(
                            "id {id:?} appears twice in the batch"
                        )));
                    }
                    check_unique(&indexes, &doc, &mut claims)?;
                    ids.insert(id);
                    Ok(doc)
                });
            match prepared {
                Ok(doc) => changes.push((Some(position), Change::Create(doc))),
                Err(e) => result.fail(Some(position), None, e),
            }
        }

        self.commit_batch(&mut state, &indexes, changes, &mut result)?;
        Ok(result)
    }

    /// Merges `patch` into every document matching `filter`.
    ///
    /// `_version` in the patch is ignored. Failures are reported by id.
    pub fn update_many(&self, filter: &Filter, patch: impl Into<Value>) -> CoreResult<BatchResult> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("update many")?;

        let mut patch = into_object(patch.into())?;
        patch.remove(VERSION_FIELD);

        let mut result = BatchResult::default();
        let mut claims = Claims::new();
        let mut changes = Vec::new();
        for doc in self.run(&indexes, &Query::new(filter.clone()))? {
            let id = doc.id().unwrap_or_default().to_string();
            let prepared = self.prepare_update(&id, patch.clone(), true).and_then(|change| {
                if let Change::Update { new, .. } = &change {
                    check_unique(&indexes, new, &mut claims)?;
                }
                Ok(change)
            });
            match prepared {
                Ok(change) => changes.push((None, change)),
                Err(e) => result.fail(None, Some(id), e),
            }
        }

        self.commit_batch(&mut state, &indexes, changes, &mut result)?;
        Ok(result)
    }

    /// Deletes every document matching `filter`.
    pub fn delete_many(&self, filter: &Filter) -> CoreResult<BatchResult> {
        let (_quiesce, mut state, indexes) = self.begin_mutation("delete many")?;

        let changes = self
            .run(&indexes, &Query::new(filter.clone()))?
            .into_iter()
            .map(|doc| (None, Change::Delete(doc)))
            .collect();
        let mut result = BatchResult::default();
        self.commit_batch(&mut state, &indexes, changes, &mut result)?;
        Ok(result)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Runs a query.
    pub fn find(&self, query: &Query) -> CoreResult<Vec<Document>> {
        let indexes = self.indexes.read();
        self.run(&indexes, query)
    }

    /// Returns the first match of `filter` in id order.
    pub fn find_one(&self, filter: &Filter) -> CoreResult<Option<Document>> {
        let query = Query::new(filter.clone()).limit(1);
        Ok(self.find(&query)?.into_iter().next())
    }

    /// Counts documents matching `filter`.
    pub fn count(&self, filter: &Filter) -> CoreResult<usize> {
        Ok(self.find(&Query::new(filter.clone()))?.len())
    }

    /// Returns the plan `filter` would run with.
    pub fn explain(&self, filter: &Filter) -> QueryPlan {
        let indexes = self.indexes.read();
        self.plan(&indexes, filter)
    }

    fn plan(&self, indexes: &[SecondaryIndex], filter: &Filter) -> QueryPlan {
        if self.stale.load(Ordering::Acquire) {
            return QueryPlan::FullScan;
        }
        QueryPlanner::new(indexes, &self.schema).plan(filter)
    }

    fn run(&self, indexes: &[SecondaryIndex], query: &Query) -> CoreResult<Vec<Document>> {
        let plan = self.plan(indexes, &query.filter);
        debug!(collection = %self.name, %plan, "planned query");
        execute(query, &plan, indexes, &self.storage, &self.stats)
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Builds a new secondary index from the stored documents.
    ///
    /// Returns false if an identical index already exists.
    ///
    /// # Errors
    ///
    /// - `Validation` if another index covers the same fields
    /// - `Index` if a unique index would be violated by existing documents
    pub fn create_index(&self, definition: IndexDefinition) -> CoreResult<bool> {
        let (_quiesce, mut state) = self.begin_write("create index")?;
        {
            let indexes = self.indexes.read();
            if let Some(existing) = indexes.iter().find(|i| i.definition().fields == definition.fields)
            {
                if existing.definition() == &definition {
                    return Ok(false);
                }
                return Err(CoreError::validation(format!(
                    "index {} already covers these fields",
                    existing.name()
                )));
            }
        }

        let index = SecondaryIndex::open(definition, &self.dir, &self.index_options)?;
        let count = index.rebuild(self.storage.read_all()?)?;
        if index.definition().unique {
            if let Some(err) = first_duplicate(&index)? {
                index.destroy()?;
                return Err(err);
            }
        }
        info!(collection = %self.name, index = index.name(), documents = count, "created index");

        state.indexes.insert(index.name().to_string());
        self.indexes.write().push(index);
        state.save(&self.storage)?;
        Ok(true)
    }

    /// Drops the index with canonical `name`. Returns false if there is none.
    ///
    /// # Errors
    ///
    /// Indexes declared by the schema cannot be dropped.
    pub fn drop_index(&self, name: &str) -> CoreResult<bool> {
        let (_quiesce, mut state) = self.begin_write("drop index")?;
        if self.schema.indexes.iter().any(|d| d.name() == name) {
            return Err(CoreError::validation(format!(
                "index {name} is declared by the collection schema"
            )));
        }

        let index = {
            let mut indexes = self.indexes.write();
            match indexes.iter().position(|i| i.name() == name) {
                Some(pos) => indexes.remove(pos),
                None => return Ok(false),
            }
        };
        index.destroy()?;
        state.indexes.remove(name);
        state.save(&self.storage)?;
        info!(collection = %self.name, index = name, "dropped index");
        Ok(true)
    }

    /// Definitions of every index, schema-declared first.
    #[must_use]
    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.indexes
            .read()
            .iter()
            .map(|i| i.definition().clone())
            .collect()
    }

    /// Checks every index tree and looks for entries pointing at missing
    /// documents.
    pub fn verify(&self) -> CoreResult<Vec<IndexReport>> {
        let indexes = self.indexes.read();
        let mut reports = Vec::with_capacity(indexes.len());
        for index in indexes.iter() {
            let (shape, violation) = match index.tree().check_invariants() {
                Ok(shape) => (Some(shape), None),
                Err(e) => (None, Some(e.to_string())),
            };
            let mut dangling = Vec::new();
            if violation.is_none() {
                let mut seen = HashSet::new();
                for (_, id) in index.tree().entries()? {
                    if seen.insert(id.clone()) && !self.storage.exists(&id)? {
                        warn!(collection = %self.name, index = index.name(), id = %id, "dangling index entry");
                        dangling.push(id);
                    }
                }
            }
            reports.push(IndexReport {
                index: index.name().to_string(),
                shape,
                violation,
                dangling,
            });
        }
        Ok(reports)
    }

    // ========================================================================
    // Metadata and cache
    // ========================================================================

    /// A copy of the aggregate metadata.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if a write holds the collection for too long.
    pub fn metadata(&self) -> CoreResult<CollectionMetadata> {
        self.state
            .try_lock_for(self.timeout)
            .map(|state| state.clone())
            .ok_or(CoreError::Timeout {
                operation: "collection metadata",
            })
    }

    /// Drops cached documents matching `predicate`; disk is untouched.
    pub fn invalidate_cache_where<F>(&self, predicate: F) -> usize
    where
        F: FnMut(&Document) -> bool,
    {
        self.storage.invalidate_where(predicate)
    }

    /// The storage manager behind this collection.
    #[must_use]
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn begin_write(
        &self,
        operation: &'static str,
    ) -> CoreResult<(RwLockReadGuard<'_, ()>, MutexGuard<'_, CollectionMetadata>)> {
        let quiesce = self
            .ops_gate
            .try_read_for(self.timeout)
            .ok_or(CoreError::Timeout { operation })?;
        let state = self
            .state
            .try_lock_for(self.timeout)
            .ok_or(CoreError::Timeout { operation })?;
        Ok((quiesce, state))
    }

    /// Takes the write gate and the index list, repairing stale indexes
    /// first so unique checks see every document.
    fn begin_mutation(&self, operation: &'static str) -> CoreResult<WriteGuards<'_>> {
        let (quiesce, mut state) = self.begin_write(operation)?;
        let indexes = self.indexes.read();
        if self.stale.load(Ordering::Acquire) {
            self.repair_indexes(&indexes, &mut state)?;
        }
        Ok((quiesce, state, indexes))
    }

    /// Rebuilds every index from the documents and recounts them.
    fn repair_indexes(
        &self,
        indexes: &[SecondaryIndex],
        state: &mut CollectionMetadata,
    ) -> CoreResult<()> {
        for index in indexes {
            index.rebuild(self.storage.read_all()?)?;
        }
        state.document_count = self.storage.count()? as u64;
        state.needs_reindex = false;
        state.save(&self.storage)?;
        self.stale.store(false, Ordering::Release);
        info!(collection = %self.name, indexes = indexes.len(), "repaired indexes");
        Ok(())
    }

    /// Undoes a logged change that could not be applied in full.
    ///
    /// The inverse is logged before it is written, so recovery folds both
    /// records into the state before the change.
    fn roll_back(&self, change: &Change, error: &CoreError) {
        warn!(collection = %self.name, id = change.id(), error = %error, "rolling back logged change");
        self.stale.store(true, Ordering::Release);

        let inverse = change.inverse();
        let undone = self.wal.log(inverse.record(&self.name)).and_then(|_| match &inverse {
            Change::Create(doc) | Change::Update { new: doc, .. } => {
                self.storage.write(inverse.id(), doc)
            }
            Change::Delete(_) => match self.storage.remove(inverse.id()) {
                Ok(()) | Err(CoreError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            },
        });
        if let Err(e) = undone {
            warn!(collection = %self.name, id = change.id(), error = %e, "rollback failed, recovery will replay the change");
        }
    }

    /// Repairs the indexes after a rollback, or flags the collection so the
    /// next write or open does it.
    fn repair_or_flag(&self, indexes: &[SecondaryIndex], state: &mut CollectionMetadata) {
        if let Err(e) = self.repair_indexes(indexes, state) {
            warn!(collection = %self.name, error = %e, "indexes stay stale until the next write");
            state.needs_reindex = true;
            if let Err(e) = state.save(&self.storage) {
                warn!(collection = %self.name, error = %e, "cannot flag collection for reindex");
            }
        }
    }

    fn prepare_insert(&self, state: &mut CollectionMetadata, value: Value) -> CoreResult<Document> {
        let mut doc = Document::from_value(value)?;
        if doc.get(ID_FIELD).is_none() {
            match self.schema.primary_key {
                PrimaryKey::Uuid => {
                    doc.insert(ID_FIELD, Value::from(uuid::Uuid::new_v4().to_string()));
                }
                PrimaryKey::AutoIncrement => {
                    doc.insert(ID_FIELD, Value::from(state.take_auto_id()?.to_string()));
                }
                PrimaryKey::Supplied => {}
            }
        }
        self.schema.validate(&doc)?;

        let id = doc.id().unwrap_or_default().to_string();
        if self.storage.exists(&id)? {
            return Err(CoreError::validation(format!(
                "document {id:?} already exists in {}",
                self.name
            )));
        }
        if self.schema.primary_key == PrimaryKey::AutoIncrement {
            state.observe_id(&id);
        }
        doc.stamp(1, now_millis());
        Ok(doc)
    }

    fn prepare_update(&self, id: &str, fields: Map<String, Value>, merge: bool) -> CoreResult<Change> {
        let old = self
            .storage
            .read(id)?
            .ok_or_else(|| CoreError::not_found(&self.name, id))?;
        let actual = old.version().unwrap_or(0);

        if let Some(expected) = fields.get(VERSION_FIELD) {
            let expected = expected
                .as_u64()
                .ok_or_else(|| CoreError::validation("_version must be a non-negative integer"))?;
            if expected != actual {
                return Err(CoreError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual,
                });
            }
        }
        if let Some(new_id) = fields.get(ID_FIELD) {
            if new_id.as_str() != Some(id) {
                return Err(CoreError::validation(format!("id of {id:?} cannot change")));
            }
        }

        let mut new = if merge {
            old.clone()
        } else {
            let mut doc = Document::new();
            doc.insert(ID_FIELD, Value::from(id));
            doc
        };
        for (field, value) in fields {
            if field != VERSION_FIELD && field != LAST_MODIFIED_FIELD {
                new.insert(field, value);
            }
        }
        new.stamp(actual + 1, now_millis());
        self.schema.validate(&new)?;
        Ok(Change::Update { old, new })
    }

    fn apply(&self, indexes: &[SecondaryIndex], change: &Change) -> CoreResult<()> {
        match change {
            Change::Create(doc) => {
                self.storage.write(change.id(), doc)?;
                for index in indexes {
                    index.insert_document(doc)?;
                }
            }
            Change::Update { old, new } => {
                self.storage.write(change.id(), new)?;
                for index in indexes {
                    index.update_document(old, new)?;
                }
            }
            Change::Delete(old) => {
                self.storage.remove(change.id())?;
                for index in indexes {
                    index.remove_document(old)?;
                }
            }
        }
        Ok(())
    }

    fn commit(
        &self,
        state: &mut CollectionMetadata,
        indexes: &[SecondaryIndex],
        change: &Change,
    ) -> CoreResult<()> {
        self.wal.log(change.record(&self.name))?;
        if let Err(e) = self.apply(indexes, change) {
            self.roll_back(change, &e);
            self.repair_or_flag(indexes, state);
            return Err(e);
        }
        account(state, change);
        state.save(&self.storage)
    }

    fn commit_batch(
        &self,
        state: &mut CollectionMetadata,
        indexes: &[SecondaryIndex],
        changes: Vec<(Option<usize>, Change)>,
        result: &mut BatchResult,
    ) -> CoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let operations = changes.iter().map(|(_, c)| c.record(&self.name)).collect();
        self.wal.log(WalRecord::Batch {
            collection: self.name.clone(),
            operations,
        })?;

        let mut rolled_back = false;
        for (position, change) in changes {
            match self.apply(indexes, &change) {
                Ok(()) => {
                    account(state, &change);
                    result.success += 1;
                }
                Err(e) => {
                    self.roll_back(&change, &e);
                    rolled_back = true;
                    result.fail(position, Some(change.id().to_string()), e);
                }
            }
        }
        if rolled_back {
            self.repair_or_flag(indexes, state);
        }
        state.save(&self.storage)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

fn into_object(value: Value) -> CoreResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CoreError::validation("expected a JSON object")),
    }
}

fn account(state: &mut CollectionMetadata, change: &Change) {
    match change {
        Change::Create(_) => state.document_count += 1,
        Change::Delete(_) => state.document_count = state.document_count.saturating_sub(1),
        Change::Update { .. } => {}
    }
    state.last_modified = now_millis();
}

/// Fails if a unique index, or an earlier item of the same batch, already
/// holds one of `doc`'s keys. Claims the keys on success.
fn check_unique(indexes: &[SecondaryIndex], doc: &Document, claims: &mut Claims) -> CoreResult<()> {
    let id = doc.id().unwrap_or_default();
    let unique: Vec<&SecondaryIndex> = indexes.iter().filter(|i| i.definition().unique).collect();

    for index in &unique {
        index.check_unique(doc)?;
        for key in index.keys_for(doc) {
            if let Some(holder) = claims.get(&(index.name().to_string(), key.clone())) {
                if holder != id {
                    return Err(CoreError::Index {
                        index: index.name().to_string(),
                        key: key.to_string(),
                        existing: holder.clone(),
                    });
                }
            }
        }
    }
    for index in unique {
        for key in index.keys_for(doc) {
            claims.insert((index.name().to_string(), key), id.to_string());
        }
    }
    Ok(())
}

/// Finds a key held by two documents in a freshly built unique index.
fn first_duplicate(index: &SecondaryIndex) -> CoreResult<Option<CoreError>> {
    let entries = index.tree().entries()?;
    Ok(entries
        .windows(2)
        .find(|pair| pair[0].0 == pair[1].0 && pair[0].1 != pair[1].1)
        .map(|pair| CoreError::Index {
            index: index.name().to_string(),
            key: pair[1].0.to_string(),
            existing: pair[0].1.clone(),
        }))
}

/// Recounts documents on disk and keeps the auto-increment counter ahead
/// of every stored id.
fn reconcile(
    storage: &StorageManager,
    schema: &CollectionSchema,
    metadata: &mut CollectionMetadata,
) -> CoreResult<()> {
    let mut count = 0u64;
    for id in storage.ids()? {
        let id = id?;
        count += 1;
        if schema.primary_key == PrimaryKey::AutoIncrement {
            metadata.observe_id(&id);
        }
    }
    if count != metadata.document_count {
        warn!(
            collection = storage.collection(),
            recorded = metadata.document_count,
            on_disk = count,
            "document count out of date, reconciling"
        );
        metadata.document_count = count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::query::SortDirection;
    use serde_json::json;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::new()
            .btree_order(2)
            .sync_on_write(false)
            .cache_capacity(8)
    }

    #[test]
    fn insert_stamps_and_persists() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::new()).unwrap();

        let doc = users.insert(json!({"id": "u1", "name": "Ada"})).unwrap();
        assert_eq!(doc.version(), Some(1));
        assert!(doc.last_modified().is_some());
        assert_eq!(users.get("u1").unwrap(), Some(doc.clone()));
        assert_eq!(users.storage().read_from_disk("u1").unwrap(), Some(doc));
        assert!(temp.path().join("users").join("u1.json").exists());
        assert_eq!(users.metadata().unwrap().document_count, 1);

        let err = users.insert(json!({"id": "u1"})).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        let err = users.insert(json!({"name": "no id"})).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn generated_primary_keys() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();

        let uuids = db.collection("a", CollectionSchema::parse("@id").unwrap()).unwrap();
        let doc = uuids.insert(json!({"x": 1})).unwrap();
        assert_eq!(doc.id().unwrap().len(), 36);

        let counters = db.collection("b", CollectionSchema::parse("++id").unwrap()).unwrap();
        assert_eq!(counters.insert(json!({})).unwrap().id(), Some("1"));
        counters.insert(json!({"id": "7"})).unwrap();
        assert_eq!(counters.insert(json!({})).unwrap().id(), Some("8"));
    }

    #[test]
    fn update_merges_and_checks_version() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::parse("age:number").unwrap()).unwrap();
        users.insert(json!({"id": "u1", "name": "Ada", "age": 36})).unwrap();

        let updated = users.update("u1", json!({"age": 37, "_version": 1})).unwrap();
        assert_eq!(updated.get("name"), Some(&json!("Ada")));
        assert_eq!(updated.get("age"), Some(&json!(37)));
        assert_eq!(updated.version(), Some(2));

        let err = users.update("u1", json!({"age": 38, "_version": 1})).unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { expected: 1, actual: 2, .. }));

        assert!(matches!(
            users.update("u1", json!({"age": "old"})),
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            users.update("u1", json!({"id": "u2"})),
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            users.update("nobody", json!({"age": 1})),
            Err(CoreError::NotFound { .. })
        ));

        let replaced = users.replace(json!({"id": "u1", "nick": "A"})).unwrap();
        assert_eq!(replaced.get("name"), None);
        assert_eq!(replaced.version(), Some(3));
    }

    #[test]
    fn delete_reports_absence() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::parse("&email").unwrap()).unwrap();
        users.insert(json!({"id": "u1", "email": "a@x"})).unwrap();

        assert!(users.delete("u1").unwrap());
        assert!(!users.delete("u1").unwrap());
        assert_eq!(users.get("u1").unwrap(), None);
        assert_eq!(users.metadata().unwrap().document_count, 0);

        // The unique key is free again.
        users.insert(json!({"id": "u2", "email": "a@x"})).unwrap();
    }

    #[test]
    fn unique_index_rejects_second_holder() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::parse("&email").unwrap()).unwrap();

        users.insert(json!({"id": "u1", "email": "a@x"})).unwrap();
        let err = users.insert(json!({"id": "u2", "email": "a@x"})).unwrap_err();
        assert!(matches!(err, CoreError::Index { ref existing, .. } if existing == "u1"));
        assert_eq!(users.get("u2").unwrap(), None);

        // Re-saving the same document keeps its own key.
        users.update("u1", json!({"email": "a@x", "n": 1})).unwrap();
    }

    #[test]
    fn batch_partial_failure() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let items = db.collection("items", CollectionSchema::parse("n:number").unwrap()).unwrap();

        let docs: Vec<Value> = (0..10)
            .map(|i| {
                if i == 5 {
                    json!({"id": format!("i{i}"), "n": "five"})
                } else {
                    json!({"id": format!("i{i}"), "n": i})
                }
            })
            .collect();
        let result = items.insert_many(docs).unwrap();

        assert_eq!(result.success, 9);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].index, Some(5));
        assert_eq!(items.count(&Filter::all()).unwrap(), 9);
        assert_eq!(items.get("i5").unwrap(), None);
        assert_eq!(items.metadata().unwrap().document_count, 9);
    }

    #[test]
    fn batch_detects_conflicts_within_itself() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::parse("&email").unwrap()).unwrap();

        let result = users
            .insert_many(vec![
                json!({"id": "a", "email": "x"}),
                json!({"id": "b", "email": "x"}),
                json!({"id": "a", "email": "y"}),
                json!(42),
            ])
            .unwrap();
        assert_eq!(result.success, 1);
        let positions: Vec<_> = result.failures.iter().map(|f| f.index).collect();
        assert_eq!(positions, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn update_many_and_delete_many() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let items = db.collection("items", CollectionSchema::new()).unwrap();
        items.create_index(IndexDefinition::plain("group")).unwrap();
        for i in 0..6 {
            items
                .insert(json!({"id": format!("i{i}"), "group": i % 2}))
                .unwrap();
        }

        let result = items
            .update_many(&Filter::eq("group", 0), json!({"flag": true, "_version": 99}))
            .unwrap();
        assert_eq!(result.success, 3);
        assert!(result.is_complete());
        assert_eq!(items.count(&Filter::eq("flag", true)).unwrap(), 3);
        assert_eq!(items.get("i0").unwrap().unwrap().version(), Some(2));

        let result = items.delete_many(&Filter::eq("group", 1)).unwrap();
        assert_eq!(result.success, 3);
        assert_eq!(items.count(&Filter::all()).unwrap(), 3);
        assert!(items.find(&Query::new(Filter::eq("group", 1))).unwrap().is_empty());
    }

    #[test]
    fn find_orders_and_pages() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let people = db
            .collection("people", CollectionSchema::parse("age:number").unwrap())
            .unwrap();
        people.create_index(IndexDefinition::plain("age")).unwrap();
        for (id, age) in [("a", 30), ("b", 25), ("c", 41), ("d", 19), ("e", 30)] {
            people.insert(json!({"id": id, "age": age})).unwrap();
        }

        let query = Query::new(Filter::gte("age", 20))
            .order_by("age", SortDirection::Descending)
            .skip(1)
            .limit(2);
        let ids: Vec<String> = people
            .find(&query)
            .unwrap()
            .iter()
            .map(|d| d.id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "e"]);

        assert!(matches!(
            people.explain(&Filter::gte("age", 20)),
            QueryPlan::IndexRange { .. }
        ));
        assert_eq!(
            people.find_one(&Filter::eq("age", 30)).unwrap().unwrap().id(),
            Some("a")
        );
        assert_eq!(people.count(&Filter::lt("age", 26)).unwrap(), 2);
    }

    #[test]
    fn create_and_drop_index() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::parse("&email").unwrap()).unwrap();
        users.insert(json!({"id": "u1", "email": "a", "team": "x"})).unwrap();
        users.insert(json!({"id": "u2", "email": "b", "team": "x"})).unwrap();

        assert!(users.create_index(IndexDefinition::plain("team")).unwrap());
        assert!(!users.create_index(IndexDefinition::plain("team")).unwrap());
        assert!(users.create_index(IndexDefinition::unique("team")).is_err());
        assert!(matches!(
            users.create_index(IndexDefinition::unique("email")),
            Ok(false)
        ));

        assert!(users
            .create_index(IndexDefinition::compound(["team", "email"]))
            .unwrap());
        assert!(users.metadata().unwrap().indexes.contains("team"));

        assert!(users.drop_index("team").unwrap());
        assert!(!users.drop_index("team").unwrap());
        assert!(users.drop_index("&email").is_err());
        assert!(!temp.path().join("users/_indexes/team").exists());
    }

    #[test]
    fn unique_index_over_duplicates_is_refused() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::new()).unwrap();
        users.insert(json!({"id": "u1", "team": "x"})).unwrap();
        users.insert(json!({"id": "u2", "team": "x"})).unwrap();

        let err = users.create_index(IndexDefinition::unique("team")).unwrap_err();
        assert!(matches!(err, CoreError::Index { .. }));
        assert!(users.indexes().is_empty());
    }

    #[test]
    fn verify_reports_healthy_indexes() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let tags = db.collection("posts", CollectionSchema::parse("*tags:string").unwrap()).unwrap();
        for i in 0..20 {
            tags.insert(json!({"id": format!("p{i:02}"), "tags": ["a", format!("t{}", i % 4)]}))
                .unwrap();
        }
        let reports = tags.verify().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_healthy());
        assert_eq!(reports[0].shape.as_ref().unwrap().entries, 40);
    }

    #[test]
    fn cache_invalidation_leaves_disk_alone() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let users = db.collection("users", CollectionSchema::new()).unwrap();
        users.insert(json!({"id": "u1", "team": "x"})).unwrap();
        users.insert(json!({"id": "u2", "team": "y"})).unwrap();

        let dropped = users.invalidate_cache_where(|d| d.get("team") == Some(&json!("x")));
        assert_eq!(dropped, 1);
        assert!(users.get("u1").unwrap().is_some());
    }

    #[test]
    fn auto_increment_refuses_to_wrap() {
        let temp = tempdir().unwrap();
        let db = Database::open_with_config(temp.path(), config()).unwrap();
        let counters = db.collection("counters", CollectionSchema::parse("++id").unwrap()).unwrap();
        counters.insert(json!({"id": u64::MAX.to_string()})).unwrap();

        let err = counters.insert(json!({})).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(counters.count(&Filter::all()).unwrap(), 1);
    }

    #[test]
    fn failed_index_update_is_rolled_back() {
        let temp = tempdir().unwrap();
        let config = config().operation_timeout(Duration::from_millis(100));
        let db = Database::open_with_config(temp.path(), config).unwrap();
        let people = db.collection("people", CollectionSchema::new()).unwrap();
        people.create_index(IndexDefinition::plain("age")).unwrap();
        people.insert(json!({"id": "p1", "age": 30})).unwrap();

        {
            let indexes = people.indexes.read();
            let _held = indexes[0].tree().hold_lock();
            let err = people.update("p1", json!({"age": 40})).unwrap_err();
            assert!(matches!(err, CoreError::Timeout { .. }));

            assert_eq!(people.get("p1").unwrap().unwrap().get("age"), Some(&json!(30)));
            assert_eq!(people.explain(&Filter::eq("age", 30)), QueryPlan::FullScan);
            assert_eq!(people.count(&Filter::eq("age", 30)).unwrap(), 1);
            assert_eq!(people.count(&Filter::eq("age", 40)).unwrap(), 0);
            assert!(people.metadata().unwrap().needs_reindex);
        }

        // The next write repairs the indexes before it runs.
        people.insert(json!({"id": "p2", "age": 40})).unwrap();
        assert!(matches!(
            people.explain(&Filter::eq("age", 40)),
            QueryPlan::IndexLookup { .. }
        ));
        let ids: Vec<String> = people
            .find(&Query::new(Filter::gte("age", 0)))
            .unwrap()
            .iter()
            .map(|d| d.id().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, ["p1", "p2"]);
        assert!(people.verify().unwrap().iter().all(IndexReport::is_healthy));
        let metadata = people.metadata().unwrap();
        assert!(!metadata.needs_reindex);
        assert_eq!(metadata.document_count, 2);
    }

    #[test]
    fn failed_batch_items_stay_gone_after_recovery() {
        let temp = tempdir().unwrap();
        let config = config().operation_timeout(Duration::from_millis(100));
        {
            let db = Database::open_with_config(temp.path(), config.clone()).unwrap();
            let items = db.collection("items", CollectionSchema::new()).unwrap();
            items.create_index(IndexDefinition::plain("n")).unwrap();
            items.insert(json!({"id": "keep", "n": 0})).unwrap();

            let indexes = items.indexes.read();
            let held = indexes[0].tree().hold_lock();
            let result = items
                .insert_many((1..4).map(|i| json!({"id": format!("i{i}"), "n": i})))
                .unwrap();
            assert_eq!(result.success, 0);
            assert_eq!(result.failures.len(), 3);
            assert_eq!(items.get("i1").unwrap(), None);
            assert_eq!(items.count(&Filter::all()).unwrap(), 1);
            drop(held);
            drop(indexes);
        }

        let db = Database::open_with_config(temp.path(), config).unwrap();
        let items = db.collection("items", CollectionSchema::new()).unwrap();
        assert_eq!(items.count(&Filter::all()).unwrap(), 1);
        for id in ["i1", "i2", "i3"] {
            assert_eq!(items.get(id).unwrap(), None);
        }
        assert_eq!(items.metadata().unwrap().document_count, 1);
        assert!(items.verify().unwrap().iter().all(IndexReport::is_healthy));
    }

    #[test]
    fn held_locks_time_out() {
        let temp = tempdir().unwrap();
        let config = config().operation_timeout(Duration::from_millis(100));
        let db = Database::open_with_config(temp.path(), config).unwrap();
        let users = db.collection("users", CollectionSchema::parse("&email").unwrap()).unwrap();
        users.insert(json!({"id": "u1", "email": "a@x"})).unwrap();

        {
            let indexes = users.indexes.read();
            let _held = indexes[0].tree().hold_lock();
            let by_email = Query::new(Filter::eq("email", "a@x"));
            assert!(matches!(users.find(&by_email), Err(CoreError::Timeout { .. })));
            assert!(matches!(users.delete("u1"), Err(CoreError::Timeout { .. })));
            // Document reads never touch the tree.
            assert!(users.get("u1").unwrap().is_some());
        }

        {
            let _gate = users.state.lock();
            assert!(matches!(
                users.insert(json!({"id": "u2", "email": "b@x"})),
                Err(CoreError::Timeout { operation: "insert" })
            ));
            assert!(matches!(users.metadata(), Err(CoreError::Timeout { .. })));
        }

        assert!(users.delete("u1").unwrap());
        assert_eq!(users.count(&Filter::all()).unwrap(), 0);
    }
}
