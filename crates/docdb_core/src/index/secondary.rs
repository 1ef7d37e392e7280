//! A secondary index: a definition bound to its B-tree.

use super::key::{document_keys, IndexKey};
use super::tree::BTree;
use crate::dir::remove_dir_if_exists;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::schema::IndexDefinition;
use docdb_storage::{BlobStore, FileBlobStore, MemoryBlobStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Directory holding a collection's index trees.
pub const INDEXES_DIR: &str = "_indexes";

/// Tuning shared by every tree of a collection.
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// B-tree minimum degree.
    pub order: usize,
    /// Decoded nodes cached per tree.
    pub node_cache_capacity: usize,
    /// Bound on waiting for a busy tree.
    pub timeout: Duration,
    /// Fsync node writes.
    pub sync_writes: bool,
}

/// A secondary index over one collection.
///
/// The tree stores every key a document contributes (see
/// [`document_keys`]). Uniqueness is enforced here, before the tree is
/// touched.
#[derive(Debug)]
pub struct SecondaryIndex {
    definition: IndexDefinition,
    name: String,
    tree: BTree,
    dir: Option<PathBuf>,
}

impl SecondaryIndex {
    /// Opens the persistent index under `{collection_dir}/_indexes/`.
    pub fn open(
        definition: IndexDefinition,
        collection_dir: &Path,
        options: &IndexOptions,
    ) -> CoreResult<Self> {
        let dir = collection_dir
            .join(INDEXES_DIR)
            .join(definition.dir_name());
        let store = FileBlobStore::open(&dir, "json")?.sync_writes(options.sync_writes);
        Self::with_store(definition, Box::new(store), Some(dir), options)
    }

    /// An index kept entirely in memory.
    pub fn in_memory(definition: IndexDefinition, options: &IndexOptions) -> CoreResult<Self> {
        Self::with_store(definition, Box::new(MemoryBlobStore::new()), None, options)
    }

    fn with_store(
        definition: IndexDefinition,
        store: Box<dyn BlobStore>,
        dir: Option<PathBuf>,
        options: &IndexOptions,
    ) -> CoreResult<Self> {
        let name = definition.name();
        let tree = BTree::open(
            name.clone(),
            store,
            options.order,
            options.node_cache_capacity,
            options.timeout,
        )?;
        Ok(Self {
            definition,
            name,
            tree,
            dir,
        })
    }

    /// The definition this index was built from.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Canonical name, e.g. `&email`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying tree.
    #[must_use]
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Keys `doc` contributes to this index.
    #[must_use]
    pub fn keys_for(&self, doc: &Document) -> Vec<IndexKey> {
        document_keys(&self.definition, doc)
    }

    /// Fails if a unique key of `doc` is already held by another document.
    ///
    /// Non-unique indexes always pass.
    pub fn check_unique(&self, doc: &Document) -> CoreResult<()> {
        if !self.definition.unique {
            return Ok(());
        }
        let own_id = doc.id().unwrap_or_default();
        for key in self.keys_for(doc) {
            let holders = self.tree.find_all(&key)?;
            if let Some(existing) = holders.into_iter().find(|id| id != own_id) {
                return Err(CoreError::Index {
                    index: self.name.clone(),
                    key: key.to_string(),
                    existing,
                });
            }
        }
        Ok(())
    }

    /// Adds every key of `doc`.
    pub fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        let Some(id) = doc.id() else {
            return Ok(());
        };
        for key in self.keys_for(doc) {
            self.tree.insert(key, id)?;
        }
        Ok(())
    }

    /// Removes every key of `doc`.
    pub fn remove_document(&self, doc: &Document) -> CoreResult<()> {
        let Some(id) = doc.id() else {
            return Ok(());
        };
        for key in self.keys_for(doc) {
            self.tree.delete(&key, Some(id))?;
        }
        Ok(())
    }

    /// Moves a document from its old keys to its new ones, touching only
    /// the keys that changed.
    pub fn update_document(&self, old: &Document, new: &Document) -> CoreResult<()> {
        let Some(id) = new.id() else {
            return Ok(());
        };
        let old_keys = self.keys_for(old);
        let new_keys = self.keys_for(new);
        for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
            self.tree.delete(key, Some(id))?;
        }
        for key in new_keys.into_iter().filter(|k| !old_keys.contains(k)) {
            self.tree.insert(key, id)?;
        }
        Ok(())
    }

    /// Clears the tree and reinserts every document. Returns how many
    /// documents were indexed.
    ///
    /// Unique violations found in existing data are logged, not rejected.
    pub fn rebuild<I>(&self, docs: I) -> CoreResult<usize>
    where
        I: IntoIterator<Item = CoreResult<Document>>,
    {
        self.tree.clear()?;
        let mut count = 0;
        for doc in docs {
            let doc = doc?;
            if let Err(e) = self.check_unique(&doc) {
                warn!(index = %self.name, error = %e, "existing data violates unique index");
            }
            self.insert_document(&doc)?;
            count += 1;
        }
        debug!(index = %self.name, documents = count, "rebuilt index");
        Ok(count)
    }

    /// Deletes the index and its directory.
    pub fn destroy(self) -> CoreResult<()> {
        self.tree.clear()?;
        match &self.dir {
            Some(dir) => remove_dir_if_exists(dir),
            None => Ok(()),
        }
    }
}
