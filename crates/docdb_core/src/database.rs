//! Database facade and recovery.

use crate::collection::Collection;
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::recovery::{recover, RecoveryReport};
use crate::schema::CollectionSchema;
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::wal::{WalManager, WalOptions};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The main database handle.
///
/// `Database` is the entry point for docdb. It:
/// - holds the directory lock for the lifetime of the handle
/// - owns the write-ahead log shared by every collection
/// - recovers document files from the WAL when opened
/// - hands out collection handles
///
/// # Opening a Database
///
/// ```rust,ignore
/// use docdb_core::{CollectionSchema, Database};
/// use serde_json::json;
/// use std::path::Path;
///
/// let db = Database::open(Path::new("my_database"))?;
/// let users = db.collection("users", CollectionSchema::parse("@id; &email")?)?;
/// users.insert(json!({"email": "ada@example.com"}))?;
/// db.checkpoint()?;
/// ```
pub struct Database {
    config: Config,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    wal: Arc<WalManager>,
    /// Writers hold it shared; checkpoints take it exclusively.
    ops_gate: Arc<RwLock<()>>,
    stats: Arc<DatabaseStats>,
    recovery: RecoveryReport,
    /// Dropped last so the lock outlives the WAL writer.
    dir: DatabaseDir,
}

impl Database {
    /// Opens a database from a directory path with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another handle has the database locked (`DatabaseLocked`)
    /// - The WAL directory cannot be read (`WalReplay`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database with custom configuration.
    ///
    /// The directory is locked, the WAL opened on a fresh segment, and every
    /// earlier segment replayed into the document files and checkpointed.
    ///
    /// ```rust,ignore
    /// let config = Config::default()
    ///     .cache_capacity(10_000)
    ///     .sync_on_write(false);
    /// let db = Database::open_with_config(Path::new("my_database"), config)?;
    /// ```
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let stats = Arc::new(DatabaseStats::new());

        let wal = WalManager::open(&dir.wal_dir(), WalOptions::from_config(&config))?
            .with_stats(Arc::clone(&stats));
        let recovery = recover(&dir, &wal, &config, &stats)?;
        dir.sync()?;

        info!(path = %path.display(), "opened database");
        Ok(Self {
            config,
            collections: RwLock::new(HashMap::new()),
            wal: Arc::new(wal),
            ops_gate: Arc::new(RwLock::new(())),
            stats,
            recovery,
            dir,
        })
    }

    /// Returns the handle of collection `name`, opening it on first use.
    ///
    /// Later calls return the same handle.
    ///
    /// # Errors
    ///
    /// - `Validation` for unusable names
    /// - `InvalidOperation` if the collection is already open with a
    ///   different schema
    pub fn collection(&self, name: &str, schema: CollectionSchema) -> CoreResult<Arc<Collection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Self::same_schema(existing, &schema);
        }

        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Self::same_schema(existing, &schema);
        }
        let collection = Arc::new(Collection::open(
            name,
            self.dir.collection_dir(name)?,
            schema,
            &self.config,
            Arc::clone(&self.wal),
            Arc::clone(&self.ops_gate),
            Arc::clone(&self.stats),
        )?);
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    fn same_schema(existing: &Arc<Collection>, schema: &CollectionSchema) -> CoreResult<Arc<Collection>> {
        if existing.schema() == schema {
            Ok(Arc::clone(existing))
        } else {
            Err(CoreError::invalid_operation(format!(
                "collection {} is already open with a different schema",
                existing.name()
            )))
        }
    }

    /// Names of every collection on disk, sorted.
    pub fn collection_names(&self) -> CoreResult<Vec<String>> {
        self.dir.collection_names()
    }

    /// Makes every logged write permanent and deletes the covered WAL
    /// segments. Returns how many segments were deleted.
    ///
    /// Writers are held off while the active segment is rotated, so every
    /// record in the deleted segments is already reflected in the document
    /// files.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if in-flight writes do not finish in time.
    pub fn checkpoint(&self) -> CoreResult<usize> {
        let _quiesce = self
            .ops_gate
            .try_write_for(self.config.operation_timeout)
            .ok_or(CoreError::Timeout {
                operation: "checkpoint",
            })?;

        let active = self.wal.rotate()?;
        let deleted = self.wal.checkpoint(active - 1)?;
        self.stats.record_checkpoint();
        info!(segment = active, deleted, "checkpoint complete");
        Ok(deleted)
    }

    /// WAL segment numbers on disk, ascending.
    pub fn wal_segments(&self) -> CoreResult<Vec<u64>> {
        self.wal.segments()
    }

    /// The WAL shared by every collection.
    #[must_use]
    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    /// A snapshot of the usage counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// What recovery did when this handle was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Returns the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.dir.path())
            .field("collections", &self.collections.read().len())
            .field("active_segment", &self.wal.active_segment())
            .finish_non_exhaustive()
    }
}
