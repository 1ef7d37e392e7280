//! Startup recovery: bring document files up to date with the WAL.
//!
//! Every record is replayed in log order and folded per
//! `(collection, id)` into a final state, either a document or a deletion.
//! Each final state is then applied to the collection's storage. Because
//! records carry whole documents, applying the same log twice leaves the
//! same files behind.
//!
//! Touched collections are flagged `needs_reindex`; their indexes are
//! rebuilt the next time the collection is opened.

use crate::collection::CollectionMetadata;
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::stats::DatabaseStats;
use crate::storage::{CacheOptions, StorageManager};
use crate::wal::{WalManager, WalRecord, WalReplay};
use docdb_storage::FileBlobStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Segments read.
    pub segments: Vec<u64>,
    /// Records replayed, with batches expanded.
    pub records: usize,
    /// Corrupt lines skipped.
    pub skipped_lines: usize,
    /// Documents rewritten because disk differed from the log.
    pub documents_written: usize,
    /// Documents removed.
    pub documents_deleted: usize,
    /// Collections the log referred to.
    pub collections: BTreeSet<String>,
    /// Segments deleted by the closing checkpoint.
    pub checkpointed: usize,
}

/// Replays the whole WAL into storage, then checkpoints every segment
/// before the active one.
///
/// # Errors
///
/// Fails if the segment directory cannot be read or a document cannot be
/// written. Corrupt lines are skipped and counted.
pub fn recover(
    dir: &DatabaseDir,
    wal: &WalManager,
    config: &Config,
    stats: &Arc<DatabaseStats>,
) -> CoreResult<RecoveryReport> {
    let mut report = replay_into(dir, wal.replay()?, config, stats)?;

    let active = wal.active_segment();
    if active > 1 {
        report.checkpointed = wal.checkpoint(active - 1)?;
    }
    info!(
        segments = report.segments.len(),
        records = report.records,
        skipped = report.skipped_lines,
        written = report.documents_written,
        deleted = report.documents_deleted,
        checkpointed = report.checkpointed,
        "recovery complete"
    );
    Ok(report)
}

/// Applies every record of `replay` to the document files without
/// touching the WAL.
pub fn replay_into(
    dir: &DatabaseDir,
    mut replay: WalReplay,
    config: &Config,
    stats: &Arc<DatabaseStats>,
) -> CoreResult<RecoveryReport> {
    let mut report = RecoveryReport {
        segments: replay.segments().to_vec(),
        ..RecoveryReport::default()
    };

    // Later records overwrite earlier ones: the map ends up holding each
    // document's final state.
    let mut final_states: BTreeMap<String, BTreeMap<String, Option<Document>>> = BTreeMap::new();
    for replayed in replay.by_ref() {
        let replayed = replayed?;
        for record in replayed.record.flatten() {
            report.records += 1;
            let collection = record.collection().to_string();
            let (id, state) = match record {
                WalRecord::Create { id, document, .. } | WalRecord::Update { id, document, .. } => {
                    (id, Some(document))
                }
                WalRecord::Delete { id, .. } => (id, None),
                WalRecord::Batch { .. } => continue,
            };
            final_states.entry(collection).or_default().insert(id, state);
        }
    }
    report.skipped_lines = replay.skipped();

    for (collection, documents) in final_states {
        let collection_dir = match dir.collection_dir(&collection) {
            Ok(path) => path,
            Err(e) => {
                warn!(collection = %collection, error = %e, "skipping WAL records for unusable collection name");
                continue;
            }
        };
        let store = FileBlobStore::open(&collection_dir, "json")?.sync_writes(config.sync_on_write);
        let storage = StorageManager::new(
            collection.as_str(),
            Arc::new(store),
            CacheOptions::disabled(),
            Arc::clone(stats),
        )?;

        for (id, state) in documents {
            match state {
                Some(doc) => {
                    if storage.read_from_disk(&id)?.as_ref() != Some(&doc) {
                        storage.write(&id, &doc)?;
                        report.documents_written += 1;
                    }
                }
                None => match storage.remove(&id) {
                    Ok(()) => report.documents_deleted += 1,
                    Err(CoreError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                },
            }
        }

        let mut metadata = CollectionMetadata::load(&storage)?;
        metadata.needs_reindex = true;
        metadata.save(&storage)?;
        debug!(collection = %collection, "flagged collection for reindex");
        report.collections.insert(collection);
    }

    Ok(report)
}
