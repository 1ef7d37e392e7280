//! Checkpoint command implementation.

use super::{ensure_database, CliResult};
use docdb_core::Database;
use std::path::Path;
use tracing::info;

/// Outcome of a checkpoint run.
#[derive(Debug)]
pub struct CheckpointResult {
    /// Records replayed while opening.
    pub replayed: usize,
    /// Documents recovery rewrote or removed.
    pub repaired: usize,
    /// Segments deleted, by recovery and by the checkpoint itself.
    pub segments_deleted: usize,
    /// Segments left on disk.
    pub segments_remaining: Vec<u64>,
}

/// Runs the checkpoint command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Checkpointing database at {}", path.display());
    let result = checkpoint(path)?;
    println!("  Records replayed:   {}", result.replayed);
    println!("  Documents repaired: {}", result.repaired);
    println!("  Segments deleted:   {}", result.segments_deleted);
    println!("  Segments remaining: {:?}", result.segments_remaining);
    println!();
    println!("✓ Checkpoint complete");
    Ok(())
}

/// Opens the database, which replays the WAL, and checkpoints it.
pub fn checkpoint(path: &Path) -> CliResult<CheckpointResult> {
    ensure_database(path)?;
    info!("Checkpointing {:?}", path);
    let db = Database::open(path)?;
    let report = db.recovery_report().clone();
    let deleted = db.checkpoint()?;
    Ok(CheckpointResult {
        replayed: report.records,
        repaired: report.documents_written + report.documents_deleted,
        segments_deleted: report.checkpointed + deleted,
        segments_remaining: db.wal_segments()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::CollectionSchema;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn checkpoint_leaves_one_segment() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path()).unwrap();
            let items = db.collection("items", CollectionSchema::new()).unwrap();
            items.insert(json!({"id": "a"})).unwrap();
            items.insert(json!({"id": "b"})).unwrap();
        }

        let result = checkpoint(temp.path()).unwrap();
        assert_eq!(result.replayed, 2);
        assert_eq!(result.repaired, 0);
        assert_eq!(result.segments_deleted, 2);
        assert_eq!(result.segments_remaining.len(), 1);

        let db = Database::open(temp.path()).unwrap();
        let items = db.collection("items", CollectionSchema::new()).unwrap();
        assert!(items.get("a").unwrap().is_some());
    }

    #[test]
    fn missing_database_is_reported() {
        let temp = tempdir().unwrap();
        assert!(matches!(
            checkpoint(&temp.path().join("nothing")),
            Err(super::super::CliError::NoDatabase(_))
        ));
    }
}
