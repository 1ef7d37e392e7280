//! Verify command implementation.

use super::{ensure_database, CliError, CliResult};
use docdb_core::collection::IndexReport;
use docdb_core::dir::WAL_DIR;
use docdb_core::wal::WalReplay;
use docdb_core::{CollectionSchema, Config, Database};
use std::path::Path;
use tracing::info;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// WAL records read.
    pub wal_records: usize,
    /// Corrupt WAL lines.
    pub corrupt_lines: usize,
    /// Index reports per collection.
    pub indexes: Vec<(String, IndexReport)>,
    /// Collections whose indexes are due for a rebuild on the next open.
    pub reindex_pending: Vec<String>,
}

impl VerifyResult {
    /// Number of problems found.
    #[must_use]
    pub fn problems(&self) -> usize {
        self.corrupt_lines
            + self
                .indexes
                .iter()
                .filter(|(_, report)| !report.is_healthy())
                .count()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying database at {}", path.display());
    println!();

    let result = verify(path)?;
    println!(
        "WAL: {} records, {} corrupt lines",
        result.wal_records, result.corrupt_lines
    );
    for collection in &result.reindex_pending {
        println!("{collection}: indexes pending rebuild");
    }
    for (collection, report) in &result.indexes {
        print_report(collection, report);
    }

    println!();
    match result.problems() {
        0 => {
            println!("✓ Database verification passed");
            Ok(())
        }
        n => {
            println!("✗ Database verification failed");
            Err(CliError::VerificationFailed(n))
        }
    }
}

/// Checks the WAL as it is on disk, then opens the database and checks
/// every index of every collection as stored.
///
/// Indexes are not rebuilt on open, so damage recovery would otherwise
/// paper over is still reported.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    ensure_database(path)?;
    info!("Verifying {:?}", path);
    let mut result = VerifyResult::default();

    // Read before opening: recovery checkpoints the segments away.
    let mut replay = WalReplay::open(&path.join(WAL_DIR))?;
    for record in replay.by_ref() {
        record?;
        result.wal_records += 1;
    }
    result.corrupt_lines = replay.skipped();

    let db = Database::open_with_config(path, Config::default().reindex_on_open(false))?;
    for name in db.collection_names()? {
        let collection = db.collection(&name, CollectionSchema::new())?;
        if collection.metadata()?.needs_reindex {
            result.reindex_pending.push(name.clone());
        }
        for report in collection.verify()? {
            result.indexes.push((name.clone(), report));
        }
    }
    Ok(result)
}

fn print_report(collection: &str, report: &IndexReport) {
    let status = if report.is_healthy() { "ok" } else { "FAILED" };
    print!("{collection}/{}: {status}", report.index);
    if let Some(shape) = &report.shape {
        print!(
            " (height {}, {} nodes, {} keys, {} entries)",
            shape.height, shape.nodes, shape.keys, shape.entries
        );
    }
    println!();
    if let Some(violation) = &report.violation {
        println!("  violation: {violation}");
    }
    for id in &report.dangling {
        println!("  dangling entry: {id}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::IndexDefinition;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn healthy_database_passes() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open_with_config(temp.path(), Config::new().btree_order(2)).unwrap();
            let posts = db
                .collection("posts", CollectionSchema::parse("*tags").unwrap())
                .unwrap();
            for i in 0..12 {
                posts
                    .insert(json!({"id": format!("p{i}"), "tags": [format!("t{}", i % 3)]}))
                    .unwrap();
            }
        }

        let result = verify(temp.path()).unwrap();
        assert_eq!(result.wal_records, 12);
        assert_eq!(result.indexes.len(), 1);
        assert_eq!(result.problems(), 0);
    }

    #[test]
    fn corrupt_wal_lines_are_problems() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path()).unwrap();
            let items = db.collection("items", CollectionSchema::new()).unwrap();
            items.insert(json!({"id": "a"})).unwrap();
        }
        let segment = temp.path().join("_wal").join("segment-1.log");
        let mut bytes = fs::read(&segment).unwrap();
        bytes.extend_from_slice(b"deadbeef\tnot json\n");
        fs::write(&segment, bytes).unwrap();

        let result = verify(temp.path()).unwrap();
        assert_eq!(result.corrupt_lines, 1);
        assert_eq!(result.problems(), 1);
    }

    #[test]
    fn stale_index_is_checked_as_stored() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path()).unwrap();
            let schema = CollectionSchema::new()
                .with_index(IndexDefinition::plain("author"))
                .unwrap();
            let posts = db.collection("posts", schema).unwrap();
            posts.insert(json!({"id": "p1", "author": "ann"})).unwrap();
            posts.insert(json!({"id": "p2", "author": "bob"})).unwrap();
            db.checkpoint().unwrap();

            // A logged write makes recovery flag the collection for reindex.
            posts.insert(json!({"id": "p3", "author": "cy"})).unwrap();
            posts.storage().remove("p1").unwrap();
        }

        let result = verify(temp.path()).unwrap();
        assert_eq!(result.reindex_pending, ["posts"]);
        let (_, report) = &result.indexes[0];
        assert_eq!(report.dangling, ["p1"]);
        assert_eq!(result.problems(), 1);
    }
}
