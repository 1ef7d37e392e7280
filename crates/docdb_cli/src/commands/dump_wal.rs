//! Dump WAL command implementation.

use super::{ensure_database, CliResult, OutputFormat};
use docdb_core::dir::WAL_DIR;
use docdb_core::wal::{ReplayedRecord, WalRecord, WalReplay};
use serde::Serialize;
use std::path::Path;

/// WAL record representation for output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalRecordInfo {
    /// Segment number.
    pub segment: u64,
    /// Byte offset in the segment.
    pub offset: u64,
    /// Record type.
    pub record_type: String,
    /// Collection name.
    pub collection: String,
    /// Document id, for single-document records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Number of operations, for batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<usize>,
}

impl From<ReplayedRecord> for WalRecordInfo {
    fn from(replayed: ReplayedRecord) -> Self {
        let record = replayed.record;
        let operations = match &record {
            WalRecord::Batch { operations, .. } => Some(operations.len()),
            _ => None,
        };
        Self {
            segment: replayed.position.segment,
            offset: replayed.position.offset,
            record_type: record.record_type().to_string(),
            collection: record.collection().to_string(),
            id: record.document_id().map(str::to_string),
            operations,
        }
    }
}

/// Runs the dump-wal command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CliResult<()> {
    let (records, skipped) = read_records(path, limit)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print_text_output(&records, skipped),
    }
    Ok(())
}

/// Reads up to `limit` records. Also returns how many corrupt lines were
/// skipped on the way.
pub fn read_records(path: &Path, limit: Option<usize>) -> CliResult<(Vec<WalRecordInfo>, usize)> {
    ensure_database(path)?;
    let mut replay = WalReplay::open(&path.join(WAL_DIR))?;
    let mut records = Vec::new();
    for replayed in replay.by_ref().take(limit.unwrap_or(usize::MAX)) {
        records.push(WalRecordInfo::from(replayed?));
    }
    Ok((records, replay.skipped()))
}

fn print_text_output(records: &[WalRecordInfo], skipped: usize) {
    println!("{:>10}  {:<7} {:<16} ID", "POSITION", "TYPE", "COLLECTION");
    for r in records {
        let detail = match (&r.id, r.operations) {
            (Some(id), _) => id.clone(),
            (None, Some(n)) => format!("({n} operations)"),
            (None, None) => String::new(),
        };
        println!(
            "{:>10}  {:<7} {:<16} {}",
            format!("{}:{}", r.segment, r.offset),
            r.record_type,
            r.collection,
            detail
        );
    }
    println!();
    println!("{} records, {} corrupt lines skipped", records.len(), skipped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_core::{CollectionSchema, Database};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn lists_records_in_order() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path()).unwrap();
            let items = db.collection("items", CollectionSchema::new()).unwrap();
            items.insert(json!({"id": "a"})).unwrap();
            items.update("a", json!({"n": 1})).unwrap();
            items
                .insert_many(vec![json!({"id": "b"}), json!({"id": "c"})])
                .unwrap();
            items.delete("a").unwrap();
        }

        let (records, skipped) = read_records(temp.path(), None).unwrap();
        assert_eq!(skipped, 0);
        let types: Vec<&str> = records.iter().map(|r| r.record_type.as_str()).collect();
        assert_eq!(types, vec!["create", "update", "batch", "delete"]);
        assert_eq!(records[2].operations, Some(2));
        assert_eq!(records[0].offset, 0);

        let (limited, _) = read_records(temp.path(), Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
