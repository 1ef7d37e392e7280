//! Inspect command implementation.
//!
//! Reads the directory without taking the database lock, so it works while
//! another process has the database open.

use super::{ensure_database, format_size, CliResult, OutputFormat};
use docdb_core::collection::{CollectionMetadata, METADATA_KEY};
use docdb_core::dir::{validate_collection_name, WAL_DIR};
use docdb_core::wal::{list_segments, segment_path};
use docdb_storage::{BlobStore, FileBlobStore};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Collections found on disk.
    pub collections: Vec<CollectionInfo>,
    /// WAL segments, ascending.
    pub segments: Vec<SegmentInfo>,
}

/// One collection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Document files on disk.
    pub documents_on_disk: u64,
    /// Persisted metadata, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CollectionMetadata>,
}

/// One WAL segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Segment number.
    pub number: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    ensure_database(path)?;

    let mut collections = Vec::new();
    let mut names: Vec<String> = fs::read_dir(path)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| validate_collection_name(name).is_ok())
        .collect();
    names.sort();

    for name in names {
        let store = FileBlobStore::open(&path.join(&name), "json")?;
        let mut documents_on_disk = 0;
        for key in store.keys()? {
            key?;
            documents_on_disk += 1;
        }
        let metadata = match store.get(METADATA_KEY)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        collections.push(CollectionInfo {
            name,
            documents_on_disk,
            metadata,
        });
    }

    let wal_dir = path.join(WAL_DIR);
    let mut segments = Vec::new();
    for number in list_segments(&wal_dir)? {
        let size = fs::metadata(segment_path(&wal_dir, number)).map_or(0, |m| m.len());
        segments.push(SegmentInfo { number, size });
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        collections,
        segments,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("docdb Database Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Collections:");
    if result.collections.is_empty() {
        println!("  (none)");
    }
    for col in &result.collections {
        println!("  {}: {} documents on disk", col.name, col.documents_on_disk);
        if let Some(meta) = &col.metadata {
            println!("    recorded count: {}", meta.document_count);
            let indexes: Vec<&str> = meta.indexes.iter().map(String::as_str).collect();
            println!("    indexes:        {}", indexes.join(", "));
            if meta.needs_reindex {
                println!("    needs reindex");
            }
        }
    }
    println!();
    println!("WAL segments:");
    let total: u64 = result.segments.iter().map(|s| s.size).sum();
    for seg in &result.segments {
        println!("  segment-{}.log  {}", seg.number, format_size(seg.size));
    }
    println!("  total: {}", format_size(total));
}
