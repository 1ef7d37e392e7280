//! # docdb core
//!
//! Core engine of docdb, an embedded store of JSON documents kept one file
//! per document.
//!
//! This crate provides:
//! - Persistent B-tree secondary indexes (unique, multi-value, compound)
//! - A segmented write-ahead log with batching writer, replay and checkpoints
//! - Document storage behind an LRU/LFU cache with TTL
//! - A query planner choosing between index lookups, range scans and full scans
//! - Collections tying these together, and a database facade with recovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use docdb_core::{CollectionSchema, Database, Filter, Query, SortDirection};
//! use serde_json::json;
//!
//! let db = Database::open(std::path::Path::new("data"))?;
//! let users = db.collection("users", CollectionSchema::parse("@id; &email; age:number")?)?;
//! users.insert(json!({"email": "ada@example.com", "age": 36}))?;
//!
//! let query = Query::new(Filter::gte("age", 18)).order_by("age", SortDirection::Descending);
//! for doc in users.find(&query)? {
//!     println!("{}", doc.id().unwrap_or_default());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collection;
mod config;
mod database;
pub mod dir;
mod document;
mod error;
pub mod index;
pub mod query;
pub mod recovery;
mod schema;
mod stats;
pub mod storage;
pub mod wal;

pub use collection::{BatchFailure, BatchResult, Collection, CollectionMetadata, IndexReport};
pub use config::Config;
pub use database::Database;
pub use dir::DatabaseDir;
pub use document::{
    decode_id, encode_id, Document, ID_FIELD, LAST_MODIFIED_FIELD, VERSION_FIELD,
};
pub use error::{CoreError, CoreResult};
pub use query::{Filter, Predicate, Query, QueryPlan, SortDirection, SortKey};
pub use recovery::RecoveryReport;
pub use schema::{CollectionSchema, FieldSchema, FieldType, IndexDefinition, PrimaryKey};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use storage::CachePolicy;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
