//! Find command implementation.

use super::{ensure_database, CliError, CliResult};
use docdb_core::{CollectionSchema, Database, Document, Filter, Query, QueryPlan, SortDirection};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Options of the find command.
#[derive(Debug, Default, Clone)]
pub struct FindOptions {
    /// Field to sort by.
    pub order_by: Option<String>,
    /// Sort descending instead of ascending.
    pub descending: bool,
    /// Matches to skip.
    pub skip: usize,
    /// Maximum number of matches to print.
    pub limit: Option<usize>,
    /// Print the query plan instead of running the query.
    pub explain: bool,
}

/// What a find run produced.
#[derive(Debug)]
pub enum FindOutput {
    /// The plan the query would use.
    Plan(QueryPlan),
    /// Matching documents.
    Documents(Vec<Document>),
}

/// Runs the find command.
pub fn run(path: &Path, collection: &str, filter: &str, options: &FindOptions) -> CliResult<()> {
    match find(path, collection, filter, options)? {
        FindOutput::Plan(plan) => {
            println!("{plan}");
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        FindOutput::Documents(docs) => {
            let values: Vec<Value> = docs.into_iter().map(Document::into_value).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
    }
    Ok(())
}

/// Opens the database and runs one query against `collection`.
pub fn find(
    path: &Path,
    collection: &str,
    filter: &str,
    options: &FindOptions,
) -> CliResult<FindOutput> {
    ensure_database(path)?;
    let filter_json: Value = serde_json::from_str(filter)
        .map_err(|e| CliError::InvalidArgument(format!("filter is not valid JSON: {e}")))?;
    let filter = Filter::from_json(&filter_json)?;
    debug!(collection, ?filter, "running query");

    let db = Database::open(path)?;
    if !db.collection_names()?.iter().any(|name| name == collection) {
        return Err(CliError::InvalidArgument(format!(
            "no collection named {collection}"
        )));
    }
    let coll = db.collection(collection, CollectionSchema::new())?;

    if options.explain {
        return Ok(FindOutput::Plan(coll.explain(&filter)));
    }

    let mut query = Query::new(filter).skip(options.skip);
    if let Some(field) = &options.order_by {
        let direction = if options.descending {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        };
        query = query.order_by(field.clone(), direction);
    }
    if let Some(limit) = options.limit {
        query = query.limit(limit);
    }
    Ok(FindOutput::Documents(coll.find(&query)?))
}
