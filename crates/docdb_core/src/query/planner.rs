//! Index selection and query execution.
//!
//! The planner looks only at the top-level conjunction of a filter. An
//! equality on an indexed field becomes a point lookup; ordering predicates
//! on an indexed field become a range scan; anything else is a full scan.
//! Whatever the plan, every candidate is re-checked against the whole
//! filter, so a plan only ever narrows the set of documents read.

use super::filter::{Filter, Predicate};
use super::{compare_for_sort, Query, SortDirection};
use crate::document::Document;
use crate::error::CoreResult;
use crate::index::{IndexKey, SecondaryIndex};
use crate::schema::{CollectionSchema, FieldType};
use crate::stats::DatabaseStats;
use crate::storage::StorageManager;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// One end of an index range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeBound {
    /// Boundary key.
    pub key: IndexKey,
    /// Whether the boundary itself is included.
    pub inclusive: bool,
}

/// How a query will find its candidates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "camelCase")]
pub enum QueryPlan {
    /// Read every document in the collection.
    FullScan,
    /// Read the documents stored under one key.
    IndexLookup {
        /// Canonical index name.
        index: String,
        /// Key looked up.
        key: IndexKey,
    },
    /// Read the documents whose keys fall in a range.
    IndexRange {
        /// Canonical index name.
        index: String,
        /// Lower end, if bounded below.
        lower: Option<RangeBound>,
        /// Upper end, if bounded above.
        upper: Option<RangeBound>,
    },
}

impl QueryPlan {
    /// The index used, if any.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        match self {
            Self::FullScan => None,
            Self::IndexLookup { index, .. } | Self::IndexRange { index, .. } => Some(index),
        }
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullScan => f.write_str("full scan"),
            Self::IndexLookup { index, key } => write!(f, "lookup {index} = {key}"),
            Self::IndexRange {
                index,
                lower,
                upper,
            } => {
                write!(f, "range {index} ")?;
                match lower {
                    Some(b) => write!(f, "{}{}", if b.inclusive { '[' } else { '(' }, b.key)?,
                    None => f.write_str("(-inf")?,
                }
                f.write_str(", ")?;
                match upper {
                    Some(b) => write!(f, "{}{}", b.key, if b.inclusive { ']' } else { ')' }),
                    None => f.write_str("+inf)"),
                }
            }
        }
    }
}

/// Chooses a plan for a filter given a collection's indexes.
pub struct QueryPlanner<'a> {
    indexes: &'a [SecondaryIndex],
    schema: &'a CollectionSchema,
}

impl<'a> QueryPlanner<'a> {
    /// A planner over `indexes`. The schema tells which fields can never
    /// hold arrays.
    #[must_use]
    pub fn new(indexes: &'a [SecondaryIndex], schema: &'a CollectionSchema) -> Self {
        Self { indexes, schema }
    }

    /// Picks a plan for `filter`.
    #[must_use]
    pub fn plan(&self, filter: &Filter) -> QueryPlan {
        let mut terms = Vec::new();
        collect_conjuncts(filter, &mut terms);
        if terms.is_empty() {
            return QueryPlan::FullScan;
        }

        self.point_lookup(&terms)
            .or_else(|| self.range_scan(&terms))
            .unwrap_or(QueryPlan::FullScan)
    }

    fn point_lookup(&self, terms: &[(&str, &Predicate)]) -> Option<QueryPlan> {
        let equality = |field: &str| {
            terms.iter().find_map(|(path, predicate)| match predicate {
                Predicate::Eq(value) if *path == field => IndexKey::from_scalar(value),
                _ => None,
            })
        };

        // Unique single-field indexes first, then other single-field ones,
        // then compound indexes with every component pinned.
        let mut candidates: Vec<&SecondaryIndex> = self.indexes.iter().collect();
        candidates.sort_by_key(|index| {
            let def = index.definition();
            (def.is_compound(), !def.unique)
        });

        candidates.into_iter().find_map(|index| {
            let def = index.definition();
            let key = match def.single_field() {
                Some(field) => equality(field)?,
                None => IndexKey::Composite(
                    def.fields
                        .iter()
                        .map(|f| equality(f.as_str()))
                        .collect::<Option<Vec<_>>>()?,
                ),
            };
            Some(QueryPlan::IndexLookup {
                index: index.name().to_string(),
                key,
            })
        })
    }

    fn range_scan(&self, terms: &[(&str, &Predicate)]) -> Option<QueryPlan> {
        self.indexes.iter().find_map(|index| {
            let field = index.definition().single_field()?;
            let mut lower: Option<RangeBound> = None;
            let mut upper: Option<RangeBound> = None;

            for (_, predicate) in terms.iter().filter(|(path, _)| *path == field) {
                let Some(key) = predicate.operand().and_then(IndexKey::from_scalar) else {
                    continue;
                };
                match predicate {
                    Predicate::Gt(_) => tighten_lower(&mut lower, key, false),
                    Predicate::Gte(_) => tighten_lower(&mut lower, key, true),
                    Predicate::Lt(_) => tighten_upper(&mut upper, key, false),
                    Predicate::Lte(_) => tighten_upper(&mut upper, key, true),
                    _ => {}
                }
            }
            if lower.is_none() && upper.is_none() {
                return None;
            }

            // An array can satisfy a lower bound with one element and an
            // upper bound with another, so both ends are only combined when
            // the field is typed as a scalar.
            if lower.is_some() && upper.is_some() && !self.is_scalar_field(field) {
                upper = None;
            }
            Some(QueryPlan::IndexRange {
                index: index.name().to_string(),
                lower,
                upper,
            })
        })
    }

    fn is_scalar_field(&self, field: &str) -> bool {
        self.schema.fields.get(field).is_some_and(|f| {
            !f.multi_value
                && matches!(
                    f.ty,
                    FieldType::String | FieldType::Number | FieldType::Boolean
                )
        })
    }
}

fn collect_conjuncts<'f>(filter: &'f Filter, out: &mut Vec<(&'f str, &'f Predicate)>) {
    match filter {
        Filter::Field { path, predicate } => out.push((path, predicate)),
        Filter::And(filters) => {
            for f in filters {
                collect_conjuncts(f, out);
            }
        }
        Filter::Or(_) | Filter::Not(_) => {}
    }
}

fn tighten_lower(bound: &mut Option<RangeBound>, key: IndexKey, inclusive: bool) {
    let tighter = match bound {
        None => true,
        Some(b) => key > b.key || (key == b.key && !inclusive),
    };
    if tighter {
        *bound = Some(RangeBound { key, inclusive });
    }
}

fn tighten_upper(bound: &mut Option<RangeBound>, key: IndexKey, inclusive: bool) {
    let tighter = match bound {
        None => true,
        Some(b) => key < b.key || (key == b.key && !inclusive),
    };
    if tighter {
        *bound = Some(RangeBound { key, inclusive });
    }
}

/// Runs `query` with `plan`, returning matching documents in order.
///
/// Results are ordered by id, then stably by the query's sort field if it
/// has one, and finally windowed by skip and limit.
pub(crate) fn execute(
    query: &Query,
    plan: &QueryPlan,
    indexes: &[SecondaryIndex],
    storage: &StorageManager,
    stats: &DatabaseStats,
) -> CoreResult<Vec<Document>> {
    let index = plan
        .index()
        .and_then(|name| indexes.iter().find(|i| i.name() == name));

    let mut matched = Vec::new();
    match (plan, index) {
        (QueryPlan::IndexLookup { key, .. }, Some(index)) => {
            stats.record_index_lookup();
            let ids = index.tree().find_all(key)?;
            fetch_matching(ids, query, storage, &mut matched)?;
        }
        (QueryPlan::IndexRange { lower, upper, .. }, Some(index)) => {
            stats.record_range_scan();
            let lower = lower.as_ref().map(|b| (&b.key, b.inclusive));
            let upper = upper.as_ref().map(|b| (&b.key, b.inclusive));
            let ids = index
                .tree()
                .find_range(lower, upper)?
                .into_iter()
                .map(|(_, id)| id);
            fetch_matching(ids, query, storage, &mut matched)?;
        }
        _ => {
            stats.record_scan();
            for doc in storage.read_all()? {
                let doc = doc?;
                if query.filter.matches(&doc) {
                    matched.push(doc);
                }
            }
        }
    }

    matched.sort_by(|a, b| a.id().cmp(&b.id()));
    if let Some(sort) = &query.order_by {
        matched.sort_by(|a, b| {
            let ordering = compare_for_sort(a.get_path(&sort.field), b.get_path(&sort.field));
            match sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
    }

    Ok(matched
        .into_iter()
        .skip(query.skip)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect())
}

fn fetch_matching(
    ids: impl IntoIterator<Item = String>,
    query: &Query,
    storage: &StorageManager,
    out: &mut Vec<Document>,
) -> CoreResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(doc) = storage.read(&id)? {
            if query.filter.matches(&doc) {
                out.push(doc);
            }
        }
    }
    Ok(())
}
