//! Queries: filters, ordering, paging and plan selection.

mod filter;
mod planner;

pub use filter::{compare_same_kind, values_equal, Filter, Predicate};
pub use planner::{QueryPlan, QueryPlanner, RangeBound};

pub(crate) use planner::execute;

use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Ordering of query results by one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A filter with ordering and paging.
///
/// ```rust,ignore
/// let adults = Query::new(Filter::gte("age", 18))
///     .order_by("age", SortDirection::Descending)
///     .limit(10);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Documents must match this.
    pub filter: Filter,
    /// Sort field; results are ordered by id when absent.
    pub order_by: Option<SortKey>,
    /// Matches to drop from the front.
    pub skip: usize,
    /// Maximum matches to return.
    pub limit: Option<usize>,
}

impl Query {
    /// A query returning every match of `filter`.
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Orders results by `field`.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    /// Skips the first `n` matches.
    #[must_use]
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Returns at most `n` matches.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Parses `{"filter": {...}, "orderBy": "-age", "skip": 0, "limit": 10}`.
    ///
    /// Every key is optional. A leading `-` on `orderBy` sorts descending.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed input.
    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let Value::Object(map) = value else {
            return Err(CoreError::validation("query must be a JSON object"));
        };
        let mut query = match map.get("filter") {
            Some(filter) => Self::new(Filter::from_json(filter)?),
            None => Self::default(),
        };
        for (key, value) in map {
            match key.as_str() {
                "filter" => {}
                "orderBy" => {
                    let field = value
                        .as_str()
                        .ok_or_else(|| CoreError::validation("orderBy must be a string"))?;
                    query = match field.strip_prefix('-') {
                        Some(field) => query.order_by(field, SortDirection::Descending),
                        None => query.order_by(field, SortDirection::Ascending),
                    };
                }
                "skip" => query.skip = count(key, value)?,
                "limit" => query.limit = Some(count(key, value)?),
                other => {
                    return Err(CoreError::validation(format!("unknown query key {other:?}")))
                }
            }
        }
        Ok(query)
    }
}

fn count(key: &str, value: &Value) -> CoreResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| CoreError::validation(format!("{key} must be a non-negative integer")))
}

/// Total order used for sorting results.
///
/// Missing sorts first, then `null`, booleans, numbers, strings, arrays
/// (element-wise) and objects (by their JSON text).
#[must_use]
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Some(Value::Array(x)), Some(Value::Array(y))) => x
            .iter()
            .zip(y)
            .map(|(a, b)| compare_for_sort(Some(a), Some(b)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            Value::Object(x.clone()).to_string().cmp(&Value::Object(y.clone()).to_string())
        }
        (Some(x), Some(y)) => compare_same_kind(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}
