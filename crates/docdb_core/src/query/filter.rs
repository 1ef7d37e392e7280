//! Filter expressions and their evaluation against documents.

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A boolean expression over document fields.
///
/// The default filter is an empty conjunction, which matches everything.
#[derive(Debug, Clone)]
pub enum Filter {
    /// All sub-filters match. Empty matches everything.
    And(Vec<Filter>),
    /// At least one sub-filter matches. Empty matches nothing.
    Or(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
    /// A predicate on the value at a dotted field path.
    Field {
        /// Dotted path, e.g. `address.city`.
        path: String,
        /// Test applied to the value.
        predicate: Predicate,
    },
}

/// A test on a single field value.
///
/// # Semantics
///
/// - Numbers compare numerically regardless of integer or float encoding.
/// - Ordering predicates only hold between values of the same kind; a
///   string is never greater than a number.
/// - A missing field satisfies only [`Predicate::Ne`] and
///   [`Predicate::Nin`].
/// - An array field satisfies a predicate if the array itself or any of its
///   elements does.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Equal to.
    Eq(Value),
    /// Not equal to.
    Ne(Value),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal to.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal to.
    Lte(Value),
    /// Equal to one of.
    In(Vec<Value>),
    /// Equal to none of.
    Nin(Vec<Value>),
    /// String starting with.
    StartsWith(String),
    /// String matching a regular expression.
    Regex(Regex),
}

impl Default for Filter {
    fn default() -> Self {
        Self::all()
    }
}

impl Filter {
    /// Matches every document.
    #[must_use]
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    /// A predicate on `path`.
    pub fn field(path: impl Into<String>, predicate: Predicate) -> Self {
        Self::Field {
            path: path.into(),
            predicate,
        }
    }

    /// `path == value`
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Eq(value.into()))
    }

    /// `path != value`
    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Ne(value.into()))
    }

    /// `path > value`
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Gt(value.into()))
    }

    /// `path >= value`
    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Gte(value.into()))
    }

    /// `path < value`
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Lt(value.into()))
    }

    /// `path <= value`
    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Predicate::Lte(value.into()))
    }

    /// `path` equals one of `values`.
    pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, Predicate::In(values))
    }

    /// `path` equals none of `values`.
    pub fn not_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, Predicate::Nin(values))
    }

    /// `path` is a string starting with `prefix`.
    pub fn starts_with(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::field(path, Predicate::StartsWith(prefix.into()))
    }

    /// `path` is a string matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the pattern does not compile.
    pub fn regex(path: impl Into<String>, pattern: &str) -> CoreResult<Self> {
        Ok(Self::field(path, Predicate::Regex(compile(pattern)?)))
    }

    /// All of `filters`.
    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Any of `filters`.
    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Negation of `filter`.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Evaluates the filter against `doc`.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Self::Not(filter) => !filter.matches(doc),
            Self::Field { path, predicate } => predicate.matches(doc.get_path(path)),
        }
    }

    /// Parses the JSON filter syntax.
    ///
    /// ```text
    /// {"status": "active"}                      equality
    /// {"age": {"gte": 18, "lt": 65}}            operators on one field
    /// {"or": [{"a": 1}, {"b": {"ne": 2}}]}      and / or / not
    /// ```
    ///
    /// Several keys in one object are combined with `and`. An object value
    /// is read as operators if any of its keys is an operator name, in which
    /// case all of them must be; otherwise it is a literal to compare with.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown operators or malformed
    /// operands.
    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let Value::Object(map) = value else {
            return Err(CoreError::validation("filter must be a JSON object"));
        };

        let mut filters = Vec::new();
        for (key, operand) in map {
            match key.as_str() {
                "and" => filters.push(Self::And(parse_list(key, operand)?)),
                "or" => filters.push(Self::Or(parse_list(key, operand)?)),
                "not" => filters.push(Self::not(Self::from_json(operand)?)),
                path => filters.extend(parse_field(path, operand)?),
            }
        }
        Ok(match filters.len() {
            1 => filters.remove(0),
            _ => Self::And(filters),
        })
    }
}

fn parse_list(key: &str, operand: &Value) -> CoreResult<Vec<Filter>> {
    let Value::Array(items) = operand else {
        return Err(CoreError::validation(format!("{key:?} expects an array of filters")));
    };
    items.iter().map(Filter::from_json).collect()
}

const OPERATORS: [&str; 10] = [
    "eq", "ne", "gt", "gte", "lt", "lte", "in", "nin", "startsWith", "regex",
];

fn parse_field(path: &str, operand: &Value) -> CoreResult<Vec<Filter>> {
    let ops = match operand {
        Value::Object(ops) if ops.keys().any(|k| OPERATORS.contains(&k.as_str())) => ops,
        literal => return Ok(vec![Filter::eq(path, literal.clone())]),
    };
    ops.iter()
        .map(|(op, value)| Ok(Filter::field(path, parse_predicate(path, op, value)?)))
        .collect()
}

fn parse_predicate(path: &str, op: &str, value: &Value) -> CoreResult<Predicate> {
    let list = || match value {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(CoreError::validation(format!(
            "operator {op:?} on {path:?} expects an array"
        ))),
    };
    let string = || match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(CoreError::validation(format!(
            "operator {op:?} on {path:?} expects a string"
        ))),
    };
    Ok(match op {
        "eq" => Predicate::Eq(value.clone()),
        "ne" => Predicate::Ne(value.clone()),
        "gt" => Predicate::Gt(value.clone()),
        "gte" => Predicate::Gte(value.clone()),
        "lt" => Predicate::Lt(value.clone()),
        "lte" => Predicate::Lte(value.clone()),
        "in" => Predicate::In(list()?),
        "nin" => Predicate::Nin(list()?),
        "startsWith" => Predicate::StartsWith(string()?),
        "regex" => Predicate::Regex(compile(&string()?)?),
        other => {
            return Err(CoreError::validation(format!(
                "unknown operator {other:?} on {path:?}"
            )))
        }
    })
}

fn compile(pattern: &str) -> CoreResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| CoreError::validation(format!("invalid regex {pattern:?}: {e}")))
}

impl Predicate {
    /// Tests the value found at a field path; `None` means the field is
    /// missing.
    #[must_use]
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return matches!(self, Self::Ne(_) | Self::Nin(_));
        };
        match self {
            Self::Eq(literal) => contains_equal(value, literal),
            Self::Ne(literal) => !contains_equal(value, literal),
            Self::Gt(literal) => any_compares(value, literal, |o| o == Ordering::Greater),
            Self::Gte(literal) => any_compares(value, literal, |o| o != Ordering::Less),
            Self::Lt(literal) => any_compares(value, literal, |o| o == Ordering::Less),
            Self::Lte(literal) => any_compares(value, literal, |o| o != Ordering::Greater),
            Self::In(literals) => literals.iter().any(|l| contains_equal(value, l)),
            Self::Nin(literals) => !literals.iter().any(|l| contains_equal(value, l)),
            Self::StartsWith(prefix) => any_string(value, |s| s.starts_with(prefix.as_str())),
            Self::Regex(re) => any_string(value, |s| re.is_match(s)),
        }
    }

    /// The literal of an ordering or equality predicate.
    #[must_use]
    pub fn operand(&self) -> Option<&Value> {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                Some(v)
            }
            _ => None,
        }
    }
}

/// Equality with numeric normalization, applied recursively.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y),
        _ => a == b,
    }
}

fn objects_equal(x: &Map<String, Value>, y: &Map<String, Value>) -> bool {
    x.len() == y.len()
        && x
            .iter()
            .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
}

/// Orders two values of the same scalar kind. Different kinds, arrays and
/// objects are incomparable.
#[must_use]
pub fn compare_same_kind(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains_equal(value: &Value, literal: &Value) -> bool {
    values_equal(value, literal)
        || matches!(value, Value::Array(items) if items.iter().any(|i| values_equal(i, literal)))
}

fn any_compares(value: &Value, literal: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let test = |v: &Value| compare_same_kind(v, literal).is_some_and(&accept);
    match value {
        Value::Array(items) => items.iter().any(test),
        other => test(other),
    }
}

fn any_string(value: &Value, accept: impl Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => accept(s),
        Value::Array(items) => items.iter().any(|i| i.as_str().is_some_and(&accept)),
        _ => false,
    }
}
