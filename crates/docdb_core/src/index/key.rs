//! Index keys and key extraction from documents.

use crate::document::Document;
use crate::schema::IndexDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A totally ordered key stored in a B-tree.
///
/// Keys of different kinds order as `Null < Bool < Number < String <
/// Composite`. Numbers compare with [`f64::total_cmp`] after `-0.0` is folded
/// into `0.0`, so the order is total and agrees with numeric equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum IndexKey {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(f64),
    /// JSON string.
    String(String),
    /// One component per field of a compound index.
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Builds a key from a scalar JSON value.
    ///
    /// Returns `None` for arrays and objects, which are not keys themselves.
    #[must_use]
    pub fn from_scalar(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::number),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Builds a numeric key.
    #[must_use]
    pub fn number(n: f64) -> Self {
        // -0.0 == 0.0 numerically but not under total_cmp.
        Self::Number(if n == 0.0 { 0.0 } else { n })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::String(_) => 3,
            Self::Composite(_) => 4,
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Composite(a), Self::Composite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for IndexKey {
    fn from(n: f64) -> Self {
        Self::number(n)
    }
}

impl From<i64> for IndexKey {
    fn from(n: i64) -> Self {
        Self::number(n as f64)
    }
}

impl From<bool> for IndexKey {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Keys a single field value contributes to an index.
///
/// A scalar yields itself. An array yields each distinct scalar element, so
/// a document is reachable under every element it holds. Objects yield
/// nothing.
#[must_use]
pub fn value_keys(value: &Value) -> Vec<IndexKey> {
    match value {
        Value::Array(items) => {
            let mut keys: Vec<IndexKey> = items.iter().filter_map(IndexKey::from_scalar).collect();
            keys.sort();
            keys.dedup();
            keys
        }
        other => IndexKey::from_scalar(other).into_iter().collect(),
    }
}

/// Keys a document contributes to the index described by `definition`.
///
/// Missing fields contribute nothing. For compound indexes the result is the
/// cartesian product of each field's keys; if any field contributes nothing,
/// neither does the document.
#[must_use]
pub fn document_keys(definition: &IndexDefinition, doc: &Document) -> Vec<IndexKey> {
    if let Some(field) = definition.single_field() {
        return doc.get_path(field).map(value_keys).unwrap_or_default();
    }

    let mut combos: Vec<Vec<IndexKey>> = vec![Vec::new()];
    for field in &definition.fields {
        let keys = doc.get_path(field).map(value_keys).unwrap_or_default();
        if keys.is_empty() {
            return Vec::new();
        }
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                keys.iter().map(move |k| {
                    let mut next = prefix.clone();
                    next.push(k.clone());
                    next
                })
            })
            .collect();
    }
    let mut keys: Vec<IndexKey> = combos.into_iter().map(IndexKey::Composite).collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn kinds_order_across_types() {
        let ordered = vec![
            IndexKey::Null,
            IndexKey::Bool(false),
            IndexKey::Bool(true),
            IndexKey::number(-5.0),
            IndexKey::number(3.5),
            IndexKey::from("a"),
            IndexKey::from("b"),
            IndexKey::Composite(vec![IndexKey::Null]),
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.sort();
        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(IndexKey::number(-0.0), IndexKey::number(0.0));
        assert_eq!(
            IndexKey::from_scalar(&json!(-0.0)),
            IndexKey::from_scalar(&json!(0))
        );
    }

    #[test]
    fn integers_and_floats_share_keys() {
        assert_eq!(
            IndexKey::from_scalar(&json!(2)),
            IndexKey::from_scalar(&json!(2.0))
        );
    }

    #[test]
    fn arrays_yield_distinct_elements() {
        let keys = value_keys(&json!(["b", "a", "b", {"x": 1}, [1]]));
        assert_eq!(keys, vec![IndexKey::from("a"), IndexKey::from("b")]);
    }

    #[test]
    fn missing_field_yields_no_keys() {
        let def = IndexDefinition::plain("email");
        assert!(document_keys(&def, &doc(json!({"id": "1"}))).is_empty());
        assert_eq!(
            document_keys(&def, &doc(json!({"id": "1", "email": null}))),
            vec![IndexKey::Null]
        );
    }

    #[test]
    fn nested_paths_are_indexed() {
        let def = IndexDefinition::plain("address.city");
        let keys = document_keys(&def, &doc(json!({"id": "1", "address": {"city": "Oslo"}})));
        assert_eq!(keys, vec![IndexKey::from("Oslo")]);
    }

    #[test]
    fn compound_keys_take_the_product() {
        let def = IndexDefinition::compound(["a", "b"]);
        let keys = document_keys(&def, &doc(json!({"id": "1", "a": [1, 2], "b": "x"})));
        assert_eq!(
            keys,
            vec![
                IndexKey::Composite(vec![IndexKey::from(1i64), IndexKey::from("x")]),
                IndexKey::Composite(vec![IndexKey::from(2i64), IndexKey::from("x")]),
            ]
        );
        assert!(document_keys(&def, &doc(json!({"id": "1", "a": 1}))).is_empty());
    }

    #[test]
    fn key_json_shape() {
        let json = serde_json::to_value(IndexKey::from("x")).unwrap();
        assert_eq!(json, json!({"type": "string", "value": "x"}));
        let back: IndexKey = serde_json::from_value(json!({"type": "null"})).unwrap();
        assert_eq!(back, IndexKey::Null);
    }
}
