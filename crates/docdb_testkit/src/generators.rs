//! Property-based test generators using proptest.
//!
//! Value domains are kept small on purpose: collisions between keys, ids
//! and filter operands are what exercise duplicate handling, node merges
//! and overlapping range bounds.

use docdb_core::index::IndexKey;
use docdb_core::Filter;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// Names used by generated documents and filters.
pub const NAMES: [&str; 6] = ["ada", "alan", "bob", "cy", "dee", "eve"];

/// Tags used by generated documents and filters.
pub const TAGS: [&str; 4] = ["red", "green", "blue", "gold"];

/// Cities used by generated documents and filters.
pub const CITIES: [&str; 3] = ["oslo", "lima", "rome"];

/// Strategy for generating index keys of every scalar kind.
pub fn index_key_strategy() -> impl Strategy<Value = IndexKey> {
    prop_oneof![
        1 => Just(IndexKey::Null),
        1 => any::<bool>().prop_map(IndexKey::from),
        4 => (-20i64..20).prop_map(IndexKey::from),
        4 => prop::string::string_regex("[a-f]{1,2}")
            .expect("Invalid regex")
            .prop_map(IndexKey::from),
    ]
}

/// Strategy for generating document ids from a small pool.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    (0u8..12).prop_map(|n| format!("d{n}"))
}

/// One mutation of a B-tree.
#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Add `id` under `key`.
    Insert {
        /// Key
        key: IndexKey,
        /// Document id
        id: String,
    },
    /// Remove `id` from `key`, or the whole key.
    Delete {
        /// Key
        key: IndexKey,
        /// Document id; `None` removes the key.
        id: Option<String>,
    },
}

/// Strategy for generating tree mutations, inserts twice as likely.
pub fn tree_op_strategy() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        2 => (index_key_strategy(), doc_id_strategy())
            .prop_map(|(key, id)| TreeOp::Insert { key, id }),
        1 => (index_key_strategy(), prop::option::of(doc_id_strategy()))
            .prop_map(|(key, id)| TreeOp::Delete { key, id }),
    ]
}

/// Strategy for generating a sequence of tree mutations.
pub fn tree_ops_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<TreeOp>> {
    prop::collection::vec(tree_op_strategy(), min_ops..max_ops)
}

/// One access to a cache.
#[derive(Debug, Clone, Copy)]
pub enum CacheOp {
    /// Insert or overwrite a key.
    Insert(u8),
    /// Read a key.
    Get(u8),
}

/// Strategy for generating cache accesses over `keys` distinct keys.
pub fn cache_ops_strategy(keys: u8, max_ops: usize) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(
        prop_oneof![
            (0..keys).prop_map(CacheOp::Insert),
            (0..keys).prop_map(CacheOp::Get),
        ],
        0..max_ops,
    )
}

fn pick<T: Copy + std::fmt::Debug + 'static>(pool: &'static [T]) -> impl Strategy<Value = T> {
    prop::sample::select(pool)
}

/// Strategy for generating the body of a document, without an id.
///
/// Fields may be missing; `age` is a number, `name` a string, `tags` an
/// array of strings and `address.city` a nested string whenever present.
pub fn document_body_strategy() -> impl Strategy<Value = Map<String, Value>> {
    (
        prop::option::of(prop_oneof![
            4 => (0i64..40).prop_map(Value::from),
            1 => (0u8..80).prop_map(|n| Value::from(f64::from(n) / 2.0)),
        ]),
        prop::option::of(pick(&NAMES)),
        prop::option::of(prop::collection::vec(pick(&TAGS), 0..4)),
        prop::option::of(pick(&CITIES)),
    )
        .prop_map(|(age, name, tags, city)| {
            let mut body = Map::new();
            if let Some(age) = age {
                body.insert("age".into(), age);
            }
            if let Some(name) = name {
                body.insert("name".into(), json!(name));
            }
            if let Some(tags) = tags {
                body.insert("tags".into(), json!(tags));
            }
            if let Some(city) = city {
                body.insert("address".into(), json!({ "city": city }));
            }
            body
        })
}

/// Strategy for generating up to `max` documents with distinct ids.
pub fn documents_strategy(max: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(document_body_strategy(), 0..max).prop_map(|bodies| {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, mut body)| {
                body.insert("id".into(), json!(format!("doc{i:03}")));
                Value::Object(body)
            })
            .collect()
    })
}

fn age_operand() -> impl Strategy<Value = Value> {
    prop_oneof![
        6 => (-2i64..42).prop_map(Value::from),
        1 => (0u8..80).prop_map(|n| Value::from(f64::from(n) / 2.0)),
        // Never matches a numeric age: comparisons across kinds fail.
        1 => Just(json!("30")),
    ]
}

/// Strategy for generating a single field predicate.
pub fn leaf_filter_strategy() -> impl Strategy<Value = Filter> {
    prop_oneof![
        age_operand().prop_map(|v| Filter::eq("age", v)),
        age_operand().prop_map(|v| Filter::ne("age", v)),
        age_operand().prop_map(|v| Filter::gt("age", v)),
        age_operand().prop_map(|v| Filter::gte("age", v)),
        age_operand().prop_map(|v| Filter::lt("age", v)),
        age_operand().prop_map(|v| Filter::lte("age", v)),
        pick(&NAMES).prop_map(|n| Filter::eq("name", n)),
        pick(&NAMES).prop_map(|n| Filter::gte("name", n)),
        pick(&NAMES).prop_map(|n| Filter::lt("name", n)),
        prop::collection::vec(pick(&NAMES), 0..3)
            .prop_map(|ns| Filter::is_in("name", ns.into_iter().map(Value::from).collect())),
        prop::sample::select(vec!["a", "al", "d", "z"]).prop_map(|p| Filter::starts_with("name", p)),
        pick(&TAGS).prop_map(|t| Filter::eq("tags", t)),
        pick(&TAGS).prop_map(|t| Filter::gt("tags", t)),
        prop::collection::vec(pick(&TAGS), 1..3)
            .prop_map(|ts| Filter::not_in("tags", ts.into_iter().map(Value::from).collect())),
        pick(&CITIES).prop_map(|c| Filter::eq("address.city", c)),
    ]
}

/// Strategy for generating filters with nested `and`/`or`/`not`.
///
/// Range pairs on one field are generated often, since they drive the
/// two-sided range plans.
pub fn filter_strategy() -> impl Strategy<Value = Filter> {
    let range = (age_operand(), age_operand())
        .prop_map(|(lo, hi)| Filter::and(vec![Filter::gte("age", lo), Filter::lt("age", hi)]));
    let compound = (pick(&NAMES), 0i64..40)
        .prop_map(|(n, a)| Filter::and(vec![Filter::eq("name", n), Filter::eq("age", a)]));
    let base = prop_oneof![4 => leaf_filter_strategy(), 1 => range, 1 => compound];

    base.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::and),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::or),
            inner.prop_map(Filter::not),
        ]
    })
}

/// One logged change to a document of the `items` collection.
#[derive(Debug, Clone)]
pub enum DocOp {
    /// Create or overwrite `id` with payload `n`.
    Put {
        /// Document id
        id: String,
        /// Payload
        n: i64,
    },
    /// Delete `id`.
    Delete {
        /// Document id
        id: String,
    },
}

/// Strategy for generating document changes over a small id pool.
pub fn doc_ops_strategy(max_ops: usize) -> impl Strategy<Value = Vec<DocOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => (doc_id_strategy(), any::<i64>()).prop_map(|(id, n)| DocOp::Put { id, n }),
            1 => doc_id_strategy().prop_map(|id| DocOp::Delete { id }),
        ],
        0..max_ops,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests, e.g. ones touching disk.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_ids_are_distinct(docs in documents_strategy(30)) {
            let ids: HashSet<_> = docs.iter().map(|d| d["id"].clone()).collect();
            prop_assert_eq!(ids.len(), docs.len());
        }

        #[test]
        fn typed_fields_keep_their_type(body in document_body_strategy()) {
            if let Some(age) = body.get("age") {
                prop_assert!(age.is_number());
            }
            if let Some(tags) = body.get("tags") {
                prop_assert!(tags.as_array().is_some_and(|t| t.iter().all(Value::is_string)));
            }
        }
    }
}
