//! Reference models and checkers.
//!
//! Each checker drives the real component and a deliberately naive model
//! side by side and reports the first disagreement as an error string, so
//! property tests can `prop_assert!` on it.

use crate::generators::{CacheOp, TreeOp};
use docdb_core::index::{BTree, IndexKey, TreeShape};
use docdb_core::storage::{Cache, CachePolicy};
use docdb_core::{Collection, Document, Query};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Ids of `docs`, in order.
pub fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter()
        .map(|d| d.id().unwrap_or_default().to_string())
        .collect()
}

/// A B-tree model: an ordered map from key to id set.
#[derive(Debug, Default)]
pub struct TreeModel {
    entries: BTreeMap<IndexKey, BTreeSet<String>>,
}

impl TreeModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op`, returning whether it changed anything.
    pub fn apply(&mut self, op: &TreeOp) -> bool {
        match op {
            TreeOp::Insert { key, id } => self.entries.entry(key.clone()).or_default().insert(id.clone()),
            TreeOp::Delete { key, id: None } => self.entries.remove(key).is_some(),
            TreeOp::Delete { key, id: Some(id) } => {
                let Some(ids) = self.entries.get_mut(key) else {
                    return false;
                };
                let removed = ids.remove(id);
                if ids.is_empty() {
                    self.entries.remove(key);
                }
                removed
            }
        }
    }

    /// Every (key, id) pair, sorted.
    pub fn pairs(&self) -> Vec<(IndexKey, String)> {
        self.entries
            .iter()
            .flat_map(|(k, ids)| ids.iter().map(move |id| (k.clone(), id.clone())))
            .collect()
    }

    /// Ids stored under `key`.
    pub fn ids(&self, key: &IndexKey) -> BTreeSet<String> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Distinct keys.
    pub fn keys(&self) -> impl Iterator<Item = &IndexKey> {
        self.entries.keys()
    }
}

/// Applies `op` to the tree.
pub fn apply_tree_op(tree: &BTree, op: &TreeOp) -> Result<bool, String> {
    match op {
        TreeOp::Insert { key, id } => {
            let before = tree.find_all(key).map_err(|e| e.to_string())?;
            tree.insert(key.clone(), id.clone()).map_err(|e| e.to_string())?;
            Ok(!before.contains(id))
        }
        TreeOp::Delete { key, id } => tree.delete(key, id.as_deref()).map_err(|e| e.to_string()),
    }
}

/// Checks the tree's structure and compares its content with `model`.
pub fn check_tree(tree: &BTree, model: &TreeModel) -> Result<TreeShape, String> {
    let shape = tree.check_invariants().map_err(|e| e.to_string())?;

    let mut actual = tree.entries().map_err(|e| e.to_string())?;
    actual.sort();
    let expected = model.pairs();
    if actual != expected {
        return Err(format!("entries differ: tree {actual:?}, model {expected:?}"));
    }
    if shape.entries != expected.len() {
        return Err(format!(
            "shape counts {} entries, model holds {}",
            shape.entries,
            expected.len()
        ));
    }

    for key in model.keys() {
        let found: BTreeSet<String> = tree
            .find_all(key)
            .map_err(|e| e.to_string())?
            .into_iter()
            .collect();
        if found != model.ids(key) {
            return Err(format!("find_all({key}) returned {found:?}"));
        }
    }
    Ok(shape)
}

#[derive(Debug, Clone, Copy)]
struct ModelEntry {
    frequency: u64,
    inserted: u64,
    last_access: u64,
}

/// A cache model that picks eviction victims by brute force.
#[derive(Debug)]
pub struct CacheModel {
    policy: CachePolicy,
    capacity: usize,
    entries: HashMap<u8, ModelEntry>,
    tick: u64,
}

impl CacheModel {
    /// Creates an empty model.
    pub fn new(capacity: usize, policy: CachePolicy) -> Self {
        Self {
            policy,
            capacity,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    fn touch(&mut self, key: u8) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.frequency += 1;
            entry.last_access = tick;
        }
    }

    /// The key evicted next.
    pub fn victim(&self) -> Option<u8> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| match self.policy {
                CachePolicy::Lru => (e.last_access, 0),
                CachePolicy::Lfu => (e.frequency, e.inserted),
            })
            .map(|(k, _)| *k)
    }

    /// Applies `op`, returning the evicted key, if any.
    pub fn apply(&mut self, op: CacheOp) -> Option<u8> {
        match op {
            CacheOp::Get(key) => {
                self.touch(key);
                None
            }
            CacheOp::Insert(key) if self.entries.contains_key(&key) => {
                self.touch(key);
                None
            }
            CacheOp::Insert(key) => {
                if self.capacity == 0 {
                    return None;
                }
                let victim = if self.entries.len() >= self.capacity {
                    let victim = self.victim();
                    if let Some(v) = victim {
                        self.entries.remove(&v);
                    }
                    victim
                } else {
                    None
                };
                self.tick += 1;
                self.entries.insert(
                    key,
                    ModelEntry {
                        frequency: 1,
                        inserted: self.tick,
                        last_access: self.tick,
                    },
                );
                victim
            }
        }
    }

    /// Keys currently held.
    pub fn keys(&self) -> BTreeSet<u8> {
        self.entries.keys().copied().collect()
    }
}

/// Runs `ops` against a real cache (evicting one entry at a time) and the
/// model, failing on the first divergence in contents.
pub fn check_cache(capacity: usize, policy: CachePolicy, ops: &[CacheOp]) -> Result<(), String> {
    let mut cache = Cache::new(capacity, policy).with_eviction_batch(1);
    let mut model = CacheModel::new(capacity, policy);

    for (step, op) in ops.iter().enumerate() {
        let victim = model.apply(*op);
        match *op {
            CacheOp::Get(key) => {
                let hit = cache.get(&key).is_some();
                if hit != model.entries.contains_key(&key) {
                    return Err(format!("step {step}: get({key}) hit={hit}"));
                }
            }
            CacheOp::Insert(key) => {
                let evicted = cache.insert(key, u32::from(key));
                if evicted != usize::from(victim.is_some()) {
                    return Err(format!("step {step}: evicted {evicted}, model evicted {victim:?}"));
                }
            }
        }
        if cache.len() > capacity {
            return Err(format!("step {step}: {} entries over capacity {capacity}", cache.len()));
        }
        let held: BTreeSet<u8> = (0..=u8::MAX).filter(|k| cache.contains_key(k)).collect();
        if held != model.keys() {
            return Err(format!(
                "step {step}: cache holds {held:?}, model holds {:?}",
                model.keys()
            ));
        }
    }
    Ok(())
}

/// Runs `query` on both collections and compares the returned documents.
pub fn same_results(a: &Collection, b: &Collection, query: &Query) -> Result<Vec<String>, String> {
    let left = a.find(query).map_err(|e| e.to_string())?;
    let right = b.find(query).map_err(|e| e.to_string())?;
    let (left_ids, right_ids) = (ids(&left), ids(&right));
    if left_ids != right_ids {
        return Err(format!(
            "{} returned {left_ids:?}, {} returned {right_ids:?} (plan {})",
            a.name(),
            b.name(),
            a.explain(&query.filter)
        ));
    }
    Ok(left_ids)
}
