//! Disk-resident B-tree of minimum degree `m`.
//!
//! Every node except the root holds between `m - 1` and `2m - 1` keys and
//! all leaves sit at the same depth. Keys are unique within a tree; adding a
//! second document under an existing key appends to that key's value list.
//!
//! Insertion splits full nodes on the way down, so a split never has to
//! propagate back up. Deletion tops up any child it is about to enter to at
//! least `m` keys, by borrowing from a sibling or merging with one, so the
//! removal itself never underflows a node.
//!
//! All operations on one tree are serialized by a single mutex. Acquiring it
//! is bounded by the configured timeout.

use super::arena::NodeArena;
use super::key::IndexKey;
use super::node::Node;
use crate::error::{CoreError, CoreResult};
use docdb_storage::BlobStore;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::cmp::Ordering;
use std::mem;
use std::time::Duration;
use tracing::debug;

/// One bound of a range scan: the key and whether it is inclusive.
pub type Bound<'a> = Option<(&'a IndexKey, bool)>;

/// Shape of a tree, as measured by [`BTree::check_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TreeShape {
    /// Number of levels; a lone root leaf has height 1.
    pub height: usize,
    /// Number of nodes.
    pub nodes: usize,
    /// Number of distinct keys.
    pub keys: usize,
    /// Number of (key, document id) pairs.
    pub entries: usize,
}

/// A persistent B-tree mapping keys to document id lists.
pub struct BTree {
    name: String,
    order: usize,
    timeout: Duration,
    state: Mutex<TreeState>,
}

struct TreeState {
    arena: NodeArena,
    root_id: String,
    order: usize,
}

impl BTree {
    /// Opens the tree stored in `store`, initializing an empty root if the
    /// store holds no tree yet.
    ///
    /// `order` is the minimum degree and is clamped to at least 2.
    ///
    /// # Errors
    ///
    /// Returns an error if the root pointer cannot be read or written.
    pub fn open(
        name: impl Into<String>,
        store: Box<dyn BlobStore>,
        order: usize,
        node_cache_capacity: usize,
        timeout: Duration,
    ) -> CoreResult<Self> {
        let name = name.into();
        let order = order.max(2);
        let mut arena = NodeArena::new(store, node_cache_capacity, name.clone());
        let root_id = match arena.load_root()? {
            Some(id) => id,
            None => TreeState::init_root(&mut arena)?,
        };
        debug!(index = %name, order, root = %root_id, "opened B-tree");
        Ok(Self {
            name,
            order,
            timeout,
            state: Mutex::new(TreeState {
                arena,
                root_id,
                order,
            }),
        })
    }

    /// The tree's name, used in errors and logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The minimum degree.
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Adds `doc_id` under `key`. Adding an existing pair is a no-op.
    pub fn insert(&self, key: IndexKey, doc_id: impl Into<String>) -> CoreResult<()> {
        self.lock("index insert")?.insert(key, doc_id.into())
    }

    /// Removes `doc_id` from `key`, or the whole key when `doc_id` is `None`.
    ///
    /// The key itself leaves the tree once its last id is gone. Returns
    /// whether anything was removed.
    pub fn delete(&self, key: &IndexKey, doc_id: Option<&str>) -> CoreResult<bool> {
        self.lock("index delete")?.delete(key, doc_id)
    }

    /// The first document id stored under `key`.
    pub fn find(&self, key: &IndexKey) -> CoreResult<Option<String>> {
        Ok(self.find_all(key)?.into_iter().next())
    }

    /// All document ids stored under `key`.
    pub fn find_all(&self, key: &IndexKey) -> CoreResult<Vec<String>> {
        let mut state = self.lock("index lookup")?;
        Ok(state
            .locate(key)?
            .map(|(mut node, pos)| mem::take(&mut node.values[pos]))
            .unwrap_or_default())
    }

    /// All (key, id) pairs with `min <= key <= max`, in key order.
    ///
    /// Each bound may be absent or exclusive.
    pub fn find_range(
        &self,
        min: Bound<'_>,
        max: Bound<'_>,
    ) -> CoreResult<Vec<(IndexKey, String)>> {
        let mut state = self.lock("index range scan")?;
        let mut out = Vec::new();
        let root = state.root_id.clone();
        state.collect_range(&root, min, max, &mut out)?;
        Ok(out)
    }

    /// Every (key, id) pair in key order.
    pub fn entries(&self) -> CoreResult<Vec<(IndexKey, String)>> {
        self.find_range(None, None)
    }

    /// Number of (key, id) pairs.
    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.entries()?.len())
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> CoreResult<bool> {
        let mut state = self.lock("index lookup")?;
        let root_id = state.root_id.clone();
        let root = state.arena.get(&root_id)?;
        Ok(root.keys.is_empty())
    }

    /// Drops every node and starts over with an empty root.
    pub fn clear(&self) -> CoreResult<()> {
        let mut state = self.lock("index clear")?;
        state.arena.clear()?;
        state.root_id = TreeState::init_root(&mut state.arena)?;
        debug!(index = %self.name, "cleared B-tree");
        Ok(())
    }

    /// Number of node blobs in the backing store.
    pub fn node_count(&self) -> CoreResult<usize> {
        self.lock("index lookup")?.arena.node_count()
    }

    /// Walks the whole tree and verifies ordering, occupancy and balance.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] describing the first violation.
    pub fn check_invariants(&self) -> CoreResult<TreeShape> {
        let mut state = self.lock("index verify")?;
        let root_id = state.root_id.clone();
        let mut shape = TreeShape::default();
        let mut leaf_depth = None;
        state.check_node(&self.name, &root_id, 1, None, None, &mut leaf_depth, &mut shape)?;
        shape.height = leaf_depth.unwrap_or(1);
        Ok(shape)
    }

    fn lock(&self, operation: &'static str) -> CoreResult<MutexGuard<'_, TreeState>> {
        self.state
            .try_lock_for(self.timeout)
            .ok_or(CoreError::Timeout { operation })
    }

    /// Holds the tree lock until the guard drops.
    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.state.lock()
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl TreeState {
    fn init_root(arena: &mut NodeArena) -> CoreResult<String> {
        let root = Node::leaf(NodeArena::new_id());
        arena.put(&root)?;
        arena.save_root(&root.id)?;
        Ok(root.id)
    }

    fn max_keys(&self) -> usize {
        2 * self.order - 1
    }

    fn set_root(&mut self, id: String) -> CoreResult<()> {
        self.arena.save_root(&id)?;
        self.root_id = id;
        Ok(())
    }

    fn locate(&mut self, key: &IndexKey) -> CoreResult<Option<(Node, usize)>> {
        let root_id = self.root_id.clone();
        let mut node = self.arena.get(&root_id)?;
        loop {
            let (pos, found) = node.search(key);
            if found {
                return Ok(Some((node, pos)));
            }
            if node.is_leaf {
                return Ok(None);
            }
            node = self.arena.get(&node.children[pos])?;
        }
    }

    // ---------------------------------------------------------------- insert

    fn insert(&mut self, key: IndexKey, doc_id: String) -> CoreResult<()> {
        let root_id = self.root_id.clone();
        let mut root = self.arena.get(&root_id)?;
        if root.keys.len() >= self.max_keys() {
            let mut new_root = Node::internal(NodeArena::new_id(), vec![root.id.clone()]);
            self.split_child(&mut new_root, 0, root)?;
            self.set_root(new_root.id.clone())?;
            root = new_root;
        }
        self.insert_non_full(root, key, doc_id)
    }

    fn insert_non_full(
        &mut self,
        mut node: Node,
        key: IndexKey,
        doc_id: String,
    ) -> CoreResult<()> {
        loop {
            let (pos, found) = node.search(&key);
            if found {
                return self.append_value(node, pos, doc_id);
            }
            if node.is_leaf {
                node.keys.insert(pos, key);
                node.values.insert(pos, vec![doc_id]);
                return self.arena.put(&node);
            }

            let child = self.arena.get(&node.children[pos])?;
            if child.keys.len() < self.max_keys() {
                node = child;
                continue;
            }
            let (left, right) = self.split_child(&mut node, pos, child)?;
            node = match key.cmp(&node.keys[pos]) {
                Ordering::Equal => return self.append_value(node, pos, doc_id),
                Ordering::Less => left,
                Ordering::Greater => right,
            };
        }
    }

    fn append_value(&mut self, mut node: Node, pos: usize, doc_id: String) -> CoreResult<()> {
        let values = &mut node.values[pos];
        if values.contains(&doc_id) {
            return Ok(());
        }
        values.push(doc_id);
        self.arena.put(&node)
    }

    /// Splits the full child at `index` around its median, which moves up
    /// into `parent`. Returns the two halves.
    fn split_child(
        &mut self,
        parent: &mut Node,
        index: usize,
        mut child: Node,
    ) -> CoreResult<(Node, Node)> {
        let m = self.order;
        let mut sibling = Node::leaf(NodeArena::new_id());
        sibling.is_leaf = child.is_leaf;
        sibling.keys = child.keys.split_off(m);
        sibling.values = child.values.split_off(m);
        if !child.is_leaf {
            sibling.children = child.children.split_off(m);
        }

        let (Some(median), Some(median_values)) = (child.keys.pop(), child.values.pop()) else {
            return Err(CoreError::corrupted(
                format!("index node {}", child.id),
                "split of a node with too few keys",
            ));
        };
        parent.keys.insert(index, median);
        parent.values.insert(index, median_values);
        parent.children.insert(index + 1, sibling.id.clone());

        self.arena.put(&sibling)?;
        self.arena.put(&child)?;
        self.arena.put(parent)?;
        Ok((child, sibling))
    }

    // ---------------------------------------------------------------- delete

    fn delete(&mut self, key: &IndexKey, doc_id: Option<&str>) -> CoreResult<bool> {
        let Some((mut node, pos)) = self.locate(key)? else {
            return Ok(false);
        };
        if let Some(doc_id) = doc_id {
            let values = &mut node.values[pos];
            let Some(at) = values.iter().position(|v| v == doc_id) else {
                return Ok(false);
            };
            if values.len() > 1 {
                values.remove(at);
                self.arena.put(&node)?;
                return Ok(true);
            }
        }

        let root_id = self.root_id.clone();
        let root = self.arena.get(&root_id)?;
        self.remove_key(root, key.clone())?;

        let root = self.arena.get(&self.root_id.clone())?;
        if root.keys.is_empty() && !root.is_leaf {
            let new_root = root.children[0].clone();
            self.set_root(new_root)?;
            self.arena.remove(&root.id)?;
        }
        Ok(true)
    }

    /// Removes `key` and its values from the subtree rooted at `node`.
    ///
    /// `node` is either the root or has at least `m` keys.
    fn remove_key(&mut self, mut node: Node, mut key: IndexKey) -> CoreResult<()> {
        let m = self.order;
        loop {
            let (pos, found) = node.search(&key);

            if node.is_leaf {
                if found {
                    node.keys.remove(pos);
                    node.values.remove(pos);
                    self.arena.put(&node)?;
                }
                return Ok(());
            }

            if found {
                let left = self.arena.get(&node.children[pos])?;
                if left.keys.len() >= m {
                    let (pred_key, pred_values) = self.max_entry(left.clone())?;
                    node.keys[pos] = pred_key.clone();
                    node.values[pos] = pred_values;
                    self.arena.put(&node)?;
                    node = left;
                    key = pred_key;
                    continue;
                }

                let right = self.arena.get(&node.children[pos + 1])?;
                if right.keys.len() >= m {
                    let (succ_key, succ_values) = self.min_entry(right.clone())?;
                    node.keys[pos] = succ_key.clone();
                    node.values[pos] = succ_values;
                    self.arena.put(&node)?;
                    node = right;
                    key = succ_key;
                    continue;
                }

                node = self.merge_children(&mut node, pos, left, right)?;
                continue;
            }

            let child = self.arena.get(&node.children[pos])?;
            node = if child.keys.len() < m {
                self.top_up_child(&mut node, pos, child)?
            } else {
                child
            };
        }
    }

    /// Brings the child at `index` up to at least `m` keys and returns the
    /// node to descend into.
    fn top_up_child(
        &mut self,
        parent: &mut Node,
        index: usize,
        mut child: Node,
    ) -> CoreResult<Node> {
        let m = self.order;
        let left = match index.checked_sub(1) {
            Some(i) => Some(self.arena.get(&parent.children[i])?),
            None => None,
        };
        let right = match parent.children.get(index + 1) {
            Some(id) => Some(self.arena.get(id)?),
            None => None,
        };

        match (left, right) {
            (Some(mut left), _) if left.keys.len() >= m => {
                let (Some(key), Some(values)) = (left.keys.pop(), left.values.pop()) else {
                    return Err(underflow(&left));
                };
                let sep_key = mem::replace(&mut parent.keys[index - 1], key);
                let sep_values = mem::replace(&mut parent.values[index - 1], values);
                child.keys.insert(0, sep_key);
                child.values.insert(0, sep_values);
                if !child.is_leaf {
                    let Some(moved) = left.children.pop() else {
                        return Err(underflow(&left));
                    };
                    child.children.insert(0, moved);
                }
                self.arena.put(&left)?;
                self.arena.put(&child)?;
                self.arena.put(parent)?;
                Ok(child)
            }
            (_, Some(mut right)) if right.keys.len() >= m => {
                let key = right.keys.remove(0);
                let values = right.values.remove(0);
                let sep_key = mem::replace(&mut parent.keys[index], key);
                let sep_values = mem::replace(&mut parent.values[index], values);
                child.keys.push(sep_key);
                child.values.push(sep_values);
                if !child.is_leaf {
                    child.children.push(right.children.remove(0));
                }
                self.arena.put(&right)?;
                self.arena.put(&child)?;
                self.arena.put(parent)?;
                Ok(child)
            }
            (_, Some(right)) => self.merge_children(parent, index, child, right),
            (Some(left), None) => self.merge_children(parent, index - 1, left, child),
            (None, None) => Err(underflow(parent)),
        }
    }

    /// Merges `children[index + 1]` and the separator at `index` into
    /// `children[index]`.
    fn merge_children(
        &mut self,
        parent: &mut Node,
        index: usize,
        mut left: Node,
        right: Node,
    ) -> CoreResult<Node> {
        left.keys.push(parent.keys.remove(index));
        left.values.push(parent.values.remove(index));
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        left.children.extend(right.children);
        parent.children.remove(index + 1);

        self.arena.put(&left)?;
        self.arena.put(parent)?;
        self.arena.remove(&right.id)?;
        Ok(left)
    }

    fn max_entry(&mut self, mut node: Node) -> CoreResult<(IndexKey, Vec<String>)> {
        while !node.is_leaf {
            let Some(last) = node.children.last() else {
                return Err(underflow(&node));
            };
            node = self.arena.get(last)?;
        }
        match (node.keys.pop(), node.values.pop()) {
            (Some(key), Some(values)) => Ok((key, values)),
            _ => Err(underflow(&node)),
        }
    }

    fn min_entry(&mut self, mut node: Node) -> CoreResult<(IndexKey, Vec<String>)> {
        while !node.is_leaf {
            node = self.arena.get(&node.children[0])?;
        }
        if node.keys.is_empty() {
            return Err(underflow(&node));
        }
        Ok((node.keys.remove(0), node.values.remove(0)))
    }

    // ------------------------------------------------------------------ scan

    fn collect_range(
        &mut self,
        node_id: &str,
        min: Bound<'_>,
        max: Bound<'_>,
        out: &mut Vec<(IndexKey, String)>,
    ) -> CoreResult<bool> {
        let node = self.arena.get(node_id)?;
        let len = node.keys.len();

        for i in 0..=len {
            if !node.is_leaf {
                // children[i] holds keys strictly between keys[i-1] and keys[i].
                let below_max = i == 0 || max.map_or(true, |(mx, _)| node.keys[i - 1] < *mx);
                let above_min = i == len || min.map_or(true, |(mn, _)| node.keys[i] > *mn);
                if below_max
                    && above_min
                    && !self.collect_range(&node.children[i], min, max, out)?
                {
                    return Ok(false);
                }
            }
            if i == len {
                break;
            }

            let key = &node.keys[i];
            if !within_max(key, max) {
                return Ok(false);
            }
            if within_min(key, min) {
                out.extend(node.values[i].iter().map(|id| (key.clone(), id.clone())));
            }
        }
        Ok(true)
    }

    // ---------------------------------------------------------------- verify

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &mut self,
        tree: &str,
        node_id: &str,
        depth: usize,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
        leaf_depth: &mut Option<usize>,
        shape: &mut TreeShape,
    ) -> CoreResult<()> {
        let node = self.arena.get(node_id)?;
        let is_root = node_id == self.root_id;
        let fail = |message: String| {
            Err(CoreError::corrupted(
                format!("index {tree} node {node_id}"),
                message,
            ))
        };

        shape.nodes += 1;
        shape.keys += node.keys.len();
        shape.entries += node.values.iter().map(Vec::len).sum::<usize>();

        if node.values.len() != node.keys.len() {
            return fail(format!(
                "{} keys but {} value lists",
                node.keys.len(),
                node.values.len()
            ));
        }
        if node.values.iter().any(Vec::is_empty) {
            return fail("key with an empty value list".into());
        }
        if node.keys.windows(2).any(|w| w[0] >= w[1]) {
            return fail("keys are not strictly ascending".into());
        }
        if node.keys.len() > self.max_keys() {
            return fail(format!(
                "{} keys exceeds maximum {}",
                node.keys.len(),
                self.max_keys()
            ));
        }
        if !is_root && node.keys.len() < self.order - 1 {
            return fail(format!(
                "{} keys below minimum {}",
                node.keys.len(),
                self.order - 1
            ));
        }
        if let (Some(lower), Some(first)) = (lower, node.keys.first()) {
            if first <= lower {
                return fail(format!("key {first} not above separator {lower}"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, node.keys.last()) {
            if last >= upper {
                return fail(format!("key {last} not below separator {upper}"));
            }
        }

        if node.is_leaf {
            if !node.children.is_empty() {
                return fail("leaf has children".into());
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return fail(format!("leaf at depth {depth}, expected {d}"));
                }
                Some(_) => {}
            }
            return Ok(());
        }

        if node.children.len() != node.keys.len() + 1 {
            return fail(format!(
                "{} children for {} keys",
                node.children.len(),
                node.keys.len()
            ));
        }
        if is_root && node.keys.is_empty() {
            return fail("internal root without keys".into());
        }
        for (i, child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { node.keys.get(i - 1) };
            let hi = node.keys.get(i).or(upper);
            self.check_node(tree, child, depth + 1, lo, hi, leaf_depth, shape)?;
        }
        Ok(())
    }
}

fn within_min(key: &IndexKey, min: Bound<'_>) -> bool {
    match min {
        None => true,
        Some((mn, true)) => key >= mn,
        Some((mn, false)) => key > mn,
    }
}

fn within_max(key: &IndexKey, max: Bound<'_>) -> bool {
    match max {
        None => true,
        Some((mx, true)) => key <= mx,
        Some((mx, false)) => key < mx,
    }
}

fn underflow(node: &Node) -> CoreError {
    CoreError::corrupted(
        format!("index node {}", node.id),
        "node has too few keys or children",
    )
}
