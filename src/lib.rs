//! A concurrent, in-memory, order-preserving B+ tree, plus thin secondary
//! index layers built on top of it ([`index::Index`], [`index::CompositeIndex`]).
//!
//! The tree maps unique keys to record identifiers and keeps its leaves in a
//! forward chain, so point lookups, range scans, prefix scans and ordered
//! iteration all run off the same structure. The branching factor is a
//! compile-time constant and key ordering is supplied by a [`Comparator`].
//!
//! # Concurrency
//!
//! Locking is coarse: the tree owns a top-level reader-writer latch that
//! readers (`find`, `lookup`, `range_search`, `prefix_search`, `find_if`,
//! iteration steps, stats) acquire in shared mode and writers (`insert`,
//! `remove`, `bulk_load`, `clear`) acquire in exclusive mode for the whole
//! operation. Structural changes are therefore never partially observable.
//! Every node additionally carries its own lock, which is the safe mutation
//! cell behind the shared node references; under the top-level latch these
//! are uncontended.
//!
//! Iterators do not pin the latch across their lifetime. Each step
//! re-acquires it in shared mode, which means an iterator racing writers may
//! skip or revisit keys; it only ever yields keys that were present at some
//! point during the iteration. Callers that need a snapshot must serialize
//! writers externally.

use parking_lot::RwLock;
use smallvec::{smallvec, SmallVec};

use std::fmt;
use std::sync::Arc;

pub mod composite;
pub mod error;
pub mod index;
pub mod iter;
#[cfg(test)]
mod util;
#[cfg(test)]
mod bench;

pub use composite::CompositeKey;
pub use index::{CompositeIndex, Index, Record, RecordId};

use error::{Error, Result};

/// Branching factor used by [`BPlusTree`] and the index layers.
pub const DEFAULT_ORDER: usize = 128;

/// A `GenericBPlusTree` with the default branching factor and key ordering.
pub type BPlusTree<K, V> = GenericBPlusTree<K, V, DEFAULT_ORDER>;

/// Key ordering strategy. Equality is derived from `less` both ways.
pub trait Comparator<K>: Send + Sync {
    fn less(&self, a: &K, b: &K) -> bool;

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        !self.less(a, b) && !self.less(b, a)
    }
}

/// The `Ord`-backed default ordering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn less(&self, a: &K, b: &K) -> bool {
        a < b
    }
}

/// Keys that support prefix scans ([`GenericBPlusTree::prefix_search`]).
pub trait PrefixKey {
    /// True when `self` begins with `prefix`.
    fn matches_prefix(&self, prefix: &Self) -> bool;
}

impl PrefixKey for String {
    #[inline]
    fn matches_prefix(&self, prefix: &Self) -> bool {
        self.starts_with(prefix.as_str())
    }
}

impl PrefixKey for Vec<u8> {
    #[inline]
    fn matches_prefix(&self, prefix: &Self) -> bool {
        self.starts_with(prefix.as_slice())
    }
}

type NodeRef<K, V, const ORDER: usize> = Arc<RwLock<Node<K, V, ORDER>>>;

/// An ordered map from unique keys to record identifiers with a compile-time
/// branching factor `ORDER` (max children per internal node; max keys per
/// node is `ORDER - 1`) and a pluggable [`Comparator`].
///
/// All methods take `&self` and are safe to call from multiple threads.
pub struct GenericBPlusTree<K, V, const ORDER: usize, C = NaturalOrder> {
    state: RwLock<TreeState<K, V, ORDER>>,
    cmp: C,
}

pub(crate) struct TreeState<K, V, const ORDER: usize> {
    // `None` only for the empty tree; everywhere else node references are
    // Internal or Leaf.
    root: Option<NodeRef<K, V, ORDER>>,
    size: usize,
    height: usize,
}

pub(crate) enum Node<K, V, const ORDER: usize> {
    Internal(InternalNode<K, V, ORDER>),
    Leaf(LeafNode<K, V, ORDER>),
}

impl<K, V, const ORDER: usize> Node<K, V, ORDER> {
    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        match self {
            Node::Leaf(_) => true,
            Node::Internal(_) => false,
        }
    }

    #[inline]
    pub(crate) fn as_leaf(&self) -> &LeafNode<K, V, ORDER> {
        match self {
            Node::Leaf(ref leaf) => leaf,
            Node::Internal(_) => panic!("expected leaf node"),
        }
    }

    #[inline]
    pub(crate) fn as_leaf_mut(&mut self) -> &mut LeafNode<K, V, ORDER> {
        match self {
            Node::Leaf(ref mut leaf) => leaf,
            Node::Internal(_) => panic!("expected leaf node"),
        }
    }

    #[inline]
    pub(crate) fn as_internal(&self) -> &InternalNode<K, V, ORDER> {
        match self {
            Node::Internal(ref internal) => internal,
            Node::Leaf(_) => panic!("expected internal node"),
        }
    }

    #[inline]
    pub(crate) fn as_internal_mut(&mut self) -> &mut InternalNode<K, V, ORDER> {
        match self {
            Node::Internal(ref mut internal) => internal,
            Node::Leaf(_) => panic!("expected internal node"),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, const ORDER: usize> fmt::Debug for Node<K, V, ORDER> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Internal(ref internal) => f.debug_tuple("Internal").field(internal).finish(),
            Node::Leaf(ref leaf) => f.debug_tuple("Leaf").field(leaf).finish(),
        }
    }
}

// First index in `keys` whose key is not less than `key`, and whether it is
// an exact hit.
fn lower_bound_by<K, C: Comparator<K>>(keys: &[K], key: &K, cmp: &C) -> (usize, bool) {
    let mut lower = 0;
    let mut upper = keys.len();

    while lower < upper {
        let mid = (upper - lower) / 2 + lower;
        let probe = &keys[mid];

        if cmp.less(key, probe) {
            upper = mid;
        } else if cmp.less(probe, key) {
            lower = mid + 1;
        } else {
            return (mid, true);
        }
    }

    (lower, false)
}

pub(crate) struct LeafNode<K, V, const ORDER: usize> {
    pub(crate) keys: SmallVec<[K; ORDER]>,
    pub(crate) values: SmallVec<[V; ORDER]>,
    pub(crate) next: Option<NodeRef<K, V, ORDER>>,
}

impl<K: fmt::Debug, V: fmt::Debug, const ORDER: usize> fmt::Debug for LeafNode<K, V, ORDER> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafNode")
            .field("keys", &self.keys)
            .field("values", &self.values)
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

impl<K, V, const ORDER: usize> LeafNode<K, V, ORDER> {
    pub(crate) const MAX_KEYS: usize = ORDER - 1;
    pub(crate) const MIN_KEYS: usize = ORDER / 2; // ceil((ORDER - 1) / 2)

    pub(crate) fn new() -> LeafNode<K, V, ORDER> {
        LeafNode {
            keys: smallvec![],
            values: smallvec![],
            next: None,
        }
    }

    #[inline]
    pub(crate) fn lower_bound<C: Comparator<K>>(&self, key: &K, cmp: &C) -> (usize, bool) {
        lower_bound_by(&self.keys, key, cmp)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub(crate) fn is_underfull(&self) -> bool {
        self.keys.len() < Self::MIN_KEYS
    }

    #[inline]
    pub(crate) fn can_lend(&self) -> bool {
        self.keys.len() > Self::MIN_KEYS
    }

    // OBS: Does not trigger splits
    pub(crate) fn insert_at(&mut self, pos: usize, key: K, value: V) {
        self.keys.insert(pos, key);
        self.values.insert(pos, value);
    }

    // OBS: Does not trigger merges
    pub(crate) fn remove_at(&mut self, pos: usize) -> (K, V) {
        let key = self.keys.remove(pos);
        let value = self.values.remove(pos);
        (key, value)
    }

    /// Moves the upper half out into a fresh right sibling and returns it
    /// with the separator (a copy of the right sibling's first key). The
    /// caller wires the leaf chain.
    pub(crate) fn split(&mut self) -> (K, LeafNode<K, V, ORDER>)
    where
        K: Clone,
    {
        let mid = self.keys.len() / 2;
        let mut right = LeafNode::new();
        right.keys.extend(self.keys.drain(mid..));
        right.values.extend(self.values.drain(mid..));
        right.next = self.next.take();

        let separator = right.keys[0].clone();
        (separator, right)
    }

    /// Absorbs the right sibling. The right node keeps its `next` pointer so
    /// an iterator still holding it can re-enter the live chain.
    pub(crate) fn merge_from(&mut self, right: &mut LeafNode<K, V, ORDER>) {
        self.keys.extend(right.keys.drain(..));
        self.values.extend(right.values.drain(..));
        self.next = right.next.clone();
    }
}

pub(crate) struct InternalNode<K, V, const ORDER: usize> {
    pub(crate) keys: SmallVec<[K; ORDER]>,
    pub(crate) children: SmallVec<[NodeRef<K, V, ORDER>; ORDER]>,
}

impl<K: fmt::Debug, V, const ORDER: usize> fmt::Debug for InternalNode<K, V, ORDER> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalNode")
            .field("keys", &self.keys)
            .field("children", &self.children.len())
            .finish()
    }
}

impl<K, V, const ORDER: usize> InternalNode<K, V, ORDER> {
    pub(crate) const MAX_KEYS: usize = ORDER - 1;
    pub(crate) const MIN_KEYS: usize = (ORDER + 1) / 2 - 1; // ceil(ORDER / 2) children

    pub(crate) fn new() -> InternalNode<K, V, ORDER> {
        InternalNode {
            keys: smallvec![],
            children: smallvec![],
        }
    }

    #[inline]
    pub(crate) fn lower_bound<C: Comparator<K>>(&self, key: &K, cmp: &C) -> (usize, bool) {
        lower_bound_by(&self.keys, key, cmp)
    }

    /// Index of the child whose subtree covers `key`: keys equal to a
    /// separator belong to the separator's right subtree.
    #[inline]
    pub(crate) fn child_index<C: Comparator<K>>(&self, key: &K, cmp: &C) -> usize {
        let (pos, exact) = self.lower_bound(key, cmp);
        if exact {
            pos + 1
        } else {
            pos
        }
    }

    #[inline]
    pub(crate) fn is_underfull(&self) -> bool {
        self.keys.len() < Self::MIN_KEYS
    }

    #[inline]
    pub(crate) fn can_lend(&self) -> bool {
        self.keys.len() > Self::MIN_KEYS
    }

    // OBS: Does not trigger splits
    pub(crate) fn insert_at(&mut self, pos: usize, separator: K, right: NodeRef<K, V, ORDER>) {
        self.keys.insert(pos, separator);
        self.children.insert(pos + 1, right);
    }

    /// Drops the separator at `pos` together with the child on its right,
    /// returning both.
    pub(crate) fn remove_separator(&mut self, pos: usize) -> (K, NodeRef<K, V, ORDER>) {
        let key = self.keys.remove(pos);
        let child = self.children.remove(pos + 1);
        (key, child)
    }

    /// Moves the upper half out into a fresh right sibling; the median key
    /// is promoted (it ends up in neither sibling).
    pub(crate) fn split(&mut self) -> (K, InternalNode<K, V, ORDER>) {
        let mid = self.keys.len() / 2;
        let mut right = InternalNode::new();
        right.keys.extend(self.keys.drain(mid + 1..));
        right.children.extend(self.children.drain(mid + 1..));

        let median = self.keys.pop().expect("split node must hold keys");
        (median, right)
    }

    /// Absorbs the right sibling, pulling the parent separator down between
    /// the two key runs.
    pub(crate) fn merge_from(&mut self, separator: K, right: &mut InternalNode<K, V, ORDER>) {
        self.keys.push(separator);
        self.keys.extend(right.keys.drain(..));
        self.children.extend(right.children.drain(..));
    }
}

impl<K, V, const ORDER: usize, C> GenericBPlusTree<K, V, ORDER, C> {
    const ORDER_OK: () = assert!(ORDER >= 4, "branching factor must be at least 4");

    /// Walks to the leftmost leaf under `node`.
    fn leftmost_from(node: &NodeRef<K, V, ORDER>) -> NodeRef<K, V, ORDER> {
        let mut current = Arc::clone(node);
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(_) => break,
                    Node::Internal(internal) => Arc::clone(&internal.children[0]),
                }
            };
            current = next;
        }
        current
    }

    // Unlinks the leaf chain before the nodes go away, so the final strong
    // drop cannot recurse through arbitrarily many `next` references.
    fn teardown(state: &mut TreeState<K, V, ORDER>) {
        if let Some(root) = state.root.take() {
            let mut leaf = Some(Self::leftmost_from(&root));
            while let Some(current) = leaf {
                leaf = current.write().as_leaf_mut().next.take();
            }
        }
        state.size = 0;
        state.height = 0;
    }
}

impl<K: Clone, V, const ORDER: usize, C: Comparator<K>> GenericBPlusTree<K, V, ORDER, C> {
    /// Creates an empty tree with the default-constructed comparator.
    pub fn new() -> Self
    where
        C: Default,
    {
        Self::with_comparator(C::default())
    }

    /// Creates an empty tree ordered by `cmp`.
    pub fn with_comparator(cmp: C) -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::ORDER_OK;
        GenericBPlusTree {
            state: RwLock::new(TreeState {
                root: None,
                size: 0,
                height: 0,
            }),
            cmp,
        }
    }

    /// Number of key/value pairs in the tree.
    pub fn len(&self) -> usize {
        self.state.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Levels from root to leaves; 0 for the empty tree, 1 for a root leaf.
    pub fn height(&self) -> usize {
        self.state.read().height
    }

    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// Mean node occupancy: total keys over total key capacity, across all
    /// nodes. 0.0 for the empty tree.
    pub fn fill_factor(&self) -> f64 {
        let state = self.state.read();
        match &state.root {
            Some(root) => {
                let (keys, nodes) = Self::occupancy(root);
                keys as f64 / (nodes * (ORDER - 1)) as f64
            }
            None => 0.0,
        }
    }

    fn occupancy(node_ref: &NodeRef<K, V, ORDER>) -> (usize, usize) {
        let node = node_ref.read();
        match &*node {
            Node::Leaf(leaf) => (leaf.len(), 1),
            Node::Internal(internal) => {
                let mut keys = internal.keys.len();
                let mut nodes = 1;
                for child in &internal.children {
                    let (k, n) = Self::occupancy(child);
                    keys += k;
                    nodes += n;
                }
                (keys, nodes)
            }
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut state = self.state.write();
        Self::teardown(&mut state);
    }

    fn find_leaf(&self, state: &TreeState<K, V, ORDER>, key: &K) -> Option<NodeRef<K, V, ORDER>> {
        let mut current = Arc::clone(state.root.as_ref()?);
        loop {
            let next = {
                let node = current.read();
                match &*node {
                    Node::Leaf(_) => break,
                    Node::Internal(internal) => {
                        let idx = internal.child_index(key, &self.cmp);
                        Arc::clone(&internal.children[idx])
                    }
                }
            };
            current = next;
        }
        Some(current)
    }

    // Descent that records the `(parent, child index)` frames so structural
    // changes can walk back up without parent pointers.
    fn find_leaf_and_path(
        &self,
        state: &TreeState<K, V, ORDER>,
        key: &K,
    ) -> Option<(NodeRef<K, V, ORDER>, Vec<(NodeRef<K, V, ORDER>, usize)>)> {
        let mut path = Vec::new();
        let mut current = Arc::clone(state.root.as_ref()?);
        loop {
            let next = {
                let node = current.read();
                match &*node {
                    Node::Leaf(_) => break,
                    Node::Internal(internal) => {
                        let idx = internal.child_index(key, &self.cmp);
                        let child = Arc::clone(&internal.children[idx]);
                        path.push((Arc::clone(&current), idx));
                        child
                    }
                }
            };
            current = next;
        }
        Some((current, path))
    }

    pub(crate) fn leftmost_leaf(&self, state: &TreeState<K, V, ORDER>) -> Option<NodeRef<K, V, ORDER>> {
        state.root.as_ref().map(Self::leftmost_from)
    }

    /// Inserts a key/value pair. Fails with [`Error::DuplicateKey`] if the
    /// key is already present, leaving the tree untouched.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut state = self.state.write();

        if state.root.is_none() {
            let mut leaf = LeafNode::new();
            leaf.keys.push(key);
            leaf.values.push(value);
            state.root = Some(Arc::new(RwLock::new(Node::Leaf(leaf))));
            state.size = 1;
            state.height = 1;
            return Ok(());
        }

        let (leaf_ref, path) = self
            .find_leaf_and_path(&state, &key)
            .expect("tree is not empty");

        let overflow = {
            let mut node = leaf_ref.write();
            let leaf = node.as_leaf_mut();
            let (pos, exact) = leaf.lower_bound(&key, &self.cmp);
            if exact {
                return Err(Error::DuplicateKey);
            }
            leaf.insert_at(pos, key, value);
            leaf.len() == ORDER
        };

        state.size += 1;
        if overflow {
            self.split_upward(&mut state, leaf_ref, path);
        }
        Ok(())
    }

    // Splits the overflowing node and pushes the separator into the parent,
    // cascading while parents overflow; grows a new root when the cascade
    // passes the old one.
    fn split_upward(
        &self,
        state: &mut TreeState<K, V, ORDER>,
        node_ref: NodeRef<K, V, ORDER>,
        mut path: Vec<(NodeRef<K, V, ORDER>, usize)>,
    ) {
        let mut left_ref = node_ref;
        loop {
            let (separator, right_ref) = Self::split_node(&left_ref);

            match path.pop() {
                Some((parent_ref, idx)) => {
                    let overflow = {
                        let mut pnode = parent_ref.write();
                        let parent = pnode.as_internal_mut();
                        parent.insert_at(idx, separator, right_ref);
                        parent.keys.len() == ORDER
                    };
                    if !overflow {
                        return;
                    }
                    left_ref = parent_ref;
                }
                None => {
                    let mut root = InternalNode::new();
                    root.keys.push(separator);
                    root.children.push(left_ref);
                    root.children.push(right_ref);
                    state.root = Some(Arc::new(RwLock::new(Node::Internal(root))));
                    state.height += 1;
                    return;
                }
            }
        }
    }

    fn split_node(left_ref: &NodeRef<K, V, ORDER>) -> (K, NodeRef<K, V, ORDER>) {
        let mut node = left_ref.write();
        match &mut *node {
            Node::Leaf(leaf) => {
                let (separator, right) = leaf.split();
                let right_ref = Arc::new(RwLock::new(Node::Leaf(right)));
                leaf.next = Some(Arc::clone(&right_ref));
                (separator, right_ref)
            }
            Node::Internal(internal) => {
                let (separator, right) = internal.split();
                (separator, Arc::new(RwLock::new(Node::Internal(right))))
            }
        }
    }

    /// Removes the entry for `key`, returning it. Absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Option<(K, V)> {
        let mut state = self.state.write();
        let (leaf_ref, path) = self.find_leaf_and_path(&state, key)?;

        let (kv, underflow, emptied) = {
            let mut node = leaf_ref.write();
            let leaf = node.as_leaf_mut();
            let (pos, exact) = leaf.lower_bound(key, &self.cmp);
            if !exact {
                return None;
            }
            let kv = leaf.remove_at(pos);
            (kv, leaf.is_underfull(), leaf.len() == 0)
        };
        state.size -= 1;

        if path.is_empty() {
            // Root leaf: no minimum occupancy, but an emptied root resets
            // the tree to the empty state.
            if emptied {
                state.root = None;
                state.height = 0;
            }
        } else if underflow {
            self.rebalance(&mut state, leaf_ref, path);
        }

        Some(kv)
    }

    // Cures underflow at `node_ref`: borrow from the left sibling, else from
    // the right, else merge with the adjacent sibling and continue in the
    // parent. Collapses the root when it runs out of separators.
    fn rebalance(
        &self,
        state: &mut TreeState<K, V, ORDER>,
        node_ref: NodeRef<K, V, ORDER>,
        mut path: Vec<(NodeRef<K, V, ORDER>, usize)>,
    ) {
        let mut node_ref = node_ref;
        loop {
            let (parent_ref, idx) = match path.pop() {
                Some(frame) => frame,
                None => {
                    // `node_ref` is the root.
                    let collapse = {
                        let node = node_ref.read();
                        match &*node {
                            Node::Internal(internal) if internal.keys.is_empty() => {
                                Some(Arc::clone(&internal.children[0]))
                            }
                            _ => None,
                        }
                    };
                    if let Some(child) = collapse {
                        state.root = Some(child);
                        state.height -= 1;
                    }
                    return;
                }
            };

            let parent_ok = {
                let mut pnode = parent_ref.write();
                let parent = pnode.as_internal_mut();

                if idx > 0 && Self::try_borrow_from_left(parent, idx, &node_ref) {
                    true
                } else if idx < parent.keys.len()
                    && Self::try_borrow_from_right(parent, idx, &node_ref)
                {
                    true
                } else {
                    // Merge with the immediate sibling; the right node of
                    // the pair is detached.
                    let at = if idx > 0 { idx - 1 } else { idx };
                    let left_ref = Arc::clone(&parent.children[at]);
                    let (separator, right_ref) = parent.remove_separator(at);

                    let mut left = left_ref.write();
                    let mut right = right_ref.write();
                    match (&mut *left, &mut *right) {
                        (Node::Leaf(l), Node::Leaf(r)) => l.merge_from(r),
                        (Node::Internal(l), Node::Internal(r)) => l.merge_from(separator, r),
                        _ => panic!("siblings must be of the same kind"),
                    }

                    // An emptied internal root is always below the minimum,
                    // so the root-collapse check on the next round sees it.
                    !parent.is_underfull()
                }
            };

            if parent_ok {
                return;
            }
            node_ref = parent_ref;
        }
    }

    fn try_borrow_from_left(
        parent: &mut InternalNode<K, V, ORDER>,
        idx: usize,
        node_ref: &NodeRef<K, V, ORDER>,
    ) -> bool {
        let left_ref = Arc::clone(&parent.children[idx - 1]);
        let mut left = left_ref.write();
        let mut target = node_ref.write();

        match (&mut *left, &mut *target) {
            (Node::Leaf(l), Node::Leaf(t)) => {
                if !l.can_lend() {
                    return false;
                }
                let (k, v) = l.remove_at(l.len() - 1);
                t.keys.insert(0, k);
                t.values.insert(0, v);
                // The boundary separator becomes the right leaf's new first key.
                parent.keys[idx - 1] = t.keys[0].clone();
                true
            }
            (Node::Internal(l), Node::Internal(t)) => {
                if !l.can_lend() {
                    return false;
                }
                // Rotate through the parent: the separator descends as the
                // target's new edge key, the donor's edge key ascends.
                let ascending = l.keys.pop().expect("donor holds keys");
                let separator = std::mem::replace(&mut parent.keys[idx - 1], ascending);
                t.keys.insert(0, separator);
                let edge = l.children.pop().expect("donor holds children");
                t.children.insert(0, edge);
                true
            }
            _ => panic!("siblings must be of the same kind"),
        }
    }

    fn try_borrow_from_right(
        parent: &mut InternalNode<K, V, ORDER>,
        idx: usize,
        node_ref: &NodeRef<K, V, ORDER>,
    ) -> bool {
        let right_ref = Arc::clone(&parent.children[idx + 1]);
        let mut target = node_ref.write();
        let mut right = right_ref.write();

        match (&mut *target, &mut *right) {
            (Node::Leaf(t), Node::Leaf(r)) => {
                if !r.can_lend() {
                    return false;
                }
                let (k, v) = r.remove_at(0);
                t.keys.push(k);
                t.values.push(v);
                parent.keys[idx] = r.keys[0].clone();
                true
            }
            (Node::Internal(t), Node::Internal(r)) => {
                if !r.can_lend() {
                    return false;
                }
                let ascending = r.keys.remove(0);
                let separator = std::mem::replace(&mut parent.keys[idx], ascending);
                t.keys.push(separator);
                t.children.push(r.children.remove(0));
                true
            }
            _ => panic!("siblings must be of the same kind"),
        }
    }

    /// All record identifiers mapped to `key` (at most one entry under the
    /// unique-key contract; a list keeps the interface uniform with the
    /// index layers).
    pub fn find(&self, key: &K) -> Vec<V>
    where
        V: Clone,
    {
        match self.lookup(key, V::clone) {
            Some(v) => vec![v],
            None => Vec::new(),
        }
    }

    /// Runs `f` against the value stored for `key` under the shared latch.
    pub fn lookup<T>(&self, key: &K, f: impl FnOnce(&V) -> T) -> Option<T> {
        let state = self.state.read();
        let leaf_ref = self.find_leaf(&state, key)?;
        let node = leaf_ref.read();
        let leaf = node.as_leaf();
        let (pos, exact) = leaf.lower_bound(key, &self.cmp);
        if exact {
            Some(f(&leaf.values[pos]))
        } else {
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key, |_| ()).is_some()
    }

    /// Values for all keys in the closed interval `[lo, hi]`, in ascending
    /// key order. Empty when `hi < lo`.
    pub fn range_search(&self, lo: &K, hi: &K) -> Vec<V>
    where
        V: Clone,
    {
        let state = self.state.read();
        let mut out = Vec::new();
        if self.cmp.less(hi, lo) {
            return out;
        }
        let Some(start) = self.find_leaf(&state, lo) else {
            return out;
        };

        let mut current = start;
        let mut pos = {
            let node = current.read();
            node.as_leaf().lower_bound(lo, &self.cmp).0
        };
        loop {
            let next = {
                let node = current.read();
                let leaf = node.as_leaf();
                for i in pos..leaf.len() {
                    if self.cmp.less(hi, &leaf.keys[i]) {
                        return out;
                    }
                    out.push(leaf.values[i].clone());
                }
                leaf.next.clone()
            };
            match next {
                Some(n) => {
                    current = n;
                    pos = 0;
                }
                None => return out,
            }
        }
    }

    /// Values for all keys beginning with `prefix`, in ascending key order.
    pub fn prefix_search(&self, prefix: &K) -> Vec<V>
    where
        K: PrefixKey,
        V: Clone,
    {
        let state = self.state.read();
        let mut out = Vec::new();
        let Some(start) = self.find_leaf(&state, prefix) else {
            return out;
        };

        let mut current = start;
        let mut pos = {
            let node = current.read();
            node.as_leaf().lower_bound(prefix, &self.cmp).0
        };
        loop {
            let next = {
                let node = current.read();
                let leaf = node.as_leaf();
                for i in pos..leaf.len() {
                    // Keys at or past the lower bound either match the
                    // prefix or already compare beyond it.
                    if !leaf.keys[i].matches_prefix(prefix) {
                        return out;
                    }
                    out.push(leaf.values[i].clone());
                }
                leaf.next.clone()
            };
            match next {
                Some(n) => {
                    current = n;
                    pos = 0;
                }
                None => return out,
            }
        }
    }

    /// Values for all keys satisfying `pred`, in ascending key order. Walks
    /// the entire leaf chain.
    pub fn find_if(&self, pred: impl Fn(&K) -> bool) -> Vec<V>
    where
        V: Clone,
    {
        let state = self.state.read();
        let mut out = Vec::new();
        let Some(start) = self.leftmost_leaf(&state) else {
            return out;
        };

        let mut current = start;
        loop {
            let next = {
                let node = current.read();
                let leaf = node.as_leaf();
                for i in 0..leaf.len() {
                    if pred(&leaf.keys[i]) {
                        out.push(leaf.values[i].clone());
                    }
                }
                leaf.next.clone()
            };
            match next {
                Some(n) => current = n,
                None => return out,
            }
        }
    }

    /// Replaces the tree content from strictly ascending `(key, value)`
    /// pairs, packing nodes to capacity level by level. Fails with
    /// [`Error::UnsortedInput`] on the first out-of-order key, leaving the
    /// tree empty.
    pub fn bulk_load<I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut state = self.state.write();
        Self::teardown(&mut state);

        // Pack leaves.
        let mut leaves: Vec<LeafNode<K, V, ORDER>> = Vec::new();
        let mut current = LeafNode::new();
        let mut previous: Option<K> = None;
        let mut count = 0usize;

        for (key, value) in pairs {
            if let Some(prev) = &previous {
                if !self.cmp.less(prev, &key) {
                    return Err(Error::UnsortedInput);
                }
            }
            previous = Some(key.clone());

            if current.len() == LeafNode::<K, V, ORDER>::MAX_KEYS {
                leaves.push(std::mem::replace(&mut current, LeafNode::new()));
            }
            current.keys.push(key);
            current.values.push(value);
            count += 1;
        }
        if current.len() > 0 {
            leaves.push(current);
        }
        if leaves.is_empty() {
            return Ok(());
        }

        // Packing can leave the tail short; repack the final two leaves so
        // occupancy bounds hold for bulk-loaded trees too.
        if leaves.len() >= 2 {
            let last_len = leaves[leaves.len() - 1].len();
            let shortfall = LeafNode::<K, V, ORDER>::MIN_KEYS.saturating_sub(last_len);
            if shortfall > 0 {
                let donor_at = leaves.len() - 2;
                let (head, tail) = leaves.split_at_mut(donor_at + 1);
                let donor = &mut head[donor_at];
                let last = &mut tail[0];
                let cut = donor.len() - shortfall;
                let mut keys: SmallVec<[K; ORDER]> = donor.keys.drain(cut..).collect();
                let mut values: SmallVec<[V; ORDER]> = donor.values.drain(cut..).collect();
                keys.extend(last.keys.drain(..));
                values.extend(last.values.drain(..));
                last.keys = keys;
                last.values = values;
            }
        }

        // Materialize and chain the leaf level.
        let mut level: Vec<(NodeRef<K, V, ORDER>, K)> = Vec::with_capacity(leaves.len());
        let mut prev_leaf: Option<NodeRef<K, V, ORDER>> = None;
        for leaf in leaves {
            let first = leaf.keys[0].clone();
            let leaf_ref = Arc::new(RwLock::new(Node::Leaf(leaf)));
            if let Some(prev) = prev_leaf {
                prev.write().as_leaf_mut().next = Some(Arc::clone(&leaf_ref));
            }
            prev_leaf = Some(Arc::clone(&leaf_ref));
            level.push((leaf_ref, first));
        }

        // Build internal levels; the separator for each child after the
        // first is the first key of that child's subtree.
        let mut height = 1usize;
        while level.len() > 1 {
            let mut groups: Vec<Vec<(NodeRef<K, V, ORDER>, K)>> = Vec::new();
            for entry in level {
                match groups.last_mut() {
                    Some(group) if group.len() < ORDER => group.push(entry),
                    _ => groups.push(vec![entry]),
                }
            }

            let min_children = InternalNode::<K, V, ORDER>::MIN_KEYS + 1;
            if groups.len() >= 2 {
                let last_len = groups[groups.len() - 1].len();
                let shortfall = min_children.saturating_sub(last_len);
                if shortfall > 0 {
                    let donor_at = groups.len() - 2;
                    let donor = &mut groups[donor_at];
                    let mut moved: Vec<_> = donor.drain(donor.len() - shortfall..).collect();
                    let last = groups.len() - 1;
                    moved.extend(groups[last].drain(..));
                    groups[last] = moved;
                }
            }

            let mut next_level = Vec::with_capacity(groups.len());
            for group in groups {
                let first = group[0].1.clone();
                let mut internal = InternalNode::new();
                for (i, (child, child_first)) in group.into_iter().enumerate() {
                    if i > 0 {
                        internal.keys.push(child_first);
                    }
                    internal.children.push(child);
                }
                next_level.push((Arc::new(RwLock::new(Node::Internal(internal))), first));
            }
            level = next_level;
            height += 1;
        }

        let (root, _) = level.pop().expect("one node remains");
        state.root = Some(root);
        state.size = count;
        state.height = height;
        Ok(())
    }

    /// Forward iterator over all `(key, value)` pairs in ascending key
    /// order. See the crate docs for its behaviour under concurrent writes.
    pub fn iter(&self) -> iter::Iter<'_, K, V, ORDER, C>
    where
        V: Clone,
    {
        iter::Iter::new(self)
    }

    /// Forward iterator starting at the first key not less than `key`.
    pub fn iter_from(&self, key: &K) -> iter::Iter<'_, K, V, ORDER, C>
    where
        V: Clone,
    {
        iter::Iter::from_key(self, key)
    }

    /// Forward iterator over the pairs whose key satisfies `pred`.
    pub fn filter_keys<P>(&self, pred: P) -> iter::FilterKeys<'_, K, V, ORDER, C, P>
    where
        P: Fn(&K) -> bool,
        V: Clone,
    {
        iter::FilterKeys::new(self.iter(), pred)
    }

    /// Asserts every structural invariant: key ordering within and across
    /// nodes, occupancy bounds, uniform leaf depth, separator ranges, the
    /// leaf chain and the size counter. Panics on the first violation.
    /// Intended for tests and debugging; walks the whole tree.
    pub fn check_invariants(&self) {
        let state = self.state.read();
        let Some(root) = &state.root else {
            assert_eq!(state.size, 0, "empty tree must report size 0");
            assert_eq!(state.height, 0, "empty tree must report height 0");
            return;
        };

        let mut leaves = Vec::new();
        let mut leaf_depth = None;
        self.check_node(root, true, 1, None, None, &mut leaf_depth, &mut leaves);

        assert_eq!(
            leaf_depth.expect("tree has at least one leaf"),
            state.height,
            "stored height must equal leaf depth"
        );

        let total: usize = leaves.iter().map(|l| l.read().as_leaf().len()).sum();
        assert_eq!(total, state.size, "size must equal the sum of leaf keys");

        // The chain must visit exactly the in-order leaves.
        let mut current = Some(Arc::clone(&leaves[0]));
        for expected in &leaves {
            let reached = current.expect("leaf chain ended early");
            assert!(
                Arc::ptr_eq(&reached, expected),
                "leaf chain diverges from in-order leaves"
            );
            current = reached.read().as_leaf().next.clone();
        }
        assert!(current.is_none(), "leaf chain extends past the last leaf");
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        node_ref: &NodeRef<K, V, ORDER>,
        is_root: bool,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<NodeRef<K, V, ORDER>>,
    ) {
        let node = node_ref.read();
        let keys: &[K] = match &*node {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(internal) => &internal.keys,
        };

        for pair in keys.windows(2) {
            assert!(
                self.cmp.less(&pair[0], &pair[1]),
                "keys within a node must be strictly ascending"
            );
        }
        if let Some(lo) = lower {
            assert!(
                keys.iter().all(|k| !self.cmp.less(k, lo)),
                "subtree keys must not fall below the separator"
            );
        }
        if let Some(hi) = upper {
            assert!(
                keys.iter().all(|k| self.cmp.less(k, hi)),
                "subtree keys must stay below the next separator"
            );
        }

        match &*node {
            Node::Leaf(leaf) => {
                assert_eq!(
                    leaf.keys.len(),
                    leaf.values.len(),
                    "leaf keys and values must align"
                );
                if is_root {
                    assert!(leaf.len() >= 1, "a root leaf holds at least one key");
                } else {
                    assert!(!leaf.is_underfull(), "non-root leaf below minimum occupancy");
                }
                assert!(
                    leaf.len() <= LeafNode::<K, V, ORDER>::MAX_KEYS,
                    "leaf above maximum occupancy"
                );

                match leaf_depth {
                    Some(d) => assert_eq!(*d, depth, "all leaves must sit at the same depth"),
                    None => *leaf_depth = Some(depth),
                }
                leaves.push(Arc::clone(node_ref));
            }
            Node::Internal(internal) => {
                assert_eq!(
                    internal.children.len(),
                    internal.keys.len() + 1,
                    "internal node must hold one more child than keys"
                );
                if is_root {
                    assert!(
                        !internal.keys.is_empty(),
                        "an internal root holds at least one key"
                    );
                } else {
                    assert!(
                        !internal.is_underfull(),
                        "non-root internal node below minimum occupancy"
                    );
                }
                assert!(
                    internal.keys.len() <= InternalNode::<K, V, ORDER>::MAX_KEYS,
                    "internal node above maximum occupancy"
                );
                let leaf_children = internal
                    .children
                    .iter()
                    .filter(|c| c.read().is_leaf())
                    .count();
                assert!(
                    leaf_children == 0 || leaf_children == internal.children.len(),
                    "children of an internal node must all be the same kind"
                );

                for (i, child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(&internal.keys[i - 1])
                    };
                    let child_upper = if i == internal.keys.len() {
                        upper
                    } else {
                        Some(&internal.keys[i])
                    };
                    self.check_node(child, false, depth + 1, child_lower, child_upper, leaf_depth, leaves);
                }
            }
        }
    }
}

impl<K: Clone, V: Clone, const ORDER: usize, C: Comparator<K> + Clone> Clone
    for GenericBPlusTree<K, V, ORDER, C>
{
    /// Deep copy: every node is duplicated, then the new leaf chain is
    /// rebuilt from an in-order traversal of the copy.
    fn clone(&self) -> Self {
        let state = self.state.read();
        let root = state.root.as_ref().map(Self::clone_node);

        if let Some(root_ref) = &root {
            let mut leaves = Vec::new();
            Self::collect_leaves(root_ref, &mut leaves);
            for pair in leaves.windows(2) {
                pair[0].write().as_leaf_mut().next = Some(Arc::clone(&pair[1]));
            }
        }

        GenericBPlusTree {
            state: RwLock::new(TreeState {
                root,
                size: state.size,
                height: state.height,
            }),
            cmp: self.cmp.clone(),
        }
    }
}

impl<K: Clone, V: Clone, const ORDER: usize, C: Comparator<K>> GenericBPlusTree<K, V, ORDER, C> {
    fn clone_node(node_ref: &NodeRef<K, V, ORDER>) -> NodeRef<K, V, ORDER> {
        let node = node_ref.read();
        let copy = match &*node {
            Node::Leaf(leaf) => Node::Leaf(LeafNode {
                keys: leaf.keys.clone(),
                values: leaf.values.clone(),
                next: None, // rebuilt by the caller
            }),
            Node::Internal(internal) => Node::Internal(InternalNode {
                keys: internal.keys.clone(),
                children: internal.children.iter().map(Self::clone_node).collect(),
            }),
        };
        Arc::new(RwLock::new(copy))
    }

    fn collect_leaves(node_ref: &NodeRef<K, V, ORDER>, out: &mut Vec<NodeRef<K, V, ORDER>>) {
        let node = node_ref.read();
        match &*node {
            Node::Leaf(_) => out.push(Arc::clone(node_ref)),
            Node::Internal(internal) => {
                for child in &internal.children {
                    Self::collect_leaves(child, out);
                }
            }
        }
    }
}

impl<K: Clone, V, const ORDER: usize, C: Comparator<K> + Default> Default
    for GenericBPlusTree<K, V, ORDER, C>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const ORDER: usize, C> Drop for GenericBPlusTree<K, V, ORDER, C> {
    fn drop(&mut self) {
        Self::teardown(self.state.get_mut());
    }
}

impl<K, V, const ORDER: usize, C> fmt::Debug for GenericBPlusTree<K, V, ORDER, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("GenericBPlusTree")
            .field("len", &state.size)
            .field("height", &state.height)
            .field("order", &ORDER)
            .finish()
    }
}
