//! Iterators over the entries of a [`GenericBPlusTree`].
//!
//! An iterator keeps a reference-counted handle to its current leaf and a
//! position within it. Each call to `next` re-acquires the tree's top-level
//! latch in shared mode, reads through the handle, and releases everything
//! before returning; no latch is held between calls and the current leaf
//! latch is never held while the next leaf is acquired. A detached leaf
//! keeps its forward link, so an iterator that was parked on it rejoins the
//! live chain on its next step.

use crate::{Comparator, GenericBPlusTree, NaturalOrder, NodeRef};

/// Forward iterator yielding owned `(key, value)` pairs in ascending key
/// order. Created by [`GenericBPlusTree::iter`] / [`GenericBPlusTree::iter_from`].
pub struct Iter<'t, K, V, const ORDER: usize, C = NaturalOrder> {
    tree: &'t GenericBPlusTree<K, V, ORDER, C>,
    leaf: Option<NodeRef<K, V, ORDER>>,
    pos: usize,
}

impl<'t, K: Clone, V: Clone, const ORDER: usize, C: Comparator<K>> Iter<'t, K, V, ORDER, C> {
    pub(crate) fn new(tree: &'t GenericBPlusTree<K, V, ORDER, C>) -> Self {
        let state = tree.state.read();
        let leaf = tree.leftmost_leaf(&state);
        Iter { tree, leaf, pos: 0 }
    }

    pub(crate) fn from_key(tree: &'t GenericBPlusTree<K, V, ORDER, C>, key: &K) -> Self {
        let state = tree.state.read();
        match tree.find_leaf(&state, key) {
            Some(leaf_ref) => {
                let pos = {
                    let node = leaf_ref.read();
                    node.as_leaf().lower_bound(key, &tree.cmp).0
                };
                Iter {
                    tree,
                    leaf: Some(leaf_ref),
                    pos,
                }
            }
            None => Iter {
                tree,
                leaf: None,
                pos: 0,
            },
        }
    }
}

impl<'t, K: Clone, V: Clone, const ORDER: usize, C: Comparator<K>> Iterator
    for Iter<'t, K, V, ORDER, C>
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let _latch = self.tree.state.read();
        loop {
            let next = {
                let leaf_ref = self.leaf.as_ref()?;
                let node = leaf_ref.read();
                let leaf = node.as_leaf();
                if self.pos < leaf.len() {
                    let item = (
                        leaf.keys[self.pos].clone(),
                        leaf.values[self.pos].clone(),
                    );
                    self.pos += 1;
                    return Some(item);
                }
                leaf.next.clone()
            };
            // The current leaf handle is released before the successor is
            // touched.
            self.leaf = next;
            self.pos = 0;
        }
    }
}

/// Forward iterator that yields only the pairs whose key satisfies a
/// predicate. Created by [`GenericBPlusTree::filter_keys`].
pub struct FilterKeys<'t, K, V, const ORDER: usize, C, P> {
    inner: Iter<'t, K, V, ORDER, C>,
    pred: P,
}

impl<'t, K, V, const ORDER: usize, C, P> FilterKeys<'t, K, V, ORDER, C, P> {
    pub(crate) fn new(inner: Iter<'t, K, V, ORDER, C>, pred: P) -> Self {
        FilterKeys { inner, pred }
    }
}

impl<'t, K: Clone, V: Clone, const ORDER: usize, C: Comparator<K>, P: Fn(&K) -> bool> Iterator
    for FilterKeys<'t, K, V, ORDER, C, P>
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let (key, value) = self.inner.next()?;
            if (self.pred)(&key) {
                return Some((key, value));
            }
        }
    }
}
