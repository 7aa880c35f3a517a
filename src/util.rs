//! Test fixtures: trees built from a declarative JSON description of the
//! node layout, for tests that need a known shape.
use crate::{GenericBPlusTree, InternalNode, LeafNode, NaturalOrder, Node, NodeRef, TreeState};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;

pub(crate) type FixtureTree = GenericBPlusTree<String, u64, 4, NaturalOrder>;
type FixtureNode = NodeRef<String, u64, 4>;

#[derive(Deserialize, Debug)]
struct Entry {
    key: String,
    value: u64,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum TreeNode {
    Internal {
        keys: Vec<String>,
        children: Vec<TreeNode>,
    },
    Leaf {
        entries: Vec<Entry>,
    },
}

#[derive(Deserialize, Debug)]
struct Tree {
    root: TreeNode,
    height: usize,
}

fn translate_node(tree_node: TreeNode, leaves: &mut Vec<FixtureNode>) -> FixtureNode {
    match tree_node {
        TreeNode::Internal { keys, children } => {
            let mut node = InternalNode::new();
            node.keys.extend(keys);
            for child in children {
                let translated = translate_node(child, leaves);
                node.children.push(translated);
            }
            Arc::new(RwLock::new(Node::Internal(node)))
        }
        TreeNode::Leaf { entries } => {
            let mut node = LeafNode::new();
            for entry in entries {
                node.keys.push(entry.key);
                node.values.push(entry.value);
            }
            let node_ref = Arc::new(RwLock::new(Node::Leaf(node)));
            leaves.push(Arc::clone(&node_ref));
            node_ref
        }
    }
}

pub(crate) fn sample_tree<P: AsRef<std::path::Path>>(path: P) -> FixtureTree {
    let file = std::fs::File::open(path).expect("failed to find fixture");
    let tree: Tree = serde_json::from_reader(file).unwrap();

    let mut leaves = Vec::new();
    let root = translate_node(tree.root, &mut leaves);
    let size: usize = leaves.iter().map(|l| l.read().as_leaf().len()).sum();
    for pair in leaves.windows(2) {
        pair[0].write().as_leaf_mut().next = Some(Arc::clone(&pair[1]));
    }

    GenericBPlusTree {
        state: RwLock::new(TreeState {
            root: Some(root),
            size,
            height: tree.height,
        }),
        cmp: NaturalOrder,
    }
}

#[cfg(test)]
mod tests {
    use super::sample_tree;

    #[test]
    fn sample_tree_works() {
        let bptree = sample_tree("fixtures/sample.json");
        bptree.check_invariants();

        assert_eq!(bptree.len(), 6);
        assert_eq!(bptree.height(), 2);

        assert_eq!(bptree.lookup(&"0003".to_string(), |v| *v), Some(3));
        assert_eq!(bptree.lookup(&"0005".to_string(), |v| *v), Some(5));
        assert_eq!(bptree.lookup(&"0007".to_string(), |v| *v), None);
        assert_eq!(bptree.lookup(&"0000".to_string(), |v| *v), None);
    }

    #[test]
    fn sample_tree_supports_mutation() {
        let bptree = sample_tree("fixtures/sample.json");

        bptree.insert("0007".to_string(), 7).unwrap();
        assert_eq!(bptree.len(), 7);
        bptree.check_invariants();

        assert!(bptree.remove(&"0001".to_string()).is_some());
        bptree.check_invariants();

        let keys: Vec<_> = bptree.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["0002", "0003", "0004", "0005", "0006", "0007"]);
    }
}
