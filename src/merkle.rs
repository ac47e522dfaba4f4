use std::collections::HashMap;

use crate::data::Hash;
use crate::stable_hash;

/// Complete binary tree of fixed depth summarizing a bucket's contents.
///
/// Heap numbering: the root is 1, `left(n) = 2n`, `right(n) = 2n + 1`,
/// and the leaves occupy `2^(depth-1) .. 2^depth - 1`. Upper levels keep
/// the same IDs in trees of any depth, so two peers with different
/// depths agree on which logical subtree a shared ID names.
///
/// Only non-zero nodes are stored; an absent node hashes to zero, which
/// doubles as the empty-subtree signal on the wire.
pub struct MerkleTree {
    depth: u8,
    nodes: HashMap<u32, Hash>,
}

impl MerkleTree {
    pub fn new(depth: u8) -> Self {
        debug_assert!(depth >= 1 && depth <= 28, "merkle depth out of range");
        Self {
            depth,
            nodes: HashMap::new(),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn root_node(&self) -> u32 {
        1
    }

    /// Node IDs are valid in `(0, node_limit())`.
    pub fn node_limit(&self) -> u32 {
        1 << self.depth
    }

    pub fn left_child(&self, node: u32) -> u32 {
        node * 2
    }

    pub fn right_child(&self, node: u32) -> u32 {
        node * 2 + 1
    }

    /// Level of a node counting from the root at 0.
    pub fn node_level(node: u32) -> u32 {
        debug_assert!(node > 0);
        node.ilog2()
    }

    pub fn is_leaf(&self, node: u32) -> bool {
        Self::node_level(node) == self.depth as u32 - 1
    }

    pub fn leaf_for_key(&self, key: &[u8]) -> u32 {
        let leaf_count = 1u64 << (self.depth - 1);
        let index = stable_hash(key) % leaf_count;
        (leaf_count + index) as u32
    }

    pub fn node_hash(&self, node: u32) -> Hash {
        self.nodes.get(&node).copied().unwrap_or(Hash::ZERO)
    }

    pub fn root_hash(&self) -> Hash {
        self.node_hash(self.root_node())
    }

    /// Map a node ID into a tree of `other_depth`. IDs above the other
    /// tree's leaf level are shared verbatim; deeper IDs are clamped to
    /// the enclosing node at the other tree's leaf level, which keeps
    /// the walk conservative but monotone.
    pub fn translate_node(&self, node: u32, other_depth: u8) -> u32 {
        let level = Self::node_level(node);
        if level < other_depth as u32 {
            node
        } else {
            node >> (level - (other_depth as u32 - 1))
        }
    }

    /// Inclusive range of leaf IDs covered by the subtree rooted at
    /// `node`.
    pub fn leaf_range(&self, node: u32) -> (u32, u32) {
        let shift = self.depth as u32 - 1 - Self::node_level(node);
        let low = node << shift;
        let high = low + (1 << shift) - 1;
        (low, high)
    }

    /// Swap one key's contribution at `leaf`: XOR out the old sibling
    /// set hash and XOR in the new one, all the way up the root path.
    pub fn update_leaf(&mut self, leaf: u32, old_hash: Hash, new_hash: Hash) {
        debug_assert!(self.is_leaf(leaf));

        let delta = old_hash.xor(new_hash);
        if delta.is_zero() {
            return;
        }

        let mut node = leaf;
        loop {
            let combined = self.node_hash(node).xor(delta);
            if combined.is_zero() {
                self.nodes.remove(&node);
            } else {
                self.nodes.insert(node, combined);
            }
            if node == 1 {
                break;
            }
            node /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::hash::hash_bytes;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::new(8);
        assert!(tree.root_hash().is_zero());
        assert_eq!(tree.node_limit(), 256);
    }

    #[test]
    fn leaf_ids_land_in_the_leaf_row() {
        let tree = MerkleTree::new(8);
        for i in 0..1000 {
            let leaf = tree.leaf_for_key(format!("key{i}").as_bytes());
            assert!(leaf >= 128 && leaf < 256);
            assert!(tree.is_leaf(leaf));
        }
    }

    #[test]
    fn interior_nodes_are_the_xor_of_their_children() {
        let mut tree = MerkleTree::new(6);
        let mut rng = StdRng::seed_from_u64(7);

        // a churn of writes, rewrites, and removals
        let mut current: std::collections::HashMap<u32, Hash> = Default::default();
        for i in 0..200 {
            let key = format!("key{}", rng.gen_range(0..50));
            let leaf = tree.leaf_for_key(key.as_bytes());
            let old = current.get(&leaf).copied().unwrap_or(Hash::ZERO);
            let new = if i % 7 == 0 {
                Hash::ZERO
            } else {
                hash_bytes(format!("{key}v{i}").as_bytes())
            };
            tree.update_leaf(leaf, old, new);
            current.insert(leaf, new);
        }

        for node in 1..tree.node_limit() / 2 {
            assert_eq!(
                tree.node_hash(node),
                tree.node_hash(tree.left_child(node))
                    .xor(tree.node_hash(tree.right_child(node))),
                "node {node}"
            );
        }

        let mut leaves = Hash::ZERO;
        for leaf in tree.node_limit() / 2..tree.node_limit() {
            leaves = leaves.xor(tree.node_hash(leaf));
        }
        assert_eq!(tree.root_hash(), leaves);
    }

    #[test]
    fn update_is_reversible() {
        let mut tree = MerkleTree::new(5);
        let leaf = tree.leaf_for_key(b"k");
        let h = hash_bytes(b"k/v");

        tree.update_leaf(leaf, Hash::ZERO, h);
        assert_eq!(tree.node_hash(leaf), h);
        tree.update_leaf(leaf, h, Hash::ZERO);
        assert!(tree.root_hash().is_zero());
        assert!(tree.nodes.is_empty());
    }

    #[test]
    fn translation_keeps_shared_upper_levels() {
        let tree = MerkleTree::new(8);
        assert_eq!(tree.translate_node(1, 50), 1);
        assert_eq!(tree.translate_node(5, 4), 5);
    }

    #[test]
    fn translation_clamps_deep_nodes_to_the_other_leaf_row() {
        let tree = MerkleTree::new(8);
        // our leaf 200 (level 7) in a depth-3 tree collapses to level 2
        assert_eq!(tree.translate_node(200, 3), 200 >> 5);
        // a depth-1 peer only has the root
        assert_eq!(tree.translate_node(200, 1), 1);
    }

    #[test]
    fn leaf_ranges_cover_subtrees() {
        let tree = MerkleTree::new(4);
        assert_eq!(tree.leaf_range(1), (8, 15));
        assert_eq!(tree.leaf_range(2), (8, 11));
        assert_eq!(tree.leaf_range(3), (12, 15));
        assert_eq!(tree.leaf_range(13), (13, 13));
    }
}
