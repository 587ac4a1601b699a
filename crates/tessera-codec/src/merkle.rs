//! Binary hash trees with per-leaf branch proofs
//!
//! Leaves are padded to the next power of two with [`empty_leaf`]. A tree
//! with a single leaf has that leaf as its root and an empty proof, so
//! unreplicated objects (n = 1) go through the same verification path.
//!
//! ```text
//!            root
//!          /      \
//!       n01        n23
//!      /   \      /   \
//!    L0    L1   L2    L3   (L3 = empty leaf when only 3 leaves exist)
//! ```

use crate::hash::{empty_leaf, node_hash, Hash};

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are the padded leaves, the last level holds the root
    levels: Vec<Vec<Hash>>,
    leaf_count: usize,
}

/// Sibling hashes from a leaf up to (excluding) the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub index: usize,
    pub siblings: Vec<Hash>,
}

impl MerkleTree {
    /// Build a tree over `leaves`. An empty slice is treated as one empty leaf.
    pub fn new(leaves: &[Hash]) -> Self {
        let leaf_count = leaves.len().max(1);
        let width = leaf_count.next_power_of_two();

        let mut level: Vec<Hash> = Vec::with_capacity(width);
        level.extend_from_slice(leaves);
        level.resize(width, empty_leaf());

        let mut levels = vec![level];
        while levels.last().map(|l| l.len()).unwrap_or(1) > 1 {
            let prev = &levels[levels.len() - 1];
            let next: Vec<Hash> = prev
                .chunks_exact(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }

        Self { levels, leaf_count }
    }

    pub fn root(&self) -> Hash {
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of real (unpadded) leaves
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Branch proof for leaf `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut pos = index;
        for level in &self.levels[..self.levels.len() - 1] {
            siblings.push(level[pos ^ 1]);
            pos >>= 1;
        }
        Some(MerkleProof { index, siblings })
    }
}

impl MerkleProof {
    /// Fold `leaf` up through the siblings.
    pub fn compute_root(&self, leaf: &Hash) -> Hash {
        let mut acc = *leaf;
        let mut pos = self.index;
        for sibling in &self.siblings {
            acc = if pos & 1 == 0 {
                node_hash(&acc, sibling)
            } else {
                node_hash(sibling, &acc)
            };
            pos >>= 1;
        }
        acc
    }

    /// True if `leaf` sits at `self.index` under `root`.
    pub fn verify(&self, leaf: &Hash, root: &Hash) -> bool {
        // A proof longer than usize bits can't be honest and would overflow the shift.
        if self.siblings.len() >= usize::BITS as usize {
            return false;
        }
        if self.index >> self.siblings.len() != 0 {
            return false;
        }
        self.compute_root(leaf) == *root
    }
}
