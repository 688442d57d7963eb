use std::sync::Arc;

use objspace_types::Digest;
use serde::{Deserialize, Serialize};

use crate::hasher::HashFunction;

/// Side of a sibling in a Merkle proof path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Errors from Merkle tree mutations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("leaf {index} out of range (leaf count {count})")]
    LeafOutOfRange { index: usize, count: usize },
}

/// Binary Merkle tree with incremental maintenance.
///
/// Stored level by level: `levels[0]` holds the leaves, the last level holds
/// the single root. Internal nodes are `H(left ++ right)`. When a level has
/// an odd number of nodes, the last node is paired with itself. A single
/// leaf is its own root and the empty tree has the all-zero root.
///
/// Changing one leaf recomputes exactly the nodes on its root path, so
/// `set`, `push` and `truncate` cost `O(log N)` hash evaluations.
#[derive(Clone)]
pub struct MerkleTree {
    hasher: Arc<dyn HashFunction>,
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// An empty tree.
    pub fn new(hasher: Arc<dyn HashFunction>) -> Self {
        Self {
            hasher,
            levels: Vec::new(),
        }
    }

    /// Build a Merkle tree from leaf digests in one pass.
    pub fn from_leaves(hasher: Arc<dyn HashFunction>, leaves: Vec<Digest>) -> Self {
        if leaves.is_empty() {
            return Self::new(hasher);
        }

        let mut levels: Vec<Vec<Digest>> = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let hash = if pair.len() == 2 {
                    hasher.compute_pair(&pair[0], &pair[1])
                } else {
                    // Odd node: hash with itself
                    hasher.compute_pair(&pair[0], &pair[0])
                };
                next.push(hash);
            }
            levels.push(next);
        }

        Self { hasher, levels }
    }

    /// The root hash of the tree.
    pub fn root(&self) -> Digest {
        match self.levels.last() {
            Some(top) => top[0].clone(),
            None => Digest::zero(self.hasher.digest_size()),
        }
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Returns `true` when the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.leaf_count() == 0
    }

    /// Number of levels including leaves and root.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// The leaf digests.
    pub fn leaves(&self) -> &[Digest] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Leaf digest at `index`.
    pub fn leaf(&self, index: usize) -> Option<&Digest> {
        self.levels.first().and_then(|leaves| leaves.get(index))
    }

    /// The hash function this tree was built with.
    pub fn hasher(&self) -> &Arc<dyn HashFunction> {
        &self.hasher
    }

    /// Replace the leaf at `index` and update its root path.
    pub fn set(&mut self, index: usize, leaf: Digest) -> Result<(), MerkleError> {
        let count = self.leaf_count();
        if index >= count {
            return Err(MerkleError::LeafOutOfRange { index, count });
        }
        self.levels[0][index] = leaf;
        self.update_path(index);
        Ok(())
    }

    /// Append a leaf.
    pub fn push(&mut self, leaf: Digest) {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        let index = self.levels[0].len() - 1;
        self.update_path(index);
    }

    /// Drop every leaf at or after `len`.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.leaf_count() {
            return;
        }
        if len == 0 {
            self.levels.clear();
            return;
        }
        self.levels[0].truncate(len);
        self.update_path(len - 1);
    }

    /// Generate an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut path = Vec::new();
        let mut idx = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            let sibling = if sibling_idx < level.len() {
                level[sibling_idx].clone()
            } else {
                // Odd level: duplicate the last element
                level[idx].clone()
            };
            let side = if idx % 2 == 0 {
                Side::Right
            } else {
                Side::Left
            };
            path.push((sibling, side));
            idx /= 2;
        }

        Some(MerkleProof {
            leaf: self.levels[0][index].clone(),
            path,
            root: self.root(),
        })
    }

    /// Recompute the parents of leaf `index` up to the root.
    ///
    /// Parent levels are resized to `ceil(width / 2)` on the way up, which
    /// covers appends (a new rightmost parent) and truncation (stale
    /// rightmost parents dropped).
    fn update_path(&mut self, mut index: usize) {
        let mut level = 0;
        while self.levels[level].len() > 1 {
            let width = self.levels[level].len();
            let left = index & !1;
            let right = if left + 1 < width { left + 1 } else { left };
            let parent = self
                .hasher
                .compute_pair(&self.levels[level][left], &self.levels[level][right]);

            let parent_width = width.div_ceil(2);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::with_capacity(parent_width));
            }
            let next = &mut self.levels[level + 1];
            next.truncate(parent_width);
            if index / 2 < next.len() {
                next[index / 2] = parent;
            } else {
                next.push(parent);
            }

            index /= 2;
            level += 1;
        }
        self.levels.truncate(level + 1);
    }
}

impl std::fmt::Debug for MerkleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleTree")
            .field("hasher", &self.hasher.name())
            .field("leaves", &self.leaf_count())
            .field("root", &self.root())
            .finish()
    }
}

/// Merkle inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// The leaf being proven.
    pub leaf: Digest,
    /// Path of (sibling_hash, sibling_side) pairs from leaf to root.
    pub path: Vec<(Digest, Side)>,
    /// Expected root hash.
    pub root: Digest,
}

impl MerkleProof {
    /// Verify the proof: recompute the root from the leaf and path.
    pub fn verify(&self, hasher: &dyn HashFunction) -> bool {
        let mut current = self.leaf.clone();
        for (sibling, side) in &self.path {
            current = match side {
                Side::Left => hasher.compute_pair(sibling, &current),
                Side::Right => hasher.compute_pair(&current, sibling),
            };
        }
        current == self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ContentHasher;
    use proptest::prelude::*;

    fn hasher() -> Arc<dyn HashFunction> {
        Arc::new(ContentHasher::MERKLE)
    }

    fn leaf(seed: u8) -> Digest {
        ContentHasher::MERKLE.compute(&[seed])
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::new(hasher());
        assert!(tree.root().is_zero());
        assert_eq!(tree.root().len(), 32);
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn single_leaf_is_root() {
        let l = leaf(1);
        let tree = MerkleTree::from_leaves(hasher(), vec![l.clone()]);
        assert_eq!(tree.root(), l);
    }

    #[test]
    fn odd_node_pairs_with_itself() {
        let h = ContentHasher::MERKLE;
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let tree = MerkleTree::from_leaves(hasher(), vec![a.clone(), b.clone(), c.clone()]);

        let ab = h.compute_pair(&a, &b);
        let cc = h.compute_pair(&c, &c);
        assert_eq!(tree.root(), h.compute_pair(&ab, &cc));
    }

    #[test]
    fn push_matches_full_build() {
        let leaves: Vec<Digest> = (0..9).map(leaf).collect();
        let mut tree = MerkleTree::new(hasher());
        for (i, l) in leaves.iter().enumerate() {
            tree.push(l.clone());
            let full = MerkleTree::from_leaves(hasher(), leaves[..=i].to_vec());
            assert_eq!(tree.root(), full.root(), "after {} pushes", i + 1);
            assert_eq!(tree.height(), full.height());
        }
    }

    #[test]
    fn set_updates_root() {
        let mut tree = MerkleTree::from_leaves(hasher(), (0..6).map(leaf).collect());
        let before = tree.root();
        tree.set(4, leaf(99)).unwrap();
        assert_ne!(tree.root(), before);

        let mut expected: Vec<Digest> = (0..6).map(leaf).collect();
        expected[4] = leaf(99);
        assert_eq!(tree.root(), MerkleTree::from_leaves(hasher(), expected).root());
    }

    #[test]
    fn set_out_of_range() {
        let mut tree = MerkleTree::from_leaves(hasher(), vec![leaf(1)]);
        assert_eq!(
            tree.set(3, leaf(2)),
            Err(MerkleError::LeafOutOfRange { index: 3, count: 1 })
        );
    }

    #[test]
    fn truncate_matches_full_build() {
        let leaves: Vec<Digest> = (0..13).map(leaf).collect();
        for len in (0..13).rev() {
            let mut tree = MerkleTree::from_leaves(hasher(), leaves.clone());
            tree.truncate(len);
            let full = MerkleTree::from_leaves(hasher(), leaves[..len].to_vec());
            assert_eq!(tree.root(), full.root(), "truncate to {len}");
            assert_eq!(tree.leaf_count(), len);
        }
    }

    #[test]
    fn proof_verifies_for_all_leaves() {
        let leaves: Vec<Digest> = (0..7).map(leaf).collect();
        let tree = MerkleTree::from_leaves(hasher(), leaves.clone());

        for (i, expected) in leaves.iter().enumerate() {
            let proof = tree.proof(i).expect("proof should exist");
            assert_eq!(&proof.leaf, expected);
            assert!(proof.verify(&ContentHasher::MERKLE), "proof for leaf {i} should verify");
        }
    }

    #[test]
    fn proof_out_of_bounds_returns_none() {
        let tree = MerkleTree::from_leaves(hasher(), vec![leaf(1), leaf(2)]);
        assert!(tree.proof(5).is_none());
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let tree = MerkleTree::from_leaves(hasher(), (1..=4).map(leaf).collect());
        let mut proof = tree.proof(0).unwrap();
        proof.leaf = leaf(99);
        assert!(!proof.verify(&ContentHasher::MERKLE));
    }

    #[test]
    fn power_of_two_proof_length() {
        let tree = MerkleTree::from_leaves(hasher(), (0..8).map(leaf).collect());
        for i in 0..8 {
            let proof = tree.proof(i).unwrap();
            assert!(proof.verify(&ContentHasher::MERKLE));
            assert_eq!(proof.path.len(), 3);
        }
    }

    #[test]
    fn proof_serde_roundtrip() {
        let tree = MerkleTree::from_leaves(hasher(), (1..=4).map(leaf).collect());
        let proof = tree.proof(2).unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        let parsed: MerkleProof = serde_json::from_str(&json).unwrap();
        assert_eq!(proof, parsed);
        assert!(parsed.verify(&ContentHasher::MERKLE));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u8),
        Set(usize, u8),
        Truncate(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<u8>().prop_map(Op::Push),
            2 => (any::<usize>(), any::<u8>()).prop_map(|(i, s)| Op::Set(i, s)),
            1 => any::<usize>().prop_map(Op::Truncate),
        ]
    }

    proptest! {
        #[test]
        fn incremental_equals_rebuild(ops in proptest::collection::vec(op(), 1..60)) {
            let mut tree = MerkleTree::new(hasher());
            let mut shadow: Vec<Digest> = Vec::new();

            for op in ops {
                match op {
                    Op::Push(seed) => {
                        tree.push(leaf(seed));
                        shadow.push(leaf(seed));
                    }
                    Op::Set(i, seed) => {
                        if !shadow.is_empty() {
                            let i = i % shadow.len();
                            tree.set(i, leaf(seed)).unwrap();
                            shadow[i] = leaf(seed);
                        }
                    }
                    Op::Truncate(n) => {
                        let n = if shadow.is_empty() { 0 } else { n % (shadow.len() + 1) };
                        tree.truncate(n);
                        shadow.truncate(n);
                    }
                }
                let rebuilt = MerkleTree::from_leaves(hasher(), shadow.clone());
                prop_assert_eq!(tree.root(), rebuilt.root());
                prop_assert_eq!(tree.leaves(), rebuilt.leaves());
            }
        }
    }
}
