use std::sync::Arc;

use objspace_crypto::{HashFunction, MerkleProof, MerkleTree};
use objspace_types::Digest;
use tracing::{debug, warn};

use crate::buffer::{CheckpointBuffer, ReadableBuffer, WritableBuffer};
use crate::error::{StoreError, StoreResult};

/// A buffer that keeps a Merkle tree over its content.
///
/// Leaves are `leaf_size`-byte chunks of the content; a shorter final chunk
/// is hashed as-is. Every write re-hashes the leaves it touches and walks
/// their root paths, so the root is always current without a full rebuild.
pub struct MerkleBuffer<B> {
    inner: B,
    tree: MerkleTree,
    leaf_size: usize,
}

impl<B: WritableBuffer> MerkleBuffer<B> {
    /// Wrap `inner`, hashing its current content to build the tree.
    pub fn open(mut inner: B, hasher: Arc<dyn HashFunction>, leaf_size: usize) -> StoreResult<Self> {
        if leaf_size == 0 {
            return Err(StoreError::InvalidConfig("merkle leaf size is zero".into()));
        }
        let leaves = hash_leaves(&mut inner, hasher.as_ref(), leaf_size)?;
        let tree = MerkleTree::from_leaves(hasher, leaves);
        debug!(leaves = tree.leaf_count(), root = %tree.root().short_hex(), "built merkle tree");
        Ok(Self {
            inner,
            tree,
            leaf_size,
        })
    }

    /// Current root over all content.
    pub fn root(&self) -> Digest {
        self.tree.root()
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Inclusion proof for one leaf.
    pub fn proof(&self, leaf: usize) -> Option<MerkleProof> {
        self.tree.proof(leaf)
    }

    /// Rebuild the tree from scratch and compare both the incremental root
    /// and `expected` against it.
    pub fn verify_root(&mut self, expected: &Digest) -> StoreResult<bool> {
        let hasher = Arc::clone(self.tree.hasher());
        let leaves = hash_leaves(&mut self.inner, hasher.as_ref(), self.leaf_size)?;
        let rebuilt = MerkleTree::from_leaves(hasher, leaves).root();
        let ok = rebuilt == *expected && rebuilt == self.tree.root();
        if !ok {
            warn!(
                expected = %expected.short_hex(),
                rebuilt = %rebuilt.short_hex(),
                "merkle root verification failed"
            );
        }
        Ok(ok)
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn leaf_count_for(&self, len: u64) -> usize {
        len.div_ceil(self.leaf_size as u64) as usize
    }

    /// Re-hash leaves `first..last` (exclusive), pushing any new ones.
    fn rehash(&mut self, first: usize, last: usize) -> StoreResult<()> {
        let len = self.inner.len();
        for leaf in first..last {
            let start = leaf as u64 * self.leaf_size as u64;
            let end = (start + self.leaf_size as u64).min(len);
            let chunk = self.inner.read_vec(start, (end - start) as usize)?;
            let digest = self.tree.hasher().compute(&chunk);
            if leaf < self.tree.leaf_count() {
                self.tree
                    .set(leaf, digest)
                    .map_err(|e| StoreError::IntegrityViolation(e.to_string()))?;
            } else {
                self.tree.push(digest);
            }
        }
        Ok(())
    }
}

fn hash_leaves<B: ReadableBuffer>(
    inner: &mut B,
    hasher: &dyn HashFunction,
    leaf_size: usize,
) -> StoreResult<Vec<Digest>> {
    let len = inner.len();
    let mut leaves = Vec::with_capacity(len.div_ceil(leaf_size as u64) as usize);
    let mut offset = 0u64;
    while offset < len {
        let n = (len - offset).min(leaf_size as u64) as usize;
        leaves.push(hasher.compute(&inner.read_vec(offset, n)?));
        offset += n as u64;
    }
    Ok(leaves)
}

impl<B: WritableBuffer> ReadableBuffer for MerkleBuffer<B> {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.inner.read_at(offset, buf)
    }
}

impl<B: WritableBuffer> WritableBuffer for MerkleBuffer<B> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.inner.write_at(offset, data)?;
        if data.is_empty() {
            return Ok(());
        }
        // offset <= old length, so the first touched leaf is at most one past
        // the current last leaf.
        let first = (offset / self.leaf_size as u64) as usize;
        let last = self.leaf_count_for(offset + data.len() as u64);
        self.rehash(first, last)
    }

    fn set_len(&mut self, len: u64) -> StoreResult<()> {
        let old_leaves = self.tree.leaf_count();
        self.inner.set_len(len)?;
        let new_leaves = self.leaf_count_for(len);
        if new_leaves < old_leaves {
            self.tree.truncate(new_leaves);
        }
        // The boundary leaf may have grown or shrunk; new leaves are pushed.
        let first = new_leaves.min(old_leaves).saturating_sub(1);
        self.rehash(first, new_leaves)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.inner.flush()
    }
}

impl<B: CheckpointBuffer> CheckpointBuffer for MerkleBuffer<B> {
    fn checkpoint(&mut self, _root: Option<&Digest>) -> StoreResult<()> {
        let root = self.tree.root();
        self.inner.checkpoint(Some(&root))
    }
}
