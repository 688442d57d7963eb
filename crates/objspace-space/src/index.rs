//! Persistent index structures kept alongside each container.
//!
//! Every index lives in its own clustered stream and is indexed by object
//! id where that makes sense, so removing an object is a constant number
//! of slot updates.

use std::collections::{BTreeSet, HashMap};
use std::iter;
use std::sync::Arc;

use objspace_crypto::{ContentHasher, HashFunction, MerkleProof, MerkleTree};
use objspace_store::{
    DigestSerializer, FreeIndexStore, SlotSerializer, StoreError, StoreResult, StreamPagedList,
    U64Serializer, WritableBuffer,
};
use objspace_types::Digest;

use crate::definition::{IndexDefinition, IndexKind};

/// 64-bit checksum of a key value, as stored in key indexes.
pub fn key_checksum(key: &[u8]) -> u64 {
    ContentHasher::KEY.compute(key).checksum64()
}

/// Key checksums by object id.
///
/// Slot `id` holds the checksum of object `id`'s key, or nothing when the
/// object is vacant or has no key. Checksums can collide, so lookups
/// return candidates that the caller confirms against the objects.
pub struct KeyIndex<B> {
    member: String,
    unique: bool,
    slots: StreamPagedList<Option<u64>, SlotSerializer<U64Serializer>, B>,
    lookup: HashMap<u64, BTreeSet<u64>>,
}

impl<B: WritableBuffer> KeyIndex<B> {
    pub fn open(
        buffer: B,
        member: impl Into<String>,
        unique: bool,
        page_size: usize,
        max_memory: usize,
    ) -> StoreResult<Self> {
        let serializer = SlotSerializer::new::<u64>(U64Serializer)?;
        let mut slots = StreamPagedList::open(buffer, serializer, page_size, max_memory)?;
        let mut lookup: HashMap<u64, BTreeSet<u64>> = HashMap::new();
        for id in 0..slots.len() {
            if let Some(checksum) = slots.read(id)? {
                lookup.entry(checksum).or_default().insert(id as u64);
            }
        }
        Ok(Self {
            member: member.into(),
            unique,
            slots,
            lookup,
        })
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Ids whose key checksum matches `key`, ascending.
    pub fn candidates(&self, key: &[u8]) -> Vec<u64> {
        self.lookup
            .get(&key_checksum(key))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record `key` for object `id`, replacing any previous key.
    pub fn insert(&mut self, id: u64, key: Option<&[u8]>) -> StoreResult<()> {
        self.remove(id)?;
        let checksum = key.map(key_checksum);
        let index = id as usize;
        let len = self.slots.len();
        if index >= len {
            let gap = iter::repeat_n(None, index - len);
            self.slots.append(gap.chain(iter::once(checksum)))?;
        } else {
            self.slots.update(index, [checksum])?;
        }
        if let Some(checksum) = checksum {
            self.lookup.entry(checksum).or_default().insert(id);
        }
        Ok(())
    }

    /// Forget the key of object `id`.
    pub fn remove(&mut self, id: u64) -> StoreResult<()> {
        let index = id as usize;
        if index >= self.slots.len() {
            return Ok(());
        }
        if let Some(checksum) = self.slots.read(index)? {
            if let Some(ids) = self.lookup.get_mut(&checksum) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.lookup.remove(&checksum);
                }
            }
            self.slots.update(index, [None])?;
        }
        Ok(())
    }

    /// Objects with a key.
    pub fn keyed_count(&self) -> usize {
        self.lookup.values().map(BTreeSet::len).sum()
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        self.slots.flush()
    }
}

/// Persisted set of vacant object ids, handed out lowest first.
///
/// The stream holds the ids in no particular order; removal swaps the last
/// entry into the gap.
pub struct FreeIndex<B> {
    list: StreamPagedList<u64, U64Serializer, B>,
    positions: HashMap<u64, usize>,
    order: FreeIndexStore,
}

impl<B: WritableBuffer> FreeIndex<B> {
    pub fn open(buffer: B, page_size: usize, max_memory: usize) -> StoreResult<Self> {
        let mut list = StreamPagedList::open(buffer, U64Serializer, page_size, max_memory)?;
        let mut positions = HashMap::with_capacity(list.len());
        for pos in 0..list.len() {
            let id = list.read(pos)?;
            if positions.insert(id, pos).is_some() {
                return Err(StoreError::IntegrityViolation(format!(
                    "free index lists id {id} twice"
                )));
            }
        }
        let order = positions.keys().copied().collect();
        Ok(Self {
            list,
            positions,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        self.order.iter().collect()
    }

    /// Take the lowest free id.
    pub fn claim(&mut self) -> StoreResult<Option<u64>> {
        let Some(id) = self.order.claim() else {
            return Ok(None);
        };
        let pos = self.positions.remove(&id).ok_or_else(|| {
            StoreError::IntegrityViolation(format!("free id {id} has no position"))
        })?;
        let last = self.list.len() - 1;
        if pos != last {
            let moved = self.list.read(last)?;
            self.list.update(pos, [moved])?;
            self.positions.insert(moved, pos);
        }
        self.list.erase_from_end(1)?;
        Ok(Some(id))
    }

    /// Make `id` reusable. Returns `false` if it already was.
    pub fn release(&mut self, id: u64) -> StoreResult<bool> {
        if self.positions.contains_key(&id) {
            return Ok(false);
        }
        let range = self.list.append([id])?;
        self.positions.insert(id, range.start);
        self.order.release(id);
        Ok(true)
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        self.list.flush()
    }
}

/// Merkle tree over per-object digests, leaves persisted in a stream.
///
/// Leaf `id` is the digest of object `id`; vacant ids hold the all-zero
/// digest.
pub struct ContentTree<B> {
    leaves: StreamPagedList<Digest, DigestSerializer, B>,
    tree: MerkleTree,
}

impl<B: WritableBuffer> ContentTree<B> {
    pub fn open(
        buffer: B,
        hasher: Arc<dyn HashFunction>,
        page_size: usize,
        max_memory: usize,
    ) -> StoreResult<Self> {
        let serializer = DigestSerializer::new(hasher.digest_size());
        let mut leaves = StreamPagedList::open(buffer, serializer, page_size, max_memory)?;
        let all = leaves.read_range(0, leaves.len())?;
        let tree = MerkleTree::from_leaves(hasher, all);
        Ok(Self { leaves, tree })
    }

    pub fn root(&self) -> Digest {
        self.tree.root()
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.leaf_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn leaf(&self, index: u64) -> Option<&Digest> {
        self.tree.leaf(index as usize)
    }

    pub fn proof(&self, index: u64) -> Option<MerkleProof> {
        self.tree.proof(index as usize)
    }

    fn zero(&self) -> Digest {
        Digest::zero(self.tree.hasher().digest_size())
    }

    /// Set leaf `index`, padding with zero leaves up to it.
    pub fn set(&mut self, index: u64, digest: Digest) -> StoreResult<()> {
        let index = index as usize;
        let len = self.tree.leaf_count();
        if index >= len {
            let zero = self.zero();
            let gap = iter::repeat_n(zero, index - len);
            for leaf in gap.clone() {
                self.tree.push(leaf);
            }
            self.tree.push(digest.clone());
            self.leaves.append(gap.chain(iter::once(digest)))?;
        } else {
            self.tree
                .set(index, digest.clone())
                .map_err(|e| StoreError::IntegrityViolation(e.to_string()))?;
            self.leaves.update(index, [digest])?;
        }
        Ok(())
    }

    /// Zero leaf `index` if it exists.
    pub fn clear(&mut self, index: u64) -> StoreResult<()> {
        if (index as usize) < self.tree.leaf_count() {
            let zero = self.zero();
            self.set(index, zero)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        self.leaves.flush()
    }
}

/// Runtime state of one declared index.
pub enum IndexRuntime<B> {
    UniqueKey(KeyIndex<B>),
    Index(KeyIndex<B>),
    FreeIndexStore(FreeIndex<B>),
    MerkleTree(ContentTree<B>),
}

impl<B: WritableBuffer> IndexRuntime<B> {
    /// Open the index declared by `definition` over its stream.
    pub fn open(
        definition: &IndexDefinition,
        buffer: B,
        hasher: &Arc<dyn HashFunction>,
        page_size: usize,
        max_memory: usize,
    ) -> StoreResult<Self> {
        Ok(match &definition.kind {
            IndexKind::UniqueKey { member } => {
                Self::UniqueKey(KeyIndex::open(buffer, member.clone(), true, page_size, max_memory)?)
            }
            IndexKind::Index { member } => {
                Self::Index(KeyIndex::open(buffer, member.clone(), false, page_size, max_memory)?)
            }
            IndexKind::FreeIndexStore => {
                Self::FreeIndexStore(FreeIndex::open(buffer, page_size, max_memory)?)
            }
            IndexKind::MerkleTree => {
                Self::MerkleTree(ContentTree::open(buffer, Arc::clone(hasher), page_size, max_memory)?)
            }
        })
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        match self {
            Self::UniqueKey(index) | Self::Index(index) => index.flush(),
            Self::FreeIndexStore(free) => free.flush(),
            Self::MerkleTree(tree) => tree.flush(),
        }
    }
}
