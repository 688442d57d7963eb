//! The object space: typed containers and their indexes in one file.

use std::sync::Arc;

use objspace_crypto::{HashFunction, MerkleProof, MerkleTree};
use objspace_store::{
    open_file, BytesSerializer, ClusteredStream, ContainerStats, FixedBytesSerializer, ObjectBox,
    ReadableBuffer, SectorMappedList, SharedContainer, StorageConfig, StoreError, StoreResult,
    StreamContainer, TransactionalFile,
};
use objspace_types::Digest;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::definition::{ContainerDefinition, ObjectSpaceDefinition, SCHEMA_STREAM};
use crate::error::{SpaceError, SpaceResult};
use crate::index::{ContentTree, FreeIndex, IndexRuntime, KeyIndex};
use crate::object::SpaceObject;

type SpaceStream = ClusteredStream<TransactionalFile>;

/// Object slots of one container, addressed by slot index. Fixed boxes
/// name objects by byte offset, so slot indexes are converted on the way in.
enum Records {
    Fixed(ObjectBox<Vec<u8>, FixedBytesSerializer, SpaceStream>),
    Variable(SectorMappedList<Vec<u8>, BytesSerializer, TransactionalFile>),
}

impl Records {
    fn capacity(&self) -> u64 {
        match self {
            Self::Fixed(slots) => slots.capacity() as u64,
            Self::Variable(list) => list.len() as u64,
        }
    }

    fn get(&mut self, id: u64) -> StoreResult<Option<Vec<u8>>> {
        if id >= self.capacity() {
            return Ok(None);
        }
        match self {
            Self::Fixed(slots) => slots.get(slots.id_of(id as usize)),
            Self::Variable(list) => list.read(id as usize),
        }
    }

    fn contains(&mut self, id: u64) -> StoreResult<bool> {
        match self {
            Self::Fixed(slots) => slots.contains(slots.id_of(id as usize)),
            Self::Variable(list) => list.is_live(id as usize),
        }
    }

    fn put(&mut self, id: u64, bytes: &Vec<u8>) -> StoreResult<()> {
        match self {
            Self::Fixed(slots) => slots.put(slots.id_of(id as usize), bytes),
            Self::Variable(list) => list.write(id as usize, bytes),
        }
    }

    fn vacate(&mut self, id: u64) -> StoreResult<bool> {
        match self {
            Self::Fixed(slots) => slots.vacate(slots.id_of(id as usize)),
            Self::Variable(list) => list.remove(id as usize),
        }
    }

    fn flush(&mut self) -> StoreResult<()> {
        match self {
            Self::Fixed(slots) => slots.flush(),
            Self::Variable(list) => list.flush(),
        }
    }
}

struct ContainerRuntime {
    definition: ContainerDefinition,
    records: Records,
    indexes: Vec<IndexRuntime<SpaceStream>>,
}

impl ContainerRuntime {
    fn name(&self) -> &str {
        &self.definition.object_type
    }

    fn free(&self) -> SpaceResult<&FreeIndex<SpaceStream>> {
        self.indexes
            .iter()
            .find_map(|index| match index {
                IndexRuntime::FreeIndexStore(free) => Some(free),
                _ => None,
            })
            .ok_or_else(|| self.missing_free())
    }

    fn free_mut(&mut self) -> SpaceResult<&mut FreeIndex<SpaceStream>> {
        let missing = self.missing_free();
        self.indexes
            .iter_mut()
            .find_map(|index| match index {
                IndexRuntime::FreeIndexStore(free) => Some(free),
                _ => None,
            })
            .ok_or(missing)
    }

    fn missing_free(&self) -> SpaceError {
        SpaceError::InvalidDefinition(format!("container {} has no free index store", self.name()))
    }

    fn tree(&self) -> Option<&ContentTree<SpaceStream>> {
        self.indexes.iter().find_map(|index| match index {
            IndexRuntime::MerkleTree(tree) => Some(tree),
            _ => None,
        })
    }

    /// Key index on `member`; unique ones only when `unique_only`.
    fn key_index(&self, member: &str, unique_only: bool) -> Option<&KeyIndex<SpaceStream>> {
        let mut fallback = None;
        for index in &self.indexes {
            match index {
                IndexRuntime::UniqueKey(key) if key.member() == member => {
                    if unique_only {
                        return Some(key);
                    }
                    fallback = Some(key);
                }
                IndexRuntime::Index(key) if key.member() == member && !unique_only => {
                    return Some(key);
                }
                _ => {}
            }
        }
        fallback
    }

    fn count(&self) -> SpaceResult<usize> {
        Ok(self.records.capacity() as usize - self.free()?.len())
    }

    fn ids(&self) -> SpaceResult<Vec<u64>> {
        let free = self.free()?;
        Ok((0..self.records.capacity())
            .filter(|id| !free.contains(*id))
            .collect())
    }

    /// Point every index at `object` stored as `id`.
    fn index_object<T: SpaceObject>(&mut self, id: u64, object: &T, digest: &Digest) -> StoreResult<()> {
        for index in &mut self.indexes {
            match index {
                IndexRuntime::UniqueKey(key) | IndexRuntime::Index(key) => {
                    let value = object.member_key(key.member());
                    key.insert(id, value.as_deref())?;
                }
                IndexRuntime::MerkleTree(tree) => tree.set(id, digest.clone())?,
                IndexRuntime::FreeIndexStore(_) => {}
            }
        }
        Ok(())
    }

    /// Drop `id` from every key index and zero its Merkle leaf.
    fn unindex(&mut self, id: u64) -> StoreResult<()> {
        for index in &mut self.indexes {
            match index {
                IndexRuntime::UniqueKey(key) | IndexRuntime::Index(key) => key.remove(id)?,
                IndexRuntime::MerkleTree(tree) => tree.clear(id)?,
                IndexRuntime::FreeIndexStore(_) => {}
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.records.flush()?;
        for index in &mut self.indexes {
            index.flush()?;
        }
        Ok(())
    }
}

/// Result of [`ObjectSpace::verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    pub file_root: Digest,
    /// The committed content still hashes to the root in the header.
    pub file_ok: bool,
    pub containers: Vec<ContainerCheck>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.file_ok && self.containers.iter().all(|c| c.ok)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerCheck {
    pub name: String,
    pub objects: usize,
    pub root: Option<Digest>,
    /// Leaves match the stored objects and vacant ids are exactly the
    /// free index.
    pub ok: bool,
}

/// Per-container figures for tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub objects: usize,
    pub slots: u64,
    pub fixed_size: Option<u32>,
    pub root: Option<Digest>,
}

/// Typed containers with unique keys, secondary indexes, free-slot reuse
/// and Merkle roots, all stored in one transactional file.
///
/// Mutations are staged until [`commit`](Self::commit). A failed
/// operation that already staged changes rolls back the whole open
/// transaction before the error is returned.
pub struct ObjectSpace {
    definition: ObjectSpaceDefinition,
    container: SharedContainer<TransactionalFile>,
    containers: Vec<ContainerRuntime>,
    space_tree: Option<ContentTree<SpaceStream>>,
    hasher: Arc<dyn HashFunction>,
    page_size: usize,
    max_memory: usize,
    read_only: bool,
    commit_on_drop: bool,
}

impl ObjectSpace {
    /// Open the space at `config.file_path`, creating it with `definition`
    /// if the file is new. An existing file must have been created with an
    /// identical definition.
    pub fn open(
        config: &StorageConfig,
        definition: ObjectSpaceDefinition,
        hasher: Arc<dyn HashFunction>,
    ) -> SpaceResult<Self> {
        definition.validate()?;
        let file = open_file(config, Arc::clone(&hasher))?;
        let fresh = file.is_empty();
        let container = StreamContainer::open(file, config.cluster_size, config.container_policy)?;
        let shared = Arc::new(Mutex::new(container));
        if fresh {
            create_layout(&shared, &definition)?;
        } else {
            let stored = read_definition(&shared)?;
            if stored != definition {
                return Err(StoreError::SchemaViolation(
                    "file was created with a different definition".into(),
                )
                .into());
            }
        }
        Self::assemble(config, definition, shared, hasher)
    }

    /// Open an existing space with the definition stored in it.
    pub fn load(config: &StorageConfig, hasher: Arc<dyn HashFunction>) -> SpaceResult<Self> {
        let file = open_file(config, Arc::clone(&hasher))?;
        if file.is_empty() {
            return Err(StoreError::FormatViolation(format!(
                "{} holds no object space",
                config.file_path.display()
            ))
            .into());
        }
        let container = StreamContainer::open(file, config.cluster_size, config.container_policy)?;
        let shared = Arc::new(Mutex::new(container));
        let definition = read_definition(&shared)?;
        definition.validate()?;
        Self::assemble(config, definition, shared, hasher)
    }

    fn assemble(
        config: &StorageConfig,
        definition: ObjectSpaceDefinition,
        container: SharedContainer<TransactionalFile>,
        hasher: Arc<dyn HashFunction>,
    ) -> SpaceResult<Self> {
        let streams = container.lock().stream_count();
        if streams <= definition.last_stream() {
            return Err(StoreError::FormatViolation(format!(
                "definition uses stream {} but the file has {streams}",
                definition.last_stream()
            ))
            .into());
        }
        let mut space = Self {
            definition,
            container,
            containers: Vec::new(),
            space_tree: None,
            hasher,
            page_size: config.page_size,
            max_memory: config.max_memory,
            read_only: config.read_only,
            commit_on_drop: config.commit_on_drop,
        };
        space.open_runtimes()?;
        info!(
            path = %config.file_path.display(),
            containers = space.containers.len(),
            root = %space.file_root().short_hex(),
            "object space opened"
        );
        Ok(space)
    }

    fn stream(&self, id: usize) -> StoreResult<SpaceStream> {
        ClusteredStream::new(Arc::clone(&self.container), id)
    }

    fn open_runtimes(&mut self) -> SpaceResult<()> {
        let mut containers = Vec::with_capacity(self.definition.containers.len());
        for definition in &self.definition.containers {
            let records = match definition.fixed_size {
                Some(size) => Records::Fixed(ObjectBox::new(
                    self.stream(definition.data_stream)?,
                    FixedBytesSerializer::new(size as usize),
                    self.page_size,
                    self.max_memory,
                )?),
                None => Records::Variable(SectorMappedList::open(
                    Arc::clone(&self.container),
                    definition.data_stream,
                    BytesSerializer,
                    self.page_size,
                    self.max_memory,
                )?),
            };
            let mut indexes = Vec::with_capacity(definition.indexes.len());
            for index in &definition.indexes {
                indexes.push(IndexRuntime::open(
                    index,
                    self.stream(index.reserved_stream)?,
                    &self.hasher,
                    self.page_size,
                    self.max_memory,
                )?);
            }
            containers.push(ContainerRuntime {
                definition: definition.clone(),
                records,
                indexes,
            });
        }
        let space_tree = match self.definition.schema_indexes.first() {
            Some(index) => Some(ContentTree::open(
                self.stream(index.reserved_stream)?,
                Arc::clone(&self.hasher),
                self.page_size,
                self.max_memory,
            )?),
            None => None,
        };
        self.containers = containers;
        self.space_tree = space_tree;
        Ok(())
    }

    pub fn definition(&self) -> &ObjectSpaceDefinition {
        &self.definition
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn position(&self, name: &str) -> SpaceResult<usize> {
        self.containers
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| SpaceError::UnknownContainer(name.to_string()))
    }

    fn ensure_writable(&self) -> SpaceResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly.into());
        }
        Ok(())
    }

    fn encode<T: SpaceObject>(definition: &ContainerDefinition, object: &T) -> SpaceResult<Vec<u8>> {
        let mut bytes = bincode::serialize(object)?;
        if let Some(size) = definition.fixed_size {
            let size = size as usize;
            if bytes.len() > size {
                return Err(StoreError::SchemaViolation(format!(
                    "{} object is {} bytes, slots hold {size}",
                    definition.object_type,
                    bytes.len()
                ))
                .into());
            }
            bytes.resize(size, 0);
        }
        Ok(bytes)
    }

    fn read_object<T: SpaceObject>(&mut self, c: usize, id: u64) -> SpaceResult<Option<T>> {
        match self.containers[c].records.get(id)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fail with `DuplicateKey` if a unique member of `object` is already
    /// taken by an object other than `except`.
    fn check_unique<T: SpaceObject>(&mut self, c: usize, object: &T, except: Option<u64>) -> SpaceResult<()> {
        let mut checks = Vec::new();
        for index in &self.containers[c].indexes {
            if let IndexRuntime::UniqueKey(key) = index {
                if let Some(value) = object.member_key(key.member()) {
                    let candidates = key.candidates(&value);
                    checks.push((key.member().to_string(), value, candidates));
                }
            }
        }
        for (member, value, candidates) in checks {
            for id in candidates {
                if Some(id) == except {
                    continue;
                }
                let Some(other) = self.read_object::<T>(c, id)? else {
                    continue;
                };
                if other.member_key(&member).as_deref() == Some(value.as_slice()) {
                    return Err(SpaceError::DuplicateKey {
                        container: T::CONTAINER.to_string(),
                        member,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a mutation; if it fails, roll the transaction back.
    fn staged<R>(&mut self, op: impl FnOnce(&mut Self) -> SpaceResult<R>) -> SpaceResult<R> {
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, "operation failed after staging, rolling back");
                if let Err(rollback) = self.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Store a new object and return its id. Vacant ids are reused lowest
    /// first.
    pub fn insert<T: SpaceObject>(&mut self, object: &T) -> SpaceResult<u64> {
        self.ensure_writable()?;
        let c = self.position(T::CONTAINER)?;
        let bytes = Self::encode(&self.containers[c].definition, object)?;
        self.check_unique(c, object, None)?;
        let digest = self.hasher.compute(&bytes);
        self.staged(|space| {
            let container = &mut space.containers[c];
            let id = match container.free_mut()?.claim()? {
                Some(id) => id,
                None => container.records.capacity(),
            };
            container.records.put(id, &bytes)?;
            container.index_object(id, object, &digest)?;
            debug!(container = T::CONTAINER, id, "inserted object");
            Ok(id)
        })
    }

    /// The live object `id`.
    pub fn get<T: SpaceObject>(&mut self, id: u64) -> SpaceResult<T> {
        let c = self.position(T::CONTAINER)?;
        self.read_object(c, id)?.ok_or_else(|| SpaceError::NotFound {
            container: T::CONTAINER.to_string(),
            id,
        })
    }

    pub fn contains<T: SpaceObject>(&mut self, id: u64) -> SpaceResult<bool> {
        let c = self.position(T::CONTAINER)?;
        Ok(self.containers[c].records.contains(id)?)
    }

    /// Replace the live object `id`.
    pub fn update<T: SpaceObject>(&mut self, id: u64, object: &T) -> SpaceResult<()> {
        self.ensure_writable()?;
        let c = self.position(T::CONTAINER)?;
        if !self.containers[c].records.contains(id)? {
            return Err(SpaceError::NotFound {
                container: T::CONTAINER.to_string(),
                id,
            });
        }
        let bytes = Self::encode(&self.containers[c].definition, object)?;
        self.check_unique(c, object, Some(id))?;
        let digest = self.hasher.compute(&bytes);
        self.staged(|space| {
            let container = &mut space.containers[c];
            container.records.put(id, &bytes)?;
            container.index_object(id, object, &digest)?;
            debug!(container = T::CONTAINER, id, "updated object");
            Ok(())
        })
    }

    /// Delete the live object `id`. Index entries go first, then the slot
    /// is vacated and its id handed to the free index store.
    pub fn delete<T: SpaceObject>(&mut self, id: u64) -> SpaceResult<()> {
        self.ensure_writable()?;
        let c = self.position(T::CONTAINER)?;
        if !self.containers[c].records.contains(id)? {
            return Err(SpaceError::NotFound {
                container: T::CONTAINER.to_string(),
                id,
            });
        }
        self.staged(|space| {
            let container = &mut space.containers[c];
            container.unindex(id)?;
            container.records.vacate(id)?;
            container.free_mut()?.release(id)?;
            debug!(container = T::CONTAINER, id, "deleted object");
            Ok(())
        })
    }

    /// Id of the object whose unique `member` equals `key`.
    pub fn find_unique<T: SpaceObject>(&mut self, member: &str, key: &[u8]) -> SpaceResult<Option<u64>> {
        let c = self.position(T::CONTAINER)?;
        let candidates = self.containers[c]
            .key_index(member, true)
            .ok_or_else(|| SpaceError::UnknownIndex {
                container: T::CONTAINER.to_string(),
                member: member.to_string(),
            })?
            .candidates(key);
        Ok(self.confirm::<T>(c, member, key, candidates)?.into_iter().next())
    }

    /// Ids of every object whose `member` equals `key`, ascending.
    pub fn find<T: SpaceObject>(&mut self, member: &str, key: &[u8]) -> SpaceResult<Vec<u64>> {
        let c = self.position(T::CONTAINER)?;
        let candidates = self.containers[c]
            .key_index(member, false)
            .ok_or_else(|| SpaceError::UnknownIndex {
                container: T::CONTAINER.to_string(),
                member: member.to_string(),
            })?
            .candidates(key);
        self.confirm::<T>(c, member, key, candidates)
    }

    /// Drop checksum collisions.
    fn confirm<T: SpaceObject>(
        &mut self,
        c: usize,
        member: &str,
        key: &[u8],
        candidates: Vec<u64>,
    ) -> SpaceResult<Vec<u64>> {
        let mut ids = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(object) = self.read_object::<T>(c, id)? {
                if object.member_key(member).as_deref() == Some(key) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Live objects in `T`'s container.
    pub fn count<T: SpaceObject>(&self) -> SpaceResult<usize> {
        self.containers[self.position(T::CONTAINER)?].count()
    }

    /// Live ids in `T`'s container, ascending.
    pub fn ids<T: SpaceObject>(&self) -> SpaceResult<Vec<u64>> {
        self.containers[self.position(T::CONTAINER)?].ids()
    }

    /// Merkle root over the objects of `T`'s container.
    pub fn container_root<T: SpaceObject>(&self) -> SpaceResult<Digest> {
        let container = &self.containers[self.position(T::CONTAINER)?];
        container
            .tree()
            .map(ContentTree::root)
            .ok_or_else(|| SpaceError::UnknownIndex {
                container: T::CONTAINER.to_string(),
                member: "merkle tree".into(),
            })
    }

    /// Inclusion proof for object `id` in its container's Merkle tree.
    pub fn proof<T: SpaceObject>(&self, id: u64) -> SpaceResult<Option<MerkleProof>> {
        let container = &self.containers[self.position(T::CONTAINER)?];
        Ok(container.tree().and_then(|tree| tree.proof(id)))
    }

    fn container_roots(&self) -> Vec<Digest> {
        let zero = Digest::zero(self.hasher.digest_size());
        self.containers
            .iter()
            .map(|c| c.tree().map_or_else(|| zero.clone(), ContentTree::root))
            .collect()
    }

    /// Merkle root over the container roots, in declaration order.
    /// Containers without a tree contribute the zero digest.
    pub fn space_root(&self) -> Digest {
        MerkleTree::from_leaves(Arc::clone(&self.hasher), self.container_roots()).root()
    }

    /// Merkle root of the committed file content.
    pub fn file_root(&self) -> Digest {
        self.container.lock().buffer().root()
    }

    pub fn summary(&self) -> SpaceResult<Vec<ContainerSummary>> {
        self.containers
            .iter()
            .map(|c| -> SpaceResult<ContainerSummary> {
                Ok(ContainerSummary {
                    name: c.name().to_string(),
                    objects: c.count()?,
                    slots: c.records.capacity(),
                    fixed_size: c.definition.fixed_size,
                    root: c.tree().map(ContentTree::root),
                })
            })
            .collect()
    }

    /// Sector and stream figures of the underlying container.
    pub fn storage_stats(&self) -> ContainerStats {
        self.container.lock().stats()
    }

    /// Make every staged change durable.
    pub fn commit(&mut self) -> SpaceResult<()> {
        let result = self.write_back().and_then(|()| {
            self.container
                .lock()
                .buffer_mut()
                .commit()
                .map_err(SpaceError::from)
        });
        if let Err(err) = result {
            warn!(error = %err, "commit failed, rolling back");
            if let Err(rollback) = self.rollback() {
                warn!(error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        debug!(root = %self.file_root().short_hex(), "object space committed");
        Ok(())
    }

    fn write_back(&mut self) -> SpaceResult<()> {
        for container in &mut self.containers {
            container.flush()?;
        }
        let roots = self.container_roots();
        if let Some(tree) = &mut self.space_tree {
            for (i, root) in roots.into_iter().enumerate() {
                if tree.leaf(i as u64) != Some(&root) {
                    tree.set(i as u64, root)?;
                }
            }
            tree.flush()?;
        }
        self.container.lock().flush()?;
        Ok(())
    }

    /// Discard every staged change and reload all indexes.
    pub fn rollback(&mut self) -> SpaceResult<()> {
        {
            let mut container = self.container.lock();
            container.buffer_mut().rollback();
            container.reload()?;
        }
        self.open_runtimes()?;
        debug!("object space rolled back");
        Ok(())
    }

    /// Check the committed file root and every container tree against the
    /// stored objects.
    pub fn verify(&mut self) -> SpaceResult<VerifyReport> {
        let (file_root, file_ok) = {
            let mut container = self.container.lock();
            let file = container.buffer_mut();
            (file.root(), file.verify()?)
        };
        let mut containers = Vec::with_capacity(self.containers.len());
        for c in 0..self.containers.len() {
            containers.push(self.check_container(c)?);
        }
        Ok(VerifyReport {
            file_root,
            file_ok,
            containers,
        })
    }

    fn check_container(&mut self, c: usize) -> SpaceResult<ContainerCheck> {
        let zero = Digest::zero(self.hasher.digest_size());
        let hasher = Arc::clone(&self.hasher);
        let container = &mut self.containers[c];
        let capacity = container.records.capacity();
        let vacant = container.free()?.ids();
        let mut ok = true;
        let mut leaves = Vec::new();
        for id in 0..capacity {
            let stored = container.records.get(id)?;
            if stored.is_none() != vacant.binary_search(&id).is_ok() {
                ok = false;
            }
            leaves.push(stored.map_or_else(|| zero.clone(), |bytes| hasher.compute(&bytes)));
        }
        let root = container.tree().map(ContentTree::root);
        if let Some(tree) = container.tree() {
            let mut kept = tree.tree().leaves().to_vec();
            // Trailing leaves of erased slots stay zero.
            while kept.len() > leaves.len() && kept.last() == Some(&zero) {
                kept.pop();
            }
            while leaves.len() > kept.len() && leaves.last() == Some(&zero) {
                leaves.pop();
            }
            ok &= kept == leaves && MerkleTree::from_leaves(Arc::clone(&hasher), kept).root() == tree.root();
        }
        Ok(ContainerCheck {
            name: container.name().to_string(),
            objects: capacity as usize - vacant.len(),
            root,
            ok,
        })
    }
}

impl Drop for ObjectSpace {
    fn drop(&mut self) {
        if self.commit_on_drop && !self.read_only {
            if let Err(err) = self.commit() {
                warn!(error = %err, "commit on drop failed");
            }
        } else {
            self.container.lock().buffer_mut().rollback();
        }
    }
}

/// Create the schema stream and every stream the definition reserves, then
/// commit the empty space.
fn create_layout(
    container: &SharedContainer<TransactionalFile>,
    definition: &ObjectSpaceDefinition,
) -> SpaceResult<()> {
    let mut container = container.lock();
    let encoded = bincode::serialize(definition)?;
    while container.stream_count() <= definition.last_stream() {
        container.add_stream()?;
    }
    container.write(SCHEMA_STREAM, 0, &encoded)?;
    container.buffer_mut().commit()?;
    info!(
        containers = definition.containers.len(),
        streams = container.stream_count(),
        "created object space"
    );
    Ok(())
}

fn read_definition(container: &SharedContainer<TransactionalFile>) -> SpaceResult<ObjectSpaceDefinition> {
    let mut container = container.lock();
    if container.stream_count() <= SCHEMA_STREAM {
        return Err(StoreError::FormatViolation("missing schema stream".into()).into());
    }
    let len = container.stream_len(SCHEMA_STREAM)?;
    let mut bytes = vec![0u8; len as usize];
    container.read(SCHEMA_STREAM, 0, &mut bytes)?;
    Ok(bincode::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use objspace_crypto::ContentHasher;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::definition::ContainerBuilder;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        name: String,
        owner: String,
        balance: u64,
    }

    impl SpaceObject for Account {
        const CONTAINER: &'static str = "Account";

        fn member_key(&self, member: &str) -> Option<Vec<u8>> {
            match member {
                "name" => Some(self.name.as_bytes().to_vec()),
                "owner" => Some(self.owner.as_bytes().to_vec()),
                _ => None,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        author: String,
        body: Vec<u8>,
    }

    impl SpaceObject for Note {
        const CONTAINER: &'static str = "Note";

        fn member_key(&self, member: &str) -> Option<Vec<u8>> {
            (member == "author").then(|| self.author.as_bytes().to_vec())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Ghost;

    impl SpaceObject for Ghost {
        const CONTAINER: &'static str = "Ghost";
    }

    fn account(name: &str, owner: &str, balance: u64) -> Account {
        Account {
            name: name.into(),
            owner: owner.into(),
            balance,
        }
    }

    fn note(author: &str, len: usize) -> Note {
        Note {
            author: author.into(),
            body: (0..len).map(|i| i as u8).collect(),
        }
    }

    fn definition() -> ObjectSpaceDefinition {
        ObjectSpaceDefinition::builder()
            .with_space_tree()
            .container(
                ContainerBuilder::new("Account")
                    .fixed_size(64)
                    .unique_key("name")
                    .index("owner")
                    .merkle_tree(),
            )
            .container(ContainerBuilder::new("Note").average_size(300).index("author").merkle_tree())
            .build()
            .unwrap()
    }

    fn config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig::new(dir.path().join("space.db"))
            .with_page_size(256)
            .with_cluster_size(64)
            .with_max_memory(64 * 1024)
    }

    fn hasher() -> Arc<dyn HashFunction> {
        Arc::new(ContentHasher::MERKLE)
    }

    fn open(dir: &tempfile::TempDir) -> ObjectSpace {
        ObjectSpace::open(&config(dir), definition(), hasher()).unwrap()
    }

    #[test]
    fn objects_round_trip_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (alice, long) = {
            let mut space = open(&dir);
            let alice = space.insert(&account("alice", "ops", 10)).unwrap();
            space.insert(&account("bob", "ops", 20)).unwrap();
            let long = space.insert(&note("alice", 1000)).unwrap();
            assert_eq!(space.get::<Account>(alice).unwrap().balance, 10);
            space.commit().unwrap();
            (alice, long)
        };
        let mut space = open(&dir);
        assert_eq!(space.count::<Account>().unwrap(), 2);
        assert_eq!(space.get::<Account>(alice).unwrap(), account("alice", "ops", 10));
        assert_eq!(space.get::<Note>(long).unwrap(), note("alice", 1000));
        assert_eq!(space.find_unique::<Account>("name", b"bob").unwrap(), Some(1));
        assert_eq!(space.find::<Account>("owner", b"ops").unwrap(), [0, 1]);
        assert_eq!(space.find::<Note>("author", b"alice").unwrap(), [long]);
    }

    #[test]
    fn unique_keys_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        let alice = space.insert(&account("alice", "ops", 1)).unwrap();
        let bob = space.insert(&account("bob", "ops", 2)).unwrap();

        let err = space.insert(&account("alice", "dev", 3)).unwrap_err();
        assert!(matches!(err, SpaceError::DuplicateKey { ref member, .. } if member == "name"));
        assert_eq!(space.count::<Account>().unwrap(), 2);

        space.update(alice, &account("alice", "dev", 5)).unwrap();
        assert!(matches!(
            space.update(bob, &account("alice", "ops", 2)),
            Err(SpaceError::DuplicateKey { .. })
        ));
        assert_eq!(space.find::<Account>("owner", b"dev").unwrap(), [alice]);
        assert_eq!(space.find::<Account>("owner", b"ops").unwrap(), [bob]);
    }

    #[test]
    fn deleted_ids_are_reused_lowest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        for i in 0..5 {
            space.insert(&account(&format!("a{i}"), "ops", i)).unwrap();
        }
        space.delete::<Account>(3).unwrap();
        space.delete::<Account>(1).unwrap();
        assert_eq!(space.ids::<Account>().unwrap(), [0, 2, 4]);
        assert!(matches!(space.get::<Account>(1), Err(SpaceError::NotFound { id: 1, .. })));
        assert_eq!(space.find_unique::<Account>("name", b"a1").unwrap(), None);
        assert!(matches!(space.delete::<Account>(1), Err(SpaceError::NotFound { .. })));
        space.commit().unwrap();
        drop(space);

        let mut space = open(&dir);
        assert_eq!(space.insert(&account("x", "ops", 0)).unwrap(), 1);
        assert_eq!(space.insert(&account("y", "ops", 0)).unwrap(), 3);
        assert_eq!(space.insert(&account("z", "ops", 0)).unwrap(), 5);
    }

    #[test]
    fn variable_records_reuse_freed_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        let big = space.insert(&note("ann", 2000)).unwrap();
        space.commit().unwrap();
        let before = space.storage_stats().sectors;
        space.delete::<Note>(big).unwrap();
        let again = space.insert(&note("ann", 1500)).unwrap();
        assert_eq!(again, big);
        space.commit().unwrap();
        assert!(space.storage_stats().sectors <= before);
        assert_eq!(space.get::<Note>(again).unwrap(), note("ann", 1500));
    }

    #[test]
    fn oversized_fixed_object_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        let err = space.insert(&account(&"n".repeat(80), "ops", 0)).unwrap_err();
        assert_eq!(err.kind(), objspace_store::ErrorKind::Schema);
        assert_eq!(space.count::<Account>().unwrap(), 0);
    }

    #[test]
    fn roots_track_content_and_proofs_verify() {
        let dir = tempfile::tempdir().unwrap();
        let (container, space_root, file_root) = {
            let mut space = open(&dir);
            let empty = space.container_root::<Account>().unwrap();
            let id = space.insert(&account("carol", "ops", 7)).unwrap();
            let root = space.container_root::<Account>().unwrap();
            assert_ne!(root, empty);
            let proof = space.proof::<Account>(id).unwrap().unwrap();
            assert_eq!(proof.root, root);
            assert!(proof.verify(hasher().as_ref()));

            let before = space.space_root();
            space.insert(&note("carol", 10)).unwrap();
            assert_ne!(space.space_root(), before);
            space.commit().unwrap();
            (root, space.space_root(), space.file_root())
        };
        let space = open(&dir);
        assert_eq!(space.container_root::<Account>().unwrap(), container);
        assert_eq!(space.space_root(), space_root);
        assert_eq!(space.file_root(), file_root);
    }

    #[test]
    fn rollback_and_drop_discard_staged_changes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut space = open(&dir);
            space.insert(&account("keep", "ops", 1)).unwrap();
            space.commit().unwrap();
            space.insert(&account("gone", "ops", 2)).unwrap();
            space.rollback().unwrap();
            assert_eq!(space.count::<Account>().unwrap(), 1);
            assert_eq!(space.find_unique::<Account>("name", b"gone").unwrap(), None);
            space.insert(&account("dropped", "ops", 3)).unwrap();
        }
        let mut space = open(&dir);
        assert_eq!(space.ids::<Account>().unwrap(), [0]);
        assert_eq!(space.find_unique::<Account>("name", b"dropped").unwrap(), None);
    }

    #[test]
    fn stored_definition_must_match() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(&dir));
        let other = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("Account").unique_key("name"))
            .build()
            .unwrap();
        let err = ObjectSpace::open(&config(&dir), other, hasher()).err().unwrap();
        assert!(matches!(err, SpaceError::Store(StoreError::SchemaViolation(_))));

        let loaded = ObjectSpace::load(&config(&dir), hasher()).unwrap();
        assert_eq!(loaded.definition(), &definition());
    }

    #[test]
    fn verify_reports_every_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        for i in 0..4 {
            space.insert(&account(&format!("v{i}"), "ops", i)).unwrap();
        }
        space.insert(&note("v", 300)).unwrap();
        space.delete::<Account>(3).unwrap();
        space.delete::<Account>(1).unwrap();
        space.commit().unwrap();
        let report = space.verify().unwrap();
        assert!(report.is_ok());
        assert_eq!(report.containers.len(), 2);
        assert_eq!(report.containers[0].objects, 2);
        assert_eq!(report.containers[1].objects, 1);
    }

    #[test]
    fn read_only_space_rejects_mutations() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut space = open(&dir);
            space.insert(&account("ro", "ops", 1)).unwrap();
            space.commit().unwrap();
        }
        let cfg = config(&dir).with_read_only(true);
        let mut space = ObjectSpace::load(&cfg, hasher()).unwrap();
        assert_eq!(space.get::<Account>(0).unwrap().name, "ro");
        let err = space.insert(&account("no", "ops", 0)).unwrap_err();
        assert!(matches!(err, SpaceError::Store(StoreError::ReadOnly)));
        space.commit().unwrap();
    }

    #[test]
    fn unknown_containers_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut space = open(&dir);
        assert!(matches!(space.insert(&Ghost), Err(SpaceError::UnknownContainer(_))));
        assert!(matches!(
            space.find_unique::<Account>("owner", b"ops"),
            Err(SpaceError::UnknownIndex { .. })
        ));
        assert!(matches!(
            space.find::<Note>("body", b"x"),
            Err(SpaceError::UnknownIndex { .. })
        ));
    }
}
