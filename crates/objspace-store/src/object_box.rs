//! Fixed-size objects in slots with stable ids.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use objspace_crypto::HashFunction;
use objspace_types::Digest;
use tracing::{debug, info, warn};

use crate::buffer::WritableBuffer;
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::file::{open_file, TransactionalFile};
use crate::free_index::FreeIndexStore;
use crate::paged_list::{ListStats, StreamPagedList};
use crate::serializer::{ItemSerializer, SlotSerializer};

/// Typed slots over any byte buffer.
///
/// An object's id is the byte offset of its slot in the backing list, so
/// ids step by [`slot_size`](Self::slot_size). Deleting an object vacates
/// its slot; later writes reuse vacant slots lowest first, so ids of live
/// objects never change. Every object must serialize to the serializer's
/// fixed size.
pub struct ObjectBox<T, S, B> {
    list: StreamPagedList<Option<T>, SlotSerializer<S>, B>,
    free: FreeIndexStore,
    live: usize,
}

impl<T, S, B> ObjectBox<T, S, B>
where
    T: Clone,
    S: ItemSerializer<T>,
    B: WritableBuffer,
{
    /// Open a box over `buffer` and index its vacant slots.
    pub fn new(buffer: B, serializer: S, page_size: usize, max_memory: usize) -> StoreResult<Self> {
        let slots = SlotSerializer::new::<T>(serializer)?;
        let list = StreamPagedList::open(buffer, slots, page_size, max_memory)?;
        let mut object_box = Self {
            list,
            free: FreeIndexStore::new(),
            live: 0,
        };
        object_box.scan()?;
        Ok(object_box)
    }

    fn scan(&mut self) -> StoreResult<()> {
        self.free.clear();
        self.live = 0;
        for id in 0..self.list.len() {
            if self.list.read(id)?.is_some() {
                self.live += 1;
            } else {
                self.free.release(id as u64);
            }
        }
        debug!(live = self.live, vacant = self.free.len(), "scanned object slots");
        Ok(())
    }

    /// Bytes per object, without the slot flag.
    pub fn object_size(&self) -> usize {
        self.list.serializer().item_size()
    }

    /// Live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bytes per slot, flag included. Ids are multiples of this.
    pub fn slot_size(&self) -> usize {
        self.object_size() + 1
    }

    /// Id of the object stored in slot `slot`.
    pub fn id_of(&self, slot: usize) -> u64 {
        (slot * self.slot_size()) as u64
    }

    /// Slots, vacant ones included.
    pub fn capacity(&self) -> usize {
        self.list.len()
    }

    pub fn loaded_pages(&self) -> usize {
        self.list.loaded_pages()
    }

    pub fn page_count(&self) -> usize {
        self.list.page_count()
    }

    pub fn stats(&self) -> ListStats {
        self.list.stats()
    }

    /// The object with `id`, or `None` if its slot is vacant.
    pub fn get(&mut self, id: u64) -> StoreResult<Option<T>> {
        let index = self.slot(id)?;
        self.list.read(index)
    }

    /// The object with `id`; fails with `ObjectNotFound` for vacant slots.
    pub fn read(&mut self, id: u64) -> StoreResult<T> {
        self.get(id)?.ok_or(StoreError::ObjectNotFound(id))
    }

    pub fn contains(&mut self, id: u64) -> StoreResult<bool> {
        match self.slot(id) {
            Ok(index) => Ok(!self.free.contains(index as u64)),
            Err(_) => Ok(false),
        }
    }

    /// Ids of live objects in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        (0..self.capacity())
            .filter(|slot| !self.free.contains(*slot as u64))
            .map(|slot| self.id_of(slot))
            .collect()
    }

    /// Store `item` in the lowest vacant slot, or a new one, and return its
    /// id.
    pub fn write(&mut self, item: &T) -> StoreResult<u64> {
        self.check_size(item)?;
        let slot = self
            .free
            .iter()
            .next()
            .unwrap_or(self.capacity() as u64);
        let id = self.id_of(slot as usize);
        self.put(id, item)?;
        Ok(id)
    }

    /// Replace the live object `id`.
    pub fn update(&mut self, id: u64, item: &T) -> StoreResult<()> {
        if !self.contains(id)? {
            return Err(StoreError::ObjectNotFound(id));
        }
        self.put(id, item)
    }

    /// Delete the live object `id`. Vacant slots at the end of the box are
    /// erased.
    pub fn delete(&mut self, id: u64) -> StoreResult<()> {
        if !self.vacate(id)? {
            return Err(StoreError::ObjectNotFound(id));
        }
        let mut trailing = 0;
        while trailing < self.capacity() && self.free.contains((self.capacity() - 1 - trailing) as u64) {
            trailing += 1;
        }
        if trailing > 0 {
            let keep = self.capacity() - trailing;
            self.list.erase_from_end(trailing)?;
            for slot in keep..keep + trailing {
                self.free.remove(slot as u64);
            }
        }
        Ok(())
    }

    /// Store `item` in slot `id`, which may be live, vacant, or the next
    /// new slot.
    pub fn put(&mut self, id: u64, item: &T) -> StoreResult<()> {
        self.check_size(item)?;
        let capacity = self.capacity();
        let index = if id == self.id_of(capacity) {
            capacity
        } else {
            self.slot(id)?
        };
        if index == capacity {
            self.list.append([Some(item.clone())])?;
            self.live += 1;
        } else {
            self.list.update(index, [Some(item.clone())])?;
            if self.free.remove(index as u64) {
                self.live += 1;
            }
        }
        Ok(())
    }

    /// Mark slot `id` vacant without shrinking the box. Returns `false` if
    /// it already was.
    pub fn vacate(&mut self, id: u64) -> StoreResult<bool> {
        let index = self.slot(id)?;
        if self.free.contains(index as u64) {
            return Ok(false);
        }
        self.list.update(index, [None])?;
        self.free.release(index as u64);
        self.live -= 1;
        Ok(true)
    }

    /// Write pending pages to the buffer.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.list.flush()
    }

    /// Drop cached state and re-read the buffer.
    pub fn reload(&mut self) -> StoreResult<()> {
        self.list.discard_cache()?;
        self.scan()
    }

    pub fn buffer(&self) -> &B {
        self.list.buffer()
    }

    /// Direct buffer access. Call [`reload`](Self::reload) after changing
    /// its bytes behind the box.
    pub fn buffer_mut(&mut self) -> &mut B {
        self.list.buffer_mut()
    }

    /// Slot index of `id`; offsets inside a slot name no object.
    fn slot(&self, id: u64) -> StoreResult<usize> {
        let end = self.id_of(self.capacity());
        if id >= end {
            return Err(StoreError::range("object id", id, end));
        }
        let slot_size = self.slot_size() as u64;
        if id % slot_size != 0 {
            return Err(StoreError::ObjectNotFound(id));
        }
        Ok((id / slot_size) as usize)
    }

    fn check_size(&self, item: &T) -> StoreResult<()> {
        let size = self.list.serializer().inner().calculate_size(item)?;
        if size != self.object_size() {
            return Err(StoreError::SchemaViolation(format!(
                "object is {size} bytes, box holds {}-byte objects",
                self.object_size()
            )));
        }
        Ok(())
    }
}

/// An object box owning a storage file.
///
/// Changes are staged until [`commit`](Self::commit). Dropping the box
/// rolls staged changes back unless the configuration asks to commit on
/// drop.
pub struct FileObjectBox<T, S>
where
    T: Clone,
    S: ItemSerializer<T>,
{
    inner: ObjectBox<T, S, TransactionalFile>,
    commit_on_drop: bool,
}

impl<T, S> FileObjectBox<T, S>
where
    T: Clone,
    S: ItemSerializer<T>,
{
    /// Open or create the box file described by `config`.
    pub fn open(config: &StorageConfig, serializer: S, hasher: Arc<dyn HashFunction>) -> StoreResult<Self> {
        let file = open_file(config, hasher)?;
        let inner = ObjectBox::new(file, serializer, config.page_size, config.max_memory)?;
        info!(
            path = %config.file_path.display(),
            objects = inner.len(),
            slots = inner.capacity(),
            "object box opened"
        );
        Ok(Self {
            inner,
            commit_on_drop: config.commit_on_drop,
        })
    }

    /// Run `op` on the box; any error it returns rolls the transaction
    /// back before it is reported.
    fn staged<R>(&mut self, op: impl FnOnce(&mut ObjectBox<T, S, TransactionalFile>) -> StoreResult<R>) -> StoreResult<R> {
        match op(&mut self.inner) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, "object box write failed, rolling back");
                if let Err(rollback) = self.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// See [`ObjectBox::write`].
    pub fn write(&mut self, item: &T) -> StoreResult<u64> {
        self.inner.check_size(item)?;
        self.staged(|inner| inner.write(item))
    }

    /// See [`ObjectBox::update`].
    pub fn update(&mut self, id: u64, item: &T) -> StoreResult<()> {
        if !self.inner.contains(id)? {
            return Err(StoreError::ObjectNotFound(id));
        }
        self.inner.check_size(item)?;
        self.staged(|inner| inner.update(id, item))
    }

    /// See [`ObjectBox::delete`].
    pub fn delete(&mut self, id: u64) -> StoreResult<()> {
        if !self.inner.contains(id)? {
            return Err(StoreError::ObjectNotFound(id));
        }
        self.staged(|inner| inner.delete(id))
    }

    /// See [`ObjectBox::put`].
    pub fn put(&mut self, id: u64, item: &T) -> StoreResult<()> {
        self.inner.check_size(item)?;
        if id != self.inner.id_of(self.inner.capacity()) {
            self.inner.slot(id)?;
        }
        self.staged(|inner| inner.put(id, item))
    }

    /// See [`ObjectBox::vacate`].
    pub fn vacate(&mut self, id: u64) -> StoreResult<bool> {
        self.inner.slot(id)?;
        self.staged(|inner| inner.vacate(id))
    }

    /// Make every change since the last commit durable.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.inner.flush()?;
        self.inner.buffer_mut().commit()
    }

    /// Discard every change since the last commit.
    pub fn rollback(&mut self) -> StoreResult<()> {
        self.inner.buffer_mut().rollback();
        self.inner.reload()
    }

    /// Merkle root of the committed content.
    pub fn root(&self) -> Digest {
        self.inner.buffer().root()
    }

    /// Recompute the committed root and compare it with the header.
    pub fn verify(&mut self) -> StoreResult<bool> {
        self.inner.buffer_mut().verify()
    }

    pub fn file(&self) -> &TransactionalFile {
        self.inner.buffer()
    }
}

impl<T, S> Deref for FileObjectBox<T, S>
where
    T: Clone,
    S: ItemSerializer<T>,
{
    type Target = ObjectBox<T, S, TransactionalFile>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T, S> DerefMut for FileObjectBox<T, S>
where
    T: Clone,
    S: ItemSerializer<T>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T, S> Drop for FileObjectBox<T, S>
where
    T: Clone,
    S: ItemSerializer<T>,
{
    fn drop(&mut self) {
        if self.commit_on_drop {
            if let Err(err) = self.commit() {
                warn!(error = %err, "commit on drop failed, changes discarded");
                self.inner.buffer_mut().rollback();
            }
        } else {
            self.inner.buffer_mut().rollback();
        }
    }
}
