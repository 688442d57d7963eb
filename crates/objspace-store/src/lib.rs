//! Paged, Merkle-verified, transactional storage for ObjectSpace.
//!
//! Every layer exposes the same byte-buffer interface
//! ([`ReadableBuffer`], [`WritableBuffer`]) and wraps the one below it:
//!
//! ```text
//! File -> PagedBuffer -> MerkleBuffer -> TransactionalBuffer
//!      -> SectorStore / StreamContainer -> ClusteredStream
//!      -> StreamPagedList -> ObjectBox / SectorMappedList
//! ```
//!
//! # Layers
//!
//! - [`PagedBuffer`] -- LRU page cache over the file content region; owns
//!   the file header
//! - [`MerkleBuffer`] -- keeps a Merkle root over page-sized leaves
//! - [`TransactionalBuffer`] -- staged overlay with journaled commit and
//!   rollback
//! - [`SectorStore`] / [`StreamContainer`] -- linked sectors and the
//!   growable streams built from them
//! - [`StreamPagedList`] -- typed items in lazily loaded pages
//! - [`ObjectBox`] -- fixed-size objects with stable ids
//! - [`SectorMappedList`] -- variable-length records over sector chains
//!
//! # Guarantees
//!
//! 1. Nothing reaches the file before commit.
//! 2. A commit is journaled first, so a crash at any point leaves either
//!    the old or the new state.
//! 3. The header root always matches the content it was written with;
//!    reopening verifies it.
//! 4. One writer per file, enforced with an OS lock.

pub mod buffer;
pub mod clustered;
pub mod config;
pub mod error;
pub mod file;
pub mod free_index;
pub mod header;
pub mod journal;
pub mod merkle_buffer;
pub mod object_box;
pub mod paged_buffer;
pub mod paged_list;
pub mod sector;
pub mod sector_list;
pub mod serializer;
pub mod stream;
pub mod transactional;

pub use buffer::{CheckpointBuffer, ReadableBuffer, WritableBuffer};
pub use clustered::{ClusteredStream, ContainerStats, SharedContainer, StreamContainer, StreamInfo};
pub use config::{ContainerPolicy, StorageConfig};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use file::{open_file, read_header, TransactionalFile};
pub use free_index::FreeIndexStore;
pub use header::FileHeader;
pub use merkle_buffer::MerkleBuffer;
pub use object_box::{FileObjectBox, ObjectBox};
pub use paged_buffer::{CacheStats, PagedBuffer};
pub use paged_list::{ListStats, StreamPagedList};
pub use sector::{Sector, SectorStore, END_OF_CHAIN, FREE_SECTOR};
pub use sector_list::{ItemPointer, SectorMappedList};
pub use serializer::{
    BincodeSerializer, BytesSerializer, DigestSerializer, FixedBytesSerializer, ItemSerializer,
    SlotSerializer, U64Serializer,
};
pub use stream::Stream;
pub use transactional::TransactionalBuffer;
