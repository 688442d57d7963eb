//! Typed object containers over the ObjectSpace storage engine.
//!
//! An [`ObjectSpace`] lives in one transactional file. Its
//! [`ObjectSpaceDefinition`] declares the containers, one per
//! [`SpaceObject`] type, and the indexes each keeps:
//!
//! - unique keys and secondary indexes on named members
//! - a free index store recycling vacant ids lowest first
//! - an optional Merkle tree over object digests
//!
//! A space-level Merkle tree over the container roots is optional too.
//! Every index is a clustered stream in the same file, so one commit
//! covers objects and indexes alike.
//!
//! ```no_run
//! use std::sync::Arc;
//! use objspace_crypto::ContentHasher;
//! use objspace_space::{ContainerBuilder, ObjectSpace, ObjectSpaceDefinition, SpaceObject};
//! use objspace_store::StorageConfig;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Account { name: String, balance: u64 }
//!
//! impl SpaceObject for Account {
//!     const CONTAINER: &'static str = "Account";
//!     fn member_key(&self, member: &str) -> Option<Vec<u8>> {
//!         (member == "name").then(|| self.name.as_bytes().to_vec())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = ObjectSpaceDefinition::builder()
//!     .container(ContainerBuilder::new("Account").unique_key("name").merkle_tree())
//!     .build()?;
//! let config = StorageConfig::new("accounts.db");
//! let mut space = ObjectSpace::open(&config, definition, Arc::new(ContentHasher::MERKLE))?;
//! let id = space.insert(&Account { name: "alice".into(), balance: 10 })?;
//! space.commit()?;
//! assert_eq!(space.find_unique::<Account>("name", b"alice")?, Some(id));
//! # Ok(())
//! # }
//! ```

pub mod definition;
pub mod error;
pub mod index;
pub mod object;
pub mod space;

pub use definition::{
    ContainerBuilder, ContainerDefinition, DefinitionBuilder, IndexDefinition, IndexKind,
    ObjectSpaceDefinition, SCHEMA_STREAM,
};
pub use error::{SpaceError, SpaceResult};
pub use index::{key_checksum, ContentTree, FreeIndex, IndexRuntime, KeyIndex};
pub use object::SpaceObject;
pub use space::{ContainerCheck, ContainerSummary, ObjectSpace, VerifyReport};
