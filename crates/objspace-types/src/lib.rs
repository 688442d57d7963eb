//! Foundation types for the ObjectSpace storage engine.
//!
//! Every other ObjectSpace crate depends on `objspace-types`. The crate
//! only defines values that cross crate boundaries.
//!
//! # Key Types
//!
//! - [`Digest`] -- Output of a pluggable hash function (Merkle leaves, roots, keys)
//! - [`TypeError`] -- Parsing and length errors for the above

pub mod digest;
pub mod error;

pub use digest::{Digest, MAX_DIGEST_SIZE};
pub use error::TypeError;
