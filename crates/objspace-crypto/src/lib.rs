//! Cryptographic primitives for the ObjectSpace storage engine.
//!
//! Provides the pluggable [`HashFunction`] seam, BLAKE3 implementations of
//! it (domain-separated and keyed), and a binary Merkle tree that supports
//! `O(log N)` incremental leaf updates and inclusion proofs.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod merkle;

pub use hasher::{ContentHasher, HashFunction, KeyedHasher};
pub use merkle::{MerkleError, MerkleProof, MerkleTree, Side};
