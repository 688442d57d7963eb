use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Largest digest the storage format can persist (header root field).
pub const MAX_DIGEST_SIZE: usize = 64;

/// Output of a hash function.
///
/// Digests are opaque byte strings whose length is fixed per hash function
/// (32 bytes for the default BLAKE3 hasher). They are used for Merkle
/// leaves, internal nodes and roots, and for key checksums in indexes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() > MAX_DIGEST_SIZE {
            return Err(TypeError::DigestTooLong(bytes.len()));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Wrap an owned digest without copying.
    ///
    /// Callers are hash functions, which never produce more than
    /// [`MAX_DIGEST_SIZE`] bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() <= MAX_DIGEST_SIZE);
        Self(bytes)
    }

    /// The all-zero digest of the given size. Represents "nothing hashed".
    pub fn zero(size: usize) -> Self {
        Self(vec![0u8; size])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Digest length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for a zero-length digest.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Parse from a hex string and require a specific length.
    pub fn from_hex_sized(s: &str, size: usize) -> Result<Self, TypeError> {
        let digest = Self::from_hex(s)?;
        if digest.len() != size {
            return Err(TypeError::InvalidLength {
                expected: size,
                actual: digest.len(),
            });
        }
        Ok(digest)
    }

    /// First eight bytes interpreted as a little-endian `u64`.
    ///
    /// Shorter digests are zero-extended.
    pub fn checksum64(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.0.len().min(8);
        buf[..n].copy_from_slice(&self.0[..n]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_is_all_zeros() {
        let zero = Digest::zero(32);
        assert!(zero.is_zero());
        assert_eq!(zero.len(), 32);
        assert_eq!(zero.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn oversized_digest_rejected() {
        let err = Digest::from_bytes(&[1u8; MAX_DIGEST_SIZE + 1]).unwrap_err();
        assert_eq!(err, TypeError::DigestTooLong(MAX_DIGEST_SIZE + 1));
    }

    #[test]
    fn hex_sized_checks_length() {
        let digest = Digest::from([7u8; 32]);
        let err = Digest::from_hex_sized(&digest.to_hex(), 16).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 16,
                actual: 32
            }
        );
    }

    #[test]
    fn short_hex_is_8_chars() {
        let digest = Digest::from([0xab; 32]);
        assert_eq!(digest.short_hex(), "abababab");
    }

    #[test]
    fn short_hex_of_tiny_digest() {
        let digest = Digest::from_bytes(&[1, 2]).unwrap();
        assert_eq!(digest.short_hex(), "0102");
    }

    #[test]
    fn checksum64_is_little_endian_prefix() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        bytes[1] = 2;
        let digest = Digest::from(bytes);
        assert_eq!(digest.checksum64(), 0x0201);
    }

    #[test]
    fn serde_roundtrip() {
        let digest = Digest::from([9u8; 32]);
        let json = serde_json::to_string(&digest).unwrap();
        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, parsed);
    }

    proptest! {
        #[test]
        fn hex_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..=MAX_DIGEST_SIZE)) {
            let digest = Digest::from_bytes(&bytes).unwrap();
            let parsed = Digest::from_hex(&digest.to_hex()).unwrap();
            prop_assert_eq!(digest, parsed);
        }
    }
}
