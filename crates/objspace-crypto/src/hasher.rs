use objspace_types::{Digest, MAX_DIGEST_SIZE};

/// A hash function producing fixed-size digests.
///
/// This is the seam through which the storage engine consumes hashing. The
/// engine never assumes a particular algorithm; it only relies on the
/// digest size being constant for the lifetime of a file.
pub trait HashFunction: Send + Sync {
    /// Size in bytes of every digest this function produces.
    fn digest_size(&self) -> usize;

    /// Hash arbitrary input.
    fn compute(&self, input: &[u8]) -> Digest;

    /// Hash the concatenation `left ++ right` (Merkle internal nodes).
    fn compute_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut joined = Vec::with_capacity(left.len() + right.len());
        joined.extend_from_slice(left.as_bytes());
        joined.extend_from_slice(right.as_bytes());
        self.compute(&joined)
    }

    /// Short human-readable name, used in diagnostics.
    fn name(&self) -> &str;
}

/// Domain-separated BLAKE3 hasher.
///
/// Each hasher carries a domain tag (e.g., `"objspace-merkle-v1"`) that is
/// prepended to every hash computation, so the same bytes hashed for a
/// Merkle leaf and for an index key never collide. The output length is
/// configurable through BLAKE3's extendable output.
#[derive(Clone, Debug)]
pub struct ContentHasher {
    domain: &'static str,
    size: usize,
}

impl ContentHasher {
    /// Hasher for Merkle leaves and nodes over file content.
    pub const MERKLE: Self = Self {
        domain: "objspace-merkle-v1",
        size: 32,
    };
    /// Hasher for index key checksums.
    pub const KEY: Self = Self {
        domain: "objspace-key-v1",
        size: 32,
    };
    /// Hasher for object content leaves in container trees.
    pub const OBJECT: Self = Self {
        domain: "objspace-object-v1",
        size: 32,
    };

    /// Create a hasher with a custom domain tag and 32-byte output.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain, size: 32 }
    }

    /// Same domain, different output length (clamped to `1..=64`).
    pub fn with_digest_size(mut self, size: usize) -> Self {
        self.size = size.clamp(1, MAX_DIGEST_SIZE);
        self
    }

    /// Raw BLAKE3 hash without domain separation (for low-level use).
    pub fn raw_hash(data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    fn finish(&self, hasher: &blake3::Hasher) -> Digest {
        let mut out = vec![0u8; self.size];
        hasher.finalize_xof().fill(&mut out);
        Digest::from_vec(out)
    }
}

impl HashFunction for ContentHasher {
    fn digest_size(&self) -> usize {
        self.size
    }

    fn compute(&self, input: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(input);
        self.finish(&hasher)
    }

    fn compute_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        self.finish(&hasher)
    }

    fn name(&self) -> &str {
        "blake3"
    }
}

/// Keyed BLAKE3 hasher (a MAC over content).
///
/// Useful when the integrity root must not be forgeable by someone who can
/// rewrite the file: without the key, a consistent root cannot be produced.
#[derive(Clone)]
pub struct KeyedHasher {
    key: [u8; 32],
}

impl KeyedHasher {
    /// Create a keyed hasher from a 32-byte secret.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl std::fmt::Debug for KeyedHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedHasher").finish_non_exhaustive()
    }
}

impl HashFunction for KeyedHasher {
    fn digest_size(&self) -> usize {
        32
    }

    fn compute(&self, input: &[u8]) -> Digest {
        Digest::from(*blake3::keyed_hash(&self.key, input).as_bytes())
    }

    fn compute_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        Digest::from(*hasher.finalize().as_bytes())
    }

    fn name(&self) -> &str {
        "blake3-keyed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"hello world";
        let d1 = ContentHasher::MERKLE.compute(data);
        let d2 = ContentHasher::MERKLE.compute(data);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 32);
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let data = b"same content";
        let merkle = ContentHasher::MERKLE.compute(data);
        let key = ContentHasher::KEY.compute(data);
        let object = ContentHasher::OBJECT.compute(data);
        assert_ne!(merkle, key);
        assert_ne!(merkle, object);
        assert_ne!(key, object);
    }

    #[test]
    fn pair_matches_concatenation() {
        let h = ContentHasher::MERKLE;
        let left = h.compute(b"left");
        let right = h.compute(b"right");
        let mut joined = left.as_bytes().to_vec();
        joined.extend_from_slice(right.as_bytes());
        assert_eq!(h.compute_pair(&left, &right), h.compute(&joined));
    }

    #[test]
    fn pair_order_matters() {
        let h = ContentHasher::MERKLE;
        let a = h.compute(b"a");
        let b = h.compute(b"b");
        assert_ne!(h.compute_pair(&a, &b), h.compute_pair(&b, &a));
    }

    #[test]
    fn custom_digest_size() {
        let h = ContentHasher::new("short").with_digest_size(16);
        assert_eq!(h.digest_size(), 16);
        assert_eq!(h.compute(b"x").len(), 16);
    }

    #[test]
    fn digest_size_is_clamped() {
        let h = ContentHasher::new("huge").with_digest_size(1000);
        assert_eq!(h.digest_size(), MAX_DIGEST_SIZE);
    }

    #[test]
    fn raw_hash_no_domain() {
        let raw = ContentHasher::raw_hash(b"test");
        let domain = ContentHasher::MERKLE.compute(b"test");
        assert_ne!(&raw[..], domain.as_bytes());
    }

    #[test]
    fn keyed_hasher_depends_on_key() {
        let a = KeyedHasher::new([1u8; 32]);
        let b = KeyedHasher::new([2u8; 32]);
        assert_ne!(a.compute(b"data"), b.compute(b"data"));
    }

    #[test]
    fn keyed_pair_matches_concatenation() {
        let h = KeyedHasher::new([3u8; 32]);
        let left = h.compute(b"l");
        let right = h.compute(b"r");
        let mut joined = left.as_bytes().to_vec();
        joined.extend_from_slice(right.as_bytes());
        assert_eq!(h.compute_pair(&left, &right), h.compute(&joined));
    }

    #[test]
    fn keyed_debug_hides_key() {
        let h = KeyedHasher::new([0x42; 32]);
        let debug = format!("{h:?}");
        assert!(!debug.contains("66"));
    }
}
