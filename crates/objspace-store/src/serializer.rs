use std::marker::PhantomData;

use objspace_types::Digest;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

/// Converts items to and from bytes for lists and boxes.
///
/// A serializer either produces a fixed number of bytes for every item
/// ([`fixed_size`](Self::fixed_size) returns `Some`) or a variable number,
/// in which case lists store a length prefix before each item.
pub trait ItemSerializer<T>: Send + Sync {
    /// Byte size shared by every item, if any.
    fn fixed_size(&self) -> Option<usize>;

    /// Serialized size of `item`.
    fn calculate_size(&self, item: &T) -> StoreResult<usize>;

    /// Append the encoding of `item` to `out`.
    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> StoreResult<()>;

    /// Decode one item from exactly `bytes`.
    fn deserialize(&self, bytes: &[u8]) -> StoreResult<T>;
}

fn size_mismatch(expected: usize, actual: usize) -> StoreError {
    StoreError::SchemaViolation(format!(
        "item is {actual} bytes, serializer expects {expected}"
    ))
}

/// Little-endian `u64`.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Serializer;

impl ItemSerializer<u64> for U64Serializer {
    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn calculate_size(&self, _item: &u64) -> StoreResult<usize> {
        Ok(8)
    }

    fn serialize(&self, item: &u64, out: &mut Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(&item.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| size_mismatch(8, bytes.len()))?;
        Ok(u64::from_le_bytes(raw))
    }
}

/// Raw byte strings of one exact length.
#[derive(Clone, Copy, Debug)]
pub struct FixedBytesSerializer {
    size: usize,
}

impl FixedBytesSerializer {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ItemSerializer<Vec<u8>> for FixedBytesSerializer {
    fn fixed_size(&self) -> Option<usize> {
        Some(self.size)
    }

    fn calculate_size(&self, item: &Vec<u8>) -> StoreResult<usize> {
        Ok(item.len())
    }

    fn serialize(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> StoreResult<()> {
        if item.len() != self.size {
            return Err(size_mismatch(self.size, item.len()));
        }
        out.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        if bytes.len() != self.size {
            return Err(size_mismatch(self.size, bytes.len()));
        }
        Ok(bytes.to_vec())
    }
}

/// Raw byte strings of any length.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesSerializer;

impl ItemSerializer<Vec<u8>> for BytesSerializer {
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    fn calculate_size(&self, item: &Vec<u8>) -> StoreResult<usize> {
        Ok(item.len())
    }

    fn serialize(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Digests of one size.
#[derive(Clone, Copy, Debug)]
pub struct DigestSerializer {
    size: usize,
}

impl DigestSerializer {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ItemSerializer<Digest> for DigestSerializer {
    fn fixed_size(&self) -> Option<usize> {
        Some(self.size)
    }

    fn calculate_size(&self, item: &Digest) -> StoreResult<usize> {
        Ok(item.len())
    }

    fn serialize(&self, item: &Digest, out: &mut Vec<u8>) -> StoreResult<()> {
        if item.len() != self.size {
            return Err(size_mismatch(self.size, item.len()));
        }
        out.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<Digest> {
        if bytes.len() != self.size {
            return Err(size_mismatch(self.size, bytes.len()));
        }
        Digest::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Any serde type, encoded with bincode. Variable size.
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> ItemSerializer<T> for BincodeSerializer<T> {
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    fn calculate_size(&self, item: &T) -> StoreResult<usize> {
        Ok(bincode::serialized_size(item)? as usize)
    }

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> StoreResult<()> {
        bincode::serialize_into(out, item)?;
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Presence-flagged slots: `[flag u8][item]`, where flag 0 marks a vacant
/// slot whose item bytes are zero.
#[derive(Clone, Copy, Debug)]
pub struct SlotSerializer<S> {
    inner: S,
    item_size: usize,
}

impl<S> SlotSerializer<S> {
    /// Wrap a fixed-size serializer. Variable-size serializers cannot back
    /// slots.
    pub fn new<T>(inner: S) -> StoreResult<Self>
    where
        S: ItemSerializer<T>,
    {
        let item_size = inner.fixed_size().ok_or_else(|| {
            StoreError::SchemaViolation("slots need a fixed-size serializer".into())
        })?;
        Ok(Self { inner, item_size })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Size of the wrapped item, without the flag byte.
    pub fn item_size(&self) -> usize {
        self.item_size
    }
}

impl<T, S: ItemSerializer<T>> ItemSerializer<Option<T>> for SlotSerializer<S> {
    fn fixed_size(&self) -> Option<usize> {
        Some(self.item_size + 1)
    }

    fn calculate_size(&self, item: &Option<T>) -> StoreResult<usize> {
        match item {
            Some(item) => Ok(self.inner.calculate_size(item)? + 1),
            None => Ok(self.item_size + 1),
        }
    }

    fn serialize(&self, item: &Option<T>, out: &mut Vec<u8>) -> StoreResult<()> {
        match item {
            Some(item) => {
                let start = out.len();
                out.push(1);
                if let Err(err) = self.inner.serialize(item, out) {
                    out.truncate(start);
                    return Err(err);
                }
                let written = out.len() - start - 1;
                if written != self.item_size {
                    out.truncate(start);
                    return Err(size_mismatch(self.item_size, written));
                }
            }
            None => out.resize(out.len() + self.item_size + 1, 0),
        }
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<Option<T>> {
        match bytes.split_first() {
            Some((0, _)) => Ok(None),
            Some((1, rest)) => Ok(Some(self.inner.deserialize(rest)?)),
            Some((flag, _)) => Err(StoreError::FormatViolation(format!(
                "invalid slot flag {flag}"
            ))),
            None => Err(size_mismatch(self.item_size + 1, 0)),
        }
    }
}
