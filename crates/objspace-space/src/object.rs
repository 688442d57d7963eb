use serde::de::DeserializeOwned;
use serde::Serialize;

/// A type stored in an object space.
///
/// Objects are encoded with bincode. Fixed-size containers pad the
/// encoding to the slot size and reject objects that do not fit.
pub trait SpaceObject: Serialize + DeserializeOwned {
    /// Name of the container holding this type.
    const CONTAINER: &'static str;

    /// Key bytes of `member`, used by unique and secondary indexes.
    /// `None` leaves the object out of the index.
    fn member_key(&self, member: &str) -> Option<Vec<u8>> {
        let _ = member;
        None
    }
}
