use std::collections::BTreeSet;

/// Set of reusable indexes, handed out lowest first.
///
/// Used for free sectors and free object slots. The set itself is not
/// persisted: owners rebuild it at open from their own vacancy markers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeIndexStore {
    free: BTreeSet<u64>,
}

impl FreeIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free index.
    pub fn claim(&mut self) -> Option<u64> {
        self.free.pop_first()
    }

    /// Mark `index` reusable. Returns `false` if it already was.
    pub fn release(&mut self, index: u64) -> bool {
        self.free.insert(index)
    }

    /// Take a specific index out of the set.
    pub fn remove(&mut self, index: u64) -> bool {
        self.free.remove(&index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.free.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Highest free index, if any.
    pub fn last(&self) -> Option<u64> {
        self.free.last().copied()
    }

    /// Free indexes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.free.iter().copied()
    }

    pub fn clear(&mut self) {
        self.free.clear();
    }
}

impl FromIterator<u64> for FreeIndexStore {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            free: iter.into_iter().collect(),
        }
    }
}
