//! Key bookkeeping for open load groups.

use std::collections::HashMap;
use std::hash::Hash;

/// Identity of a load group: one collection plus the indexed field its keys
/// are matched against. Two loads coalesce into the same bulk query exactly
/// when their group keys are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey {
    pub(crate) collection: &'static str,
    pub(crate) field: &'static str,
}

/// Values that can be looked up through the loader.
///
/// `is_loadable` is the validity check applied before a key joins a batch.
/// It exists to catch degenerate identifiers (the empty id string, the kind
/// of value a dynamically-typed caller would have passed as null) and reject
/// them synchronously instead of letting them into a bulk query.
pub trait DocumentKey: Eq + Hash + Clone {
    fn is_loadable(&self) -> bool {
        true
    }
}

impl DocumentKey for String {
    fn is_loadable(&self) -> bool {
        !self.is_empty()
    }
}

macro_rules! always_loadable {
    ($($key:ty)*) => {$(
        impl DocumentKey for $key {}
    )*}
}

always_loadable! { i8 i16 i32 i64 i128 isize u8 u16 u32 u64 u128 usize }

/// The keys pending in one accumulating group, with a count of how many live
/// futures are waiting on each.
///
/// Waiter counts matter for two reasons: duplicate requests for a key must
/// all be fulfilled from one fetched value, and a key whose every waiter is
/// dropped before the flush must not be fetched at all.
#[derive(Debug)]
pub(crate) struct KeyBatch<K> {
    waiters: HashMap<K, usize>,
}

impl<K: Eq + Hash> KeyBatch<K> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }

    /// Register interest in `key`. Duplicate joins stack; the key is fetched
    /// once no matter how many futures wait on it.
    pub(crate) fn join(&mut self, key: K) {
        *self.waiters.entry(key).or_insert(0) += 1;
    }

    /// Withdraw one waiter's interest. The key leaves the flush set when its
    /// last waiter does. Unknown keys are ignored; the waiter may have raced
    /// a flush that already consumed the batch.
    pub(crate) fn leave(&mut self, key: &K) {
        if let Some(count) = self.waiters.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.waiters.remove(key);
            }
        }
    }

    /// Number of unique keys currently pending.
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Freeze the batch for flushing, leaving this instance empty. The
    /// returned keys are unique and in arbitrary order.
    pub(crate) fn take(&mut self) -> Vec<K> {
        self.waiters.drain().map(|(key, _count)| key).collect()
    }
}
