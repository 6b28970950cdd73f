//! The per-request result cache.

use std::collections::HashMap;
use std::hash::Hash;

use crate::key::GroupKey;

/// A resolved cache entry: either the document that matched, or a confirmed
/// miss. The *absence* of an entry means "not yet attempted", which is why
/// cache lookups return `Option<CacheEntry<D>>`: a confirmed miss must not
/// be mistaken for an unknown key, or it would be re-fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<D> {
    Found(D),
    Absent,
}

impl<D> CacheEntry<D> {
    /// Collapse into the shape loads resolve with: `Some(doc)` or `None`
    /// for a confirmed miss.
    pub fn into_option(self) -> Option<D> {
        match self {
            CacheEntry::Found(doc) => Some(doc),
            CacheEntry::Absent => None,
        }
    }
}

impl<D> From<Option<D>> for CacheEntry<D> {
    fn from(doc: Option<D>) -> Self {
        match doc {
            Some(doc) => CacheEntry::Found(doc),
            None => CacheEntry::Absent,
        }
    }
}

/// Memoized results for one request, keyed by (collection, field, key).
///
/// Entries are immutable once set and are never evicted; the cache's
/// lifetime is bounded by the request context that owns it, so growth is
/// bounded by what one request actually loads.
#[derive(Debug)]
pub(crate) struct ResultCache<K, D> {
    groups: HashMap<GroupKey, HashMap<K, CacheEntry<D>>>,
}

impl<K: Eq + Hash + Clone, D> ResultCache<K, D> {
    pub(crate) fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, group: GroupKey, key: &K) -> Option<&CacheEntry<D>> {
        self.groups.get(&group)?.get(key)
    }

    /// Record one resolved entry. The first write for a key wins; later
    /// writes are ignored, which is what keeps entries immutable for the
    /// rest of the request.
    pub(crate) fn insert(&mut self, group: GroupKey, key: K, entry: CacheEntry<D>) {
        self.groups
            .entry(group)
            .or_default()
            .entry(key)
            .or_insert(entry);
    }

    /// Record the outcome of one flushed batch: every key in the flush set
    /// gets an entry, with keys that matched no document confirmed as
    /// absent. Rows tagged with keys outside the flush set are ignored.
    pub(crate) fn store_batch(&mut self, group: GroupKey, keys: &[K], rows: Vec<(K, D)>) {
        let mut matched: HashMap<K, D> = HashMap::with_capacity(rows.len());
        for (key, doc) in rows {
            // First row per key wins.
            matched.entry(key).or_insert(doc);
        }

        let entries = self.groups.entry(group).or_default();
        for key in keys {
            let entry = match matched.remove(key) {
                Some(doc) => CacheEntry::Found(doc),
                None => CacheEntry::Absent,
            };
            entries.entry(key.clone()).or_insert(entry);
        }
    }
}
