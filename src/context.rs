//! The per-request owner: loader rules, the request context, and its
//! registry of open groups.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::cache::{CacheEntry, ResultCache};
use crate::error::LoadError;
use crate::group::{AccumState, GroupState, LoadFuture, LoadMany, SharedGroup};
use crate::key::{DocumentKey, GroupKey, KeyBatch};
use crate::source::DocumentSource;
use crate::wakers::WaiterSet;

/// Behavior shared by every load issued through one [`RequestContext`].
///
/// Passed to the context by reference, so that the in-flight groups can
/// borrow the source directly.
#[derive(Debug, Clone, Default)]
pub struct LoaderRules<S, W> {
    /// The storage layer's bulk-fetch primitive.
    pub source: S,
    /// Creates the window future that defines how long a group stays open
    /// collecting keys. `|| future::ready(())` closes the window at the
    /// first poll, coalescing exactly the loads issued in one synchronous
    /// pass; a short timer widens the window across passes.
    pub window: W,
    /// Optional cap on unique keys per group. Reaching it flushes the group
    /// immediately, regardless of the window.
    pub max_batch: Option<NonZeroUsize>,
}

/// Registry of the load groups created during one request.
///
/// `open` tracks the group currently accumulating keys for each
/// (collection, field); `live` remembers every group that may still have
/// waiters, so cancellation can reach groups that already detached from
/// `open` (key cap reached, or flushed).
struct GroupRegistry<'a, S: DocumentSource, Delay> {
    open: HashMap<GroupKey, Weak<Mutex<GroupState<'a, S, Delay>>>>,
    live: Vec<(GroupKey, Weak<Mutex<GroupState<'a, S, Delay>>>)>,
}

impl<'a, S: DocumentSource, Delay> GroupRegistry<'a, S, Delay> {
    fn new() -> Self {
        Self {
            open: HashMap::new(),
            live: Vec::new(),
        }
    }

    fn track(&mut self, group: GroupKey, handle: &SharedGroup<'a, S, Delay>) {
        // Groups are short-lived; pruning on every insert keeps the ledger
        // proportional to the groups that are actually alive.
        self.live.retain(|(_group, weak)| weak.strong_count() > 0);
        self.live.push((group, Arc::downgrade(handle)));
    }
}

/// Per-request loading scope: owns the result cache and the group registry,
/// and hands out [`LoadFuture`]s.
///
/// One of these is constructed at the start of handling an inbound request
/// and dropped when the request completes. Nothing it caches survives it,
/// and two contexts never share state, which is what makes the cache safe:
/// an entry can go stale only for as long as one request lives.
///
/// All methods take `&self`; a context can be shared by reference across
/// the tasks serving one request.
pub struct RequestContext<'a, S: DocumentSource, W, Delay> {
    rules: &'a LoaderRules<S, W>,
    cache: Arc<Mutex<ResultCache<S::Key, S::Doc>>>,
    groups: Mutex<GroupRegistry<'a, S, Delay>>,
    cancelled: AtomicBool,
}

impl<'a, S, W, Delay> RequestContext<'a, S, W, Delay>
where
    S: DocumentSource,
    W: Fn() -> Delay,
    Delay: Future<Output = ()>,
{
    pub fn new(rules: &'a LoaderRules<S, W>) -> Self {
        Self {
            rules,
            cache: Arc::new(Mutex::new(ResultCache::new())),
            groups: Mutex::new(GroupRegistry::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Request the document(s) where `field == key` in `collection`.
    ///
    /// If the key is already cached (found *or* confirmed absent), the
    /// returned future resolves on its first poll without touching any
    /// batch. Otherwise the key joins the open group for
    /// (collection, field), opening one if needed, and the future
    /// resolves when that group's single bulk fetch completes.
    pub fn load(
        &self,
        collection: &'static str,
        field: &'static str,
        key: S::Key,
    ) -> LoadFuture<'a, S, Delay> {
        let group = GroupKey { collection, field };

        if self.cancelled.load(Ordering::SeqCst) {
            return LoadFuture::immediate(Err(LoadError::Cancelled { collection, field }));
        }

        if !key.is_loadable() {
            return LoadFuture::immediate(Err(LoadError::InvalidKey { collection, field }));
        }

        // Cache first: a known result never joins a batch. The cache lock
        // is released before the registry lock is taken.
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(group, &key) {
                trace!(collection, field, "cache hit");
                return LoadFuture::immediate(Ok(entry.clone().into_option()));
            }
        }

        let mut registry = self.groups.lock().unwrap();

        // Re-checked under the registry lock. cancel() sets the flag and
        // then drains the registry while holding this lock, so a load that
        // gets here with the flag clear is ordered before the drain and its
        // group will be reached by it; a load that sees the flag set must
        // not register a group that teardown would miss.
        if self.cancelled.load(Ordering::SeqCst) {
            return LoadFuture::immediate(Err(LoadError::Cancelled { collection, field }));
        }

        // Join the open group if it's still accumulating. Timing is never
        // checked here: if the window has already closed, the next poll of
        // any waiter transitions the group before results could be observed,
        // so a late joiner is indistinguishable from a same-tick one.
        if let Some(handle) = registry.open.get(&group).and_then(Weak::upgrade) {
            if let Ok(mut state_guard) = handle.lock() {
                if let GroupState::Accum(accum) = &mut *state_guard {
                    accum.batch.join(key.clone());

                    // At the key cap: drop the window, wake the driver so
                    // the flush happens promptly, and detach the group so
                    // the next load opens a fresh one.
                    match self.rules.max_batch {
                        Some(max) if accum.batch.len() >= max.get() => {
                            accum.delay = None;
                            accum.waiters.wake_driver();
                            drop(state_guard);
                            registry.open.remove(&group);
                        }
                        _ => drop(state_guard),
                    }

                    return LoadFuture::waiting(
                        key,
                        group,
                        Arc::clone(&handle),
                        Arc::clone(&self.cache),
                    );
                }
            }
        }

        // No usable open group; start one.
        let mut batch = KeyBatch::new();
        batch.join(key.clone());

        let handle = match self.rules.max_batch {
            // A cap of one key means there is nothing to coalesce: no
            // window, and no point registering the group as open.
            Some(max) if max.get() <= 1 => Arc::new(Mutex::new(GroupState::Accum(AccumState {
                batch,
                source: &self.rules.source,
                delay: None,
                waiters: WaiterSet::default(),
            }))),
            _ => {
                let handle = Arc::new(Mutex::new(GroupState::Accum(AccumState {
                    batch,
                    source: &self.rules.source,
                    delay: Some((self.rules.window)()),
                    waiters: WaiterSet::default(),
                })));
                registry.open.insert(group, Arc::downgrade(&handle));
                handle
            }
        };
        registry.track(group, &handle);

        LoadFuture::waiting(key, group, handle, Arc::clone(&self.cache))
    }

    /// Load several keys from the same (collection, field) at once. The
    /// returned future yields one result per input key, in input order;
    /// duplicates are fine and resolve to the same value.
    pub fn load_many<I>(
        &self,
        collection: &'static str,
        field: &'static str,
        keys: I,
    ) -> LoadMany<'a, S, Delay>
    where
        I: IntoIterator<Item = S::Key>,
    {
        LoadMany::new(
            keys.into_iter()
                .map(|key| self.load(collection, field, key))
                .collect(),
        )
    }
}

impl<'a, S: DocumentSource, W, Delay> RequestContext<'a, S, W, Delay> {
    /// Seed the cache ahead of any fetch: `Some(doc)` records a known
    /// document, `None` records a confirmed absence. The first write for a
    /// key wins, so priming a key that already resolved is a no-op.
    pub fn prime(
        &self,
        collection: &'static str,
        field: &'static str,
        key: S::Key,
        doc: Option<S::Doc>,
    ) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(GroupKey { collection, field }, key, doc.into());
    }

    /// Three-state cache lookup: `None` means the key has not been resolved
    /// this request; `Some(CacheEntry::Absent)` means it resolved to no
    /// document.
    pub fn cached(
        &self,
        collection: &'static str,
        field: &'static str,
        key: &S::Key,
    ) -> Option<CacheEntry<S::Doc>> {
        let cache = self.cache.lock().unwrap();
        cache.get(GroupKey { collection, field }, key).cloned()
    }

    /// Tear the context down: every outstanding load is rejected with
    /// [`LoadError::Cancelled`], groups still accumulating are dropped
    /// without their bulk fetch ever being issued, and any later `load`
    /// call fails immediately. Idempotent.
    ///
    /// Dropping the context does the same thing.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut registry = self.groups.lock().unwrap();
        registry.open.clear();
        for (group, weak) in registry.live.drain(..) {
            if let Some(handle) = weak.upgrade() {
                if let Ok(mut state) = handle.lock() {
                    state.cancel(group);
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl<'a, S: DocumentSource, W, Delay> Drop for RequestContext<'a, S, W, Delay> {
    fn drop(&mut self) {
        self.cancel();
    }
}
