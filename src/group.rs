//! The shared state machine behind one load group, and the futures that
//! drive it.
//!
//! A group moves through three states. While `Accum`ulating, new loads for
//! the same (collection, field) join the key set and the window future runs.
//! When the window closes (or the key cap is hit), whichever waiter polls
//! next freezes the key set, starts the bulk fetch, and the group is
//! `Running`. When the fetch resolves, results land in the request cache and
//! the group is `Done`; every waiter is woken to collect its own key's
//! entry.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::error::LoadError;
use crate::key::{GroupKey, KeyBatch};
use crate::source::{BatchQuery, DocumentSource};
use crate::wakers::{WaiterSet, WaiterToken};

pub(crate) type SharedGroup<'a, S, Delay> = Arc<Mutex<GroupState<'a, S, Delay>>>;
pub(crate) type SharedCache<S> =
    Arc<Mutex<ResultCache<<S as DocumentSource>::Key, <S as DocumentSource>::Doc>>>;

pub(crate) struct AccumState<'a, S: DocumentSource, Delay> {
    pub(crate) batch: KeyBatch<S::Key>,
    pub(crate) source: &'a S,
    pub(crate) delay: Option<Delay>,
    pub(crate) waiters: WaiterSet,
}

pub(crate) struct RunningState<S: DocumentSource> {
    /// The frozen flush set; used to partition fetched rows and to confirm
    /// absences for keys that matched nothing.
    keys: Vec<S::Key>,
    fetch: S::Fetch,
    waiters: WaiterSet,
}

pub(crate) enum GroupState<'a, S: DocumentSource, Delay> {
    Accum(AccumState<'a, S, Delay>),
    Running(RunningState<S>),
    Done(Result<(), LoadError<S::Key, S::Error>>),
}

impl<'a, S: DocumentSource, Delay> GroupState<'a, S, Delay> {
    /// Force the group into its terminal state with a cancellation error and
    /// wake everyone still parked on it. An accumulating group dies without
    /// its bulk fetch ever being issued; a running group's fetch is dropped.
    pub(crate) fn cancel(&mut self, group: GroupKey) {
        let waiters = match self {
            GroupState::Accum(state) => mem::take(&mut state.waiters),
            GroupState::Running(state) => mem::take(&mut state.waiters),
            GroupState::Done(..) => return,
        };

        // The assignment destructs the replaced state in place, which is
        // what the pin contract for a Running fetch future requires.
        *self = GroupState::Done(Err(LoadError::Cancelled {
            collection: group.collection,
            field: group.field,
        }));

        waiters.wake_all();
    }
}

/// Upsert this future's waker into the group's waiter set, making it the
/// driver. Free function rather than a method so the borrows stay
/// field-disjoint at the call sites.
fn park(slot: &mut Option<WaiterToken>, waiters: &mut WaiterSet, waker: &Waker) {
    match slot {
        Some(token) => waiters.repark(token, waker),
        None => *slot = Some(waiters.park(waker.clone())),
    }
}

/// The pending handle returned by [`RequestContext::load`]. Resolves with
/// `Ok(Some(doc))`, `Ok(None)` for a confirmed miss, or a [`LoadError`].
///
/// Fulfillment is exactly-once: either immediately (cache hit, invalid key,
/// cancelled context) or when this future's group completes its single bulk
/// fetch. Dropping the future before then withdraws its key from the flush
/// set if no other waiter wants it.
///
/// [`RequestContext::load`]: crate::RequestContext::load
pub struct LoadFuture<'a, S: DocumentSource, Delay> {
    inner: Inner<'a, S, Delay>,
}

enum Inner<'a, S: DocumentSource, Delay> {
    /// Resolved at load() time, without joining any group.
    Immediate(Option<Result<Option<S::Doc>, LoadError<S::Key, S::Error>>>),
    /// Waiting on a shared group.
    Waiting(PendingLoad<'a, S, Delay>),
}

struct PendingLoad<'a, S: DocumentSource, Delay> {
    key: S::Key,
    group: GroupKey,
    state: Option<SharedGroup<'a, S, Delay>>,
    cache: SharedCache<S>,
    waiter: Option<WaiterToken>,
}

impl<'a, S: DocumentSource, Delay> LoadFuture<'a, S, Delay> {
    pub(crate) fn immediate(result: Result<Option<S::Doc>, LoadError<S::Key, S::Error>>) -> Self {
        Self {
            inner: Inner::Immediate(Some(result)),
        }
    }

    pub(crate) fn waiting(
        key: S::Key,
        group: GroupKey,
        state: SharedGroup<'a, S, Delay>,
        cache: SharedCache<S>,
    ) -> Self {
        Self {
            inner: Inner::Waiting(PendingLoad {
                key,
                group,
                state: Some(state),
                cache,
                waiter: None,
            }),
        }
    }
}

impl<'a, S, Delay> Future for LoadFuture<'a, S, Delay>
where
    S: DocumentSource,
    Delay: Future<Output = ()>,
{
    type Output = Result<Option<S::Doc>, LoadError<S::Key, S::Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: no field of LoadFuture is structurally pinned. The window
        // and fetch futures live behind the group's Arc, not in here.
        let this = unsafe { self.get_unchecked_mut() };

        match &mut this.inner {
            Inner::Immediate(result) => {
                Poll::Ready(result.take().expect("polled a completed LoadFuture"))
            }
            Inner::Waiting(load) => load.poll(ctx),
        }
    }
}

impl<'a, S, Delay> PendingLoad<'a, S, Delay>
where
    S: DocumentSource,
    Delay: Future<Output = ()>,
{
    fn poll(
        &mut self,
        ctx: &mut Context<'_>,
    ) -> Poll<Result<Option<S::Doc>, LoadError<S::Key, S::Error>>> {
        let state_handle = self
            .state
            .as_ref()
            .expect("polled a completed LoadFuture");

        // The lock is held only for the duration of this poll, never across
        // a yield. If another waiter's poll panicked (in the window or the
        // fetch), the mutex is poisoned and this unwrap spreads the panic to
        // the rest of the group.
        let mut guard = state_handle.lock().unwrap();

        if let GroupState::Accum(state) = &mut *guard {
            if let Some(delay) = &mut state.delay {
                // Safety: the window future lives behind the Arc and is
                // never moved; the state assignment below destructs it in
                // place.
                let pinned = unsafe { Pin::new_unchecked(delay) };
                if pinned.poll(ctx).is_pending() {
                    park(&mut self.waiter, &mut state.waiters, ctx.waker());
                    return Poll::Pending;
                }
            }

            // The window has closed. Freeze the key set and start the bulk
            // fetch; from here on, new loads for this (collection, field)
            // open a fresh group.
            let keys = state.batch.take();
            let waiters = mem::take(&mut state.waiters);

            debug!(
                collection = self.group.collection,
                field = self.group.field,
                keys = keys.len(),
                "flushing load group"
            );

            let fetch = state.source.find_many(BatchQuery {
                collection: self.group.collection,
                field: self.group.field,
                keys: keys.clone(),
            });

            // The assignment destructs the window future in place, keeping
            // the pin contract.
            *guard = GroupState::Running(RunningState {
                keys,
                fetch,
                waiters,
            });
        }

        if let GroupState::Running(state) = &mut *guard {
            // Safety: the fetch future is never moved out of the Arc; every
            // transition replaces it by assignment, dropping it in place.
            let fetch = unsafe { Pin::new_unchecked(&mut state.fetch) };

            let result = match fetch.poll(ctx) {
                Poll::Pending => {
                    park(&mut self.waiter, &mut state.waiters, ctx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(result) => result,
            };

            let outcome = match result {
                Ok(rows) => {
                    // Every key in the flush set gets a cache entry, found
                    // or confirmed absent. Waiters read their own entry out
                    // of the cache once the group is Done.
                    self.cache
                        .lock()
                        .unwrap()
                        .store_batch(self.group, &state.keys, rows);
                    Ok(())
                }
                Err(source) => {
                    warn!(
                        collection = self.group.collection,
                        field = self.group.field,
                        keys = state.keys.len(),
                        "bulk fetch failed"
                    );
                    Err(LoadError::FetchFailed {
                        collection: self.group.collection,
                        field: self.group.field,
                        // The flush set has no other use once the fetch has
                        // failed; attach it to the error so callers can see
                        // which keys the fault covers.
                        keys: mem::take(&mut state.keys),
                        source,
                    })
                }
            };

            // Signal the other waiters that results are ready. This future
            // is about to take its result directly, so it skips itself.
            let waiters = mem::take(&mut state.waiters);
            match self.waiter.take() {
                Some(token) => waiters.wake_all_except(token),
                None => waiters.wake_all(),
            }

            *guard = GroupState::Done(outcome);
        }

        match &*guard {
            GroupState::Done(Ok(())) => {
                let entry = self
                    .cache
                    .lock()
                    .unwrap()
                    .get(self.group, &self.key)
                    .cloned();
                drop(guard);
                self.state = None;
                match entry {
                    Some(entry) => Poll::Ready(Ok(entry.into_option())),
                    // A live waiter's key is always in the flush set, and
                    // every flushed key gets an entry. Drop the guard first
                    // so the panic doesn't poison the group.
                    None => panic!("no cache entry for a key that was flushed"),
                }
            }
            GroupState::Done(Err(err)) => {
                let err = err.clone();
                drop(guard);
                self.state = None;
                Poll::Ready(Err(err))
            }
            _ => unreachable!("load group in a non-terminal state after poll"),
        }
    }
}

impl<'a, S: DocumentSource, Delay> Drop for LoadFuture<'a, S, Delay> {
    fn drop(&mut self) {
        // The group's shared work is only ever driven by one task at a
        // time. A dropped future must make sure someone else takes over in
        // case it was the driver; WaiterSet::abandon handles that.
        let Inner::Waiting(load) = &mut self.inner else {
            return;
        };
        let Some(state) = load.state.take() else {
            return;
        };
        // No cleanup if the mutex is poisoned; panic propagation to the
        // other waiters happens through their own polls.
        let Ok(mut guard) = state.lock() else {
            return;
        };

        match &mut *guard {
            GroupState::Accum(accum) => {
                if let Some(token) = load.waiter.take() {
                    accum.waiters.abandon(token);
                }
                // Withdraw interest in the key; a key with no remaining
                // waiters is removed from the flush set entirely.
                accum.batch.leave(&load.key);
            }
            GroupState::Running(running) => {
                if let Some(token) = load.waiter.take() {
                    running.waiters.abandon(token);
                }
                // The flush set is frozen. The fetched value still lands in
                // the request cache, where later loads can use it.
            }
            GroupState::Done(..) => {}
        }
    }
}

/// Future for [`RequestContext::load_many`]: one result per input key,
/// delivered in input order. Each entry resolves or fails independently, the
/// same way the corresponding single [`load`] would have.
///
/// [`RequestContext::load_many`]: crate::RequestContext::load_many
/// [`load`]: crate::RequestContext::load
pub struct LoadMany<'a, S: DocumentSource, Delay> {
    slots: Vec<ManySlot<'a, S, Delay>>,
}

enum ManySlot<'a, S: DocumentSource, Delay> {
    Waiting(LoadFuture<'a, S, Delay>),
    Finished(Result<Option<S::Doc>, LoadError<S::Key, S::Error>>),
    Taken,
}

impl<'a, S: DocumentSource, Delay> LoadMany<'a, S, Delay> {
    pub(crate) fn new(loads: Vec<LoadFuture<'a, S, Delay>>) -> Self {
        Self {
            slots: loads.into_iter().map(ManySlot::Waiting).collect(),
        }
    }
}

impl<'a, S, Delay> Future for LoadMany<'a, S, Delay>
where
    S: DocumentSource,
    Delay: Future<Output = ()>,
{
    type Output = Vec<Result<Option<S::Doc>, LoadError<S::Key, S::Error>>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: the slot vec is never resized after construction, so the
        // inner futures stay put; they are replaced only by assignment,
        // which drops them in place.
        let this = unsafe { self.get_unchecked_mut() };

        let mut pending = false;
        for slot in &mut this.slots {
            if let ManySlot::Waiting(load) = slot {
                match unsafe { Pin::new_unchecked(&mut *load) }.poll(ctx) {
                    Poll::Ready(result) => *slot = ManySlot::Finished(result),
                    Poll::Pending => pending = true,
                }
            }
        }

        if pending {
            return Poll::Pending;
        }

        Poll::Ready(
            this.slots
                .iter_mut()
                .map(|slot| match mem::replace(slot, ManySlot::Taken) {
                    ManySlot::Finished(result) => result,
                    _ => panic!("polled a completed LoadMany"),
                })
                .collect(),
        )
    }
}
