//! Error taxonomy for batched loads.

use thiserror::Error;

/// Errors delivered through a [`LoadFuture`](crate::LoadFuture).
///
/// `K` is the document key type and `E` the storage layer's own error type.
/// Both must be `Clone` because a single failed bulk fetch is delivered,
/// identically, to every waiter of that batch. Failures are never cached: a
/// later load of the same key joins a fresh group and gets a fresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<K, E> {
    /// The key failed [`DocumentKey::is_loadable`] and was rejected
    /// synchronously, without joining any batch.
    ///
    /// [`DocumentKey::is_loadable`]: crate::DocumentKey::is_loadable
    #[error("invalid key for {collection}.{field}: key is not loadable")]
    InvalidKey {
        collection: &'static str,
        field: &'static str,
    },

    /// The bulk query for one batch failed. The whole batch fails
    /// atomically; no waiter of that flush receives a value.
    #[error("bulk fetch of {} key(s) from {collection}.{field} failed: {source}", keys.len())]
    FetchFailed {
        collection: &'static str,
        field: &'static str,
        /// The unique keys of the failed batch, in arbitrary order.
        keys: Vec<K>,
        source: E,
    },

    /// The owning [`RequestContext`](crate::RequestContext) was cancelled or
    /// dropped before this load could be fulfilled. No bulk fetch is issued
    /// for a group that was still accumulating when its context went away.
    #[error("request cancelled before {collection}.{field} load completed")]
    Cancelled {
        collection: &'static str,
        field: &'static str,
    },
}
