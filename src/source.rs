//! The storage-layer seam: the bulk-query primitive that batched loads
//! flush into.

use std::future::Future;

use crate::key::DocumentKey;

/// One flushed batch: every unique key that was pending for a single
/// (collection, field) group when its window closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuery<K> {
    /// Collection the documents live in.
    pub collection: &'static str,
    /// Indexed field being matched against `keys`.
    pub field: &'static str,
    /// Unique keys, in arbitrary order.
    pub keys: Vec<K>,
}

/// The bulk-fetch primitive supplied by the storage layer.
///
/// [`find_many`] is the moral equivalent of
/// `db.collection.find({ field: { $in: keys } })`: return every document
/// whose indexed field matches one of the batch's keys, tagged with the key
/// value it matched. Tagging is the source's job because only it knows how
/// to read the field off a document; partitioning results back to the
/// waiting futures (including confirming which keys matched nothing) is
/// the loader's.
///
/// Keys that match no document are simply omitted from the result. A failed
/// fetch fails the whole batch; there is no partial success.
///
/// The returned future is stored and driven inside the load group, which is
/// why it is a named associated type rather than a boxed trait object.
///
/// [`find_many`]: DocumentSource::find_many
pub trait DocumentSource {
    type Key: DocumentKey;
    type Doc: Clone;
    type Error: Clone;
    type Fetch: Future<Output = Result<Vec<(Self::Key, Self::Doc)>, Self::Error>>;

    fn find_many(&self, query: BatchQuery<Self::Key>) -> Self::Fetch;
}
