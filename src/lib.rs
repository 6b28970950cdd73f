//! Docloader is a request-scoped batching document loader, in the spirit of
//! the [dataloader pattern](https://github.com/graphql/dataloader) that
//! GraphQL servers use to tame resolver fan-out. Many independent
//! "fetch the document where `field == key` from `collection`" requests,
//! issued while serving one inbound request, are coalesced into one bulk
//! query per (collection, field) pair; results are cached for the rest of
//! the request and handed back to each caller individually.
//!
//! The classic symptom this solves: a page of fifty posts resolves an
//! author for each one, and a naive resolver turns that into fifty point
//! queries. With a loader threaded through the request, the fifty
//! `load("users", "_id", post.author_id)` calls made in one resolution pass
//! become a single `find users where _id in [...]`, and a second pass over
//! the same authors costs nothing at all.
//!
//! ## Overview
//!
//! The storage layer plugs in through the [`DocumentSource`] trait: one
//! method, [`find_many`], which answers a whole [`BatchQuery`] at once and
//! tags each returned document with the key it matched.
//!
//! ```
//! use std::collections::HashMap;
//! use std::future::{self, Ready};
//!
//! use docloader::{BatchQuery, DocumentSource};
//!
//! /// An in-memory stand-in for the posts table.
//! struct Posts {
//!     by_id: HashMap<String, &'static str>,
//! }
//!
//! impl DocumentSource for Posts {
//!     type Key = String;
//!     type Doc = &'static str;
//!     type Error = String;
//!     type Fetch = Ready<Result<Vec<(String, &'static str)>, String>>;
//!
//!     fn find_many(&self, query: BatchQuery<String>) -> Self::Fetch {
//!         future::ready(Ok(query
//!             .keys
//!             .iter()
//!             .filter_map(|key| self.by_id.get(key).map(|doc| (key.clone(), *doc)))
//!             .collect()))
//!     }
//! }
//! ```
//!
//! A [`RequestContext`] is constructed per inbound request from a set of
//! [`LoaderRules`]: the source, a *window* (an async closure defining how
//! long a group stays open collecting keys), and an optional key cap. The
//! context is explicitly created and explicitly dropped; it is never a
//! process-wide singleton, so nothing one request caches can leak into the
//! next.
//!
//! ```
//! # use std::collections::HashMap;
//! # use std::future::{self, Ready};
//! # use docloader::{BatchQuery, DocumentSource};
//! # struct Posts { by_id: HashMap<String, &'static str> }
//! # impl DocumentSource for Posts {
//! #     type Key = String;
//! #     type Doc = &'static str;
//! #     type Error = String;
//! #     type Fetch = Ready<Result<Vec<(String, &'static str)>, String>>;
//! #     fn find_many(&self, query: BatchQuery<String>) -> Self::Fetch {
//! #         future::ready(Ok(query
//! #             .keys
//! #             .iter()
//! #             .filter_map(|key| self.by_id.get(key).map(|doc| (key.clone(), *doc)))
//! #             .collect()))
//! #     }
//! # }
//! use docloader::{LoaderRules, RequestContext};
//!
//! let rules = LoaderRules {
//!     source: Posts {
//!         by_id: HashMap::from([("p1".to_string(), "first post")]),
//!     },
//!     // Close the window on the first poll: coalesce exactly the loads
//!     // issued in one synchronous pass.
//!     window: || future::ready(()),
//!     max_batch: None,
//! };
//!
//! let ctx = RequestContext::new(&rules);
//!
//! // Same tick, same (collection, field): one bulk query for both keys.
//! let post = ctx.load("posts", "_id", "p1".to_string());
//! let missing = ctx.load("posts", "_id", "p2".to_string());
//!
//! assert_eq!(futures::executor::block_on(post), Ok(Some("first post")));
//! assert_eq!(futures::executor::block_on(missing), Ok(None));
//!
//! // "p2" resolved to a confirmed absence, which is itself cached: asking
//! // again costs no query.
//! assert_eq!(
//!     futures::executor::block_on(ctx.load("posts", "_id", "p2".to_string())),
//!     Ok(None),
//! );
//! ```
//!
//! [`load`] returns a [`LoadFuture`] resolving to
//! `Result<Option<Doc>, LoadError>`: `Ok(Some(doc))` for a match,
//! `Ok(None)` for a confirmed miss, and [`LoadError`] for an invalid key, a
//! failed bulk fetch (delivered identically to every waiter of that batch),
//! or a cancelled context. [`load_many`] is the bulk convenience, yielding
//! one result per input key in input order.
//!
//! ## Design notes
//!
//! ### Request scoping
//!
//! Everything stateful (the result cache and the registry of open groups)
//! hangs off one [`RequestContext`]. Cache entries are immutable once set
//! and never evicted; their lifetime is bounded by the request, which is
//! what makes a cache with no invalidation story correct here. Tearing the
//! context down (explicit [`cancel`], or drop) rejects every outstanding
//! load and discards accumulating groups without issuing their bulk fetch.
//!
//! ### Poll-driven batching
//!
//! No background tasks and no executor coupling: the window future and the
//! bulk fetch are driven entirely by polls of the waiting [`LoadFuture`]s.
//! The group tracks a single *driving* waker, the waiter that most
//! recently polled, and only wakes the rest when results are ready, or
//! when the driver is dropped and another waiter must take over. The flush
//! point is therefore explicit and deterministic: a group flushes when its
//! window future completes, not when some runtime's task queue happens to
//! drain.
//!
//! ### Absence is an answer
//!
//! A key that matches no document resolves to `Ok(None)` and is cached that
//! way ([`CacheEntry::Absent`]). Repeated lookups of a confirmed-absent key
//! short-circuit without re-querying, and a key is never left unresolved by
//! a flush.
//!
//! [`load`]: RequestContext::load
//! [`load_many`]: RequestContext::load_many
//! [`cancel`]: RequestContext::cancel
//! [`find_many`]: DocumentSource::find_many

mod cache;
mod context;
mod error;
mod group;
mod key;
mod source;
mod wakers;

pub use cache::CacheEntry;
pub use context::{LoaderRules, RequestContext};
pub use error::LoadError;
pub use group::{LoadFuture, LoadMany};
pub use key::DocumentKey;
pub use source::{BatchQuery, DocumentSource};
