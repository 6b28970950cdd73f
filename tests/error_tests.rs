//! These tests cover the failure contract: atomic batch failure, no failure
//! caching, synchronous rejection of invalid keys, and isolation between
//! groups.

use std::future::{self, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use cooked_waker::{IntoWaker, Wake, WakeRef};
use docloader::{BatchQuery, DocumentSource, LoadError, LoaderRules, RequestContext};
use futures::{executor, FutureExt};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("database down")]
struct DbDown;

/// Fails every bulk query, counting attempts.
struct Unreachable<'c> {
    calls: &'c AtomicUsize,
}

impl DocumentSource for Unreachable<'_> {
    type Key = usize;
    type Doc = String;
    type Error = DbDown;
    type Fetch = Ready<Result<Vec<(usize, String)>, DbDown>>;

    fn find_many(&self, _query: BatchQuery<usize>) -> Self::Fetch {
        self.calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Err(DbDown))
    }
}

/// Fails the first bulk query, then recovers.
struct Flaky<'c> {
    calls: &'c AtomicUsize,
}

impl DocumentSource for Flaky<'_> {
    type Key = usize;
    type Doc = String;
    type Error = DbDown;
    type Fetch = Ready<Result<Vec<(usize, String)>, DbDown>>;

    fn find_many(&self, query: BatchQuery<usize>) -> Self::Fetch {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            future::ready(Err(DbDown))
        } else {
            future::ready(Ok(query
                .keys
                .iter()
                .map(|&key| (key, key.to_string()))
                .collect()))
        }
    }
}

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// A failed batch fails atomically: every waiter gets the same error, with
/// the batch's collection, field, and affected keys attached.
#[test]
fn every_waiter_receives_the_batch_failure() {
    let calls = AtomicUsize::new(0);
    let rules = LoaderRules {
        source: Unreachable { calls: &calls },
        window: || future::ready(()),
        max_batch: None,
    };
    let ctx = RequestContext::new(&rules);

    let fut1 = ctx.load("posts", "_id", 1);
    let fut2 = ctx.load("posts", "_id", 2);
    let fut3 = ctx.load("posts", "_id", 2);

    // The flush set is unordered, so the error's key list is checked
    // sorted.
    let check = |result: Result<Option<String>, LoadError<usize, DbDown>>| match result {
        Err(LoadError::FetchFailed {
            collection,
            field,
            mut keys,
            source,
        }) => {
            keys.sort_unstable();
            assert_eq!(collection, "posts");
            assert_eq!(field, "_id");
            assert_eq!(keys, [1, 2]);
            assert_eq!(source, DbDown);
        }
        other => panic!("expected a fetch failure, got {other:?}"),
    };

    check(executor::block_on(fut1));
    check(executor::block_on(fut2));
    check(executor::block_on(fut3));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failures_are_not_cached() {
    let calls = AtomicUsize::new(0);
    let rules = LoaderRules {
        source: Flaky { calls: &calls },
        window: || future::ready(()),
        max_batch: None,
    };
    let ctx = RequestContext::new(&rules);

    assert!(executor::block_on(ctx.load("posts", "_id", 1)).is_err());

    // The retry joins a fresh group and gets a fresh attempt.
    assert_eq!(
        executor::block_on(ctx.load("posts", "_id", 1)),
        Ok(Some("1".to_string()))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invalid_keys_are_rejected_synchronously() {
    let calls = AtomicUsize::new(0);

    struct Table<'c> {
        calls: &'c AtomicUsize,
    }

    impl DocumentSource for Table<'_> {
        type Key = String;
        type Doc = String;
        type Error = DbDown;
        type Fetch = Ready<Result<Vec<(String, String)>, DbDown>>;

        fn find_many(&self, query: BatchQuery<String>) -> Self::Fetch {
            self.calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(query
                .keys
                .iter()
                .map(|key| (key.clone(), key.to_uppercase()))
                .collect()))
        }
    }

    let rules = LoaderRules {
        source: Table { calls: &calls },
        window: || future::ready(()),
        max_batch: None,
    };
    let ctx = RequestContext::new(&rules);

    let waker = NoOpWaker.into_waker();
    let mut poll_ctx = Context::from_waker(&waker);

    // The empty id never joins a batch; the very first poll rejects it.
    let mut bad = ctx.load("posts", "_id", String::new());
    assert_eq!(
        bad.poll_unpin(&mut poll_ctx),
        Poll::Ready(Err(LoadError::InvalidKey {
            collection: "posts",
            field: "_id",
        }))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A valid load through the same context is unaffected.
    assert_eq!(
        executor::block_on(ctx.load("posts", "_id", "p1".to_string())),
        Ok(Some("P1".to_string()))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// One group's failure never leaks into another group's results.
#[test]
fn failures_stay_within_their_group() {
    let calls = AtomicUsize::new(0);

    struct PostsAreDown<'c> {
        calls: &'c AtomicUsize,
    }

    impl DocumentSource for PostsAreDown<'_> {
        type Key = usize;
        type Doc = String;
        type Error = DbDown;
        type Fetch = Ready<Result<Vec<(usize, String)>, DbDown>>;

        fn find_many(&self, query: BatchQuery<usize>) -> Self::Fetch {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.collection == "posts" {
                future::ready(Err(DbDown))
            } else {
                future::ready(Ok(query
                    .keys
                    .iter()
                    .map(|&key| (key, key.to_string()))
                    .collect()))
            }
        }
    }

    let rules = LoaderRules {
        source: PostsAreDown { calls: &calls },
        window: || future::ready(()),
        max_batch: None,
    };
    let ctx = RequestContext::new(&rules);

    let post = ctx.load("posts", "_id", 1);
    let comment = ctx.load("comments", "_id", 1);

    assert!(executor::block_on(post).is_err());
    assert_eq!(executor::block_on(comment), Ok(Some("1".to_string())));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn errors_name_the_collection_and_field() {
    let err: LoadError<i32, DbDown> = LoadError::FetchFailed {
        collection: "posts",
        field: "_id",
        keys: vec![1, 2, 3],
        source: DbDown,
    };
    assert_eq!(
        err.to_string(),
        "bulk fetch of 3 key(s) from posts._id failed: database down"
    );

    let err: LoadError<i32, DbDown> = LoadError::Cancelled {
        collection: "comments",
        field: "postId",
    };
    assert_eq!(
        err.to_string(),
        "request cancelled before comments.postId load completed"
    );
}
