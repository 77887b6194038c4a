//! Promises with Promises/A+ settlement semantics.
//!
//! A [`Promise`] starts out pending and settles exactly once, either fulfilled
//! with a value or rejected with a reason. Handlers registered with
//! [`Promise::then`] and friends never run synchronously: they are handed to
//! the [`Scheduler`] of the promise's [`Runtime`] and run in registration
//! order once the promise settles.
//!
//! Values a promise is resolved with go through the resolution procedure:
//! plain values fulfil, promises of this crate are adopted and foreign
//! [`Thenable`]s are unwrapped recursively.
//!
//! # Examples
//!
//! ```
//! use promise_core::{Error, MicrotaskQueue, Promise, Runtime, Status};
//!
//! let queue = MicrotaskQueue::new();
//! let rt = Runtime::new(queue.clone());
//!
//! let promise = Promise::<i32, Error>::new(&rt, |resolver| {
//!     resolver.fulfill(20);
//!     Ok(())
//! })
//! .then(|v| Ok(v + 1))
//! .then(|v| Ok(v * 2));
//!
//! assert_eq!(promise.status(), Status::Pending);
//! queue.run_until_idle();
//! assert_eq!(promise.value(), Some(42));
//! ```
//!
//! With a [`ThreadScheduler`] the handlers run on a worker thread and a
//! promise can simply be awaited:
//!
//! ```
//! use promise_core::{Error, Resolution, Runtime, ThreadScheduler};
//! use futures::executor::block_on;
//!
//! let rt = Runtime::new(ThreadScheduler::builder().spawn().unwrap());
//! let all = rt.all::<_, Error, _>(vec![
//!     Resolution::Value(1),
//!     rt.resolve(Resolution::Value(2)).into(),
//! ]);
//! assert_eq!(block_on(all), Ok(vec![1, 2]));
//! ```
use std::any::Any;

pub mod deferred;
pub mod promise;
pub mod resolution;
pub mod runtime;
pub mod scheduler;

pub use deferred::{Deferred, Resolver};
pub use promise::{Promise, Status};
pub use resolution::{thenable, Resolution, Resolvers, ThenFn, ThenMember, Thenable};
pub use runtime::Runtime;
pub use scheduler::{MicrotaskQueue, Scheduler, Task, ThreadScheduler, ThreadSchedulerBuilder};

/// Failures the core itself produces and injects into rejection reasons.
///
/// Reason types other than `Error` must implement `From<Error>` so these can
/// reach them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A promise was resolved with itself, directly or through a thenable
    /// chain that loops back.
    #[error("chaining cycle detected for promise")]
    ChainingCycle,
    /// An `on_fulfilled`, `on_rejected` or `on_finally` handler panicked.
    #[error("handler failed: {0}")]
    HandlerFailure(String),
    /// Reading or invoking a thenable's `then` member panicked.
    #[error("thenable access failed: {0}")]
    ThenableAccessFailure(String),
    /// The executor passed to [`Promise::new`] panicked.
    #[error("executor failed: {0}")]
    ExecutorFailure(String),
    /// A rejection reason supplied by the caller.
    #[error("{0}")]
    Rejected(String),
}

impl Error {
    /// A caller-supplied rejection reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}

/// Extracts the message from a payload returned by `catch_unwind`.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}
