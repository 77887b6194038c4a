//! The resolution procedure: what happens when a promise is resolved with a
//! value that may itself be promise-like.
//!
//! Plain values fulfil the target. Promises of this crate are adopted by
//! subscribing the target to their outcome. Foreign [`Thenable`]s are probed
//! for a callable `then` member which is handed a pair of one-shot
//! [`Resolvers`].
use crate::{panic_message, Error, Promise};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, trace};

/// Anything a promise can be resolved with.
pub enum Resolution<T, E = Error> {
    /// A plain value. Fulfils the target as is.
    Value(T),
    /// A promise of this crate, whose eventual outcome is adopted.
    Promise(Promise<T, E>),
    /// A foreign promise-like object.
    Thenable(Arc<dyn Thenable<T, E>>),
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(&promise.id()).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// The `then` member of a thenable, once invoked.
pub type ThenFn<T, E> = Box<dyn FnOnce(Resolvers<T, E>) -> Result<(), E> + Send>;

/// Result of reading a thenable's `then` member.
pub enum ThenMember<T, E = Error> {
    Callable(ThenFn<T, E>),
    /// The object has a `then` member but it cannot be called. The target is
    /// fulfilled with the object's plain value instead.
    NotCallable(T),
}

/// A foreign promise-like object.
///
/// Reading the member may fail; both an `Err` and a panic reject the target,
/// unless the `then` already fired one of its resolvers.
pub trait Thenable<T, E = Error>: Send + Sync {
    fn then_member(&self) -> Result<ThenMember<T, E>, E>;
}

/// The `resolve`/`reject` pair handed to a thenable's `then`.
///
/// Both halves share a single guard: only the first call of either one has
/// any effect, so thenables that call back twice, or call both, are
/// tolerated.
pub struct Resolvers<T, E = Error> {
    target: Promise<T, E>,
    called: Arc<AtomicBool>,
}

impl<T, E> Clone for Resolvers<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            called: self.called.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolvers<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolvers")
            .field("target", &self.target.id())
            .field("called", &self.is_called())
            .finish()
    }
}

impl<T, E> Resolvers<T, E> {
    /// Whether either half has already fired.
    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        let claimed = self
            .called
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            debug!(promise = self.target.id(), "thenable fired more than once, ignoring");
        }
        claimed
    }
}

impl<T, E> Resolvers<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    fn new(target: Promise<T, E>) -> Self {
        Self {
            target,
            called: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-enters the resolution procedure with `value`.
    pub fn resolve(&self, value: Resolution<T, E>) {
        if self.claim() {
            resolve_promise(&self.target, value);
        }
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value));
    }

    pub fn reject(&self, reason: E) {
        if self.claim() {
            self.target.reject(reason);
        }
    }
}

struct FnThenable<F>(Arc<F>);

impl<T, E, F> Thenable<T, E> for FnThenable<F>
where
    F: Fn(Resolvers<T, E>) -> Result<(), E> + Send + Sync + 'static,
{
    fn then_member(&self) -> Result<ThenMember<T, E>, E> {
        let then = self.0.clone();
        Ok(ThenMember::Callable(Box::new(move |resolvers| then(resolvers))))
    }
}

/// Wraps a closure as a thenable whose `then` member is always callable.
///
/// # Examples
///
/// ```
/// use promise_core::{thenable, Error, MicrotaskQueue, Runtime};
///
/// let queue = MicrotaskQueue::new();
/// let rt = Runtime::new(queue.clone());
/// let promise = rt.resolve::<i32, Error>(thenable(|resolvers| {
///     resolvers.fulfill(5);
///     Ok(())
/// }));
/// queue.run_until_idle();
/// assert_eq!(promise.value(), Some(5));
/// ```
pub fn thenable<T, E, F>(then: F) -> Resolution<T, E>
where
    T: 'static,
    E: 'static,
    F: Fn(Resolvers<T, E>) -> Result<(), E> + Send + Sync + 'static,
{
    Resolution::Thenable(Arc::new(FnThenable(Arc::new(then))))
}

/// Settles `target` according to `x`.
pub(crate) fn resolve_promise<T, E>(target: &Promise<T, E>, x: Resolution<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    match x {
        Resolution::Value(value) => target.fulfill(value),
        Resolution::Promise(other) if other.ptr_eq(target) => {
            debug!(promise = target.id(), "chaining cycle detected");
            target.reject(Error::ChainingCycle.into());
        }
        Resolution::Promise(other) => {
            trace!(promise = target.id(), adopted = other.id(), "adopting promise");
            other.relay_to(target.clone());
        }
        Resolution::Thenable(object) => unwrap_thenable(target, object),
    }
}

fn unwrap_thenable<T, E>(target: &Promise<T, E>, object: Arc<dyn Thenable<T, E>>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    let resolvers = Resolvers::new(target.clone());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), E> {
        match object.then_member()? {
            ThenMember::Callable(then) => then(resolvers.clone()),
            ThenMember::NotCallable(value) => {
                target.fulfill(value);
                Ok(())
            }
        }
    }));
    let reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(reason)) => reason,
        Err(payload) => {
            let message = panic_message(payload);
            debug!(promise = target.id(), panic = %message, "thenable panicked");
            Error::ThenableAccessFailure(message).into()
        }
    };
    resolvers.reject(reason);
}
