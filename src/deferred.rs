//! Settling a promise from the outside.
//!
//! A [`Resolver`] is the capability to settle one promise. The executor of
//! [`Promise::new`](crate::Promise::new) receives one; a [`Deferred`] bundles
//! one with its promise for code that settles imperatively.
use crate::{Error, Promise, Resolution, Runtime};
use std::fmt;

/// The `resolve`/`reject` capability of a single promise.
///
/// Cloneable and `Send`, so it can be moved to whichever thread produces the
/// value. Only the first settlement has any effect.
///
/// # Examples
///
/// ```
/// use promise_core::{Error, Promise, Runtime, ThreadScheduler};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let rt = Runtime::new(ThreadScheduler::builder().spawn().unwrap());
/// let promise = Promise::<String, Error>::new(&rt, |resolver| {
///     thread::spawn(move || resolver.fulfill("🍓".into()));
///     Ok(())
/// });
/// assert_eq!(block_on(promise), Ok("🍓".to_string()));
/// ```
pub struct Resolver<T, E = Error> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.promise.id())
            .finish()
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    pub(crate) fn new(promise: Promise<T, E>) -> Self {
        Self { promise }
    }

    /// Resolves the promise with `value`.
    ///
    /// A promise or thenable is adopted: the promise settles when it does.
    /// Until then the promise stays pending and another call may still
    /// settle it first. Resolving a promise with itself rejects it with
    /// [`Error::ChainingCycle`].
    pub fn resolve(&self, value: Resolution<T, E>) {
        self.promise.resolve(value);
    }

    pub fn fulfill(&self, value: T) {
        self.promise.resolve(Resolution::Value(value));
    }

    pub fn reject(&self, reason: E) {
        self.promise.reject(reason);
    }

    /// Whether the promise is still pending.
    pub fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }
}

/// A promise together with the [`Resolver`] that settles it.
///
/// # Examples
///
/// ```
/// use promise_core::{Error, MicrotaskQueue, Runtime};
///
/// let queue = MicrotaskQueue::new();
/// let rt = Runtime::new(queue.clone());
/// let deferred = rt.deferred::<i32, Error>();
/// let doubled = deferred.promise.then(|v| Ok(v * 2));
/// deferred.fulfill(21);
/// deferred.reject(Error::rejected("ignored"));
/// queue.run_until_idle();
/// assert_eq!(doubled.value(), Some(42));
/// ```
pub struct Deferred<T, E = Error> {
    pub promise: Promise<T, E>,
    resolver: Resolver<T, E>,
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("promise", &self.promise)
            .finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    pub fn new(runtime: &Runtime) -> Self {
        let promise = Promise::pending(runtime);
        let resolver = Resolver::new(promise.clone());
        Self { promise, resolver }
    }

    pub fn resolve(&self, value: Resolution<T, E>) {
        self.resolver.resolve(value);
    }

    pub fn fulfill(&self, value: T) {
        self.resolver.fulfill(value);
    }

    pub fn reject(&self, reason: E) {
        self.resolver.reject(reason);
    }

    pub fn resolver(&self) -> Resolver<T, E> {
        self.resolver.clone()
    }

    /// Splits into the promise and its resolver.
    pub fn into_parts(self) -> (Promise<T, E>, Resolver<T, E>) {
        (self.promise, self.resolver)
    }
}
