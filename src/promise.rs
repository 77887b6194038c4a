//! The settlement core.
//!
//! A [`Promise`] is a shared handle to a small state machine:
//!
//! ```text
//! Pending ──fulfill──▶ Fulfilled(value)
//!    │
//!    └────reject────▶ Rejected(reason)
//! ```
//!
//! The transition happens under the promise's lock, together with the drain
//! of the handler queue it selects, so the first `fulfill`/`reject` wins even
//! when producers race on several threads.
use crate::{
    panic_message,
    resolution::{resolve_promise, Resolution},
    Error, Resolver, Runtime,
};
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a promise is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

impl Status {
    /// `true` once the promise has settled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fulfilled => write!(f, "fulfilled"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

type FulfillCallback<T> = Box<dyn FnOnce(T) + Send>;
type RejectCallback<E> = Box<dyn FnOnce(E) + Send>;

struct Inner<T, E> {
    state: State<T, E>,
    fulfill_callbacks: Vec<FulfillCallback<T>>,
    reject_callbacks: Vec<RejectCallback<E>>,
    wakers: Vec<Waker>,
}

struct Shared<T, E> {
    id: u64,
    runtime: Runtime,
    inner: Mutex<Inner<T, E>>,
}

/// A value that is not known yet.
///
/// Cloning a `Promise` clones the handle, not the promise: both handles
/// observe the same settlement. Every `then`-style call returns a new,
/// distinct promise.
///
/// # Examples
///
/// ```
/// use promise_core::{Error, MicrotaskQueue, Promise, Runtime};
///
/// let queue = MicrotaskQueue::new();
/// let rt = Runtime::new(queue.clone());
/// let deferred = rt.deferred::<String, Error>();
/// let shout = deferred.promise.then(|s| Ok(s.to_uppercase()));
///
/// deferred.fulfill("hi".into());
/// queue.run_until_idle();
/// assert_eq!(shout.value().as_deref(), Some("HI"));
/// ```
pub struct Promise<T, E = Error> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    /// Process-unique identifier, used in log events.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The runtime whose scheduler runs this promise's handlers.
    pub fn runtime(&self) -> &Runtime {
        &self.shared.runtime
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq<U, F>(&self, other: &Promise<U, F>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.shared) as *const (),
            Arc::as_ptr(&other.shared) as *const (),
        )
    }

    pub fn status(&self) -> Status {
        match self.shared.inner.lock().state {
            State::Pending => Status::Pending,
            State::Fulfilled(_) => Status::Fulfilled,
            State::Rejected(_) => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.status().is_terminal()
    }
}

impl<T: Clone, E> Promise<T, E> {
    /// The fulfilment value, if fulfilled.
    pub fn value(&self) -> Option<T> {
        match &self.shared.inner.lock().state {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T, E: Clone> Promise<T, E> {
    /// The rejection reason, if rejected.
    pub fn reason(&self) -> Option<E> {
        match &self.shared.inner.lock().state {
            State::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// Creates a promise and runs `executor` synchronously with the
    /// [`Resolver`] that settles it.
    ///
    /// An executor that returns `Err` rejects the promise with that reason;
    /// one that panics rejects it with [`Error::ExecutorFailure`]. Either is
    /// ignored if the executor already settled the promise.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_core::{Error, MicrotaskQueue, Promise, Runtime};
    ///
    /// let rt = Runtime::new(MicrotaskQueue::new());
    /// let failed = Promise::<i32, Error>::new(&rt, |_| Err(Error::rejected("nope")));
    /// assert_eq!(failed.reason(), Some(Error::rejected("nope")));
    /// ```
    pub fn new<F>(runtime: &Runtime, executor: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let promise = Self::pending(runtime);
        let resolver = Resolver::new(promise.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| executor(resolver))) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => promise.reject(reason),
            Err(payload) => {
                let message = panic_message(payload);
                debug!(promise = promise.id(), panic = %message, "executor panicked");
                promise.reject(Error::ExecutorFailure(message).into());
            }
        }
        promise
    }

    pub(crate) fn pending(runtime: &Runtime) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        trace!(promise = id, "created");
        Self {
            shared: Arc::new(Shared {
                id,
                runtime: runtime.clone(),
                inner: Mutex::new(Inner {
                    state: State::Pending,
                    fulfill_callbacks: Vec::new(),
                    reject_callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Resolves through the resolution procedure. No-op once settled.
    pub(crate) fn resolve(&self, value: Resolution<T, E>) {
        if self.is_pending() {
            resolve_promise(self, value);
        }
    }

    pub(crate) fn fulfill(&self, value: T) {
        let wakers = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !matches!(inner.state, State::Pending) {
                trace!(promise = self.id(), "already settled, ignoring fulfillment");
                return;
            }
            inner.state = State::Fulfilled(value.clone());
            inner.reject_callbacks.clear();
            let callbacks = mem::take(&mut inner.fulfill_callbacks);
            trace!(promise = self.id(), handlers = callbacks.len(), "fulfilled");
            for callback in callbacks {
                callback(value.clone());
            }
            mem::take(&mut inner.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    pub(crate) fn reject(&self, reason: E) {
        let wakers = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !matches!(inner.state, State::Pending) {
                trace!(promise = self.id(), "already settled, ignoring rejection");
                return;
            }
            inner.state = State::Rejected(reason.clone());
            inner.fulfill_callbacks.clear();
            let callbacks = mem::take(&mut inner.reject_callbacks);
            trace!(promise = self.id(), handlers = callbacks.len(), "rejected");
            for callback in callbacks {
                callback(reason.clone());
            }
            mem::take(&mut inner.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    /// Registers a pair of callbacks that run through the scheduler once this
    /// promise settles, or right away (still deferred) if it already has.
    ///
    /// Callbacks are queued under the lock so handlers registered on the same
    /// promise are deferred in registration order.
    pub(crate) fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + Send + 'static,
        R: FnOnce(E) + Send + 'static,
    {
        let runtime = self.shared.runtime.clone();
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        match &inner.state {
            State::Pending => {
                let on_reject_runtime = runtime.clone();
                inner.fulfill_callbacks.push(Box::new(move |value| {
                    runtime.defer(Box::new(move || on_fulfilled(value)))
                }));
                inner.reject_callbacks.push(Box::new(move |reason| {
                    on_reject_runtime.defer(Box::new(move || on_rejected(reason)))
                }));
            }
            State::Fulfilled(value) => {
                let value = value.clone();
                runtime.defer(Box::new(move || on_fulfilled(value)));
            }
            State::Rejected(reason) => {
                let reason = reason.clone();
                runtime.defer(Box::new(move || on_rejected(reason)));
            }
        }
    }

    /// Settles `target` with this promise's outcome once it is known.
    pub(crate) fn relay_to(&self, target: Promise<T, E>) {
        let on_rejected = target.clone();
        self.subscribe(
            move |value| target.fulfill(value),
            move |reason| on_rejected.reject(reason),
        );
    }

    /// Registers both handlers and returns the promise they settle.
    ///
    /// Handlers always run later, through the scheduler, even when this
    /// promise has already settled. Whatever a handler returns is fed to the
    /// resolution procedure of the returned promise, so returning another
    /// promise or a thenable adopts its outcome. A handler returning `Err`
    /// rejects the returned promise with that reason; a panicking handler
    /// rejects it with [`Error::HandlerFailure`].
    pub fn chain<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        let derived = Promise::<U, E>::pending(&self.shared.runtime);
        let fulfilled_target = derived.clone();
        let rejected_target = derived.clone();
        trace!(promise = self.id(), derived = derived.id(), "handlers registered");
        self.subscribe(
            move |value| run_handler(&fulfilled_target, on_fulfilled, value),
            move |reason| run_handler(&rejected_target, on_rejected, reason),
        );
        derived
    }

    /// [`chain`](Self::chain) with the rejection passed through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        self.chain(on_fulfilled, Err)
    }

    /// [`chain`](Self::chain) with the value passed through unchanged.
    pub fn or_else<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
    {
        self.chain(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Maps the fulfilment value. Rejections pass through.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_core::{Error, MicrotaskQueue, Resolution, Runtime};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let rt = Runtime::new(queue.clone());
    /// let p = rt.resolve::<_, Error>(Resolution::Value(2)).then(|v| Ok(v * 21));
    /// queue.run_until_idle();
    /// assert_eq!(p.value(), Some(42));
    /// ```
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        self.and_then(move |value| on_fulfilled(value).map(Resolution::Value))
    }

    /// Handles a rejection. Fulfilment values pass through.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<T, E> + Send + 'static,
    {
        self.or_else(move |reason| on_rejected(reason).map(Resolution::Value))
    }

    /// Runs `on_finally` once this promise settles, whatever the outcome, and
    /// passes the outcome through.
    ///
    /// If `on_finally` fails, its error replaces the outcome.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T, E>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        self.finally_with(move || on_finally().map(Resolution::Value))
    }

    /// Like [`finally`](Self::finally), but `on_finally` may return a promise
    /// or thenable. The outcome passes through once it fulfils; if it
    /// rejects, its reason replaces the outcome.
    pub fn finally_with<X, F>(&self, on_finally: F) -> Promise<T, E>
    where
        X: Clone + Send + 'static,
        F: FnOnce() -> Result<Resolution<X, E>, E> + Send + 'static,
    {
        let on_finally = Arc::new(Mutex::new(Some(on_finally)));
        let on_reject_finally = on_finally.clone();
        let runtime = self.shared.runtime.clone();
        let on_reject_runtime = runtime.clone();
        self.chain(
            move |value| {
                let Some(on_finally) = on_finally.lock().take() else {
                    return Ok(Resolution::Value(value));
                };
                let cleanup = runtime.resolve(on_finally()?);
                Ok(Resolution::Promise(cleanup.then(move |_| Ok(value))))
            },
            move |reason| {
                let Some(on_finally) = on_reject_finally.lock().take() else {
                    return Err(reason);
                };
                let cleanup = on_reject_runtime.resolve(on_finally()?);
                Ok(Resolution::Promise(
                    cleanup.and_then(move |_| Err::<Resolution<T, E>, E>(reason)),
                ))
            },
        )
    }
}

/// Runs one handler and settles `target` with what it produced.
fn run_handler<A, U, E, H>(target: &Promise<U, E>, handler: H, argument: A)
where
    U: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
    H: FnOnce(A) -> Result<Resolution<U, E>, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| handler(argument))) {
        Ok(Ok(x)) => resolve_promise(target, x),
        Ok(Err(reason)) => {
            debug!(promise = target.id(), "handler failed");
            target.reject(reason);
        }
        Err(payload) => {
            let message = panic_message(payload);
            debug!(promise = target.id(), panic = %message, "handler failed");
            target.reject(Error::HandlerFailure(message).into());
        }
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MicrotaskQueue;
    use futures::executor::block_on;
    use std::thread;

    fn setup() -> (MicrotaskQueue, Runtime) {
        let queue = MicrotaskQueue::new();
        let rt = Runtime::new(queue.clone());
        (queue, rt)
    }

    #[test]
    fn test_executor_runs_synchronously() {
        let (_queue, rt) = setup();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let promise = Promise::<i32>::new(&rt, move |resolver| {
            *flag.lock() = true;
            resolver.fulfill(1);
            Ok(())
        });
        assert!(*ran.lock());
        assert_eq!(promise.status(), Status::Fulfilled);
        assert_eq!(promise.value(), Some(1));
        assert_eq!(promise.reason(), None);
    }

    #[test]
    fn test_executor_panic_rejects() {
        let (_queue, rt) = setup();
        let promise = Promise::<i32>::new(&rt, |_| panic!("executor blew up"));
        assert_eq!(
            promise.reason(),
            Some(Error::ExecutorFailure("executor blew up".into()))
        );
    }

    #[test]
    fn test_executor_error_after_resolve_is_ignored() {
        let (_queue, rt) = setup();
        let promise = Promise::<i32>::new(&rt, |resolver| {
            resolver.fulfill(1);
            Err(Error::rejected("too late"))
        });
        assert_eq!(promise.value(), Some(1));
    }

    #[test]
    fn test_settles_once() {
        let (_queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        promise.fulfill(1);
        promise.fulfill(2);
        promise.reject(Error::rejected("x"));
        assert_eq!(promise.status(), Status::Fulfilled);
        assert_eq!(promise.value(), Some(1));

        let promise = Promise::<i32>::pending(&rt);
        promise.reject(Error::rejected("first"));
        promise.fulfill(2);
        promise.reject(Error::rejected("second"));
        assert_eq!(promise.reason(), Some(Error::rejected("first")));
        assert_eq!(promise.value(), None);
    }

    #[test]
    fn test_then_returns_distinct_promise() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let a = promise.then(Ok);
        let b = promise.then(Ok);
        assert!(!a.ptr_eq(&promise));
        assert!(!a.ptr_eq(&b));
        assert!(promise.ptr_eq(&promise.clone()));
        promise.fulfill(3);
        queue.run_until_idle();
        assert_eq!(a.value(), Some(3));
        assert_eq!(b.value(), Some(3));
        assert_eq!(promise.value(), Some(3));
    }

    #[test]
    fn test_handlers_are_deferred_even_when_settled() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::new(&rt, |resolver| {
            resolver.fulfill(1);
            Ok(())
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let derived = promise.then(move |v| {
            l.lock().push("handler");
            Ok(v)
        });
        log.lock().push("after then");
        assert_eq!(derived.status(), Status::Pending);
        queue.run_until_idle();
        assert_eq!(*log.lock(), vec!["after then", "handler"]);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            promise.then(move |v| {
                log.lock().push(i);
                Ok(v)
            });
        }
        promise.fulfill(0);
        queue.run_until_idle();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_only_matching_queue_runs() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let rejected_ran = Arc::new(Mutex::new(false));
        let flag = rejected_ran.clone();
        promise.catch(move |reason| {
            *flag.lock() = true;
            Err(reason)
        });
        promise.fulfill(1);
        queue.run_until_idle();
        assert!(!*rejected_ran.lock());
    }

    #[test]
    fn test_rejection_passes_through_then() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let derived = promise.then(|v| Ok(v + 1)).then(|v| Ok(v * 2));
        promise.reject(Error::rejected("boom"));
        queue.run_until_idle();
        assert_eq!(derived.reason(), Some(Error::rejected("boom")));
    }

    #[test]
    fn test_value_passes_through_catch() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let derived = promise.catch(|_| Ok(0));
        promise.fulfill(8);
        queue.run_until_idle();
        assert_eq!(derived.value(), Some(8));
    }

    #[test]
    fn test_catch_recovers() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let derived = promise.catch(|_| Ok(-1)).then(|v| Ok(v * 10));
        promise.reject(Error::rejected("boom"));
        queue.run_until_idle();
        assert_eq!(derived.value(), Some(-10));
    }

    #[test]
    fn test_handler_error_rejects_derived() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let derived = promise.then(|_| Err::<i32, _>(Error::rejected("handler said no")));
        promise.fulfill(1);
        queue.run_until_idle();
        assert_eq!(derived.reason(), Some(Error::rejected("handler said no")));
    }

    #[test]
    fn test_handler_panic_rejects_derived() {
        let (queue, rt) = setup();
        let promise = Promise::<i32>::pending(&rt);
        let derived = promise.or_else(|_| panic!("handler blew up"));
        promise.reject(Error::rejected("x"));
        queue.run_until_idle();
        assert_eq!(
            derived.reason(),
            Some(Error::HandlerFailure("handler blew up".into()))
        );
    }

    #[test]
    fn test_handler_returning_promise_is_adopted() {
        let (queue, rt) = setup();
        let inner = Promise::<String>::pending(&rt);
        let adopted = inner.clone();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(1))
            .and_then(move |_| Ok(Resolution::Promise(adopted)));
        queue.run_until_idle();
        assert_eq!(derived.status(), Status::Pending);
        inner.fulfill("late".into());
        queue.run_until_idle();
        assert_eq!(derived.value().as_deref(), Some("late"));
    }

    #[test]
    fn test_handler_returning_its_own_promise_is_a_cycle() {
        let (queue, rt) = setup();
        let slot: Arc<Mutex<Option<Promise<i32>>>> = Arc::new(Mutex::new(None));
        let own = slot.clone();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(1))
            .and_then(move |_| match own.lock().take() {
                Some(promise) => Ok(Resolution::Promise(promise)),
                None => Ok(Resolution::Value(0)),
            });
        *slot.lock() = Some(derived.clone());
        queue.run_until_idle();
        assert_eq!(derived.reason(), Some(Error::ChainingCycle));
    }

    #[test]
    fn test_finally_passes_value() {
        let (queue, rt) = setup();
        let ran = Arc::new(Mutex::new(0));
        let count = ran.clone();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(7))
            .finally(move || {
                *count.lock() += 1;
                Ok(())
            });
        queue.run_until_idle();
        assert_eq!(*ran.lock(), 1);
        assert_eq!(derived.value(), Some(7));
    }

    #[test]
    fn test_finally_passes_reason() {
        let (queue, rt) = setup();
        let ran = Arc::new(Mutex::new(0));
        let count = ran.clone();
        let derived = rt.reject::<i32, Error>(Error::rejected("x")).finally(move || {
            *count.lock() += 1;
            Ok(())
        });
        queue.run_until_idle();
        assert_eq!(*ran.lock(), 1);
        assert_eq!(derived.reason(), Some(Error::rejected("x")));
    }

    #[test]
    fn test_finally_error_overrides() {
        let (queue, rt) = setup();
        let on_success = rt
            .resolve::<i32, Error>(Resolution::Value(7))
            .finally(|| Err(Error::rejected("cleanup failed")));
        let on_failure = rt
            .reject::<i32, Error>(Error::rejected("original"))
            .finally(|| Err(Error::rejected("cleanup failed")));
        queue.run_until_idle();
        assert_eq!(on_success.reason(), Some(Error::rejected("cleanup failed")));
        assert_eq!(on_failure.reason(), Some(Error::rejected("cleanup failed")));
    }

    #[test]
    fn test_finally_with_rejecting_promise_overrides() {
        let (queue, rt) = setup();
        let cleanup_rt = rt.clone();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(7))
            .finally_with(move || {
                Ok(Resolution::Promise(
                    cleanup_rt.reject::<(), Error>(Error::rejected("async cleanup failed")),
                ))
            });
        queue.run_until_idle();
        assert_eq!(
            derived.reason(),
            Some(Error::rejected("async cleanup failed"))
        );
    }

    #[test]
    fn test_finally_with_waits_for_cleanup() {
        let (queue, rt) = setup();
        let cleanup = Promise::<&'static str>::pending(&rt);
        let waiting_on = cleanup.clone();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(7))
            .finally_with(move || Ok(Resolution::Promise(waiting_on)));
        queue.run_until_idle();
        assert_eq!(derived.status(), Status::Pending);
        cleanup.fulfill("done");
        queue.run_until_idle();
        assert_eq!(derived.value(), Some(7));
    }

    #[test]
    fn test_finally_panic_is_handler_failure() {
        let (queue, rt) = setup();
        let derived = rt
            .resolve::<i32, Error>(Resolution::Value(7))
            .finally(|| panic!("cleanup panicked"));
        queue.run_until_idle();
        assert_eq!(
            derived.reason(),
            Some(Error::HandlerFailure("cleanup panicked".into()))
        );
    }

    #[test]
    fn test_await_settled_promise() {
        let (_queue, rt) = setup();
        let promise = rt.resolve::<i32, Error>(Resolution::Value(5));
        assert_eq!(block_on(promise), Ok(5));
        let promise = rt.reject::<i32, Error>(Error::rejected("x"));
        assert_eq!(block_on(promise), Err(Error::rejected("x")));
    }

    #[test]
    fn test_await_wakes_on_settlement_from_another_thread() {
        let (_queue, rt) = setup();
        let promise = Promise::<String>::pending(&rt);
        let producer = promise.clone();
        let task = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            producer.fulfill(String::from("🍓"));
        });
        assert_eq!(block_on(promise), Ok(String::from("🍓")));
        task.join().expect("The producer thread has panicked");
    }

    #[test]
    fn test_racing_producers_settle_once() {
        let (queue, rt) = setup();
        let promise = Promise::<usize>::pending(&rt);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        promise.then(move |v| {
            l.lock().push(v);
            Ok(v)
        });
        let producers: Vec<_> = (0..8)
            .map(|i| {
                let producer = promise.clone();
                thread::spawn(move || producer.fulfill(i))
            })
            .collect();
        for producer in producers {
            producer.join().expect("The producer thread has panicked");
        }
        queue.run_until_idle();
        let value = promise.value().unwrap();
        assert_eq!(*log.lock(), vec![value]);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Pending.to_string(), "pending");
        assert_eq!(Status::Fulfilled.to_string(), "fulfilled");
        assert_eq!(Status::Rejected.to_string(), "rejected");
        assert!(Status::Rejected.is_terminal());
        assert!(!Status::Pending.is_terminal());
    }
}
