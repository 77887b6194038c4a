//! The handle promises are created on, and the module-level combinators.
use crate::{Deferred, Error, Promise, Resolution, Scheduler, Task};
use parking_lot::Mutex;
use std::{fmt, mem, sync::Arc};
use tracing::trace;

/// Owns the [`Scheduler`] that runs handlers.
///
/// Cheap to clone. Every promise remembers the runtime it was created on and
/// promises derived from it inherit that runtime.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(scheduler: impl Scheduler) -> Self {
        Self::from_shared(Arc::new(scheduler))
    }

    pub fn from_shared(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn defer(&self, task: Task) {
        self.scheduler.defer(task);
    }

    /// A promise resolved with `value`. Promises and thenables are adopted
    /// the same way a handler's return value is.
    pub fn resolve<T, E>(&self, value: Resolution<T, E>) -> Promise<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + From<Error> + 'static,
    {
        Promise::new(self, move |resolver| {
            resolver.resolve(value);
            Ok(())
        })
    }

    /// A promise already rejected with `reason`.
    pub fn reject<T, E>(&self, reason: E) -> Promise<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + From<Error> + 'static,
    {
        Promise::new(self, move |resolver| {
            resolver.reject(reason);
            Ok(())
        })
    }

    pub fn deferred<T, E>(&self) -> Deferred<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + From<Error> + 'static,
    {
        Deferred::new(self)
    }

    /// Fulfils with every item's value, in input order, once all of them
    /// have fulfilled. Rejects with the first rejection.
    ///
    /// An empty input fulfils with an empty vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_core::{Error, MicrotaskQueue, Resolution, Runtime};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let rt = Runtime::new(queue.clone());
    /// let late = rt.deferred::<i32, Error>();
    /// let all = rt.all(vec![
    ///     Resolution::Value(1),
    ///     rt.resolve(Resolution::Value(2)).into(),
    ///     late.promise.clone().into(),
    /// ]);
    /// queue.run_until_idle();
    /// late.fulfill(3);
    /// queue.run_until_idle();
    /// assert_eq!(all.value(), Some(vec![1, 2, 3]));
    /// ```
    pub fn all<T, E, I>(&self, items: I) -> Promise<Vec<T>, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + From<Error> + 'static,
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let items: Vec<_> = items.into_iter().collect();
        Promise::new(self, move |resolver| {
            let total = items.len();
            if total == 0 {
                resolver.fulfill(Vec::new());
                return Ok(());
            }
            let results = Arc::new(Mutex::new(Collected {
                slots: vec![None; total],
                remaining: total,
            }));
            for (index, item) in items.into_iter().enumerate() {
                let results = results.clone();
                let on_fulfilled = resolver.clone();
                let on_rejected = resolver.clone();
                self.resolve(item).subscribe(
                    move |value| {
                        let complete = {
                            let mut results = results.lock();
                            results.slots[index] = Some(value);
                            results.remaining -= 1;
                            if results.remaining == 0 {
                                Some(mem::take(&mut results.slots))
                            } else {
                                None
                            }
                        };
                        if let Some(slots) = complete {
                            trace!(items = total, "all items fulfilled");
                            on_fulfilled.fulfill(slots.into_iter().flatten().collect());
                        }
                    },
                    move |reason| on_rejected.reject(reason),
                );
            }
            Ok(())
        })
    }

    /// Settles like whichever item settles first.
    ///
    /// An empty input never settles.
    pub fn race<T, E, I>(&self, items: I) -> Promise<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + From<Error> + 'static,
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        Promise::new(self, move |resolver| {
            for item in items {
                let on_fulfilled = resolver.clone();
                let on_rejected = resolver.clone();
                self.resolve(item).subscribe(
                    move |value| on_fulfilled.fulfill(value),
                    move |reason| on_rejected.reject(reason),
                );
            }
            Ok(())
        })
    }
}

struct Collected<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}
