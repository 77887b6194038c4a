//! The scheduler contract: defer a callback past the current synchronous
//! execution.
//!
//! Promises never run handlers inline. Every handler invocation is wrapped in
//! a [`Task`] and handed to [`Scheduler::defer`]. Implementations must run
//! tasks in submission order.
use crate::panic_message;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{trace, warn};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync + 'static {
    /// Queues `task` to run after the caller returns. Tasks deferred from the
    /// same thread run in the order they were deferred.
    ///
    /// `defer` must never run `task` before it returns. Promises call it
    /// while holding their own lock, and a task run inline would deadlock on
    /// that lock.
    fn defer(&self, task: Task);
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn defer(&self, task: Task) {
        (**self).defer(task)
    }
}

/// A FIFO queue of tasks that only runs when it is drained.
///
/// This is the deterministic scheduler: nothing happens until the owner calls
/// [`run_until_idle`](Self::run_until_idle), which makes it the natural choice
/// for single-threaded event loops and tests.
///
/// # Examples
///
/// ```
/// use promise_core::{MicrotaskQueue, Scheduler};
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// let queue = MicrotaskQueue::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let h = hits.clone();
/// queue.defer(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
/// assert_eq!(hits.load(Ordering::SeqCst), 0);
/// assert_eq!(queue.run_until_idle(), 1);
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Runs the oldest queued task. Returns `false` if the queue was empty.
    pub fn run_next(&self) -> bool {
        // The lock must be released before the task runs, tasks defer more tasks.
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks queued by the
    /// tasks being run. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        trace!(ran, "microtask queue idle");
        ran
    }
}

impl Scheduler for MicrotaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Settings for a [`ThreadScheduler`].
#[derive(Debug, Clone)]
pub struct ThreadSchedulerBuilder {
    name: String,
    stack_size: Option<usize>,
}

impl Default for ThreadSchedulerBuilder {
    fn default() -> Self {
        Self {
            name: "promise-scheduler".to_string(),
            stack_size: None,
        }
    }
}

impl ThreadSchedulerBuilder {
    /// Name of the worker thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Starts the worker thread.
    pub fn spawn(self) -> io::Result<ThreadScheduler> {
        let (sender, receiver) = channel::<Task>();
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let worker = builder.spawn(move || {
            for task in receiver {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    warn!(panic = %panic_message(payload), "scheduled task panicked");
                }
            }
            trace!("scheduler channel closed, worker exiting");
        })?;
        Ok(ThreadScheduler {
            name: self.name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

/// Runs deferred tasks one at a time, in order, on a dedicated thread.
///
/// Dropping the scheduler closes its channel; tasks already queued still run
/// and the worker is joined.
///
/// # Examples
///
/// ```
/// use promise_core::{Scheduler, ThreadScheduler};
/// use std::sync::mpsc::channel;
///
/// let scheduler = ThreadScheduler::builder().name("worker").spawn().unwrap();
/// let (tx, rx) = channel();
/// scheduler.defer(Box::new(move || tx.send(std::thread::current().name().map(String::from)).unwrap()));
/// assert_eq!(rx.recv().unwrap().as_deref(), Some("worker"));
/// ```
pub struct ThreadScheduler {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    pub fn builder() -> ThreadSchedulerBuilder {
        ThreadSchedulerBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Scheduler for ThreadScheduler {
    fn defer(&self, task: Task) {
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        };
        if !sent {
            warn!(scheduler = %self.name, "scheduler shut down, dropping task");
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            // The last handle may be released by a task running on the worker.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(scheduler = %self.name, "scheduler worker panicked");
            }
        }
    }
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("name", &self.name)
            .finish()
    }
}
