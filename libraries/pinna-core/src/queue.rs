//! Named work queues.
//!
//! A [`Queue`] is where work runs and where continuations are delivered. Runtime
//! queues own a multi-threaded tokio runtime whose threads carry the queue's
//! name; the inline queue runs work on whichever thread hands it over.

use crate::error::{Error, Result};
use lru::LruCache;
use once_cell::sync::Lazy;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

/// Name of the catch-all queue handed out by [`QueueManager::common_queue`].
pub const COMMON_QUEUE_NAME: &str = "pinna.common";

/// Default upper limit of queues a [`QueueManager`] keeps alive.
pub const DEFAULT_MAX_QUEUES: usize = 10;

/// Default number of worker threads per managed queue.
pub const DEFAULT_WORKERS_PER_QUEUE: usize = 4;

enum Executor {
    Inline,
    Runtime(Handle),
}

struct Inner {
    name: String,
    executor: Executor,
    // Only queues created through `Queue::new` own their runtime.
    runtime: Option<Runtime>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(queue = %self.name, "Shutting down queue");
            // The last handle may be dropped from one of the queue's own threads.
            runtime.shutdown_background();
        }
    }
}

/// A dispatch target for work and continuations.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Create a named queue backed by `workers` threads.
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(name.clone())
            .enable_all()
            .build()
            .map_err(|e| Error::Queue(format!("Failed to start queue {}: {}", name, e)))?;

        debug!(queue = %name, workers = workers.max(1), "Started queue");

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                executor: Executor::Runtime(runtime.handle().clone()),
                runtime: Some(runtime),
            }),
        })
    }

    /// A queue that runs work immediately on the calling thread.
    pub fn inline() -> Self {
        Self {
            inner: Arc::new(Inner {
                name: "inline".to_string(),
                executor: Executor::Inline,
                runtime: None,
            }),
        }
    }

    /// Wrap an existing runtime handle without taking ownership of the runtime.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                executor: Executor::Runtime(handle),
                runtime: None,
            }),
        }
    }

    /// The queue the caller is running on.
    ///
    /// Inside a tokio runtime (including its blocking threads) this is that
    /// runtime; anywhere else it is the inline queue.
    pub fn current() -> Self {
        match Handle::try_current() {
            Ok(handle) => Self::from_handle("current", handle),
            Err(_) => Self::inline(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.inner.executor, Executor::Inline)
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run a blocking job on the queue.
    ///
    /// Jobs on runtime queues run on the runtime's blocking pool, so they may
    /// block (including calling `Promise::wait`).
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner.executor {
            Executor::Inline => job(),
            Executor::Runtime(handle) => {
                handle.spawn_blocking(job);
            }
        }
    }

    /// Spawn async work on the queue.
    ///
    /// The inline queue borrows the caller's runtime and fails outside one.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.inner.executor {
            Executor::Runtime(handle) => Ok(handle.spawn(future)),
            Executor::Inline => Handle::try_current()
                .map(|handle| handle.spawn(future))
                .map_err(|_| {
                    Error::Queue("inline queue cannot run async work outside a runtime".into())
                }),
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("inline", &self.is_inline())
            .finish()
    }
}

/// A bounded collection of named queues.
///
/// Asking for the same name twice returns the same queue while it stays in
/// the cache. Least recently used queues are evicted once the limit is hit;
/// an evicted queue keeps running for as long as someone holds it.
pub struct QueueManager {
    queues: Mutex<LruCache<String, Queue>>,
    workers_per_queue: usize,
}

static SHARED: Lazy<QueueManager> =
    Lazy::new(|| QueueManager::new(DEFAULT_MAX_QUEUES, DEFAULT_WORKERS_PER_QUEUE));

impl QueueManager {
    pub fn new(max_queues: usize, workers_per_queue: usize) -> Self {
        let capacity = NonZeroUsize::new(max_queues).unwrap_or(NonZeroUsize::MIN);
        Self {
            queues: Mutex::new(LruCache::new(capacity)),
            workers_per_queue,
        }
    }

    /// Process-wide manager, created on first use.
    pub fn shared() -> &'static QueueManager {
        &SHARED
    }

    /// Find or create the queue called `name`.
    pub fn queue_named(&self, name: &str) -> Result<Queue> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let queue = Queue::new(name, self.workers_per_queue)?;
        if let Some((evicted, _)) = queues.push(name.to_string(), queue.clone()) {
            if evicted != name {
                debug!(queue = %evicted, "Evicted queue from cache");
            }
        }
        Ok(queue)
    }

    /// Catch-all queue for short background tasks.
    pub fn common_queue(&self) -> Result<Queue> {
        self.queue_named(COMMON_QUEUE_NAME)
    }

    /// Number of queues currently cached.
    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_inline_queue_runs_on_caller() {
        let queue = Queue::inline();
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        queue.execute(move || tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn test_named_queue_threads_carry_name() {
        let queue = Queue::new("pinna.test.named", 2).unwrap();
        let (tx, rx) = mpsc::channel();
        queue.execute(move || {
            tx.send(std::thread::current().name().map(str::to_string))
                .unwrap();
        });
        assert_eq!(rx.recv().unwrap().as_deref(), Some("pinna.test.named"));
    }

    #[test]
    fn test_current_outside_runtime_is_inline() {
        assert!(Queue::current().is_inline());
    }

    #[test]
    fn test_current_inside_queue_is_runtime() {
        let queue = Queue::new("pinna.test.current", 1).unwrap();
        let (tx, rx) = mpsc::channel();
        queue.execute(move || tx.send(Queue::current().is_inline()).unwrap());
        assert!(!rx.recv().unwrap());
    }

    #[test]
    fn test_inline_spawn_outside_runtime_fails() {
        let result = Queue::inline().spawn(async {});
        assert!(matches!(result, Err(Error::Queue(_))));
    }

    #[test]
    fn test_manager_reuses_and_evicts() {
        let manager = QueueManager::new(2, 1);
        let first = manager.queue_named("a").unwrap();
        let again = manager.queue_named("a").unwrap();
        assert!(first.same_queue(&again));

        manager.queue_named("b").unwrap();
        manager.queue_named("c").unwrap();
        assert_eq!(manager.len(), 2);

        // "a" was least recently used and has been evicted
        let recreated = manager.queue_named("a").unwrap();
        assert!(!first.same_queue(&recreated));
    }

    #[test]
    fn test_common_queue_is_stable() {
        let manager = QueueManager::new(DEFAULT_MAX_QUEUES, 1);
        let a = manager.common_queue().unwrap();
        let b = manager.common_queue().unwrap();
        assert!(a.same_queue(&b));
        assert_eq!(a.name(), COMMON_QUEUE_NAME);
    }
}
