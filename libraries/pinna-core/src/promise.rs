//! Single-assignment promises.
//!
//! A [`Promise`] starts unrealized and transitions exactly once to a value or
//! an error. Continuations registered with [`Promise::then_on`] are delivered
//! on the queue requested at registration time, in registration order: each
//! one is handed to its queue only after the previous one has returned.
//!
//! Work that produces the result is attached with [`Promise::deferred`] and
//! runs the first time somebody asks for the result.

use crate::error::{Error, Result};
use crate::possibility::Possibility;
use crate::queue::Queue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Name given to promises that were never named.
pub const ANONYMOUS_PROMISE_NAME: &str = "<anonymous>";

/// The state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    NotRealized,
    Value,
    Error,
}

type ThenFn<T> = Box<dyn FnOnce(T) + Send>;
type OtherwiseFn = Box<dyn FnOnce(Error) + Send>;
type FireFn<T> = Box<dyn FnOnce(Promise<T>) + Send>;

struct Continuation<T> {
    then: ThenFn<T>,
    otherwise: OtherwiseFn,
    queue: Queue,
}

enum Realization<T> {
    NotRealized,
    Value(T),
    Error(Error),
}

impl<T: Clone> Realization<T> {
    fn outcome(&self) -> Option<Result<T>> {
        match self {
            Realization::NotRealized => None,
            Realization::Value(value) => Some(Ok(value.clone())),
            Realization::Error(error) => Some(Err(error.clone())),
        }
    }
}

struct Shared<T> {
    realization: Realization<T>,
    continuations: VecDeque<Continuation<T>>,
    // Set while a continuation is in flight; the next one waits for it.
    delivering: bool,
    fire: Option<FireFn<T>>,
    name: String,
    cache_identifier: Option<String>,
}

/// A single-assignment future with registrable continuations.
///
/// Cloning a promise clones the handle; all clones observe the same state.
pub struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// An unrealized promise with no work attached.
    pub fn new() -> Self {
        Self::from_parts(ANONYMOUS_PROMISE_NAME.to_string(), None)
    }

    /// An unrealized promise with a diagnostic name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), None)
    }

    /// An unrealized promise whose result is produced by `fire`.
    ///
    /// `fire` runs at most once, the first time a continuation is attached or
    /// [`fire`](Self::fire) is called, and only if the promise is still
    /// unrealized at that point.
    pub fn deferred(fire: impl FnOnce(Promise<T>) + Send + 'static) -> Self {
        Self::from_parts(ANONYMOUS_PROMISE_NAME.to_string(), Some(Box::new(fire)))
    }

    /// A promise that already holds `value`.
    pub fn accepted(value: T) -> Self {
        let promise = Self::new();
        promise.accept(value);
        promise
    }

    /// A promise that already holds `error`.
    pub fn rejected(error: Error) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    fn from_parts(name: String, fire: Option<FireFn<T>>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                realization: Realization::NotRealized,
                continuations: VecDeque::new(),
                delivering: false,
                fire,
                name,
                cache_identifier: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- State ----

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
    }

    pub fn cache_identifier(&self) -> Option<String> {
        self.lock().cache_identifier.clone()
    }

    pub fn set_cache_identifier(&self, identifier: Option<String>) {
        self.lock().cache_identifier = identifier;
    }

    pub fn state(&self) -> PromiseState {
        match self.lock().realization {
            Realization::NotRealized => PromiseState::NotRealized,
            Realization::Value(_) => PromiseState::Value,
            Realization::Error(_) => PromiseState::Error,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.state() != PromiseState::NotRealized
    }

    /// The terminal outcome, or `None` while unrealized.
    pub fn outcome(&self) -> Option<Result<T>> {
        self.lock().realization.outcome()
    }

    // ---- Propagating values ----

    /// Realize the promise with a value and deliver it to every continuation.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already realized.
    pub fn accept(&self, value: T) {
        if let Err(name) = self.realize(Ok(value)) {
            panic!("promise `{}` accepted after it was already realized", name);
        }
    }

    /// Realize the promise with an error and deliver it to every continuation.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already realized.
    pub fn reject(&self, error: Error) {
        if let Err(name) = self.realize(Err(error)) {
            panic!("promise `{}` rejected after it was already realized", name);
        }
    }

    /// Accept unless already realized. Returns whether this call realized it.
    ///
    /// For producers that legitimately race each other, such as a request
    /// finishing while it is being cancelled.
    pub fn try_accept(&self, value: T) -> bool {
        self.realize(Ok(value)).is_ok()
    }

    /// Reject unless already realized. Returns whether this call realized it.
    pub fn try_reject(&self, error: Error) -> bool {
        self.realize(Err(error)).is_ok()
    }

    fn realize(&self, outcome: Result<T>) -> std::result::Result<(), String> {
        let (pending, name) = {
            let mut shared = self.lock();
            if !matches!(shared.realization, Realization::NotRealized) {
                return Err(shared.name.clone());
            }
            shared.realization = match outcome {
                Ok(value) => Realization::Value(value),
                Err(error) => Realization::Error(error),
            };
            shared.fire = None;
            shared.delivering = !shared.continuations.is_empty();
            (shared.continuations.len(), shared.name.clone())
        };

        trace!(promise = %name, continuations = pending, "Promise realized");
        if pending > 0 {
            deliver(Arc::clone(&self.shared));
        }
        Ok(())
    }

    // ---- Realizing ----

    /// Run the attached work if the promise is unrealized and has not fired yet.
    pub fn fire(&self) {
        let fire = {
            let mut shared = self.lock();
            match shared.realization {
                Realization::NotRealized => shared.fire.take(),
                _ => None,
            }
        };
        if let Some(fire) = fire {
            fire(self.clone());
        }
    }

    /// Register continuations delivered on the caller's current queue.
    ///
    /// See [`Queue::current`].
    pub fn then(
        &self,
        then: impl FnOnce(T) + Send + 'static,
        otherwise: impl FnOnce(Error) + Send + 'static,
    ) {
        self.then_on(then, otherwise, &Queue::current());
    }

    /// Register continuations delivered on `queue`.
    ///
    /// If the promise is already realized the matching continuation is
    /// scheduled on `queue` as soon as earlier continuations have returned;
    /// otherwise it waits for realization. Attaching fires the promise's work
    /// if it has not run yet.
    pub fn then_on(
        &self,
        then: impl FnOnce(T) + Send + 'static,
        otherwise: impl FnOnce(Error) + Send + 'static,
        queue: &Queue,
    ) {
        let continuation = Continuation {
            then: Box::new(then),
            otherwise: Box::new(otherwise),
            queue: queue.clone(),
        };

        let (realized, start) = {
            let mut shared = self.lock();
            shared.continuations.push_back(continuation);
            let realized = !matches!(shared.realization, Realization::NotRealized);
            let start = realized && !shared.delivering;
            if start {
                shared.delivering = true;
            }
            (realized, start)
        };

        if start {
            deliver(Arc::clone(&self.shared));
        } else if !realized {
            self.fire();
        }
    }

    /// Block the calling thread until the promise is realized.
    ///
    /// Fires the promise if needed. Safe to call from plain threads and from
    /// jobs running on a [`Queue`] (those run on blocking threads). Must not be
    /// called from inside an async task: the result may need that very worker
    /// thread to be produced. Use [`realized`](Self::realized) there instead.
    pub fn wait(&self) -> Result<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        let (tx, rx) = mpsc::channel();
        let error_tx = tx.clone();
        self.then_on(
            move |value| {
                let _ = tx.send(Ok(value));
            },
            move |error| {
                let _ = error_tx.send(Err(error));
            },
            &Queue::inline(),
        );
        rx.recv()
            .unwrap_or_else(|_| Err(Error::other("promise dropped before it was realized")))
    }

    /// Wait for the promise asynchronously.
    pub async fn realized(&self) -> Result<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let error_tx = Arc::clone(&tx);
        self.then_on(
            move |value| {
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(Ok(value));
                }
            },
            move |error| {
                if let Some(tx) = error_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(Err(error));
                }
            },
            &Queue::inline(),
        );
        rx.await
            .unwrap_or_else(|_| Err(Error::other("promise dropped before it was realized")))
    }
}

type SharedRef<T> = Arc<Mutex<Shared<T>>>;

fn next_continuation<T: Clone>(shared: &SharedRef<T>) -> Option<(Continuation<T>, Result<T>)> {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let next = match guard.realization.outcome() {
        Some(outcome) => guard.continuations.pop_front().map(|c| (c, outcome)),
        None => None,
    };
    if next.is_none() {
        guard.delivering = false;
    }
    next
}

fn run<T>(continuation: Continuation<T>, outcome: Result<T>) {
    match outcome {
        Ok(value) => (continuation.then)(value),
        Err(error) => (continuation.otherwise)(error),
    }
}

/// Hand pending continuations to their queues one at a time.
///
/// Inline continuations run right here; a runtime continuation resumes the
/// delivery from its queue once it returns.
fn deliver<T: Clone + Send + 'static>(mut shared: SharedRef<T>) {
    while let Some((continuation, outcome)) = next_continuation(&shared) {
        let relay = Relay {
            shared: Some(shared),
        };
        if continuation.queue.is_inline() {
            run(continuation, outcome);
            match relay.disarm() {
                Some(next) => shared = next,
                None => return,
            }
        } else {
            let queue = continuation.queue.clone();
            queue.execute(move || {
                let _relay = relay;
                run(continuation, outcome);
            });
            return;
        }
    }
}

/// Resumes delivery when dropped, including when a continuation panics or
/// its queue discards the job unrun.
struct Relay<T: Clone + Send + 'static> {
    shared: Option<SharedRef<T>>,
}

impl<T: Clone + Send + 'static> Relay<T> {
    fn disarm(mut self) -> Option<SharedRef<T>> {
        self.shared.take()
    }
}

impl<T: Clone + Send + 'static> Drop for Relay<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            deliver(shared);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let state = match shared.realization {
            Realization::NotRealized => PromiseState::NotRealized,
            Realization::Value(_) => PromiseState::Value,
            Realization::Error(_) => PromiseState::Error,
        };
        f.debug_struct("Promise")
            .field("name", &shared.name)
            .field("state", &state)
            .field("cache_identifier", &shared.cache_identifier)
            .finish()
    }
}

struct Collector<T> {
    slots: Mutex<Vec<Option<Possibility<T>>>>,
    remaining: AtomicUsize,
    aggregate: Promise<Vec<Possibility<T>>>,
}

impl<T: Clone + Send + 'static> Collector<T> {
    fn record(&self, index: usize, possibility: Possibility<T>) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(possibility);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let results = std::mem::take(&mut *self.slots.lock().unwrap_or_else(PoisonError::into_inner))
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect();
            self.aggregate.accept(results);
        }
    }
}

/// Realize every promise and collect one possibility per input, in input order.
///
/// The returned promise always succeeds; failures of individual promises
/// show up as error possibilities inside the collected vector. It completes
/// only after every input has reached a terminal state.
pub fn when_all<T: Clone + Send + 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<Possibility<T>>> {
    let aggregate = Promise::deferred(move |aggregate: Promise<Vec<Possibility<T>>>| {
        if promises.is_empty() {
            aggregate.accept(Vec::new());
            return;
        }

        let collector = Arc::new(Collector {
            slots: Mutex::new(vec![None; promises.len()]),
            remaining: AtomicUsize::new(promises.len()),
            aggregate,
        });

        for (index, promise) in promises.into_iter().enumerate() {
            let on_value = Arc::clone(&collector);
            let on_error = Arc::clone(&collector);
            promise.then_on(
                move |value| on_value.record(index, Possibility::Value(value)),
                move |error| on_error.record(index, Possibility::Error(error)),
                &Queue::inline(),
            );
        }
    });
    aggregate.set_name("when_all");
    aggregate
}
