//! Request promises.
//!
//! A [`RequestPromise`] is a [`Promise`] whose work is one HTTP request,
//! backed by a cache manager:
//!
//! ```text
//! fire()
//!   │
//!   ├─ cancelled? ──────────────────────────────> Error(Cancelled)
//!   │
//!   ├─ offline + use_cache_when_offline + cached?
//!   │     cached_data(id) ── Some ──> post-process ──> realize
//!   │                     ── Err ───> remove_cache(id), Error(CannotLoadCache)
//!   │
//!   └─ preflight ──> transport (+ auth challenges) ──> record response
//!         │
//!         ├─ non-2xx ──────────────────────────> Error(Status)
//!         ├─ ETag == cached revision (opt-in) ─> Error(Unchanged)
//!         ├─ cache(body, id, ETag or synthetic revision)
//!         └─ post-process ─────────────────────> realize
//! ```
//!
//! The request runs as an async task on the promise's request queue; cache
//! I/O runs on that runtime's blocking pool.

use crate::activity::{ActivityGuard, ActivityObserver, RequestInfo, RequestOutcome};
use crate::auth::{
    AuthenticationChallenge, AuthenticationHandler, ChallengeResponse, ProtectionSpace,
    DEFAULT_MAX_AUTHENTICATION_ATTEMPTS,
};
use crate::connectivity::ConnectivityMonitor;
use crate::post_processor::{PostProcessContext, PostProcessor};
use crate::request::{HttpResponse, RequestDescriptor};
use crate::transport::{ReqwestTransport, Transport, TransportResponse};
use bytes::Bytes;
use pinna_cache::CacheManager;
use pinna_core::{Error, Possibility, Promise, PromiseState, Queue, Result};
use reqwest::StatusCode;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Transform applied to the request right before it is sent.
pub type Preflight = Arc<dyn Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync>;

struct RequestInner<T> {
    request: RequestDescriptor,
    queue: Queue,
    post_processor: PostProcessor<Bytes, T>,
    cache_manager: Option<Arc<dyn CacheManager>>,
    use_cache_when_offline: bool,
    cancel_when_remote_data_unchanged: bool,
    connectivity: Arc<ConnectivityMonitor>,
    preflight: Option<Preflight>,
    authentication_handler: Option<Arc<dyn AuthenticationHandler>>,
    max_authentication_attempts: u32,
    activity_observer: Option<Arc<dyn ActivityObserver>>,
    transport: Arc<dyn Transport>,
    cancelled: AtomicBool,
    task: Mutex<Option<AbortHandle>>,
    response: Mutex<Option<HttpResponse>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run blocking cache I/O off the async workers.
async fn blocking<R: Send + 'static>(job: impl FnOnce() -> R + Send + 'static) -> Result<R> {
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| Error::Queue(format!("cache task failed: {}", e)))
}

impl<T: Clone + Send + 'static> RequestInner<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The promise's work: schedule the request on the request queue.
    fn start(self: &Arc<Self>, promise: Promise<T>) {
        if self.is_cancelled() {
            promise.try_reject(Error::Cancelled);
            return;
        }

        let inner = Arc::clone(self);
        let task_promise = promise.clone();
        match self.queue.spawn(async move { inner.run(task_promise).await }) {
            Ok(handle) => {
                *lock(&self.task) = Some(handle.abort_handle());
            }
            Err(error) => {
                warn!(url = %self.request.url, error = %error, "Cannot schedule request");
                promise.try_reject(error);
                return;
            }
        }

        // A cancel that raced the spawn found no task to abort
        if self.is_cancelled() {
            self.abort(&promise);
        }
    }

    fn abort(&self, promise: &Promise<T>) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        promise.try_reject(Error::Cancelled);
    }

    async fn run(self: Arc<Self>, promise: Promise<T>) {
        let identifier = promise.cache_identifier();
        let info = RequestInfo::new(
            promise.name(),
            self.request.method.clone(),
            self.request.url.clone(),
            identifier.clone(),
        );
        let mut activity = ActivityGuard::start(self.activity_observer.clone(), info);

        let (result, outcome) = self.execute(identifier.as_deref()).await;
        activity.finish(match &result {
            Err(_) if self.is_cancelled() => RequestOutcome::Cancelled,
            Err(Error::Unchanged { .. }) => RequestOutcome::Unchanged,
            Err(Error::Cancelled) => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::Failed,
            Ok(_) => outcome,
        });
        // Observers see the request finish before continuations run
        drop(activity);

        if self.is_cancelled() {
            promise.try_reject(Error::Cancelled);
            return;
        }
        match result {
            Ok(value) => promise.try_accept(value),
            Err(error) => {
                if !error.is_cancellation() {
                    warn!(url = %self.request.url, error = %error, "Request failed");
                }
                promise.try_reject(error)
            }
        };
    }

    async fn execute(&self, identifier: Option<&str>) -> (Result<T>, RequestOutcome) {
        let cache = self
            .cache_manager
            .as_ref()
            .zip(identifier)
            .map(|(cache, identifier)| (Arc::clone(cache), identifier.to_string()));

        if let Some((cache, identifier)) = &cache {
            if self.use_cache_when_offline && !self.connectivity.is_connected() {
                match self.load_offline(cache, identifier).await {
                    Some(result) => return (result, RequestOutcome::Cache),
                    None => debug!(identifier = %identifier, "Nothing cached while offline, trying network"),
                }
            }
        }

        (self.load_remote(cache).await, RequestOutcome::Network)
    }

    /// Serve the request from the cache. `None` when nothing is cached.
    async fn load_offline(&self, cache: &Arc<dyn CacheManager>, identifier: &str) -> Option<Result<T>> {
        if self.is_cancelled() {
            return Some(Err(Error::Cancelled));
        }

        debug!(identifier = %identifier, "Offline, loading from cache");
        let read = {
            let (cache, identifier) = (Arc::clone(cache), identifier.to_string());
            blocking(move || cache.cached_data(&identifier)).await
        };

        match read {
            Ok(Ok(Some(data))) => Some(self.post_process(data, None, Some(identifier))),
            Ok(Ok(None)) => None,
            Ok(Err(error)) => {
                warn!(identifier = %identifier, error = %error, "Cached data unreadable, removing it");
                let (cache, id) = (Arc::clone(cache), identifier.to_string());
                match blocking(move || cache.remove_cache(&id)).await {
                    Ok(Err(e)) => warn!(identifier = %identifier, error = %e, "Cannot remove cache"),
                    Err(e) => warn!(identifier = %identifier, error = %e, "Cannot remove cache"),
                    Ok(Ok(())) => {}
                }
                Some(Err(error.into_load_error(identifier)))
            }
            Err(error) => Some(Err(error)),
        }
    }

    async fn load_remote(&self, cache: Option<(Arc<dyn CacheManager>, String)>) -> Result<T> {
        let identifier = cache.as_ref().map(|(_, identifier)| identifier.as_str());

        let request = match &self.preflight {
            Some(preflight) => preflight(self.request.clone())?,
            None => self.request.clone(),
        };

        debug!(method = %request.method, url = %request.url, "Sending request");
        let TransportResponse { response, body } = self
            .send_authenticated(request)
            .await
            .map_err(|e| e.with_cache_identifier(identifier))?;

        *lock(&self.response) = Some(response.clone());

        if !response.is_success() {
            return Err(Error::Status {
                status: response.status.as_u16(),
                identifier: identifier.map(str::to_string),
            });
        }

        if let Some((cache, identifier)) = &cache {
            self.store(cache, identifier, &response, &body).await?;
        }

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.post_process(body, Some(&response), identifier)
    }

    /// Persist a fresh response, or report that it matches the cache.
    async fn store(
        &self,
        cache: &Arc<dyn CacheManager>,
        identifier: &str,
        response: &HttpResponse,
        body: &Bytes,
    ) -> Result<()> {
        let revision = match response.revision() {
            Some(revision) => {
                if self.cancel_when_remote_data_unchanged {
                    let previous = {
                        let (cache, identifier) = (Arc::clone(cache), identifier.to_string());
                        blocking(move || cache.revision_for(&identifier)).await?
                    };
                    if previous.as_deref() == Some(revision) {
                        debug!(identifier = %identifier, revision = %revision, "Remote data unchanged");
                        return Err(Error::Unchanged {
                            identifier: identifier.to_string(),
                        });
                    }
                }
                revision.to_string()
            }
            // Without an ETag the entry can only serve offline reads; a
            // throwaway revision never matches on the next fetch.
            None if self.use_cache_when_offline => uuid::Uuid::new_v4().to_string(),
            None => {
                trace!(identifier = %identifier, "No revision and no offline use, not caching");
                return Ok(());
            }
        };

        let write = {
            let (cache, identifier, body, revision) =
                (Arc::clone(cache), identifier.to_string(), body.clone(), revision.clone());
            blocking(move || cache.cache(&body, &identifier, &revision)).await?
        };
        if let Err(error) = write {
            let error = error.into_write_error(identifier);
            warn!(identifier = %identifier, error = %error, "Removing entry after failed write");
            let (cache, id) = (Arc::clone(cache), identifier.to_string());
            if let Ok(Err(e)) = blocking(move || cache.remove_cache(&id)).await {
                warn!(identifier = %identifier, error = %e, "Cannot remove cache");
            }
        }
        Ok(())
    }

    async fn send_authenticated(&self, mut request: RequestDescriptor) -> Result<TransportResponse> {
        let mut failures = 0;
        loop {
            let result = self.transport.send(&request).await?;
            if result.response.status != StatusCode::UNAUTHORIZED {
                return Ok(result);
            }

            let Some(handler) = &self.authentication_handler else {
                return Ok(result);
            };
            let Some(space) = ProtectionSpace::from_response(&result.response) else {
                return Ok(result);
            };
            if failures >= self.max_authentication_attempts
                || !handler.can_authenticate(&request, &space)
            {
                return Ok(result);
            }

            let challenge = AuthenticationChallenge {
                protection_space: space,
                previous_failure_count: failures,
                failure_response: result.response.clone(),
            };
            match handler.handle_challenge(&request, &challenge) {
                ChallengeResponse::UseCredential(credential) => {
                    debug!(
                        host = %challenge.protection_space.host,
                        scheme = %challenge.protection_space.scheme,
                        attempt = failures + 1,
                        "Answering authentication challenge"
                    );
                    credential.apply(&mut request.headers)?;
                    failures += 1;
                }
                ChallengeResponse::PerformDefaultHandling => return Ok(result),
                ChallengeResponse::Cancel => return Err(Error::Cancelled),
            }
        }
    }

    fn post_process(
        &self,
        data: Bytes,
        response: Option<&HttpResponse>,
        identifier: Option<&str>,
    ) -> Result<T> {
        let context = PostProcessContext {
            request: &self.request,
            response,
            cache_identifier: identifier,
        };
        match (self.post_processor)(Possibility::Value(data), &context) {
            Possibility::Value(value) => Ok(value),
            Possibility::Error(error) => Err(error),
            Possibility::Empty => Err(Error::NoValue),
        }
    }
}

/// A promise realized by performing one HTTP request.
///
/// Cloning yields another handle to the same request.
pub struct RequestPromise<T> {
    promise: Promise<T>,
    inner: Arc<RequestInner<T>>,
}

impl<T> Clone for RequestPromise<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> RequestPromise<T> {
    /// Start configuring a request promise.
    pub fn builder(
        request: RequestDescriptor,
        request_queue: Queue,
        post_processor: PostProcessor<Bytes, T>,
    ) -> RequestPromiseBuilder<T> {
        RequestPromiseBuilder {
            request,
            queue: request_queue,
            post_processor,
            cache_manager: None,
            use_cache_when_offline: None,
            cancel_when_remote_data_unchanged: false,
            connectivity: None,
            preflight: None,
            authentication_handler: None,
            max_authentication_attempts: DEFAULT_MAX_AUTHENTICATION_ATTEMPTS,
            activity_observer: None,
            transport: None,
            cache_identifier: None,
            name: None,
        }
    }

    /// A request promise without cache.
    pub fn new(
        request: RequestDescriptor,
        request_queue: Queue,
        post_processor: PostProcessor<Bytes, T>,
    ) -> Self {
        Self::builder(request, request_queue, post_processor).build()
    }

    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    pub fn request(&self) -> &RequestDescriptor {
        &self.inner.request
    }

    pub fn request_queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// The server's response, once one was received.
    ///
    /// Stays `None` when the request was served from the cache.
    pub fn response(&self) -> Option<HttpResponse> {
        lock(&self.inner.response).clone()
    }

    pub fn cache_manager(&self) -> Option<&Arc<dyn CacheManager>> {
        self.inner.cache_manager.as_ref()
    }

    pub fn use_cache_when_offline(&self) -> bool {
        self.inner.use_cache_when_offline
    }

    pub fn cancel_when_remote_data_unchanged(&self) -> bool {
        self.inner.cancel_when_remote_data_unchanged
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.connectivity
    }

    pub fn cache_identifier(&self) -> Option<String> {
        self.promise.cache_identifier()
    }

    pub fn set_cache_identifier(&self, identifier: Option<String>) {
        self.promise.set_cache_identifier(identifier);
    }

    pub fn name(&self) -> String {
        self.promise.name()
    }

    pub fn state(&self) -> PromiseState {
        self.promise.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Cancel the request.
    ///
    /// Before firing this makes `fire` realize with [`Error::Cancelled`]. While
    /// in flight the request task is aborted and the promise realizes with
    /// [`Error::Cancelled`] unless it already holds a result.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(url = %self.inner.request.url, name = %self.promise.name(), "Cancelling request");
        if lock(&self.inner.task).is_some() {
            self.inner.abort(&self.promise);
        }
    }

    /// Start the request if it has not started yet.
    pub fn fire(&self) {
        self.promise.fire();
    }

    /// See [`Promise::then`].
    pub fn then(
        &self,
        then: impl FnOnce(T) + Send + 'static,
        otherwise: impl FnOnce(Error) + Send + 'static,
    ) {
        self.promise.then(then, otherwise);
    }

    /// See [`Promise::then_on`].
    pub fn then_on(
        &self,
        then: impl FnOnce(T) + Send + 'static,
        otherwise: impl FnOnce(Error) + Send + 'static,
        queue: &Queue,
    ) {
        self.promise.then_on(then, otherwise, queue);
    }

    /// See [`Promise::wait`]. Must not be called from an async task.
    pub fn wait(&self) -> Result<T> {
        self.promise.wait()
    }

    pub async fn realized(&self) -> Result<T> {
        self.promise.realized().await
    }

    /// Read the cached payload through the post-processor, delivering the
    /// result to `callback` on `queue`.
    ///
    /// Does not realize the promise and ignores connectivity. Does nothing
    /// without a cache manager or cache identifier. An absent entry is
    /// delivered as whatever the post-processor makes of an empty input.
    pub fn load_cached_data_on(
        &self,
        queue: &Queue,
        callback: impl FnOnce(Possibility<T>) + Send + 'static,
    ) {
        let (Some(cache), Some(identifier)) =
            (self.inner.cache_manager.clone(), self.promise.cache_identifier())
        else {
            return;
        };

        let callback_queue = queue.clone();
        if self.is_cancelled() {
            callback_queue.execute(move || callback(Possibility::Error(Error::Cancelled)));
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.queue.execute(move || {
            let input = match cache.cached_data(&identifier) {
                Ok(Some(data)) => Possibility::Value(data),
                Ok(None) => Possibility::Empty,
                Err(error) => Possibility::Error(error.into_load_error(&identifier)),
            };
            let context = PostProcessContext {
                request: &inner.request,
                response: None,
                cache_identifier: Some(&identifier),
            };
            let output = (inner.post_processor)(input, &context);
            callback_queue.execute(move || callback(output));
        });
    }

    /// [`load_cached_data_on`](Self::load_cached_data_on) delivering on the
    /// caller's current queue.
    pub fn load_cached_data(&self, callback: impl FnOnce(Possibility<T>) + Send + 'static) {
        self.load_cached_data_on(&Queue::current(), callback);
    }
}

impl<T> fmt::Debug for RequestPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPromise")
            .field("promise", &self.promise)
            .field("method", &self.inner.request.method)
            .field("url", &self.inner.request.url.as_str())
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Configures a [`RequestPromise`].
pub struct RequestPromiseBuilder<T> {
    request: RequestDescriptor,
    queue: Queue,
    post_processor: PostProcessor<Bytes, T>,
    cache_manager: Option<Arc<dyn CacheManager>>,
    use_cache_when_offline: Option<bool>,
    cancel_when_remote_data_unchanged: bool,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    preflight: Option<Preflight>,
    authentication_handler: Option<Arc<dyn AuthenticationHandler>>,
    max_authentication_attempts: u32,
    activity_observer: Option<Arc<dyn ActivityObserver>>,
    transport: Option<Arc<dyn Transport>>,
    cache_identifier: Option<String>,
    name: Option<String>,
}

impl<T: Clone + Send + 'static> RequestPromiseBuilder<T> {
    /// Cache responses in `cache_manager`.
    ///
    /// The cache identifier defaults to the request URL.
    pub fn cache_manager(mut self, cache_manager: Option<Arc<dyn CacheManager>>) -> Self {
        self.cache_manager = cache_manager;
        self
    }

    /// Serve from the cache while offline. Defaults to `true`.
    pub fn use_cache_when_offline(mut self, use_cache_when_offline: bool) -> Self {
        self.use_cache_when_offline = Some(use_cache_when_offline);
        self
    }

    /// Realize with [`Error::Unchanged`] when the fetched revision matches
    /// the cached one.
    pub fn cancel_when_remote_data_unchanged(mut self, cancel: bool) -> Self {
        self.cancel_when_remote_data_unchanged = cancel;
        self
    }

    /// Defaults to [`ConnectivityMonitor::default_internet`].
    pub fn connectivity(mut self, connectivity: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn preflight(
        mut self,
        preflight: impl Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync + 'static,
    ) -> Self {
        self.preflight = Some(Arc::new(preflight));
        self
    }

    pub fn authentication_handler(mut self, handler: Option<Arc<dyn AuthenticationHandler>>) -> Self {
        self.authentication_handler = handler;
        self
    }

    pub fn max_authentication_attempts(mut self, attempts: u32) -> Self {
        self.max_authentication_attempts = attempts;
        self
    }

    pub fn activity_observer(mut self, observer: Option<Arc<dyn ActivityObserver>>) -> Self {
        self.activity_observer = observer;
        self
    }

    /// Defaults to the shared [`ReqwestTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.cache_identifier = Some(identifier.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> RequestPromise<T> {
        let cache_identifier = match (&self.cache_manager, self.cache_identifier) {
            (_, Some(identifier)) => Some(identifier),
            (Some(_), None) => Some(self.request.url.to_string()),
            (None, None) => None,
        };

        let inner = Arc::new(RequestInner {
            request: self.request,
            queue: self.queue,
            post_processor: self.post_processor,
            cache_manager: self.cache_manager,
            use_cache_when_offline: self.use_cache_when_offline.unwrap_or(true),
            cancel_when_remote_data_unchanged: self.cancel_when_remote_data_unchanged,
            connectivity: self
                .connectivity
                .unwrap_or_else(ConnectivityMonitor::default_internet),
            preflight: self.preflight,
            authentication_handler: self.authentication_handler,
            max_authentication_attempts: self.max_authentication_attempts,
            activity_observer: self.activity_observer,
            transport: self
                .transport
                .unwrap_or_else(|| ReqwestTransport::shared() as Arc<dyn Transport>),
            cancelled: AtomicBool::new(false),
            task: Mutex::new(None),
            response: Mutex::new(None),
        });

        let fire_inner = Arc::clone(&inner);
        let promise = Promise::deferred(move |promise| fire_inner.start(promise));
        if let Some(name) = self.name {
            promise.set_name(name);
        }
        promise.set_cache_identifier(cache_identifier);

        RequestPromise { promise, inner }
    }
}
