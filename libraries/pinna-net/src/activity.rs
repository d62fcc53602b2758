//! Request activity tracking.
//!
//! Request promises report to an optional [`ActivityObserver`] when they start
//! and finish talking to the network or cache. [`ActivityTracker`] is an
//! observer that keeps a live view of what is in flight, for debugging and
//! for "busy" indicators.

use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;
use url::Url;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Description of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: u64,
    pub name: String,
    pub method: Method,
    pub url: Url,
    pub cache_identifier: Option<String>,
}

impl RequestInfo {
    /// Describe a request, assigning it a process-unique id.
    pub fn new(
        name: impl Into<String>,
        method: Method,
        url: Url,
        cache_identifier: Option<String>,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            method,
            url,
            cache_identifier,
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Answered by the server
    Network,
    /// Answered from the cache while offline
    Cache,
    /// The remote revision matched the cached one
    Unchanged,
    Cancelled,
    Failed,
}

/// Hook invoked as requests start and stop.
///
/// Called from request worker threads.
pub trait ActivityObserver: Send + Sync {
    fn request_started(&self, request: &RequestInfo);
    fn request_finished(&self, request: &RequestInfo, outcome: RequestOutcome);
}

/// Keeps count of ongoing activity and the requests behind it.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    active: Mutex<BTreeMap<u64, RequestInfo>>,
    // Activity reported by hand, not tied to a request
    manual: AtomicUsize,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, BTreeMap<u64, RequestInfo>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report activity that is not a request.
    pub fn increment_activity_count(&self) {
        self.manual.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturates at zero.
    pub fn decrement_activity_count(&self) {
        let _ = self
            .manual
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }

    pub fn activity_count(&self) -> usize {
        self.manual.load(Ordering::SeqCst) + self.active().len()
    }

    pub fn is_active(&self) -> bool {
        self.activity_count() > 0
    }

    /// Snapshot of in-flight requests, oldest first.
    pub fn active_requests(&self) -> Vec<RequestInfo> {
        self.active().values().cloned().collect()
    }

    /// Render in-flight requests as text and log it.
    pub fn pretty_print(&self) -> String {
        let requests = self.active_requests();
        let mut output = format!("{} active request(s)\n", requests.len());
        for request in &requests {
            let _ = writeln!(
                output,
                "  #{} {} {} {} [{}]",
                request.id,
                request.name,
                request.method,
                request.url,
                request.cache_identifier.as_deref().unwrap_or("uncached")
            );
        }
        info!(active = requests.len(), "{}", output.trim_end());
        output
    }
}

impl ActivityObserver for ActivityTracker {
    fn request_started(&self, request: &RequestInfo) {
        self.active().insert(request.id, request.clone());
    }

    fn request_finished(&self, request: &RequestInfo, _outcome: RequestOutcome) {
        self.active().remove(&request.id);
    }
}

/// Reports a request as finished when dropped.
///
/// A request task that is aborted drops its guard without an outcome, which
/// is reported as [`RequestOutcome::Cancelled`].
pub(crate) struct ActivityGuard {
    observer: Option<Arc<dyn ActivityObserver>>,
    request: RequestInfo,
    outcome: Option<RequestOutcome>,
}

impl ActivityGuard {
    pub(crate) fn start(observer: Option<Arc<dyn ActivityObserver>>, request: RequestInfo) -> Self {
        if let Some(observer) = &observer {
            observer.request_started(&request);
        }
        Self {
            observer,
            request,
            outcome: None,
        }
    }

    pub(crate) fn finish(&mut self, outcome: RequestOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if let Some(observer) = &self.observer {
            let outcome = self.outcome.unwrap_or(RequestOutcome::Cancelled);
            observer.request_finished(&self.request, outcome);
        }
    }
}
