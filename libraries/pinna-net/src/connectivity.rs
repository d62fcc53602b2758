//! Connectivity Monitor
//!
//! Observes whether one fixed network target is reachable and notifies
//! registered callbacks when that changes.
//!
//! ## Architecture
//!
//! ```text
//! Probe Thread                     Any Thread
//!      │                               │
//!      │ source.is_reachable()         │
//!      │ (TCP connect, ≤ timeout)      │
//!      │                               │
//!      │ status changed?               │
//!      │──── callbacks(connected) ────>│
//!      │                               │ is_connected()
//!      │                               │ (atomic read)
//! ```
//!
//! Status updates only come from the probe thread (or an explicit
//! [`ConnectivityMonitor::refresh`]); observers just read.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Target probed by [`ConnectivityMonitor::default_internet`]
pub const DEFAULT_PROBE_HOST: &str = "1.1.1.1:53";

/// Default delay between two probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a single probe may take
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A boolean reachability provider.
///
/// Probing may block; the monitor calls it from its own thread.
#[cfg_attr(test, mockall::automock)]
pub trait ReachabilitySource: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Human-readable target, for logs.
    fn target(&self) -> String;
}

/// Reachability by opening a TCP connection to a host.
#[derive(Debug, Clone)]
pub struct TcpReachability {
    target: String,
    timeout: Duration,
}

impl TcpReachability {
    /// Probe `target` given as `host:port`.
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

impl ReachabilitySource for TcpReachability {
    fn is_reachable(&self) -> bool {
        let addresses = match self.target.to_socket_addrs() {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!(probe = %self.target, error = %e, "Cannot resolve probe target");
                return false;
            }
        };
        addresses
            .into_iter()
            .any(|address| TcpStream::connect_timeout(&address, self.timeout).is_ok())
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// Reachability flipped by hand. Used for tests and for embedders that
/// learn about connectivity from elsewhere.
#[derive(Debug)]
pub struct ManualReachability {
    reachable: AtomicBool,
}

impl ManualReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl ReachabilitySource for ManualReachability {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn target(&self) -> String {
        "manual".to_string()
    }
}

/// Handle returned by [`ConnectivityMonitor::register_status_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackToken(u64);

type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Shared {
    source: Arc<dyn ReachabilitySource>,
    connected: AtomicBool,
    callbacks: Mutex<BTreeMap<CallbackToken, StatusCallback>>,
    next_token: AtomicU64,
}

impl Shared {
    fn callbacks(&self) -> MutexGuard<'_, BTreeMap<CallbackToken, StatusCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self) -> bool {
        let reachable = self.source.is_reachable();
        self.update(reachable);
        reachable
    }

    fn update(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }

        info!(probe = %self.source.target(), connected, "Connectivity changed");

        // Snapshot so callbacks may (un)register without deadlocking
        let callbacks: Vec<StatusCallback> = self.callbacks().values().cloned().collect();
        for callback in callbacks {
            callback(connected);
        }
    }
}

/// Stop signal shared with the probe thread.
#[derive(Default)]
struct Stop {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl Stop {
    /// Sleep for `interval`; returns `true` once stop was requested.
    fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .signal
            .wait_timeout_while(stopped, interval, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }

    fn request(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }
}

static DEFAULT_INTERNET: Lazy<Arc<ConnectivityMonitor>> = Lazy::new(|| {
    Arc::new(ConnectivityMonitor::for_host(
        DEFAULT_PROBE_HOST,
        DEFAULT_PROBE_INTERVAL,
        DEFAULT_PROBE_TIMEOUT,
    ))
});

/// Tracks reachability of one target.
///
/// The status starts out as connected and is corrected by the first probe.
pub struct ConnectivityMonitor {
    shared: Arc<Shared>,
    manual: Option<Arc<ManualReachability>>,
    stop: Option<Arc<Stop>>,
}

impl ConnectivityMonitor {
    /// A monitor over `source` that only updates on [`refresh`](Self::refresh).
    pub fn new(source: Arc<dyn ReachabilitySource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                connected: AtomicBool::new(true),
                callbacks: Mutex::new(BTreeMap::new()),
                next_token: AtomicU64::new(0),
            }),
            manual: None,
            stop: None,
        }
    }

    /// A monitor probing `source` every `interval` on a background thread.
    ///
    /// The first probe runs immediately. The thread exits when the monitor
    /// is dropped.
    pub fn with_source(source: Arc<dyn ReachabilitySource>, interval: Duration) -> Self {
        let mut monitor = Self::new(source);
        let stop = Arc::new(Stop::default());
        let weak: Weak<Shared> = Arc::downgrade(&monitor.shared);
        let thread_stop = Arc::clone(&stop);
        let target = monitor.shared.source.target();

        let spawned = thread::Builder::new()
            .name(format!("pinna-connectivity-{}", target))
            .spawn(move || loop {
                match weak.upgrade() {
                    Some(shared) => {
                        shared.refresh();
                    }
                    None => break,
                }
                if thread_stop.wait(interval) {
                    break;
                }
            });

        match spawned {
            Ok(_) => {
                debug!(probe = %target, interval_ms = interval.as_millis() as u64, "Started connectivity probe");
                monitor.stop = Some(stop);
            }
            Err(e) => {
                warn!(probe = %target, error = %e, "Cannot start connectivity probe, status will not update");
            }
        }
        monitor
    }

    /// Probe `host:port` by TCP connect.
    pub fn for_host(host: &str, interval: Duration, probe_timeout: Duration) -> Self {
        Self::with_source(Arc::new(TcpReachability::new(host, probe_timeout)), interval)
    }

    /// Probe a socket address by TCP connect.
    pub fn for_address(address: SocketAddr, interval: Duration, probe_timeout: Duration) -> Self {
        Self::for_host(&address.to_string(), interval, probe_timeout)
    }

    /// A monitor whose status is set with [`set_connected`](Self::set_connected).
    pub fn manual(connected: bool) -> Self {
        let source = Arc::new(ManualReachability::new(connected));
        let mut monitor = Self::new(Arc::clone(&source) as Arc<dyn ReachabilitySource>);
        monitor.shared.connected.store(connected, Ordering::SeqCst);
        monitor.manual = Some(source);
        monitor
    }

    /// The process-wide monitor for general internet reachability.
    ///
    /// Created on first use.
    pub fn default_internet() -> Arc<ConnectivityMonitor> {
        Arc::clone(&DEFAULT_INTERNET)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> String {
        self.shared.source.target()
    }

    /// Probe the source now, notifying callbacks on change.
    pub fn refresh(&self) -> bool {
        self.shared.refresh()
    }

    /// Flip a [`manual`](Self::manual) monitor. Ignored by other monitors.
    pub fn set_connected(&self, connected: bool) {
        match &self.manual {
            Some(source) => {
                source.set_reachable(connected);
                self.shared.update(connected);
            }
            None => warn!(probe = %self.target(), "set_connected on a probed monitor ignored"),
        }
    }

    /// Call `callback` with the new status on every transition.
    pub fn register_status_changed(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> CallbackToken {
        let token = CallbackToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.callbacks().insert(token, Arc::new(callback));
        token
    }

    /// Returns whether the token was registered.
    pub fn unregister_status_changed(&self, token: CallbackToken) -> bool {
        self.shared.callbacks().remove(&token).is_some()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.request();
        }
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("target", &self.target())
            .field("connected", &self.is_connected())
            .finish()
    }
}
