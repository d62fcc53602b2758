//! Pinna Net
//!
//! Cache-aware, connectivity-aware request promises.
//!
//! # Features
//!
//! - **Request promises**: one HTTP request per [`RequestPromise`], served
//!   from a [`CacheManager`](pinna_cache::CacheManager) while offline, with
//!   ETag-based change detection and cancellation
//! - **Request factory**: URLs, request descriptors and request promises
//!   against a base URL with separate read and write caches
//! - **Post-processors**: reusable JSON, image and property-list decoders
//!   that chain
//! - **Connectivity**: reachability monitoring with change callbacks
//! - **Authentication**: challenge handling through an injected handler
//! - **Activity**: optional tracking of in-flight requests
//!
//! # Example
//!
//! ```ignore
//! use pinna_net::{post_processor, Parameters, PinnaConfig, RequestFactory};
//! use std::sync::Arc;
//!
//! let config = PinnaConfig::load()?;
//! let cache = Arc::new(config.build_cache_manager()?);
//! let queue = config.build_queue_manager().queue_named("exfm")?;
//!
//! let factory = RequestFactory::new(
//!     "https://ex.fm/api/v3".parse()?,
//!     Some(cache.clone()),
//!     Some(cache),
//!     queue,
//!     post_processor::json_value(),
//! );
//!
//! let mut parameters = Parameters::new();
//! parameters.insert("results".into(), 20.into());
//! let trending = factory.get_request_promise("trending", Some(&parameters))?;
//!
//! trending.then(
//!     |songs| println!("{songs}"),
//!     |error| eprintln!("Could not load trending songs: {error}"),
//! );
//! ```

pub mod activity;
pub mod auth;
pub mod config;
pub mod connectivity;
mod error;
pub mod factory;
pub mod post_processor;
pub mod request;
pub mod request_promise;
pub mod transport;

// Re-export main types
pub use activity::{ActivityObserver, ActivityTracker, RequestInfo, RequestOutcome};
pub use auth::{
    AuthenticationChallenge, AuthenticationHandler, ChallengeResponse, Credential,
    ProtectionSpace, StaticCredentialHandler,
};
pub use config::PinnaConfig;
pub use connectivity::{
    CallbackToken, ConnectivityMonitor, ManualReachability, ReachabilitySource, TcpReachability,
};
pub use error::{NetError, Result};
pub use factory::{Parameters, RequestBody, RequestFactory};
pub use post_processor::{ImageData, PostProcessContext, PostProcessor};
pub use request::{HttpResponse, RequestDescriptor};
pub use request_promise::{Preflight, RequestPromise, RequestPromiseBuilder};
pub use transport::{ReqwestTransport, Transport, TransportResponse};

// Re-export the building blocks request promises are made of
pub use pinna_cache::{CacheError, CacheManager, FileSystemCacheManager, MemoryCacheManager};
pub use pinna_core::{when_all, Error, Possibility, Promise, PromiseState, Queue, QueueManager};
