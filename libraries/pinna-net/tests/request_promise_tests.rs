//! Request promise tests against a mock server.
//!
//! Every test sends real HTTP to wiremock and observes cache traffic through
//! `MemoryCacheManager`'s call counters.

use bytes::Bytes;
use pinna_cache::{CacheError, MemoryCacheItem};
use pinna_core::TransportErrorKind;
use pinna_net::{
    post_processor, ActivityObserver, ActivityTracker, AuthenticationChallenge,
    AuthenticationHandler, CacheManager, ChallengeResponse, ConnectivityMonitor, Credential,
    Error, MemoryCacheManager, Possibility, PostProcessor, ProtectionSpace, Queue,
    RequestDescriptor, RequestPromise, StaticCredentialHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pinna_net=debug")),
            )
            .try_init();
    });
}

fn offline() -> Arc<ConnectivityMonitor> {
    Arc::new(ConnectivityMonitor::manual(false))
}

fn online() -> Arc<ConnectivityMonitor> {
    Arc::new(ConnectivityMonitor::manual(true))
}

fn get(server: &MockServer, route: &str) -> RequestDescriptor {
    init_logging();
    RequestDescriptor::get(Url::parse(&format!("{}{}", server.uri(), route)).unwrap())
}

fn as_manager(cache: &Arc<MemoryCacheManager>) -> Option<Arc<dyn CacheManager>> {
    Some(Arc::clone(cache) as Arc<dyn CacheManager>)
}

/// Bytes post-processor that counts its invocations.
fn counting(calls: Arc<AtomicUsize>) -> PostProcessor<Bytes, Bytes> {
    post_processor::from_fn(move |input: Possibility<Bytes>, _context| {
        calls.fetch_add(1, Ordering::SeqCst);
        input
    })
}

fn songs_promise(
    server: &MockServer,
    cache: &Arc<MemoryCacheManager>,
    connectivity: Arc<ConnectivityMonitor>,
) -> RequestPromise<Bytes> {
    RequestPromise::builder(get(server, "/songs"), Queue::current(), post_processor::data())
        .cache_manager(as_manager(cache))
        .connectivity(connectivity)
        .cache_identifier("songs")
        .build()
}

// =============================================================================
// Offline Tests
// =============================================================================

mod offline {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_serves_cached_data_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("cached", "r1"),
        )]));
        let promise = songs_promise(&server, &cache, offline());

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"cached"));
        assert!(promise.response().is_none());
        assert_eq!(cache.calls().cached_data, 1);
        assert_eq!(cache.calls().cache, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_cache_error_removes_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("cached", "r1"),
        )]));
        cache.set_error("songs", CacheError::injected("bad sector"));
        let promise = songs_promise(&server, &cache, offline());

        match promise.realized().await {
            Err(Error::CannotLoadCache { identifier, message }) => {
                assert_eq!(identifier, "songs");
                assert!(message.contains("bad sector"));
            }
            other => panic!("Expected CannotLoadCache, got {:?}", other),
        }
        assert_eq!(cache.calls().remove_cache, 1);
        assert!(cache.item("songs").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_without_cached_entry_uses_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/songs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        let promise = songs_promise(&server, &cache, offline());

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"fresh"));
        assert!(promise.response().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_cache_disabled_uses_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("cached", "r1"),
        )]));
        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), post_processor::data())
            .cache_manager(as_manager(&cache))
            .use_cache_when_offline(false)
            .connectivity(offline())
            .cache_identifier("songs")
            .build();

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"fresh"));
        assert_eq!(cache.calls().cached_data, 0);
    }
}

// =============================================================================
// Revision Tests
// =============================================================================

mod revisions {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unchanged_revision_cancels_without_post_processing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"r1\"")
                    .set_body_string("same"),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("same", "\"r1\""),
        )]));
        let calls = Arc::new(AtomicUsize::new(0));
        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), counting(calls.clone()))
            .cache_manager(as_manager(&cache))
            .cancel_when_remote_data_unchanged(true)
            .connectivity(online())
            .cache_identifier("songs")
            .build();

        let error = promise.realized().await.unwrap_err();
        assert_eq!(
            error,
            Error::Unchanged {
                identifier: "songs".into()
            }
        );
        assert!(error.is_cancellation());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.calls().cache, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_changed_revision_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"r2\"")
                    .set_body_string("new"),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("old", "\"r1\""),
        )]));
        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), post_processor::data())
            .cache_manager(as_manager(&cache))
            .cancel_when_remote_data_unchanged(true)
            .connectivity(online())
            .cache_identifier("songs")
            .build();

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"new"));
        assert_eq!(
            cache.item("songs"),
            Some(MemoryCacheItem::new("new", "\"r2\""))
        );
        assert_eq!(promise.response().unwrap().revision(), Some("\"r2\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_matching_revision_without_opt_in_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"r1\"")
                    .set_body_string("same"),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("same", "\"r1\""),
        )]));
        let promise = songs_promise(&server, &cache, online());

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"same"));
        assert_eq!(cache.calls().revision_for, 0);
        assert_eq!(cache.calls().cache, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_etag_caches_throwaway_revision() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());

        songs_promise(&server, &cache, online()).realized().await.unwrap();
        let first = cache.item("songs").unwrap();
        assert_eq!(first.data, Bytes::from_static(b"plain"));
        assert!(!first.revision.is_empty());

        songs_promise(&server, &cache, online()).realized().await.unwrap();
        let second = cache.item("songs").unwrap();
        assert_ne!(first.revision, second.revision);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_etag_without_offline_use_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), post_processor::data())
            .cache_manager(as_manager(&cache))
            .use_cache_when_offline(false)
            .connectivity(online())
            .cache_identifier("songs")
            .build();

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"plain"));
        assert!(cache.is_empty());
        assert_eq!(cache.calls().cache, 0);
    }
}

// =============================================================================
// Failure Tests
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cache_write_failure_still_delivers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"r1\"")
                    .set_body_string("fresh"),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        cache.set_error("songs", CacheError::injected("disk full"));
        let promise = songs_promise(&server, &cache, online());

        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"fresh"));
        assert_eq!(cache.calls().cache, 1);
        assert_eq!(cache.calls().remove_cache, 1);
        assert!(cache.item("songs").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_status_is_annotated_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(500)
                    .insert_header("ETag", "\"r1\"")
                    .set_body_string("oops"),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        let promise = songs_promise(&server, &cache, online());

        assert_eq!(
            promise.realized().await,
            Err(Error::Status {
                status: 500,
                identifier: Some("songs".into())
            })
        );
        assert_eq!(promise.response().unwrap().status.as_u16(), 500);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_refused_is_annotated() {
        // Grab a free port, then close it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{}/songs", port)).unwrap();
        let cache = Arc::new(MemoryCacheManager::new());
        let promise = RequestPromise::builder(RequestDescriptor::get(url), Queue::current(), post_processor::data())
            .cache_manager(as_manager(&cache))
            .connectivity(online())
            .cache_identifier("songs")
            .build();

        match promise.realized().await {
            Err(Error::Transport {
                kind, identifier, ..
            }) => {
                assert_eq!(kind, TransportErrorKind::Connect);
                assert_eq!(identifier.as_deref(), Some("songs"));
            }
            other => panic!("Expected transport error, got {:?}", other),
        }
        assert!(promise.response().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decode_failure_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let promise = RequestPromise::builder(
            get(&server, "/songs"),
            Queue::current(),
            post_processor::json_value(),
        )
        .connectivity(online())
        .build();

        assert!(matches!(promise.realized().await, Err(Error::Decode(_))));
    }
}

// =============================================================================
// Cancellation Tests
// =============================================================================

mod cancellation {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_in_flight_rejects_promptly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        let promise = songs_promise(&server, &cache, online());
        promise.fire();
        tokio::time::sleep(Duration::from_millis(100)).await;

        promise.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), promise.realized())
            .await
            .expect("cancelled promise should realize promptly");

        assert_eq!(result, Err(Error::Cancelled));
        assert!(promise.is_cancelled());
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_realization_keeps_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::new());
        let promise = songs_promise(&server, &cache, online());
        assert!(promise.realized().await.is_ok());

        promise.cancel();
        assert_eq!(promise.realized().await.unwrap(), Bytes::from_static(b"done"));
    }
}

// =============================================================================
// Authentication Tests
// =============================================================================

mod authentication {
    use super::*;

    async fn protected_server() -> MockServer {
        let server = MockServer::start().await;
        // user:pass
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret songs"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Basic realm=\"pinna\""),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_challenge_answered_with_credential() {
        let server = protected_server().await;
        let handler = Arc::new(StaticCredentialHandler::new(
            "127.0.0.1",
            Credential::basic("user", "pass"),
        ));

        let promise = RequestPromise::builder(get(&server, "/me"), Queue::current(), post_processor::data())
            .connectivity(online())
            .authentication_handler(Some(handler as Arc<dyn AuthenticationHandler>))
            .build();

        assert_eq!(
            promise.realized().await.unwrap(),
            Bytes::from_static(b"secret songs")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_challenge_without_handler_is_status_error() {
        let server = protected_server().await;
        let promise = RequestPromise::builder(get(&server, "/me"), Queue::current(), post_processor::data())
            .connectivity(online())
            .build();

        assert_eq!(
            promise.realized().await,
            Err(Error::Status {
                status: 401,
                identifier: None
            })
        );
    }

    /// Keeps offering a wrong password.
    struct StubbornHandler {
        challenges: AtomicUsize,
        response: fn() -> ChallengeResponse,
    }

    impl AuthenticationHandler for StubbornHandler {
        fn can_authenticate(&self, _request: &RequestDescriptor, space: &ProtectionSpace) -> bool {
            space.scheme == "basic" && space.realm.as_deref() == Some("pinna")
        }

        fn handle_challenge(
            &self,
            _request: &RequestDescriptor,
            challenge: &AuthenticationChallenge,
        ) -> ChallengeResponse {
            assert_eq!(
                challenge.previous_failure_count as usize,
                self.challenges.fetch_add(1, Ordering::SeqCst)
            );
            (self.response)()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_attempts_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Basic realm=\"pinna\""),
            )
            .expect(3)
            .mount(&server)
            .await;

        let handler = Arc::new(StubbornHandler {
            challenges: AtomicUsize::new(0),
            response: || ChallengeResponse::UseCredential(Credential::basic("user", "wrong")),
        });
        let promise = RequestPromise::builder(get(&server, "/me"), Queue::current(), post_processor::data())
            .connectivity(online())
            .authentication_handler(Some(handler.clone() as Arc<dyn AuthenticationHandler>))
            .max_authentication_attempts(2)
            .build();

        assert!(matches!(
            promise.realized().await,
            Err(Error::Status { status: 401, .. })
        ));
        assert_eq!(handler.challenges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_challenge_cancels_request() {
        let server = protected_server().await;
        let handler = Arc::new(StubbornHandler {
            challenges: AtomicUsize::new(0),
            response: || ChallengeResponse::Cancel,
        });
        let promise = RequestPromise::builder(get(&server, "/me"), Queue::current(), post_processor::data())
            .connectivity(online())
            .authentication_handler(Some(handler as Arc<dyn AuthenticationHandler>))
            .build();

        assert_eq!(promise.realized().await, Err(Error::Cancelled));
    }
}

// =============================================================================
// Cached Data Tests
// =============================================================================

mod cached_data {
    use super::*;
    use tokio::sync::oneshot;

    async fn load(promise: &RequestPromise<Bytes>) -> Possibility<Bytes> {
        let (tx, rx) = oneshot::channel();
        promise.load_cached_data_on(&Queue::inline(), move |possibility| {
            let _ = tx.send(possibility);
        });
        rx.await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_cached_data_ignores_connectivity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("cached", "r1"),
        )]));
        let promise = songs_promise(&server, &cache, online());

        assert!(matches!(load(&promise).await, Possibility::Value(data) if data == "cached"));
        assert_eq!(promise.state(), pinna_net::PromiseState::NotRealized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_cached_data_missing_entry_is_empty() {
        let server = MockServer::start().await;
        let cache = Arc::new(MemoryCacheManager::new());
        let promise = songs_promise(&server, &cache, online());

        assert!(matches!(load(&promise).await, Possibility::Empty));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_cached_data_error_keeps_entry() {
        let server = MockServer::start().await;
        let cache = Arc::new(MemoryCacheManager::new());
        cache.set_error("songs", CacheError::injected("unreadable"));
        let promise = songs_promise(&server, &cache, online());

        assert!(matches!(
            load(&promise).await,
            Possibility::Error(Error::CannotLoadCache { .. })
        ));
        assert_eq!(cache.calls().remove_cache, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_cached_data_after_cancel() {
        let server = MockServer::start().await;
        let cache = Arc::new(MemoryCacheManager::with_items([(
            "songs",
            MemoryCacheItem::new("cached", "r1"),
        )]));
        let promise = songs_promise(&server, &cache, online());
        promise.cancel();

        assert!(matches!(load(&promise).await, Possibility::Error(Error::Cancelled)));
        assert_eq!(cache.calls().cached_data, 0);
    }
}

// =============================================================================
// Composition Tests
// =============================================================================

mod composition {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_activity_tracker_sees_requests_finish() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let tracker = Arc::new(ActivityTracker::new());
        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), post_processor::data())
            .connectivity(online())
            .activity_observer(Some(tracker.clone() as Arc<dyn ActivityObserver>))
            .name("songs")
            .build();

        promise.realized().await.unwrap();
        assert!(!tracker.is_active());
        assert!(tracker.active_requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_when_all_collects_request_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let a = RequestPromise::builder(get(&server, "/a"), Queue::current(), post_processor::data())
            .connectivity(online())
            .build();
        let b = RequestPromise::builder(get(&server, "/b"), Queue::current(), post_processor::data())
            .connectivity(online())
            .build();

        let all = pinna_net::when_all(vec![a.promise().clone(), b.promise().clone()]);
        let results = all.realized().await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], Possibility::Value(data) if data == "a"));
        assert!(matches!(
            &results[1],
            Possibility::Error(Error::Status { status: 404, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_then_delivers_on_requested_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let promise = RequestPromise::builder(get(&server, "/songs"), Queue::current(), post_processor::data())
            .connectivity(online())
            .build();

        let (tx, rx) = tokio::sync::oneshot::channel();
        promise.then_on(
            move |data| {
                let _ = tx.send(data);
            },
            |error| panic!("unexpected error: {}", error),
            &Queue::current(),
        );

        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"ok"));
    }
}
