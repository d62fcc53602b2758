//! HTTP transport seam.
//!
//! Request promises issue requests through a [`Transport`] so tests and
//! embedders can substitute their own client. [`ReqwestTransport`] is the
//! default.

use crate::error::Result;
use crate::request::{HttpResponse, RequestDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use pinna_core::{Error, TransportErrorKind};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A complete response: metadata plus body.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub response: HttpResponse,
    pub body: Bytes,
}

/// Issues a request and returns the response or a transport error.
///
/// Non-success statuses are responses, not errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> pinna_core::Result<TransportResponse>;
}

static SHARED: Lazy<Arc<ReqwestTransport>> =
    Lazy::new(|| Arc::new(ReqwestTransport::from_client(Client::new())));

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Create a transport with the given timeouts and user agent.
    pub fn new(
        timeout: Duration,
        connect_timeout: Duration,
        user_agent: impl AsRef<str>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(user_agent.as_ref())
            .build()?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }

    /// Process-wide transport used when none is configured.
    pub fn shared() -> Arc<ReqwestTransport> {
        Arc::clone(&SHARED)
    }
}

/// Sort a `reqwest` failure into the transport error taxonomy.
fn classify(error: &reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_decode() || error.is_body() {
        TransportErrorKind::Malformed
    } else {
        TransportErrorKind::Other
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    Error::transport(classify(&error), error.to_string())
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestDescriptor) -> pinna_core::Result<TransportResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(transport_error)?;

        let metadata = HttpResponse {
            status: response.status(),
            url: response.url().clone(),
            headers: response.headers().clone(),
        };
        let body = response.bytes().await.map_err(transport_error)?;

        debug!(
            url = %metadata.url,
            status = %metadata.status,
            bytes = body.len(),
            "Received response"
        );

        Ok(TransportResponse {
            response: metadata,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(server: &MockServer, route: &str) -> RequestDescriptor {
        RequestDescriptor::get(Url::parse(&format!("{}{}", server.uri(), route)).unwrap())
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::from_client(Client::new());
        let result = transport.send(&request(&server, "/missing")).await.unwrap();

        assert_eq!(result.response.status.as_u16(), 404);
        assert_eq!(&result.body[..], b"nope");
    }

    #[tokio::test]
    async fn test_headers_and_body_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scrobble"))
            .and(header("content-type", "application/json"))
            .and(body_bytes(b"{\"track\":1}".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, "pinna-test").unwrap();
        let descriptor = RequestDescriptor::new(
            Method::POST,
            Url::parse(&format!("{}/scrobble", server.uri())).unwrap(),
        )
        .with_body(&b"{\"track\":1}"[..], "application/json");

        let result = transport.send(&descriptor).await.unwrap();
        assert_eq!(result.response.status.as_u16(), 201);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::from_client(Client::new());
        let descriptor = request(&server, "/slow").with_timeout(Duration::from_millis(50));

        match transport.send(&descriptor).await {
            Err(Error::Transport { kind, .. }) => assert_eq!(kind, TransportErrorKind::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // Bind and drop a listener to find a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let descriptor =
            RequestDescriptor::get(Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap());

        let transport = ReqwestTransport::from_client(Client::new());
        match transport.send(&descriptor).await {
            Err(Error::Transport { kind, .. }) => assert_eq!(kind, TransportErrorKind::Connect),
            other => panic!("expected connect error, got {:?}", other),
        }
    }
}
