//! Outbound request descriptors and recorded responses.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

/// Everything needed to issue one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout; the transport default applies when unset
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body and the matching `Content-Type`.
    pub fn with_body(mut self, body: impl Into<Bytes>, content_type: &'static str) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Metadata of a response received from a server.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// Final URL after redirects
    pub url: Url,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The revision token of the payload (its `ETag`), used verbatim.
    pub fn revision(&self) -> Option<&str> {
        self.headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .filter(|revision| !revision.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(headers: HeaderMap) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            url: Url::parse("https://api.example.com/songs").unwrap(),
            headers,
        }
    }

    #[test]
    fn test_revision_is_etag_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("W/\"abc\""));
        assert_eq!(response_with(headers).revision(), Some("W/\"abc\""));
    }

    #[test]
    fn test_missing_or_empty_etag_is_no_revision() {
        assert_eq!(response_with(HeaderMap::new()).revision(), None);

        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static(""));
        assert_eq!(response_with(headers).revision(), None);
    }

    #[test]
    fn test_with_body_sets_content_type() {
        let request = RequestDescriptor::new(
            Method::POST,
            Url::parse("https://api.example.com/love").unwrap(),
        )
        .with_body(&b"{}"[..], "application/json");

        assert_eq!(request.content_type(), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }
}
