//! Request factory.
//!
//! Dispenses URLs, request descriptors and request promises against one base
//! URL. GET requests use the read cache manager; POST, PUT and DELETE use the
//! write cache manager.

use crate::activity::ActivityObserver;
use crate::auth::{AuthenticationHandler, DEFAULT_MAX_AUTHENTICATION_ATTEMPTS};
use crate::connectivity::ConnectivityMonitor;
use crate::post_processor::PostProcessor;
use crate::request::RequestDescriptor;
use crate::request_promise::RequestPromise;
use crate::transport::Transport;
use bytes::Bytes;
use pinna_cache::CacheManager;
use pinna_core::{Error, Queue, Result};
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;
use url::Url;

/// Query or form parameters. Keys are emitted in sorted order.
pub type Parameters = BTreeMap<String, Value>;

/// A POST or PUT body and how to encode it.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Raw bytes, sent as `application/octet-stream`
    Data(Bytes),
    /// Form-encoded parameters
    UrlParameters(Parameters),
    /// A JSON document
    Json(Value),
}

impl RequestBody {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Data(_) => "application/octet-stream",
            Self::UrlParameters(_) => "application/x-www-form-urlencoded",
            Self::Json(_) => "application/json",
        }
    }

    /// Encode the body into bytes.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Self::Data(data) => Ok(data.clone()),
            Self::UrlParameters(parameters) => Ok(Bytes::from(encode_parameters(parameters))),
            Self::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::other(format!("cannot encode JSON body: {}", e))),
        }
    }
}

/// Render a parameter value for a query string or form body.
///
/// Strings are used as is, arrays and objects are written as JSON.
fn parameter_value(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Percent-encode parameters as `key=value&...`.
pub fn encode_parameters(parameters: &Parameters) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in parameters {
        serializer.append_pair(key, &parameter_value(value));
    }
    serializer.finish()
}

/// Builds requests and request promises against a base URL.
///
/// Holds configuration only; building never performs I/O.
pub struct RequestFactory<T> {
    base_url: Url,
    read_cache_manager: Option<Arc<dyn CacheManager>>,
    write_cache_manager: Option<Arc<dyn CacheManager>>,
    request_queue: Queue,
    post_processor: PostProcessor<Bytes, T>,
    authentication_handler: Option<Arc<dyn AuthenticationHandler>>,
    activity_observer: Option<Arc<dyn ActivityObserver>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    transport: Option<Arc<dyn Transport>>,
    max_authentication_attempts: u32,
}

impl<T: Clone + Send + 'static> RequestFactory<T> {
    pub fn new(
        base_url: Url,
        read_cache_manager: Option<Arc<dyn CacheManager>>,
        write_cache_manager: Option<Arc<dyn CacheManager>>,
        request_queue: Queue,
        post_processor: PostProcessor<Bytes, T>,
    ) -> Self {
        Self {
            base_url,
            read_cache_manager,
            write_cache_manager,
            request_queue,
            post_processor,
            authentication_handler: None,
            activity_observer: None,
            connectivity: None,
            transport: None,
            max_authentication_attempts: DEFAULT_MAX_AUTHENTICATION_ATTEMPTS,
        }
    }

    pub fn with_authentication_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.authentication_handler = Some(handler);
        self
    }

    pub fn with_activity_observer(mut self, observer: Arc<dyn ActivityObserver>) -> Self {
        self.activity_observer = Some(observer);
        self
    }

    pub fn with_connectivity_monitor(mut self, connectivity: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_max_authentication_attempts(mut self, attempts: u32) -> Self {
        self.max_authentication_attempts = attempts;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn read_cache_manager(&self) -> Option<&Arc<dyn CacheManager>> {
        self.read_cache_manager.as_ref()
    }

    pub fn write_cache_manager(&self) -> Option<&Arc<dyn CacheManager>> {
        self.write_cache_manager.as_ref()
    }

    pub fn request_queue(&self) -> &Queue {
        &self.request_queue
    }

    pub fn max_authentication_attempts(&self) -> u32 {
        self.max_authentication_attempts
    }

    // ---- URLs ----

    /// Join the base URL and `path`, then append the parameters as a query.
    pub fn url_with(&self, path: &str, parameters: Option<&Parameters>) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let joined = if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        };

        let mut url = Url::parse(&joined).map_err(|e| Error::InvalidUrl(format!("{}: {}", joined, e)))?;
        if let Some(parameters) = parameters.filter(|parameters| !parameters.is_empty()) {
            let mut query = url.query_pairs_mut();
            for (key, value) in parameters {
                query.append_pair(key, &parameter_value(value));
            }
        }
        Ok(url)
    }

    // ---- Requests ----

    fn request(&self, method: Method, path: &str, parameters: Option<&Parameters>) -> Result<RequestDescriptor> {
        let url = self.url_with(path, parameters)?;
        trace!(method = %method, url = %url, "Built request");
        Ok(RequestDescriptor::new(method, url))
    }

    fn request_with_body(
        &self,
        method: Method,
        path: &str,
        parameters: Option<&Parameters>,
        body: Option<&RequestBody>,
    ) -> Result<RequestDescriptor> {
        let request = self.request(method, path, parameters)?;
        match body {
            Some(body) => Ok(request.with_body(body.encode()?, body.content_type())),
            None => Ok(request),
        }
    }

    pub fn get_request(&self, path: &str, parameters: Option<&Parameters>) -> Result<RequestDescriptor> {
        self.request(Method::GET, path, parameters)
    }

    pub fn delete_request(&self, path: &str, parameters: Option<&Parameters>) -> Result<RequestDescriptor> {
        self.request(Method::DELETE, path, parameters)
    }

    pub fn post_request(
        &self,
        path: &str,
        parameters: Option<&Parameters>,
        body: Option<&RequestBody>,
    ) -> Result<RequestDescriptor> {
        self.request_with_body(Method::POST, path, parameters, body)
    }

    pub fn put_request(
        &self,
        path: &str,
        parameters: Option<&Parameters>,
        body: Option<&RequestBody>,
    ) -> Result<RequestDescriptor> {
        self.request_with_body(Method::PUT, path, parameters, body)
    }

    // ---- Request promises ----

    fn promise(
        &self,
        request: RequestDescriptor,
        cache_manager: Option<&Arc<dyn CacheManager>>,
    ) -> RequestPromise<T> {
        let mut builder = RequestPromise::builder(
            request,
            self.request_queue.clone(),
            Arc::clone(&self.post_processor),
        )
        .cache_manager(cache_manager.cloned())
        .authentication_handler(self.authentication_handler.clone())
        .max_authentication_attempts(self.max_authentication_attempts)
        .activity_observer(self.activity_observer.clone());

        if let Some(connectivity) = &self.connectivity {
            builder = builder.connectivity(Arc::clone(connectivity));
        }
        if let Some(transport) = &self.transport {
            builder = builder.transport(Arc::clone(transport));
        }
        builder.build()
    }

    pub fn get_request_promise(&self, path: &str, parameters: Option<&Parameters>) -> Result<RequestPromise<T>> {
        let request = self.get_request(path, parameters)?;
        Ok(self.promise(request, self.read_cache_manager.as_ref()))
    }

    pub fn delete_request_promise(
        &self,
        path: &str,
        parameters: Option<&Parameters>,
    ) -> Result<RequestPromise<T>> {
        let request = self.delete_request(path, parameters)?;
        Ok(self.promise(request, self.write_cache_manager.as_ref()))
    }

    pub fn post_request_promise(
        &self,
        path: &str,
        parameters: Option<&Parameters>,
        body: Option<&RequestBody>,
    ) -> Result<RequestPromise<T>> {
        let request = self.post_request(path, parameters, body)?;
        Ok(self.promise(request, self.write_cache_manager.as_ref()))
    }

    pub fn put_request_promise(
        &self,
        path: &str,
        parameters: Option<&Parameters>,
        body: Option<&RequestBody>,
    ) -> Result<RequestPromise<T>> {
        let request = self.put_request(path, parameters, body)?;
        Ok(self.promise(request, self.write_cache_manager.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parameters(value: Value) -> Parameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parameter_values() {
        assert_eq!(parameter_value(&json!("plain")), "plain");
        assert_eq!(parameter_value(&json!(42)), "42");
        assert_eq!(parameter_value(&json!(true)), "true");
        assert_eq!(parameter_value(&Value::Null), "");
        assert_eq!(parameter_value(&json!([1, "a"])), "[1,\"a\"]");
        assert_eq!(parameter_value(&json!({"k": 1})), "{\"k\":1}");
    }

    #[test]
    fn test_encode_parameters_sorted_and_escaped() {
        let encoded = encode_parameters(&parameters(json!({
            "q": "daft punk & friends",
            "limit": 20,
            "api_key": "k"
        })));
        assert_eq!(encoded, "api_key=k&limit=20&q=daft+punk+%26+friends");
    }

    #[test]
    fn test_body_encoding() {
        let form = RequestBody::UrlParameters(parameters(json!({"method": "track.love"})));
        assert_eq!(form.content_type(), "application/x-www-form-urlencoded");
        assert_eq!(&form.encode().unwrap()[..], b"method=track.love");

        let json_body = RequestBody::Json(json!({"loved": true}));
        assert_eq!(json_body.content_type(), "application/json");
        assert_eq!(&json_body.encode().unwrap()[..], b"{\"loved\":true}");

        let raw = RequestBody::Data(Bytes::from_static(b"\x00\x01"));
        assert_eq!(raw.content_type(), "application/octet-stream");
        assert_eq!(&raw.encode().unwrap()[..], b"\x00\x01");
    }
}
