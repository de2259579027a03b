//! HTTP transport contract and the default reqwest-backed client.

use crate::error::{BoxError, TransportError};
use crate::types::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use std::time::Duration;

/// Default per-request timeout of [`ReqwestClient`].
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One intake request produced by a feature's [`RequestBuilder`].
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    /// A POST request with an empty body.
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header. Invalid names or values are silently ignored.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Intake response. Classification uses the status code only.
#[derive(Clone, Copy, Debug)]
pub struct HttpResponse {
    pub status: u16,
}

/// The host HTTP transport: request in, response out.
///
/// The default implementation is [`ReqwestClient`]; hosts may plug their own
/// stack (certificate pinning, proxying) through this seam.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Builds the intake request for one batch of a feature's events.
///
/// The builder owns the feature's wire format: endpoint, headers and how
/// event payloads are joined into a body. A returned error condemns the
/// batch; it is deleted and the failure reported through telemetry.
pub trait RequestBuilder: Send + Sync + 'static {
    fn build(&self, events: &[Bytes], context: &Context) -> Result<HttpRequest, BoxError>;
}

/// Default transport backed by a pooled [`reqwest::Client`].
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Create a client with the default timeout.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client fails to build. Use
    /// [`with_timeout`](Self::with_timeout) for fallible construction.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT).expect("failed to build default HTTP client")
    }

    /// Create a client with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()?;
        Ok(Self { inner })
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .inner
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(Box::new(err))
                }
            })?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
        })
    }
}
