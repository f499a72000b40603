//! HTTP client abstraction and the request/response values carried through the engine.
//!
//! The engine never builds or sends HTTP traffic itself: it hands each [`HttpRequest`] to an
//! injected [`HttpClient`] and receives a [`RawResponse`] whose [`Body`] is still open and
//! unread. The process stage turns that into an [`HttpResponse`] whose body is fully buffered
//! and whose request no longer carries the batch deadline.

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};

use crate::deadline::Deadline;
use crate::error::{BroadsideError, Result};

pub mod client;
pub mod mock;

pub use client::ReqwestHttpClient;
pub use mock::{MockCall, MockHttpClient, MockOutcome};

/// Trait for executing a single HTTP request.
///
/// This is the only contract the engine needs from a transport. Implementations may honor the
/// [`Deadline`] attached to the request (see [`HttpRequest::deadline`]); the engine does not
/// abort calls that ignore it, it only discards their results.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new();
/// let request = HttpRequest::get("https://api.example.com/health")?;
/// if let Some(response) = client.execute(&request).await? {
///     let body = response.body.read_all().await?;
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute one request.
    ///
    /// Returns `Ok(None)` when the transport produced neither a response nor an error.
    async fn execute(&self, request: &HttpRequest) -> Result<Option<RawResponse>>;
}

// ============================================================================
// Requests
// ============================================================================

/// An outbound HTTP request.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    deadline: Option<Deadline>,
}

impl HttpRequest {
    /// Create a request, parsing `url`.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| BroadsideError::InvalidRequest(format!("invalid url '{}': {}", url, e)))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            deadline: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: impl Into<Bytes>) -> Result<Self> {
        Ok(Self::new(Method::POST, url)?.body(body))
    }

    /// Add a header, validating name and value.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BroadsideError::InvalidRequest(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| BroadsideError::InvalidRequest(format!("invalid header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The batch deadline this request is bound to, if it is currently being executed.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// A copy of this request bound to `deadline`.
    pub fn with_deadline(&self, deadline: Deadline) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// A copy of this request with no deadline attached.
    pub fn without_deadline(self) -> Self {
        Self {
            deadline: None,
            ..self
        }
    }

    /// `"{METHOD} {path}"`, the key used for logging and mock lookups.
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.url.path())
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.as_ref().map(|b| b.len()))
            .field("has_deadline", &self.deadline.is_some())
            .finish()
    }
}

// ============================================================================
// Raw responses (straight from the transport)
// ============================================================================

/// Stream of body chunks produced by a transport.
pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, anyhow::Error>>;

/// An open response body.
///
/// Dropping the body closes it. Reading consumes it, so a body can be read or drained at most
/// once and is always closed exactly once.
pub struct Body {
    stream: BodyStream,
}

impl Body {
    pub fn from_stream(stream: BodyStream) -> Self {
        Self { stream }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::from_stream(futures::stream::once(async move { Ok(bytes) }).boxed())
    }

    pub fn empty() -> Self {
        Self::from_stream(futures::stream::empty().boxed())
    }

    /// Read the whole body into memory and close it.
    pub async fn read_all(mut self) -> std::result::Result<Bytes, anyhow::Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Read and discard the rest of the body, then close it. Returns the number of bytes read.
    ///
    /// Draining lets the transport put a keep-alive connection back into its pool.
    pub async fn drain(mut self) -> usize {
        let mut drained = 0;
        while let Some(chunk) = self.stream.next().await {
            match chunk {
                Ok(chunk) => drained += chunk.len(),
                Err(e) => {
                    tracing::trace!(error = %e, drained, "Body errored while draining");
                    break;
                }
            }
        }
        drained
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Body { .. }")
    }
}

/// A response as returned by a transport: status and headers are known, the body is open and
/// unread.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

// ============================================================================
// Normalized responses (returned to callers)
// ============================================================================

/// A response whose body has been fully read into memory.
///
/// The originating request is kept without its deadline, so the response can be read at any
/// time after the batch call has returned.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Option<Bytes>,
    request: HttpRequest,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, request: HttpRequest) -> Self {
        Self {
            status,
            headers,
            body: Some(body),
            request: request.without_deadline(),
        }
    }

    /// The buffered body; empty once closed.
    pub fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// The buffered body as shared bytes, `None` once closed.
    pub fn bytes(&self) -> Option<Bytes> {
        self.body.clone()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.body())?)
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Release the buffered body.
    pub fn close(&mut self) {
        self.body = None;
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }
}
