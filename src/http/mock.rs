//! Mock transport for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::oneshot;

use super::{Body, HttpClient, HttpRequest, RawResponse};
use crate::error::{BroadsideError, Result};

/// What a mocked call resolves to.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// A response with a readable body.
    Response { status: u16, body: Bytes },
    /// A response whose body stream fails after the first chunk.
    BrokenBody { status: u16 },
    /// A response whose body yields one chunk and then never another.
    StalledBody { status: u16 },
    /// A transport error with the given message.
    Error(String),
    /// Neither a response nor an error.
    Empty,
}

impl MockOutcome {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        MockOutcome::Response {
            status: 200,
            body: body.into(),
        }
    }
}

/// A queued mock reply, optionally delayed or gated on a trigger.
struct MockResponse {
    outcome: MockOutcome,
    delay: Option<Duration>,
    trigger: Option<oneshot::Receiver<()>>,
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub body: Option<Bytes>,
    pub had_deadline: bool,
}

/// Mock HTTP client for testing.
///
/// Replies are keyed by `"{METHOD} {path}"` and returned in FIFO order per key. Delayed and
/// triggered replies give up when the request's batch deadline is done, like a transport that
/// honors cancellation, unless the client was built with [`MockHttpClient::ignoring_deadlines`].
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response("GET /fast", MockOutcome::ok("fast"));
/// mock.add_delayed_response("GET /slow", MockOutcome::ok("slow"), Duration::from_secs(1));
/// ```
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    open_bodies: Arc<AtomicUsize>,
    honor_deadlines: bool,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            open_bodies: Arc::new(AtomicUsize::new(0)),
            honor_deadlines: true,
        }
    }

    /// Make delayed and triggered replies run to completion even after the deadline.
    pub fn ignoring_deadlines(mut self) -> Self {
        self.honor_deadlines = false;
        self
    }

    fn push(&self, key: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Add an immediate reply for `key`.
    pub fn add_response(&self, key: &str, outcome: MockOutcome) {
        self.push(
            key,
            MockResponse {
                outcome,
                delay: None,
                trigger: None,
            },
        );
    }

    /// Add a reply that resolves after `delay`.
    pub fn add_delayed_response(&self, key: &str, outcome: MockOutcome, delay: Duration) {
        self.push(
            key,
            MockResponse {
                outcome,
                delay: Some(delay),
                trigger: None,
            },
        );
    }

    /// Add a reply that waits for a manual trigger before completing.
    ///
    /// Sending `()` or dropping the returned sender releases the call.
    pub fn add_response_with_trigger(&self, key: &str, outcome: MockOutcome) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            key,
            MockResponse {
                outcome,
                delay: None,
                trigger: Some(rx),
            },
        );
        tx
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of response bodies handed out and not yet dropped.
    pub fn open_body_count(&self) -> usize {
        self.open_bodies.load(Ordering::SeqCst)
    }

    fn body(&self, chunks: Vec<std::result::Result<Bytes, anyhow::Error>>, stall: bool) -> Body {
        let guard = CountGuard::new(self.open_bodies.clone());
        let tail = if stall {
            futures::stream::pending().boxed()
        } else {
            futures::stream::empty().boxed()
        };
        let stream = futures::stream::iter(chunks).chain(tail).map(move |chunk| {
            let _open = &guard;
            chunk
        });
        Body::from_stream(stream.boxed())
    }

    fn resolve(&self, outcome: MockOutcome) -> Result<Option<RawResponse>> {
        match outcome {
            MockOutcome::Response { status, body } => Ok(Some(RawResponse {
                status: status_code(status)?,
                headers: HeaderMap::new(),
                body: self.body(vec![Ok(body)], false),
            })),
            MockOutcome::BrokenBody { status } => Ok(Some(RawResponse {
                status: status_code(status)?,
                headers: HeaderMap::new(),
                body: self.body(
                    vec![
                        Ok(Bytes::from_static(b"partial")),
                        Err(anyhow::anyhow!("connection reset by peer")),
                    ],
                    false,
                ),
            })),
            MockOutcome::StalledBody { status } => Ok(Some(RawResponse {
                status: status_code(status)?,
                headers: HeaderMap::new(),
                body: self.body(vec![Ok(Bytes::from_static(b"partial"))], true),
            })),
            MockOutcome::Error(message) => Err(BroadsideError::Other(anyhow::anyhow!(message))),
            MockOutcome::Empty => Ok(None),
        }
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn status_code(status: u16) -> Result<StatusCode> {
    StatusCode::from_u16(status)
        .map_err(|e| BroadsideError::Other(anyhow::anyhow!("invalid mock status {}: {}", status, e)))
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest) -> Result<Option<RawResponse>> {
        let _in_flight = CountGuard::new(self.in_flight.clone());

        self.calls.lock().push(MockCall {
            method: request.method.to_string(),
            url: request.url.to_string(),
            body: request.body.clone(),
            had_deadline: request.deadline().is_some(),
        });

        let key = request.route_key();
        let mock_response = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        let Some(MockResponse {
            outcome,
            delay,
            trigger,
        }) = mock_response
        else {
            return Err(BroadsideError::Other(anyhow::anyhow!(
                "No mock response configured for {}",
                key
            )));
        };

        let wait = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(trigger) = trigger {
                // Proceed whether the trigger fired or was dropped.
                let _ = trigger.await;
            }
        };

        match request.deadline().filter(|_| self.honor_deadlines) {
            Some(deadline) => {
                tokio::select! {
                    _ = wait => {}
                    _ = deadline.done() => {
                        return Err(BroadsideError::Other(anyhow::anyhow!(
                            "context deadline exceeded"
                        )));
                    }
                }
            }
            None => wait.await,
        }

        self.resolve(outcome)
    }
}

/// Increments a counter on creation and decrements it on drop, so the count stays correct even
/// if the owner is cancelled or panics.
struct CountGuard {
    counter: Arc<AtomicUsize>,
}

impl CountGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> HttpRequest {
        HttpRequest::get(&format!("https://api.example.com{}", path)).unwrap()
    }

    #[tokio::test]
    async fn test_mock_client_basic() {
        let mock = MockHttpClient::new();
        mock.add_response("GET /test", MockOutcome::ok("success"));

        let response = mock.execute(&request("/test")).await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(mock.open_body_count(), 1);
        assert_eq!(response.body.read_all().await.unwrap(), "success");
        assert_eq!(mock.open_body_count(), 0);

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[0].url, "https://api.example.com/test");
        assert!(!calls[0].had_deadline);
    }

    #[tokio::test]
    async fn test_mock_client_multiple_responses() {
        let mock = MockHttpClient::new();
        mock.add_response("GET /status", MockOutcome::ok("first"));
        mock.add_response("GET /status", MockOutcome::ok("second"));

        let first = mock.execute(&request("/status")).await.unwrap().unwrap();
        assert_eq!(first.body.read_all().await.unwrap(), "first");

        let second = mock.execute(&request("/status")).await.unwrap().unwrap();
        assert_eq!(second.body.read_all().await.unwrap(), "second");

        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_client_no_response_configured() {
        let mock = MockHttpClient::new();
        assert!(mock.execute(&request("/unknown")).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_client_outcome_variants() {
        let mock = MockHttpClient::new();
        mock.add_response("GET /empty", MockOutcome::Empty);
        mock.add_response("GET /error", MockOutcome::Error("refused".to_string()));
        mock.add_response("GET /broken", MockOutcome::BrokenBody { status: 200 });

        assert!(mock.execute(&request("/empty")).await.unwrap().is_none());

        let err = mock.execute(&request("/error")).await.unwrap_err();
        assert_eq!(err.to_string(), "refused");

        let broken = mock.execute(&request("/broken")).await.unwrap().unwrap();
        assert!(broken.body.read_all().await.is_err());
        assert_eq!(mock.open_body_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_client_stalled_body_never_completes() {
        let mock = MockHttpClient::new();
        mock.add_response("GET /stalled", MockOutcome::StalledBody { status: 200 });

        let stalled = mock.execute(&request("/stalled")).await.unwrap().unwrap();
        let read = tokio::time::timeout(Duration::from_secs(60), stalled.body.read_all()).await;

        assert!(read.is_err(), "stalled body should not finish");
        assert_eq!(mock.open_body_count(), 0, "dropping the read closes the body");
    }

    #[tokio::test]
    async fn test_mock_client_with_trigger() {
        let mock = MockHttpClient::new();
        let trigger = mock.add_response_with_trigger("GET /test", MockOutcome::ok("triggered"));

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move { mock_clone.execute(&request("/test")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        let response = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(response.body.read_all().await.unwrap(), "triggered");
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_client_honors_deadline() {
        let scope = crate::deadline::DeadlineScope::start(Duration::from_millis(50));
        let mock = MockHttpClient::new();
        mock.add_delayed_response("GET /slow", MockOutcome::ok("slow"), Duration::from_secs(5));

        let request = request("/slow").with_deadline(scope.deadline().clone());
        let started = tokio::time::Instant::now();
        let err = mock.execute(&request).await.unwrap_err();

        assert_eq!(err.to_string(), "context deadline exceeded");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_client_ignoring_deadlines_runs_to_completion() {
        let scope = crate::deadline::DeadlineScope::start(Duration::from_millis(50));
        let mock = MockHttpClient::new().ignoring_deadlines();
        mock.add_delayed_response("GET /slow", MockOutcome::ok("slow"), Duration::from_secs(5));

        let request = request("/slow").with_deadline(scope.deadline().clone());
        let response = mock.execute(&request).await.unwrap().unwrap();

        assert!(scope.deadline().is_done());
        assert_eq!(response.body.read_all().await.unwrap(), "slow");
    }
}
