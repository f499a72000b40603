//! Response normalization: turn what the transport returned into a value that no longer
//! depends on the batch deadline.

use tokio::time::Instant;

use crate::deadline::Deadline;
use crate::error::BroadsideError;
use crate::http::{HttpResponse, RawResponse};

use super::pipeline::{NormalizedResult, RawResult};

/// Classify a raw transport result and buffer its body.
///
/// In order:
/// 1. a transport error once the batch deadline has expired or been cancelled means the
///    request was abandoned ([`BroadsideError::RequestIgnored`]). Expiry is checked against
///    the clock too, since the timer task may not have cancelled the token yet;
/// 2. any other transport error is a [`BroadsideError::Transport`];
/// 3. no response at all is [`BroadsideError::NoResponseReceived`];
/// 4. otherwise the body is read into memory and the response is rebuilt around a copy of the
///    request without its deadline. A failed read is a [`BroadsideError::BodyRead`].
///
/// The original body is consumed on every path, so it is closed before this returns. The result
/// is stamped with the instant normalization finished.
pub(crate) async fn normalize(raw: RawResult, deadline: &Deadline) -> NormalizedResult {
    let RawResult {
        request,
        outcome,
        index,
    } = raw;

    let outcome = match outcome {
        Err(error) if deadline.is_done() || deadline.is_expired() => {
            tracing::trace!(index, error = %error, "Transport error after batch deadline, request ignored");
            Err(BroadsideError::RequestIgnored)
        }
        Err(error) => {
            tracing::debug!(index, error = %error, "Transport error");
            Err(BroadsideError::Transport(error.to_string()))
        }
        Ok(None) => {
            tracing::debug!(index, "Transport returned neither response nor error");
            Err(BroadsideError::NoResponseReceived)
        }
        Ok(Some(RawResponse {
            status,
            headers,
            body,
        })) => match body.read_all().await {
            Ok(bytes) => {
                tracing::trace!(index, status = status.as_u16(), body_len = bytes.len(), "Response buffered");
                Ok(HttpResponse::new(status, headers, bytes, request))
            }
            Err(e) => {
                tracing::debug!(index, error = %e, "Failed to read response body");
                Err(BroadsideError::BodyRead(e.to_string()))
            }
        },
    };

    NormalizedResult {
        outcome,
        index,
        completed_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ErrorKind;
    use crate::deadline::DeadlineScope;
    use crate::http::{HttpClient, HttpRequest, MockHttpClient, MockOutcome};

    async fn fire_once(mock: &MockHttpClient, request: HttpRequest, index: usize) -> RawResult {
        let outcome = mock.execute(&request).await;
        RawResult {
            request,
            outcome,
            index,
        }
    }

    #[tokio::test]
    async fn test_success_buffers_body_and_strips_deadline() {
        let scope = DeadlineScope::start(Duration::from_secs(5));
        let mock = MockHttpClient::new();
        mock.add_response("GET /ok", MockOutcome::ok("hello"));

        let request = HttpRequest::get("http://mock/ok")
            .unwrap()
            .with_deadline(scope.deadline().clone());
        let raw = fire_once(&mock, request, 3).await;

        let normalized = normalize(raw, scope.deadline()).await;
        assert_eq!(normalized.index, 3);

        let response = normalized.outcome.unwrap();
        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(response.text(), "hello");
        assert!(response.request().deadline().is_none());
        assert_eq!(mock.open_body_count(), 0);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let scope = DeadlineScope::start(Duration::from_secs(5));
        let mock = MockHttpClient::new();
        mock.add_response("GET /error", MockOutcome::Error("connection refused".to_string()));
        mock.add_response("GET /empty", MockOutcome::Empty);
        mock.add_response("GET /broken", MockOutcome::BrokenBody { status: 200 });

        let cases = [
            ("http://mock/error", ErrorKind::Transport),
            ("http://mock/empty", ErrorKind::NoResponseReceived),
            ("http://mock/broken", ErrorKind::BodyRead),
        ];

        for (index, (url, expected)) in cases.into_iter().enumerate() {
            let raw = fire_once(&mock, HttpRequest::get(url).unwrap(), index).await;
            let err = normalize(raw, scope.deadline()).await.outcome.unwrap_err();
            assert_eq!(err.kind(), expected, "unexpected classification for {}", url);
        }

        let raw = fire_once(&mock, HttpRequest::get("http://mock/missing").unwrap(), 9).await;
        let err = normalize(raw, scope.deadline()).await.outcome.unwrap_err();
        assert!(err.to_string().starts_with("http client error: "));

        assert_eq!(mock.open_body_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_after_deadline_is_ignored() {
        let scope = DeadlineScope::start(Duration::from_millis(10));
        let mock = MockHttpClient::new();
        mock.add_delayed_response("GET /slow", MockOutcome::ok("late"), Duration::from_secs(1));

        let request = HttpRequest::get("http://mock/slow")
            .unwrap()
            .with_deadline(scope.deadline().clone());
        let raw = fire_once(&mock, request, 0).await;
        assert!(raw.outcome.is_err());

        let err = normalize(raw, scope.deadline()).await.outcome.unwrap_err();
        assert!(err.is_request_ignored());
    }

    #[tokio::test]
    async fn test_transport_error_after_expiry_is_ignored_before_timer_fires() {
        let scope = DeadlineScope::start(Duration::from_millis(10));

        // Block the only runtime thread so the timer task cannot cancel the token.
        std::thread::sleep(Duration::from_millis(30));
        assert!(scope.deadline().is_expired());
        assert!(!scope.deadline().is_done());

        let raw = RawResult {
            request: HttpRequest::get("http://mock/slow").unwrap(),
            outcome: Err(BroadsideError::Other(anyhow::anyhow!("operation timed out"))),
            index: 0,
        };

        let err = normalize(raw, scope.deadline()).await.outcome.unwrap_err();
        assert!(err.is_request_ignored(), "got {:?}", err);
    }
}
