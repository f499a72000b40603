//! Production transport built on reqwest.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};

use super::{Body, HttpClient, HttpRequest, RawResponse};
use crate::error::{BroadsideError, Result};

/// Production HTTP client using reqwest.
///
/// The remaining time on the request's batch deadline is used as the per-request timeout, and
/// the send is abandoned as soon as the deadline is done. The response body is returned as a
/// stream; it is not read here.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already configured reqwest client (pooling, TLS, proxies, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client with an overall per-request timeout, independent of batch deadlines.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &HttpRequest) -> Result<Option<RawResponse>> {
        let mut req = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            req = req.body(body.clone());
            tracing::trace!(body_len = body.len(), "Added request body");
        }

        let response = match request.deadline() {
            Some(deadline) => {
                let remaining = deadline.remaining();
                tracing::debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Executing HTTP request"
                );
                tokio::select! {
                    biased;
                    _ = deadline.done() => {
                        tracing::debug!("Batch deadline reached before response headers");
                        return Err(BroadsideError::Other(anyhow::anyhow!(
                            "request cancelled: batch deadline reached"
                        )));
                    }
                    response = req.timeout(remaining).send() => response,
                }
            }
            None => {
                tracing::debug!("Executing HTTP request");
                req.send().await
            }
        }
        .map_err(|e| {
            tracing::debug!(error = %e, "HTTP request failed");
            e
        })?;

        let status = response.status();
        let headers = response.headers().clone();

        tracing::debug!(status = status.as_u16(), "HTTP response headers received");

        let stream = response.bytes_stream().map_err(anyhow::Error::from).boxed();

        Ok(Some(RawResponse {
            status,
            headers,
            body: Body::from_stream(stream),
        }))
    }
}
