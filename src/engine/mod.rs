//! Bulk client: executes a batch of requests concurrently under a single deadline.
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::batch::Batch;
use crate::deadline::DeadlineScope;
use crate::error::{BroadsideError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

pub(crate) mod collector;
pub(crate) mod normalize;
pub(crate) mod pipeline;

use pipeline::Pipeline;

/// Identifier for one execution of a batch, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Configuration for the bulk client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Deadline for a whole batch execution in milliseconds
    pub timeout_ms: u64,

    /// Fire-stage workers used by [`BulkClient::execute_default`]
    pub fire_workers: usize,

    /// Process-stage workers used by [`BulkClient::execute_default`]
    pub process_workers: usize,

    /// How long a fire worker may spend draining a response it can no longer deliver before
    /// closing it outright (milliseconds)
    pub drain_timeout_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            fire_workers: 10,
            process_workers: 10,
            drain_timeout_ms: 1_000,
        }
    }
}

impl BulkConfig {
    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Executes batches of requests against an injected [`HttpClient`].
///
/// # Example
/// ```ignore
/// let client = BulkClient::new(ReqwestHttpClient::new(), Duration::from_secs(2));
/// let mut batch = Batch::new();
/// batch
///     .add(HttpRequest::get("http://localhost:8080/a")?)
///     .add(HttpRequest::get("http://localhost:8080/b")?);
///
/// let (responses, errors) = client.execute(&mut batch, 10, 10).await?;
/// for (response, error) in responses.iter().zip(errors) {
///     // exactly one of the two is Some
/// }
/// batch.close_all_responses();
/// ```
#[derive(Clone)]
pub struct BulkClient<H>
where
    H: HttpClient,
{
    http_client: H,
    config: BulkConfig,
}

impl<H> BulkClient<H>
where
    H: HttpClient + 'static,
{
    /// Create a client whose batches must finish within `timeout`.
    pub fn new(http_client: H, timeout: Duration) -> Self {
        Self::with_config(
            http_client,
            BulkConfig {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ..Default::default()
            },
        )
    }

    pub fn with_config(http_client: H, config: BulkConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Execute `batch` with the worker counts from the config.
    pub async fn execute_default<'a>(
        &self,
        batch: &'a mut Batch,
    ) -> Result<(&'a [Option<HttpResponse>], &'a [Option<BroadsideError>])> {
        self.execute(batch, self.config.fire_workers, self.config.process_workers)
            .await
    }

    /// Execute every request in `batch` concurrently.
    ///
    /// Returns the batch's response and error slots, both as long as the request list and
    /// aligned with it by index. For every index exactly one of the two is `Some`. Requests
    /// that did not finish before the deadline are reported as
    /// [`BroadsideError::RequestIgnored`].
    ///
    /// # Errors
    /// Fails only with [`BroadsideError::NoRequests`] when the batch is empty; no stage is
    /// started in that case.
    pub async fn execute<'a>(
        &self,
        batch: &'a mut Batch,
        fire_workers: usize,
        process_workers: usize,
    ) -> Result<(&'a [Option<HttpResponse>], &'a [Option<BroadsideError>])> {
        if batch.is_empty() {
            tracing::warn!("Refusing to execute an empty batch");
            return Err(BroadsideError::NoRequests);
        }

        let run_id = RunId::new();
        let span = tracing::info_span!("execute_batch", run_id = %run_id, requests = batch.len());

        let fire_workers = worker_count(fire_workers, batch.len(), "fire");
        let process_workers = worker_count(process_workers, batch.len(), "process");

        self.run(batch, fire_workers, process_workers)
            .instrument(span)
            .await;

        let batch: &'a Batch = batch;
        Ok((batch.responses(), batch.errors()))
    }

    async fn run(&self, batch: &mut Batch, fire_workers: usize, process_workers: usize) {
        let started = tokio::time::Instant::now();
        let expected = batch.len();
        batch.reset_slots();

        let scope = DeadlineScope::start(self.config.timeout());
        let deadline = scope.deadline().clone();
        // Fires on deadline expiry, or explicitly once results have been delivered.
        let stop = deadline.token().child_token();

        let requests: Vec<HttpRequest> = batch
            .requests()
            .iter()
            .map(|request| request.with_deadline(deadline.clone()))
            .collect();

        tracing::debug!(
            timeout_ms = self.config.timeout_ms,
            fire_workers,
            process_workers,
            "Executing batch"
        );

        let (results_tx, results_rx) = mpsc::channel(process_workers);
        let collector = tokio::spawn(
            collector::collect(results_rx, expected, deadline.clone()).in_current_span(),
        );

        let pipeline = Pipeline {
            client: self.http_client.clone(),
            deadline: deadline.clone(),
            stop: stop.clone(),
            fire_workers,
            process_workers,
            drain_timeout: self.config.drain_timeout(),
        };
        tokio::spawn(pipeline.run(requests, results_tx).in_current_span());

        let collected = match collector.await {
            Ok(collected) => collected,
            Err(join_error) => {
                tracing::error!(error = %join_error, "Completion collector panicked");
                Vec::new()
            }
        };

        stop.cancel();

        let delivered = collected.len();
        for result in collected {
            batch.record(result);
        }
        let ignored = batch.fill_ignored();
        drop(scope);

        let summary = batch.summary();
        counter!("broadside_requests_total", "outcome" => "success")
            .increment(summary.succeeded as u64);
        counter!("broadside_requests_total", "outcome" => "ignored")
            .increment(summary.ignored as u64);
        counter!("broadside_requests_total", "outcome" => "failed")
            .increment(summary.failed as u64);

        if ignored > 0 {
            tracing::warn!(
                ignored,
                delivered,
                expected,
                "Batch deadline reached before every request finished"
            );
        }

        tracing::info!(
            succeeded = summary.succeeded,
            ignored = summary.ignored,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch execution finished"
        );
    }
}

/// Clamp a requested pool size to `1..=requests`.
fn worker_count(requested: usize, requests: usize, stage: &'static str) -> usize {
    if requested == 0 {
        tracing::warn!(stage, "Worker count of 0 requested, using 1");
        return 1;
    }
    requested.min(requests)
}
