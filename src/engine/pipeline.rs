//! Publisher, fire stage, process stage, and the manager that wires them together.
//!
//! ```text
//! publisher ──RequestSlot──> fire pool ──RawResult──> process pool ──NormalizedResult──> collector
//! ```
//!
//! Each queue is a bounded mpsc channel whose receiver is shared by the pool consuming it. The
//! manager owns the original sender of every queue and drops it only after the stage producing
//! into that queue has been joined, so queues close stage by stage and every pool ends by
//! exhausting its input. Every blocking receive and push also races the stop signal, so the
//! whole pipeline unwinds promptly once the batch is finished or its deadline expires.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::normalize::normalize;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::http::{HttpClient, HttpRequest, HttpResponse, RawResponse};

/// A request waiting to be fired, tagged with its position in the batch.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    pub(crate) request: HttpRequest,
    pub(crate) index: usize,
}

/// What the transport returned for one slot. Any response body is still open.
#[derive(Debug)]
pub(crate) struct RawResult {
    pub(crate) request: HttpRequest,
    pub(crate) outcome: Result<Option<RawResponse>>,
    pub(crate) index: usize,
}

/// The final, deadline-independent outcome for one slot.
#[derive(Debug)]
pub(crate) struct NormalizedResult {
    pub(crate) outcome: Result<HttpResponse>,
    pub(crate) index: usize,
    /// When normalization finished; results completed after the deadline are not merged.
    pub(crate) completed_at: Instant,
}

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

impl RawResult {
    /// Release a result that cannot be delivered downstream.
    ///
    /// An obtained response body is drained (bounded by `drain_timeout`) and then closed; it is
    /// never just forgotten.
    async fn discard(self, drain_timeout: Duration) {
        counter!("broadside_responses_discarded_total", "stage" => "fire").increment(1);

        let index = self.index;
        if let Ok(Some(response)) = self.outcome {
            match tokio::time::timeout(drain_timeout, response.body.drain()).await {
                Ok(drained) => {
                    tracing::trace!(index, drained, "Drained undeliverable response body");
                }
                Err(_) => {
                    tracing::debug!(index, "Timed out draining undeliverable response body, closing it");
                }
            }
        }
    }
}

/// Take the next item from a shared queue, or `None` once the queue is closed or the stop
/// signal fires.
async fn next<T>(input: &SharedReceiver<T>, stop: &CancellationToken) -> Option<T> {
    let mut rx = input.lock().await;
    tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Push every request into the fire queue in input order. Returns how many were published.
async fn publish(
    requests: Vec<HttpRequest>,
    queue: mpsc::Sender<RequestSlot>,
    stop: CancellationToken,
) -> usize {
    let total = requests.len();

    for (index, request) in requests.into_iter().enumerate() {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!(
                    published = index,
                    abandoned = total - index,
                    "Stop signal received, abandoning unpublished requests"
                );
                return index;
            }
            permit = queue.reserve() => match permit {
                Ok(permit) => permit.send(RequestSlot { request, index }),
                Err(_) => {
                    tracing::debug!(published = index, "Fire queue closed, stopping publisher");
                    return index;
                }
            }
        }
    }

    tracing::trace!(published = total, "All requests published");
    total
}

/// One fire-stage worker. Returns the number of requests it sent to the transport.
async fn fire<H: HttpClient>(
    worker: usize,
    client: H,
    input: SharedReceiver<RequestSlot>,
    output: mpsc::Sender<RawResult>,
    stop: CancellationToken,
    drain_timeout: Duration,
) -> usize {
    let mut fired = 0;

    while let Some(RequestSlot { request, index }) = next(&input, &stop).await {
        let outcome = {
            gauge!("broadside_requests_in_flight").increment(1.0);
            let _in_flight = scopeguard::guard((), |_| {
                gauge!("broadside_requests_in_flight").decrement(1.0);
            });
            client.execute(&request).await
        };
        fired += 1;

        tracing::trace!(worker, index, ok = outcome.is_ok(), "Request fired");

        let raw = RawResult {
            request,
            outcome,
            index,
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                raw.discard(drain_timeout).await;
                break;
            }
            permit = output.reserve() => match permit {
                Ok(permit) => permit.send(raw),
                Err(_) => {
                    raw.discard(drain_timeout).await;
                    break;
                }
            }
        }
    }

    tracing::trace!(worker, fired, "Fire worker exiting");
    fired
}

/// One process-stage worker. Returns the number of results it normalized.
async fn process(
    worker: usize,
    input: SharedReceiver<RawResult>,
    output: mpsc::Sender<NormalizedResult>,
    deadline: Deadline,
    stop: CancellationToken,
) -> usize {
    let mut processed = 0;

    while let Some(raw) = next(&input, &stop).await {
        let index = raw.index;
        // A stalled body must not outlive the batch; dropping the future closes it.
        let normalized = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                counter!("broadside_responses_discarded_total", "stage" => "process").increment(1);
                tracing::trace!(worker, index, "Stop signal received while reading body, closing it");
                break;
            }
            normalized = normalize(raw, &deadline) => normalized,
        };
        processed += 1;

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                // The body is buffered already, dropping the result releases everything.
                counter!("broadside_responses_discarded_total", "stage" => "process").increment(1);
                tracing::trace!(worker, index = normalized.index, "Dropping result after stop signal");
                break;
            }
            permit = output.reserve() => match permit {
                Ok(permit) => permit.send(normalized),
                Err(_) => break,
            }
        }
    }

    tracing::trace!(worker, processed, "Process worker exiting");
    processed
}

async fn join_pool(pool: &mut JoinSet<usize>, stage: &'static str) -> usize {
    let mut handled = 0;
    while let Some(result) = pool.join_next().await {
        match result {
            Ok(count) => handled += count,
            Err(join_error) => {
                tracing::error!(stage, error = %join_error, "Worker task panicked");
            }
        }
    }
    handled
}

/// Worker-pool manager for one batch execution.
pub(crate) struct Pipeline<H> {
    pub(crate) client: H,
    pub(crate) deadline: Deadline,
    pub(crate) stop: CancellationToken,
    pub(crate) fire_workers: usize,
    pub(crate) process_workers: usize,
    pub(crate) drain_timeout: Duration,
}

impl<H> Pipeline<H>
where
    H: HttpClient + 'static,
{
    /// Run all stages to completion, feeding normalized results into `results`.
    ///
    /// Shutdown is ordered: publisher, then fire pool, then process pool, closing each stage's
    /// output queue once the stage is finished.
    pub(crate) async fn run(self, requests: Vec<HttpRequest>, results: mpsc::Sender<NormalizedResult>) {
        let (fire_tx, fire_rx) = mpsc::channel::<RequestSlot>(self.fire_workers.max(1));
        let (raw_tx, raw_rx) = mpsc::channel::<RawResult>(self.process_workers.max(1));
        let fire_rx: SharedReceiver<RequestSlot> = Arc::new(Mutex::new(fire_rx));
        let raw_rx: SharedReceiver<RawResult> = Arc::new(Mutex::new(raw_rx));

        let publisher =
            tokio::spawn(publish(requests, fire_tx.clone(), self.stop.clone()).in_current_span());

        let mut fire_pool = JoinSet::new();
        for worker in 0..self.fire_workers {
            fire_pool.spawn(
                fire(
                    worker,
                    self.client.clone(),
                    fire_rx.clone(),
                    raw_tx.clone(),
                    self.stop.clone(),
                    self.drain_timeout,
                )
                .in_current_span(),
            );
        }

        let mut process_pool = JoinSet::new();
        for worker in 0..self.process_workers {
            process_pool.spawn(
                process(
                    worker,
                    raw_rx.clone(),
                    results.clone(),
                    self.deadline.clone(),
                    self.stop.clone(),
                )
                .in_current_span(),
            );
        }

        tracing::debug!(
            fire_workers = self.fire_workers,
            process_workers = self.process_workers,
            "Pipeline started"
        );

        let published = match publisher.await {
            Ok(published) => published,
            Err(join_error) => {
                tracing::error!(error = %join_error, "Publisher task panicked");
                0
            }
        };
        drop(fire_tx);

        let fired = join_pool(&mut fire_pool, "fire").await;
        drop(raw_tx);

        let processed = join_pool(&mut process_pool, "process").await;
        drop(results);

        tracing::debug!(published, fired, processed, "Pipeline drained");
    }
}
