//! Completion multiplexer.

use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::deadline::Deadline;

use super::pipeline::NormalizedResult;

/// Gather normalized results until `expected` have arrived, the queue closes, or the deadline
/// is reached, and hand back whatever was collected.
///
/// Only results that finished by the deadline's expiry instant are kept. Once the deadline is
/// reached, results already waiting in the queue are still taken if they finished in time.
/// Returning consumes the receiver, so nothing is accepted after delivery: late pushes fail and
/// the workers making them wind down.
pub(crate) async fn collect(
    mut results: mpsc::Receiver<NormalizedResult>,
    expected: usize,
    deadline: Deadline,
) -> Vec<NormalizedResult> {
    let expires_at = deadline.expires_at();
    let mut collected = Vec::with_capacity(expected);

    while collected.len() < expected && !deadline.is_expired() {
        tokio::select! {
            biased;
            _ = deadline.done() => break,
            result = results.recv() => match result {
                Some(result) => admit(result, expires_at, &mut collected),
                None => {
                    tracing::debug!(
                        collected = collected.len(),
                        expected,
                        "Result queue closed before every result arrived"
                    );
                    return collected;
                }
            }
        }
    }

    while collected.len() < expected {
        match results.try_recv() {
            Ok(result) => admit(result, expires_at, &mut collected),
            Err(_) => break,
        }
    }

    if collected.len() < expected {
        tracing::debug!(
            collected = collected.len(),
            expected,
            "Deadline reached, delivering partial results"
        );
    }
    collected
}

fn admit(result: NormalizedResult, expires_at: Instant, collected: &mut Vec<NormalizedResult>) {
    if result.completed_at <= expires_at {
        collected.push(result);
    } else {
        counter!("broadside_responses_discarded_total", "stage" => "collector").increment(1);
        tracing::trace!(index = result.index, "Result finished after the deadline, dropping");
    }
}
