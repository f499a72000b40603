//! The batch: an ordered set of requests and the index-aligned results of executing them.
//!
//! A batch is built once (append-only), executed once by [`crate::BulkClient::execute`], and
//! read afterwards. During execution only the orchestrator writes to the result slots, and it
//! writes each index at most once.

use serde::Serialize;

use crate::engine::pipeline::NormalizedResult;
use crate::error::{BroadsideError, ErrorKind};
use crate::http::{HttpRequest, HttpResponse};

/// Requests plus their per-slot responses and errors.
///
/// After a successful execution, for every index exactly one of `responses()[i]` and
/// `errors()[i]` is `Some`.
#[derive(Debug, Default)]
pub struct Batch {
    requests: Vec<HttpRequest>,
    responses: Vec<Option<HttpResponse>>,
    errors: Vec<Option<BroadsideError>>,
}

/// Outcome counts for an executed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. Returns `self` for chaining.
    pub fn add(&mut self, request: HttpRequest) -> &mut Self {
        self.requests.push(request);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[HttpRequest] {
        &self.requests
    }

    pub fn responses(&self) -> &[Option<HttpResponse>] {
        &self.responses
    }

    pub fn errors(&self) -> &[Option<BroadsideError>] {
        &self.errors
    }

    /// The outcome of slot `index`, or `None` if the slot is out of range or was never filled.
    pub fn result(&self, index: usize) -> Option<Result<&HttpResponse, &BroadsideError>> {
        match (self.responses.get(index), self.errors.get(index)) {
            (Some(Some(response)), _) => Some(Ok(response)),
            (_, Some(Some(error))) => Some(Err(error)),
            _ => None,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.requests.len(),
            ..Default::default()
        };
        summary.succeeded = self.responses.iter().flatten().count();
        for error in self.errors.iter().flatten() {
            match error.kind() {
                ErrorKind::RequestIgnored => summary.ignored += 1,
                _ => summary.failed += 1,
            }
        }
        summary
    }

    /// Release the buffered body of every response.
    ///
    /// Call this once the response bodies have been consumed.
    pub fn close_all_responses(&mut self) {
        for response in self.responses.iter_mut().flatten() {
            response.close();
        }
    }

    /// Size both result arrays to the request count with every slot empty.
    pub(crate) fn reset_slots(&mut self) {
        let n = self.requests.len();
        self.responses = std::iter::repeat_with(|| None).take(n).collect();
        self.errors = std::iter::repeat_with(|| None).take(n).collect();
    }

    /// Write one normalized result into its slot.
    ///
    /// A slot is written at most once; a second result for the same index is dropped. Returns
    /// whether the result was recorded.
    pub(crate) fn record(&mut self, result: NormalizedResult) -> bool {
        let NormalizedResult { outcome, index, .. } = result;

        if index >= self.requests.len() {
            tracing::error!(index, len = self.requests.len(), "Result index out of range, dropping");
            return false;
        }
        if self.responses[index].is_some() || self.errors[index].is_some() {
            tracing::warn!(index, "Slot already filled, dropping duplicate result");
            return false;
        }

        match outcome {
            Ok(response) => self.responses[index] = Some(response),
            Err(error) => self.errors[index] = Some(error),
        }
        true
    }

    /// Mark every still-empty slot as [`BroadsideError::RequestIgnored`]. Returns how many
    /// slots were filled.
    pub(crate) fn fill_ignored(&mut self) -> usize {
        let mut filled = 0;
        for (response, error) in self.responses.iter().zip(self.errors.iter_mut()) {
            if response.is_none() && error.is_none() {
                *error = Some(BroadsideError::RequestIgnored);
                filled += 1;
            }
        }
        filled
    }
}

impl FromIterator<HttpRequest> for Batch {
    fn from_iter<I: IntoIterator<Item = HttpRequest>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
            ..Default::default()
        }
    }
}
