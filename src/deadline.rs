//! Batch deadline scope.
//!
//! Every execution of a batch is governed by one deadline. The [`DeadlineScope`] owns it: it
//! spawns a timer that cancels the shared token when the deadline passes, and cancels the token
//! itself when dropped so nothing outlives the execution that created it. [`Deadline`] is the
//! cheap, clonable view attached to each outbound request and handed to every pipeline stage.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Stand-in expiry for timeouts too large to represent as an instant (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A view of a batch deadline.
///
/// The deadline is "done" once it has expired or its owning scope has been dropped.
#[derive(Debug, Clone)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
}

impl Deadline {
    /// The instant at which the deadline expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry, zero if already past.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the wall-clock deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Whether the deadline has expired or been cancelled.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the deadline has expired or been cancelled.
    pub async fn done(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Owning guard for a batch deadline.
pub(crate) struct DeadlineScope {
    deadline: Deadline,
}

impl DeadlineScope {
    /// Start a deadline `timeout` from now. Must be called from within a tokio runtime.
    pub(crate) fn start(timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let now = Instant::now();
        let expires_at = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);

        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expires_at) => {
                    tracing::debug!(timeout = ?timeout, "Batch deadline expired");
                    timer_token.cancel();
                }
                _ = timer_token.cancelled() => {}
            }
        });

        Self {
            deadline: Deadline { token, expires_at },
        }
    }

    pub(crate) fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

impl Drop for DeadlineScope {
    fn drop(&mut self) {
        self.deadline.token.cancel();
    }
}
