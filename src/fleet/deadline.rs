//! Deadline and cancellation bound for remote operations.
//!
//! Every blocking remote operation (dial, upload, command execution) runs
//! under a [`Deadline`]: a fixed instant after which the operation times out,
//! paired with a cancellation token the caller can trigger to abort early.
//! Both outcomes surface as [`Interrupted`] so callers can route them into
//! the same cleanup path.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a bounded operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
}

/// A point in time plus a cancellation token bounding an operation.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn new(at: Instant, cancel: CancellationToken) -> Self {
        Self { at, cancel }
    }

    /// Deadline `timeout` from now, cancelled together with `cancel`.
    pub fn after(timeout: Duration, cancel: CancellationToken) -> Self {
        Self::new(Instant::now() + timeout, cancel)
    }

    /// Deadline that only expires on time.
    ///
    /// Remote cleanup runs under this so a caller abort never skips it.
    pub fn uncancellable(timeout: Duration) -> Self {
        Self::after(timeout, CancellationToken::new())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before expiry (zero once passed).
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Report an interruption that has already happened, without waiting.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            Err(Interrupted::Cancelled)
        } else if Instant::now() >= self.at {
            Err(Interrupted::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the deadline passes or the token fires first.
    ///
    /// Cancellation wins over expiry, and both win over a future that becomes
    /// ready in the same poll.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),

            _ = tokio::time::sleep_until(self.at) => Err(Interrupted::TimedOut),

            out = fut => Ok(out),
        }
    }
}
