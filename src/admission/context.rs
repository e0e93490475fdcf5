use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::AdmissionError;

/// Reserved for fairness policies. Admission is FIFO regardless of the tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Deadline and cancellation signal carried by one `acquire` call.
#[derive(Debug, Clone, Default)]
pub struct AcquireContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

impl Interrupted {
    pub(crate) fn into_error(self, pool: &str) -> AdmissionError {
        let pool = pool.to_string();
        match self {
            Interrupted::Cancelled => AdmissionError::Cancelled { pool },
            Interrupted::DeadlineExceeded => AdmissionError::DeadlineExceeded { pool },
        }
    }
}

impl AcquireContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Runs `fut` until it completes, the caller cancels, or the deadline passes.
    /// On interruption `fut` is dropped, so whatever it was holding is released.
    pub(crate) async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            out = fut => Ok(out),
            _ = expire(self.deadline) => Err(Interrupted::DeadlineExceeded),
        }
    }

    pub(crate) async fn sleep_until(&self, at: Instant) -> Result<(), Interrupted> {
        self.guard(sleep_until(at)).await
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
