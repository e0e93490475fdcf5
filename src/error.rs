use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Deadline exceeded waiting for admission to pool '{pool}'")]
    DeadlineExceeded { pool: String },

    #[error("Admission to pool '{pool}' cancelled by caller")]
    Cancelled { pool: String },

    #[error("Pool '{pool}' degraded: circuit open{}", fmt_retry(.retry_after))]
    PoolDegraded {
        pool: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Lease {lease} on pool '{pool}' leaked after {held_for:?}, force-released")]
    LeaseLeak {
        lease: Uuid,
        pool: String,
        held_for: Duration,
    },

    #[error("Admission controller is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

fn fmt_retry(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry in {}ms", d.as_millis()),
        None => ", probe in flight".to_string(),
    }
}

impl AdmissionError {
    /// Transient conditions the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::DeadlineExceeded { .. } | AdmissionError::PoolDegraded { .. }
        )
    }

    pub fn pool(&self) -> Option<&str> {
        match self {
            AdmissionError::DeadlineExceeded { pool }
            | AdmissionError::Cancelled { pool }
            | AdmissionError::PoolDegraded { pool, .. }
            | AdmissionError::LeaseLeak { pool, .. } => Some(pool),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
