use std::time::Duration;
use tokio::time::Instant;

pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Zero when `at` is already in the past.
pub fn until(at: Instant, now: Instant) -> Duration {
    at.saturating_duration_since(now)
}

pub fn as_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
