use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimiterConfig;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    end: Instant,
    count: u32,
}

/// Proof of one counted request, used to hand the count back if admission is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTicket {
    bucket_start: Instant,
}

/// Rolling-window request counter for a single pool.
///
/// Requests are counted in sub-buckets of `window / buckets_per_window`. A bucket stays
/// live until its *end* is a full window in the past, so every request inside any exact
/// window of length `window` is still counted when a later request is checked. The cost
/// is at most one bucket of extra hold time, never a burst above the limit.
#[derive(Debug, Default)]
pub struct RateWindow {
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request if the window has room, else returns how long until the oldest
    /// counted bucket expires.
    pub fn try_consume(
        &self,
        cfg: &RateLimiterConfig,
        now: Instant,
    ) -> std::result::Result<WindowTicket, Duration> {
        let window = cfg.window();
        let mut buckets = self.buckets.lock();
        prune(&mut buckets, window, now);

        let used: u64 = buckets.iter().map(|b| b.count as u64).sum();
        if used >= cfg.max_requests_per_window as u64 {
            let retry_after = buckets
                .iter()
                .find(|b| b.count > 0)
                .map(|b| (b.end + window).saturating_duration_since(now))
                .unwrap_or(window);
            // Never ask for a zero-length sleep; the caller would spin.
            return Err(retry_after.max(Duration::from_millis(1)));
        }

        let bucket_start = match buckets.back_mut() {
            Some(current) if now < current.end => {
                current.count += 1;
                current.start
            }
            _ => {
                buckets.push_back(Bucket {
                    start: now,
                    end: now + cfg.bucket_len(),
                    count: 1,
                });
                now
            }
        };

        Ok(WindowTicket { bucket_start })
    }

    /// Gives back a count taken by [`try_consume`](Self::try_consume). A no-op once the
    /// bucket has expired.
    pub fn refund(&self, ticket: WindowTicket) {
        let mut buckets = self.buckets.lock();
        if let Some(b) = buckets.iter_mut().find(|b| b.start == ticket.bucket_start) {
            b.count = b.count.saturating_sub(1);
        }
    }

    /// Requests currently counted against the window.
    pub fn occupancy(&self, cfg: &RateLimiterConfig, now: Instant) -> u32 {
        let mut buckets = self.buckets.lock();
        prune(&mut buckets, cfg.window(), now);
        buckets.iter().map(|b| b.count).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn prune(buckets: &mut VecDeque<Bucket>, window: Duration, now: Instant) {
    while let Some(front) = buckets.front() {
        if front.end + window <= now {
            buckets.pop_front();
        } else {
            break;
        }
    }
}
