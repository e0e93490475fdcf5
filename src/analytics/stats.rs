use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub admitted: AtomicU64,
    pub released: AtomicU64,
    pub rejected_degraded: AtomicU64,
    pub deadline_exceeded: AtomicU64,
    pub cancelled: AtomicU64,
    pub leaked_leases: AtomicU64,

    pub queue_depth: AtomicUsize,

    // Last observed admission wait, gauge-style.
    pub last_wait_ms: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_admitted(&self, wait_ms: u64) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.last_wait_ms.store(wait_ms, Ordering::Relaxed);
    }

    pub fn inc_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_degraded(&self) {
        self.rejected_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deadline_exceeded(&self) {
        self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_leaked(&self) {
        self.leaked_leases.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the caller as queued until the guard drops.
    pub fn enter_queue(&self) -> QueueGuard<'_> {
        self.queue_depth.fetch_add(1, Ordering::AcqRel);
        QueueGuard { depth: &self.queue_depth }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }
}

pub struct QueueGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stats_concurrency() {
        let stats = Arc::new(PoolStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _queued = stats.enter_queue();
                    stats.inc_admitted(50);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.admitted.load(Ordering::Relaxed), 1000);
        assert_eq!(stats.last_wait_ms.load(Ordering::Relaxed), 50);
        assert_eq!(stats.queue_depth(), 0);
    }

    #[test]
    fn test_queue_guard_tracks_depth() {
        let stats = PoolStats::new();
        let a = stats.enter_queue();
        let b = stats.enter_queue();
        assert_eq!(stats.queue_depth(), 2);
        drop(a);
        assert_eq!(stats.queue_depth(), 1);
        drop(b);
        assert_eq!(stats.queue_depth(), 0);
    }
}
