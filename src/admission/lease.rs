use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::controller::Inner;
use super::pool::Pool;
use crate::config::RateLimiterConfig;
use crate::limiter::{Admission, GateToken, Outcome};

/// What a lease still holds. Shared with the registry so the reaper can take it.
#[derive(Debug)]
pub(crate) struct LeaseState {
    pub(crate) token: Option<GateToken>,
    pub(crate) probe: bool,
}

impl LeaseState {
    pub(crate) fn take(&mut self) -> (Option<GateToken>, bool) {
        (self.token.take(), std::mem::take(&mut self.probe))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LeaseEntry {
    pub(crate) pool: Arc<Pool>,
    pub(crate) acquired_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) state: Arc<Mutex<LeaseState>>,
}

/// Every lease that has not been released yet.
#[derive(Debug, Default)]
pub(crate) struct LeaseRegistry {
    live: DashMap<Uuid, LeaseEntry>,
}

impl LeaseRegistry {
    pub(crate) fn insert(&self, id: Uuid, entry: LeaseEntry) {
        self.live.insert(id, entry);
    }

    pub(crate) fn remove(&self, id: &Uuid) {
        self.live.remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Removes and returns every lease whose deadline has passed.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<(Uuid, LeaseEntry)> {
        let expired: Vec<Uuid> = self
            .live
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.live.remove(&id))
            .collect()
    }
}

/// One admitted, in-flight request.
///
/// Call [`release`](Lease::release) when the upstream call finishes. Dropping a lease
/// without releasing it frees its slots but records no outcome.
#[derive(Debug)]
pub struct Lease {
    id: Uuid,
    pool: Arc<Pool>,
    limits: Arc<RateLimiterConfig>,
    acquired_at: Instant,
    deadline: Instant,
    state: Arc<Mutex<LeaseState>>,
    inner: Arc<Inner>,
    done: bool,
}

impl Lease {
    pub(crate) fn new(
        id: Uuid,
        pool: Arc<Pool>,
        limits: Arc<RateLimiterConfig>,
        acquired_at: Instant,
        deadline: Instant,
        state: Arc<Mutex<LeaseState>>,
        inner: Arc<Inner>,
    ) -> Self {
        Self {
            id,
            pool,
            limits,
            acquired_at,
            deadline,
            state,
            inner,
            done: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pool(&self) -> &str {
        self.pool.name()
    }

    /// Limits in force when this lease was admitted.
    pub fn limits(&self) -> &RateLimiterConfig {
        &self.limits
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_probe(&self) -> bool {
        self.state.lock().probe
    }

    /// Frees the lease's slots and reports `outcome` to the pool's breaker.
    ///
    /// Returns `false` if the reaper already force-released the slots. The outcome is
    /// recorded either way.
    pub fn release(mut self, outcome: Outcome) -> bool {
        self.done = true;
        let (token, probe) = self.state.lock().take();

        let freed = match token {
            Some(mut token) => token.release(),
            None => {
                warn!(
                    lease = %self.id,
                    pool = self.pool.name(),
                    "Lease already force-released, release is a no-op"
                );
                false
            }
        };

        self.inner.leases.remove(&self.id);
        if freed {
            self.pool.stats.inc_released();
        }

        let admission = if probe { Admission::Probe } else { Admission::Normal };
        self.inner.report(&self.pool, outcome, admission);

        debug!(
            lease = %self.id,
            pool = self.pool.name(),
            ?outcome,
            held_ms = self.held_for().as_millis() as u64,
            "Lease released"
        );
        freed
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let (token, probe) = self.state.lock().take();
        self.inner.leases.remove(&self.id);
        if probe {
            self.inner.breaker.abandon_probe(self.pool.name());
        }
        if let Some(mut token) = token {
            token.release();
            self.pool.stats.inc_released();
            warn!(
                lease = %self.id,
                pool = self.pool.name(),
                "Lease dropped without release, slots returned"
            );
        }
    }
}
