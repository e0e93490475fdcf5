use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use super::stats::PoolStats;
use crate::admission::AdmissionController;
use crate::limiter::CircuitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left in the open period. Absent unless the circuit is open.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub active_leases: usize,
    pub max_concurrent: usize,
    pub window_occupancy: u32,
    pub window_limit: u32,
    pub circuit: CircuitSnapshot,
    pub queue_depth: usize,
    pub admitted: u64,
    pub released: u64,
    pub rejected_degraded: u64,
    pub deadline_exceeded: u64,
    pub cancelled: u64,
    pub leaked_leases: u64,
    pub last_wait_ms: u64,
}

impl PoolSnapshot {
    pub(crate) fn from_stats(
        stats: &PoolStats,
        active_leases: usize,
        max_concurrent: usize,
        window_occupancy: u32,
        window_limit: u32,
        circuit: CircuitSnapshot,
        queue_depth: usize,
    ) -> Self {
        Self {
            active_leases,
            max_concurrent,
            window_occupancy,
            window_limit,
            circuit,
            queue_depth,
            admitted: stats.admitted.load(Ordering::Relaxed),
            released: stats.released.load(Ordering::Relaxed),
            rejected_degraded: stats.rejected_degraded.load(Ordering::Relaxed),
            deadline_exceeded: stats.deadline_exceeded.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            leaked_leases: stats.leaked_leases.load(Ordering::Relaxed),
            last_wait_ms: stats.last_wait_ms.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view for status panels.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub captured_at: DateTime<Utc>,
    pub global_active_leases: usize,
    pub global_capacity: usize,
    pub global_queue_depth: usize,
    pub live_leases: usize,
    pub pools: BTreeMap<String, PoolSnapshot>,
}

#[derive(Debug, Clone)]
pub struct StatsReporter {
    controller: AdmissionController,
}

impl StatsReporter {
    pub fn new(controller: AdmissionController) -> Self {
        Self { controller }
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        self.controller.snapshot()
    }

    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn log_stats(&self) {
        let snap = self.snapshot();
        info!(
            "STATS: Global {}/{} active | Queued {} | Live leases {}",
            snap.global_active_leases,
            snap.global_capacity,
            snap.global_queue_depth,
            snap.live_leases
        );
        for (name, pool) in &snap.pools {
            info!(
                "STATS [{}]: Active {}/{} | Window {}/{} | Circuit {:?} | Queued {} | Admitted {} | Degraded {} | Timeouts {} | Leaked {}",
                name,
                pool.active_leases,
                pool.max_concurrent,
                pool.window_occupancy,
                pool.window_limit,
                pool.circuit.state,
                pool.queue_depth,
                pool.admitted,
                pool.rejected_degraded,
                pool.deadline_exceeded,
                pool.leaked_leases
            );
        }
    }

    /// Logs stats every `period` until the controller shuts down.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if self.controller.is_shutting_down() {
                    break;
                }
                self.log_stats();
            }
        })
    }
}
