use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::context::AcquireContext;
use super::lease::{Lease, LeaseEntry, LeaseRegistry, LeaseState};
use super::pool::Pool;
use crate::analytics::{AdmissionSnapshot, CircuitSnapshot, PoolSnapshot};
use crate::config::{
    BreakerConfig, ConfigManager, OperatorCommand, RateLimiterConfig, Settings, OPERATOR_WINDOW_MS,
};
use crate::error::{AdmissionError, Result};
use crate::limiter::{
    Admission, BackoffCoordinator, CircuitState, ConcurrencyGate, GateToken, Outcome,
    PacingClock, PacingSlot, WindowTicket,
};
use crate::utils::time::{as_ms, elapsed_ms, until};

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) config: ConfigManager,
    pools: DashMap<String, Arc<Pool>>,
    gate: ConcurrencyGate,
    /// Process-wide dispatch spacing, applied after the pool's own pacing.
    pacer: PacingClock,
    pub(crate) breaker: BackoffCoordinator,
    pub(crate) leases: LeaseRegistry,
    shutdown: CancellationToken,
}

/// What has been reserved so far for one admission, undone if a later step fails.
struct Reservation<'a> {
    pool: &'a Pool,
    global_pacer: &'a PacingClock,
    ticket: WindowTicket,
    pool_slot: Option<PacingSlot>,
    global_slot: Option<PacingSlot>,
}

impl Reservation<'_> {
    fn rollback(self) {
        if let Some(slot) = self.global_slot {
            self.global_pacer.cancel(slot);
        }
        if let Some(slot) = self.pool_slot {
            self.pool.pacer.cancel(slot);
        }
        self.pool.window.refund(self.ticket);
    }
}

impl Inner {
    fn pool(&self, name: &str) -> Arc<Pool> {
        if let Some(pool) = self.pools.get(name) {
            return pool.clone();
        }
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(pool = name, "Pool registered");
                Arc::new(Pool::new(name))
            })
            .clone()
    }

    pub(crate) fn report(&self, pool: &Pool, outcome: Outcome, admission: Admission) -> CircuitState {
        let policy = self.config.breaker();
        self.breaker
            .report(pool.name(), outcome, admission, &policy, Instant::now())
    }

    /// Rate window, then pool pacing, then global pacing, then concurrency.
    async fn admit(
        &self,
        pool: &Pool,
        limits: &RateLimiterConfig,
        ctx: &AcquireContext,
    ) -> Result<GateToken> {
        let name = pool.name();
        let interrupted = |i: super::context::Interrupted| i.into_error(name);

        let ticket = loop {
            ctx.check().map_err(interrupted)?;
            let now = Instant::now();
            match pool.window.try_consume(limits, now) {
                Ok(ticket) => break ticket,
                Err(retry_after) => {
                    debug!(
                        pool = name,
                        retry_after_ms = as_ms(retry_after),
                        "Rate window full, waiting"
                    );
                    ctx.sleep_until(now + retry_after).await.map_err(interrupted)?;
                }
            }
        };

        let mut reservation = Reservation {
            pool,
            global_pacer: &self.pacer,
            ticket,
            pool_slot: None,
            global_slot: None,
        };

        let deadline = ctx.deadline();
        let Some(pool_slot) = pool.pacer.next_slot(limits.min_delay(), Instant::now(), deadline)
        else {
            reservation.rollback();
            return Err(AdmissionError::DeadlineExceeded { pool: name.to_string() });
        };
        reservation.pool_slot = Some(pool_slot);

        // The global slot is reserved only once this pool's turn has come, so one pool's
        // spacing never holds up the others.
        if let Err(i) = ctx.sleep_until(pool_slot.at).await {
            reservation.rollback();
            return Err(i.into_error(name));
        }

        let spacing = self.config.pacing().request_delay();
        let Some(global_slot) = self.pacer.next_slot(spacing, Instant::now(), deadline) else {
            reservation.rollback();
            return Err(AdmissionError::DeadlineExceeded { pool: name.to_string() });
        };
        reservation.global_slot = Some(global_slot);

        if let Err(i) = ctx.sleep_until(global_slot.at).await {
            reservation.rollback();
            return Err(i.into_error(name));
        }

        // Seeds a pool the gate has not seen yet; known pools are resized on update only.
        let capacity = self.config.pool_config(name).max_concurrent_connections;
        match self.gate.acquire(name, capacity, ctx).await {
            Ok(token) => Ok(token),
            Err(e) => {
                reservation.rollback();
                Err(e)
            }
        }
    }

    fn reap(&self, now: Instant) -> usize {
        let expired = self.leases.take_expired(now);
        let reaped = expired.len();

        for (id, entry) in expired {
            let (token, probe) = entry.state.lock().take();
            if let Some(mut token) = token {
                token.release();
            }
            if probe {
                self.breaker.abandon_probe(entry.pool.name());
            }
            entry.pool.stats.inc_leaked();

            let leak = AdmissionError::LeaseLeak {
                lease: id,
                pool: entry.pool.name().to_string(),
                held_for: now.saturating_duration_since(entry.acquired_at),
            };
            error!(lease = %id, pool = entry.pool.name(), "{}", leak);
        }
        reaped
    }
}

/// Entry point for workers: one `acquire` per outbound call, one `release` per lease.
///
/// Cheap to clone; clones share all limiter state.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(ConfigManager::default())
    }
}

impl AdmissionController {
    pub fn new(config: ConfigManager) -> Self {
        let global_capacity = config.global().max_concurrent;
        Self {
            inner: Arc::new(Inner {
                config,
                pools: DashMap::new(),
                gate: ConcurrencyGate::new(global_capacity),
                pacer: PacingClock::new(),
                breaker: BackoffCoordinator::new(),
                leases: LeaseRegistry::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(ConfigManager::from_settings(settings))
    }

    pub fn config(&self) -> &ConfigManager {
        &self.inner.config
    }

    /// Waits until `pool` may dispatch one request and returns the lease for it.
    ///
    /// Fails fast with `PoolDegraded` while the pool's circuit is open. Otherwise waits on
    /// the rate window, the pacing clocks and the concurrency gate, in that order, giving
    /// up with `DeadlineExceeded` or `Cancelled` per `ctx`. A failed call holds no slot,
    /// window count or pacing grant afterwards.
    pub async fn acquire(&self, pool_id: &str, ctx: &AcquireContext) -> Result<Lease> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }

        let pool = inner.pool(pool_id);
        let started = Instant::now();
        let _queued = pool.stats.enter_queue();

        let admission = match inner.breaker.admit(pool_id, started) {
            Ok(admission) => admission,
            Err(e) => {
                pool.stats.inc_rejected_degraded();
                debug!(pool = pool_id, "{}", e);
                return Err(e);
            }
        };

        let limits = inner.config.pool_config(pool_id);
        let token = match inner.admit(&pool, &limits, ctx).await {
            Ok(token) => token,
            Err(e) => {
                if admission == Admission::Probe {
                    inner.breaker.abandon_probe(pool_id);
                }
                match e {
                    AdmissionError::DeadlineExceeded { .. } => pool.stats.inc_deadline_exceeded(),
                    AdmissionError::Cancelled { .. } => pool.stats.inc_cancelled(),
                    _ => {}
                }
                debug!(pool = pool_id, wait_ms = elapsed_ms(started), "{}", e);
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let acquired_at = Instant::now();
        let deadline = acquired_at + inner.config.lease().deadline();
        let state = Arc::new(Mutex::new(LeaseState {
            token: Some(token),
            probe: admission == Admission::Probe,
        }));

        inner.leases.insert(
            id,
            LeaseEntry {
                pool: pool.clone(),
                acquired_at,
                deadline,
                state: state.clone(),
            },
        );

        let wait_ms = elapsed_ms(started);
        pool.stats.inc_admitted(wait_ms);
        debug!(
            pool = pool_id,
            lease = %id,
            wait_ms,
            probe = admission == Admission::Probe,
            "Lease granted"
        );

        Ok(Lease::new(
            id,
            pool.clone(),
            limits,
            acquired_at,
            deadline,
            state,
            inner.clone(),
        ))
    }

    /// Records an upstream outcome that did not come through a lease.
    pub fn report_result(&self, pool_id: &str, outcome: Outcome) -> CircuitState {
        let pool = self.inner.pool(pool_id);
        self.inner.report(&pool, outcome, Admission::Normal)
    }

    pub fn circuit_state(&self, pool_id: &str) -> CircuitState {
        self.inner.breaker.state(pool_id).state
    }

    pub fn update_rate_limiter_config(&self, pool_id: &str, cfg: RateLimiterConfig) -> Result<()> {
        let capacity = cfg.max_concurrent_connections;
        self.inner.config.update_rate_limiter_config(pool_id, cfg)?;
        self.inner.gate.resize_pool(pool_id, capacity);
        Ok(())
    }

    /// Changes the limits of every pool without its own override.
    pub fn update_default_pool_config(&self, cfg: RateLimiterConfig) -> Result<()> {
        let capacity = cfg.max_concurrent_connections;
        self.inner.config.update_default_pool_config(cfg)?;
        for pool in self.inner.pools.iter() {
            if !self.inner.config.has_override(pool.key()) {
                self.inner.gate.resize_pool(pool.key(), capacity);
            }
        }
        Ok(())
    }

    pub fn clear_pool_override(&self, pool_id: &str) -> bool {
        let removed = self.inner.config.clear_pool_override(pool_id);
        if removed {
            let capacity = self.inner.config.pool_config(pool_id).max_concurrent_connections;
            self.inner.gate.resize_pool(pool_id, capacity);
        }
        removed
    }

    pub fn update_global_concurrency(&self, max_concurrent: usize) -> Result<()> {
        self.inner.config.update_global_concurrency(max_concurrent)?;
        self.inner.gate.resize_global(max_concurrent);
        Ok(())
    }

    pub fn update_pacing(&self, request_delay_ms: u64) -> Result<()> {
        self.inner.config.update_pacing(request_delay_ms)
    }

    pub fn update_breaker(&self, cfg: BreakerConfig) -> Result<()> {
        self.inner.config.update_breaker(cfg)
    }

    /// Applies a settings-panel command. Invalid values are rejected and the previous
    /// configuration stays in force.
    pub fn apply(&self, cmd: OperatorCommand) -> Result<()> {
        match cmd {
            OperatorCommand::SetRateLimiterConfig {
                pool,
                max_requests_per_10s,
                max_concurrent_connections,
                min_delay_ms,
            } => {
                let current = match &pool {
                    Some(pool) => self.inner.config.pool_config(pool),
                    None => self.inner.config.default_pool_config(),
                };
                let cfg = RateLimiterConfig {
                    max_requests_per_window: max_requests_per_10s,
                    window_ms: OPERATOR_WINDOW_MS,
                    buckets_per_window: current.buckets_per_window,
                    max_concurrent_connections,
                    min_delay_ms,
                };
                match pool {
                    Some(pool) => self.update_rate_limiter_config(&pool, cfg),
                    None => self.update_default_pool_config(cfg),
                }
            }
            OperatorCommand::SetGlobalConcurrency { max_concurrent } => {
                self.update_global_concurrency(max_concurrent)
            }
            OperatorCommand::SetPacing { request_delay_ms } => self.update_pacing(request_delay_ms),
            OperatorCommand::SetBreakerPolicy {
                failure_threshold,
                base_backoff_ms,
                max_backoff_ms,
            } => {
                let current = self.inner.config.breaker();
                self.update_breaker(OperatorCommand::breaker_policy(
                    &current,
                    failure_threshold,
                    base_backoff_ms,
                    max_backoff_ms,
                ))
            }
            OperatorCommand::ClearPoolOverride { pool } => {
                self.clear_pool_override(&pool);
                Ok(())
            }
        }
    }

    /// Force-releases leases past their deadline. Returns how many were reaped.
    pub fn reap_leaked_leases(&self) -> usize {
        self.inner.reap(Instant::now())
    }

    /// Runs [`reap_leaked_leases`](Self::reap_leaked_leases) on the configured interval
    /// until shutdown or until the controller is dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.lease().reaper_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.reap(Instant::now());
            }
            debug!("Lease reaper stopped");
        })
    }

    pub fn live_leases(&self) -> usize {
        self.inner.leases.len()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inner.pools.iter().map(|p| p.key().clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuses new admissions and fails every caller still waiting on the gate.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.gate.close();
        info!(live_leases = self.live_leases(), "Admission controller shutting down");
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let inner = &self.inner;
        let now = Instant::now();
        let mut pools = BTreeMap::new();
        let mut global_queue_depth = 0;

        for entry in inner.pools.iter() {
            let (name, pool) = (entry.key(), entry.value());
            let limits = inner.config.pool_config(name);
            let backoff = inner.breaker.state(name);
            let queue_depth = pool.stats.queue_depth();
            global_queue_depth += queue_depth;

            let retry_after_ms = match backoff.state {
                CircuitState::Open => backoff.circuit_open_until.map(|at| as_ms(until(at, now))),
                _ => None,
            };

            pools.insert(
                name.clone(),
                PoolSnapshot::from_stats(
                    &pool.stats,
                    inner.gate.pool_active(name),
                    limits.max_concurrent_connections,
                    pool.window.occupancy(&limits, now),
                    limits.max_requests_per_window,
                    CircuitSnapshot {
                        state: backoff.state,
                        consecutive_failures: backoff.consecutive_failures,
                        retry_after_ms,
                    },
                    queue_depth,
                ),
            );
        }

        AdmissionSnapshot {
            captured_at: chrono::Utc::now(),
            global_active_leases: inner.gate.global_active(),
            global_capacity: inner.config.global().max_concurrent,
            global_queue_depth,
            live_leases: inner.leases.len(),
            pools,
        }
    }
}
