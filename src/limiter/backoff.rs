use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{AdmissionError, Result};

/// How an admitted request ended, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Upstream answered 429 or an equivalent throttling signal.
    RateLimited,
    /// Connection refused, reset, timed out, or a 5xx from the provider.
    TransportError,
    /// Application-level failure (not found, bad params). Says nothing about upstream health.
    OtherError,
}

impl Outcome {
    pub fn counts_as_failure(self) -> bool {
        matches!(self, Outcome::RateLimited | Outcome::TransportError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What the breaker let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single request allowed while HalfOpen.
    Probe,
}

#[derive(Debug, Clone)]
pub struct BackoffState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub circuit_open_until: Option<Instant>,
    pub current_backoff: Duration,
    probe_in_flight: bool,
    last_failure: Option<Instant>,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            circuit_open_until: None,
            current_backoff: Duration::ZERO,
            probe_in_flight: false,
            last_failure: None,
        }
    }
}

impl BackoffState {
    fn open(&mut self, policy: &BreakerConfig, now: Instant) {
        let backoff = backoff_delay(policy, self.consecutive_failures);
        self.state = CircuitState::Open;
        self.current_backoff = backoff;
        self.circuit_open_until = Some(now + backoff);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        *self = BackoffState::default();
    }

    fn record_failure(&mut self, policy: &BreakerConfig, now: Instant) {
        let stale = self
            .last_failure
            .map(|at| now.saturating_duration_since(at) > policy.failure_lookback())
            .unwrap_or(false);
        if stale {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
    }
}

/// `min(cap, base * 2^n) + jitter(0, base)`
pub fn backoff_delay(policy: &BreakerConfig, failures: u32) -> Duration {
    let base = policy.base_backoff();
    let exp = base
        .checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .unwrap_or(Duration::MAX);
    let jitter_ms = rand::random_range(0..policy.base_backoff_ms.max(1));
    exp.min(policy.max_backoff()) + Duration::from_millis(jitter_ms)
}

/// Per-pool circuit breakers driven by upstream throttling and transport failures.
#[derive(Debug, Default)]
pub struct BackoffCoordinator {
    pools: DashMap<String, BackoffState>,
}

impl BackoffCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails fast with `PoolDegraded` while the circuit is open. The first caller after
    /// the open period becomes the probe; everyone else keeps failing until it reports.
    pub fn admit(&self, pool: &str, now: Instant) -> Result<Admission> {
        let Some(mut st) = self.pools.get_mut(pool) else {
            return Ok(Admission::Normal);
        };

        match st.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => match st.circuit_open_until {
                Some(until) if now < until => Err(AdmissionError::PoolDegraded {
                    pool: pool.to_string(),
                    retry_after: Some(until - now),
                }),
                _ => {
                    st.state = CircuitState::HalfOpen;
                    st.probe_in_flight = true;
                    info!(pool, "Circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                }
            },
            CircuitState::HalfOpen if st.probe_in_flight => Err(AdmissionError::PoolDegraded {
                pool: pool.to_string(),
                retry_after: None,
            }),
            CircuitState::HalfOpen => {
                st.probe_in_flight = true;
                debug!(pool, "Re-admitting probe");
                Ok(Admission::Probe)
            }
        }
    }

    /// Feeds one outcome into the pool's breaker and returns the resulting state.
    pub fn report(
        &self,
        pool: &str,
        outcome: Outcome,
        admission: Admission,
        policy: &BreakerConfig,
        now: Instant,
    ) -> CircuitState {
        let mut st = match self.pools.get_mut(pool) {
            Some(st) => st,
            None => self.pools.entry(pool.to_string()).or_default(),
        };

        match (st.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                if outcome.counts_as_failure() {
                    // The streak continues across the open period regardless of lookback.
                    st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                    st.last_failure = Some(now);
                    st.open(policy, now);
                    warn!(
                        pool,
                        ?outcome,
                        failures = st.consecutive_failures,
                        backoff_ms = st.current_backoff.as_millis() as u64,
                        "Probe failed, circuit re-opened"
                    );
                } else {
                    st.close();
                    info!(pool, ?outcome, "Probe succeeded, circuit closed");
                }
            }
            (CircuitState::Closed, _) => {
                if outcome.counts_as_failure() {
                    st.record_failure(policy, now);
                    if st.consecutive_failures >= policy.failure_threshold {
                        st.open(policy, now);
                        warn!(
                            pool,
                            ?outcome,
                            failures = st.consecutive_failures,
                            backoff_ms = st.current_backoff.as_millis() as u64,
                            "Circuit opened"
                        );
                    }
                } else if outcome == Outcome::Success {
                    st.consecutive_failures = 0;
                }
            }
            (state, _) => {
                debug!(pool, ?state, ?outcome, "Outcome from pre-open lease ignored");
            }
        }

        st.state
    }

    /// Hands the probe slot back without an outcome, e.g. the probe never got dispatched.
    pub fn abandon_probe(&self, pool: &str) {
        if let Some(mut st) = self.pools.get_mut(pool) {
            if st.state == CircuitState::HalfOpen && st.probe_in_flight {
                st.probe_in_flight = false;
                debug!(pool, "Probe abandoned, next caller probes");
            }
        }
    }

    pub fn state(&self, pool: &str) -> BackoffState {
        self.pools
            .get(pool)
            .map(|st| st.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerConfig {
        BreakerConfig::default()
    }

    fn trip(coord: &BackoffCoordinator, pool: &str, now: Instant) {
        for _ in 0..3 {
            coord.report(pool, Outcome::RateLimited, Admission::Normal, &policy(), now);
        }
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let policy = policy();
        for n in 0..40 {
            let d = backoff_delay(&policy, n);
            let exp = (policy.base_backoff_ms.saturating_mul(1u64 << n.min(40)))
                .min(policy.max_backoff_ms);
            assert!(d.as_millis() as u64 >= exp);
            assert!((d.as_millis() as u64) < exp + policy.base_backoff_ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_opens_circuit() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();

        coord.report("solana-rpc", Outcome::RateLimited, Admission::Normal, &policy(), now);
        coord.report("solana-rpc", Outcome::TransportError, Admission::Normal, &policy(), now);
        assert_eq!(coord.admit("solana-rpc", now).unwrap(), Admission::Normal);

        let state =
            coord.report("solana-rpc", Outcome::RateLimited, Admission::Normal, &policy(), now);
        assert_eq!(state, CircuitState::Open);

        let err = coord.admit("solana-rpc", now + Duration::from_millis(100)).unwrap_err();
        match err {
            AdmissionError::PoolDegraded { retry_after: Some(d), .. } => {
                assert!(d >= Duration::from_millis(3_900));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_errors_do_not_count() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();

        for _ in 0..10 {
            coord.report("dexscreener", Outcome::OtherError, Admission::Normal, &policy(), now);
        }
        assert_eq!(coord.state("dexscreener").state, CircuitState::Closed);
        assert_eq!(coord.state("dexscreener").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_streak() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();

        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), now);
        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), now);
        coord.report("proxy-1", Outcome::Success, Admission::Normal, &policy(), now);
        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), now);

        assert_eq!(coord.state("proxy-1").state, CircuitState::Closed);
        assert_eq!(coord.state("proxy-1").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_not_consecutive() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(120);

        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), now);
        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), now);
        coord.report("proxy-1", Outcome::RateLimited, Admission::Normal, &policy(), later);

        assert_eq!(coord.state("proxy-1").state, CircuitState::Closed);
        assert_eq!(coord.state("proxy-1").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_then_close() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();
        trip(&coord, "solana-rpc", now);

        let until = coord.state("solana-rpc").circuit_open_until.unwrap();
        assert_eq!(coord.admit("solana-rpc", until).unwrap(), Admission::Probe);

        // Everyone else still fails while the probe is out.
        let err = coord.admit("solana-rpc", until).unwrap_err();
        assert!(matches!(err, AdmissionError::PoolDegraded { retry_after: None, .. }));

        let state = coord.report("solana-rpc", Outcome::Success, Admission::Probe, &policy(), until);
        assert_eq!(state, CircuitState::Closed);
        assert_eq!(coord.state("solana-rpc").consecutive_failures, 0);
        assert_eq!(coord.admit("solana-rpc", until).unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_longer_backoff() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();
        trip(&coord, "solana-rpc", now);

        let until = coord.state("solana-rpc").circuit_open_until.unwrap();
        coord.admit("solana-rpc", until).unwrap();
        let state =
            coord.report("solana-rpc", Outcome::RateLimited, Admission::Probe, &policy(), until);

        assert_eq!(state, CircuitState::Open);
        let st = coord.state("solana-rpc");
        assert_eq!(st.consecutive_failures, 4);
        assert!(st.current_backoff >= Duration::from_millis(8_000));
        assert!(st.circuit_open_until.unwrap() > until);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_hands_slot_on() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();
        trip(&coord, "solana-rpc", now);

        let until = coord.state("solana-rpc").circuit_open_until.unwrap();
        assert_eq!(coord.admit("solana-rpc", until).unwrap(), Admission::Probe);
        coord.abandon_probe("solana-rpc");

        assert_eq!(coord.admit("solana-rpc", until).unwrap(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_open_results_ignored() {
        let coord = BackoffCoordinator::new();
        let now = Instant::now();
        trip(&coord, "solana-rpc", now);

        let state = coord.report("solana-rpc", Outcome::Success, Admission::Normal, &policy(), now);
        assert_eq!(state, CircuitState::Open);
        assert_eq!(coord.state("solana-rpc").consecutive_failures, 3);
    }
}
