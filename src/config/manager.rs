use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{
    BreakerConfig, GlobalConcurrencyConfig, LeaseConfig, PacingConfig, RateLimiterConfig,
    Settings,
};
use crate::error::Result;

/// Live limiter parameters.
///
/// Every limit sits behind an [`ArcSwap`]: readers get a whole snapshot with one atomic
/// load, writers validate first and then swap in a fresh copy. A rejected update leaves
/// the previous value in place. Lease settings are fixed at startup.
#[derive(Debug)]
pub struct ConfigManager {
    global: ArcSwap<GlobalConcurrencyConfig>,
    pacing: ArcSwap<PacingConfig>,
    breaker: ArcSwap<BreakerConfig>,
    lease: LeaseConfig,
    default_pool: ArcSwap<RateLimiterConfig>,
    pools: ArcSwap<HashMap<String, Arc<RateLimiterConfig>>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ConfigManager {
    pub fn from_settings(settings: &Settings) -> Self {
        let pools = settings
            .pools
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(cfg.clone())))
            .collect::<HashMap<_, _>>();

        Self {
            global: ArcSwap::from_pointee(settings.global.clone()),
            pacing: ArcSwap::from_pointee(settings.pacing.clone()),
            breaker: ArcSwap::from_pointee(settings.breaker.clone()),
            lease: settings.lease.clone(),
            default_pool: ArcSwap::from_pointee(settings.default_pool.clone()),
            pools: ArcSwap::from_pointee(pools),
        }
    }

    /// Override if one exists, otherwise the default pool limits.
    pub fn pool_config(&self, pool: &str) -> Arc<RateLimiterConfig> {
        match self.pools.load().get(pool) {
            Some(cfg) => cfg.clone(),
            None => self.default_pool.load_full(),
        }
    }

    pub fn default_pool_config(&self) -> Arc<RateLimiterConfig> {
        self.default_pool.load_full()
    }

    pub fn has_override(&self, pool: &str) -> bool {
        self.pools.load().contains_key(pool)
    }

    pub fn global(&self) -> Arc<GlobalConcurrencyConfig> {
        self.global.load_full()
    }

    pub fn pacing(&self) -> Arc<PacingConfig> {
        self.pacing.load_full()
    }

    pub fn breaker(&self) -> Arc<BreakerConfig> {
        self.breaker.load_full()
    }

    /// Fixed at startup; the reaper interval is read once when the reaper spawns.
    pub fn lease(&self) -> &LeaseConfig {
        &self.lease
    }

    pub fn update_rate_limiter_config(&self, pool: &str, cfg: RateLimiterConfig) -> Result<()> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        self.pools.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(pool.to_string(), cfg.clone());
            next
        });
        info!(pool, config = ?cfg, "Rate limiter config updated");
        Ok(())
    }

    pub fn update_default_pool_config(&self, cfg: RateLimiterConfig) -> Result<()> {
        cfg.validate()?;
        info!(config = ?cfg, "Default pool config updated");
        self.default_pool.store(Arc::new(cfg));
        Ok(())
    }

    /// Drops a pool override so the pool falls back to the default limits.
    pub fn clear_pool_override(&self, pool: &str) -> bool {
        let mut removed = false;
        self.pools.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(pool).is_some();
            next
        });
        if removed {
            info!(pool, "Pool override cleared");
        }
        removed
    }

    pub fn update_global_concurrency(&self, max_concurrent: usize) -> Result<()> {
        let cfg = GlobalConcurrencyConfig { max_concurrent };
        cfg.validate()?;
        self.global.store(Arc::new(cfg));
        info!(max_concurrent, "Global concurrency updated");
        Ok(())
    }

    pub fn update_pacing(&self, request_delay_ms: u64) -> Result<()> {
        let cfg = PacingConfig { request_delay_ms };
        cfg.validate()?;
        self.pacing.store(Arc::new(cfg));
        info!(request_delay_ms, "Pacing updated");
        Ok(())
    }

    pub fn update_breaker(&self, cfg: BreakerConfig) -> Result<()> {
        cfg.validate()?;
        info!(config = ?cfg, "Breaker policy updated");
        self.breaker.store(Arc::new(cfg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdmissionError;
    use std::thread;

    #[test]
    fn test_pool_override_and_fallback() {
        let manager = ConfigManager::default();
        assert_eq!(*manager.pool_config("solana-rpc"), RateLimiterConfig::default());

        let mut cfg = RateLimiterConfig::default();
        cfg.max_requests_per_window = 10;
        manager.update_rate_limiter_config("solana-rpc", cfg.clone()).unwrap();

        assert_eq!(*manager.pool_config("solana-rpc"), cfg);
        assert_eq!(*manager.pool_config("dexscreener"), RateLimiterConfig::default());

        assert!(manager.clear_pool_override("solana-rpc"));
        assert!(!manager.clear_pool_override("solana-rpc"));
        assert!(!manager.has_override("solana-rpc"));
    }

    #[test]
    fn test_invalid_update_keeps_previous() {
        let manager = ConfigManager::default();
        let res = manager.update_global_concurrency(0);
        assert!(matches!(res, Err(AdmissionError::InvalidConfig(_))));
        assert_eq!(manager.global().max_concurrent, 20);

        let mut bad = RateLimiterConfig::default();
        bad.window_ms = 0;
        assert!(manager.update_rate_limiter_config("solana-rpc", bad).is_err());
        assert!(!manager.has_override("solana-rpc"));

        assert!(manager.update_pacing(0).is_err());
        assert_eq!(manager.pacing().request_delay_ms, 15);
    }

    #[test]
    fn test_concurrent_reads_never_torn() {
        let manager = Arc::new(ConfigManager::default());
        let a = RateLimiterConfig::new(
            10,
            std::time::Duration::from_secs(1),
            1,
            std::time::Duration::from_millis(1),
        );
        let b = RateLimiterConfig::new(
            500,
            std::time::Duration::from_secs(60),
            50,
            std::time::Duration::from_millis(500),
        );

        let writer = {
            let manager = manager.clone();
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for i in 0..2_000 {
                    let cfg = if i % 2 == 0 { a.clone() } else { b.clone() };
                    manager.update_rate_limiter_config("solana-rpc", cfg).unwrap();
                }
            })
        };

        let mut readers = vec![];
        for _ in 0..4 {
            let manager = manager.clone();
            let (a, b) = (a.clone(), b.clone());
            readers.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    let seen = manager.pool_config("solana-rpc");
                    assert!(*seen == a || *seen == b || *seen == RateLimiterConfig::default());
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
