mod command;
mod limits;
mod manager;

pub use command::{OperatorCommand, OPERATOR_WINDOW_MS};
pub use limits::*;
pub use manager::ConfigManager;

use config::{Config as ConfigLoader, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::Result;

const CONFIG_FILE: &str = "admission";
const ENV_PREFIX: &str = "ADMISSION";

/// Startup settings. Everything here can later be changed through [`ConfigManager`].
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub log_level: Option<String>,
    pub log_json: bool,

    pub global: GlobalConcurrencyConfig,
    pub pacing: PacingConfig,
    pub breaker: BreakerConfig,
    pub lease: LeaseConfig,

    /// Limits for pools without an entry in `pools`.
    pub default_pool: RateLimiterConfig,
    pub pools: HashMap<String, RateLimiterConfig>,
}

impl Settings {
    /// Reads `admission.{toml,json,yaml}` if present, then `ADMISSION__*` env vars.
    ///
    /// `ADMISSION__GLOBAL__MAX_CONCURRENT=20` sets `global.max_concurrent`.
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let loader = ConfigLoader::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = loader.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings = ConfigLoader::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.global.validate()?;
        self.pacing.validate()?;
        self.breaker.validate()?;
        self.lease.validate()?;
        self.default_pool.validate()?;
        for cfg in self.pools.values() {
            cfg.validate()?;
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            log_level = "debug"

            [global]
            max_concurrent = 8

            [pacing]
            request_delay_ms = 25

            [pools.dexscreener]
            max_requests_per_window = 30
            window_ms = 60000
            max_concurrent_connections = 4
            min_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_level(), "debug");
        assert_eq!(settings.global.max_concurrent, 8);
        assert_eq!(settings.pacing.request_delay_ms, 25);
        assert_eq!(settings.default_pool, RateLimiterConfig::default());

        let dex = &settings.pools["dexscreener"];
        assert_eq!(dex.max_requests_per_window, 30);
        assert_eq!(dex.buckets_per_window, DEFAULT_BUCKETS_PER_WINDOW);
        assert_eq!(settings.breaker.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
    }

    #[test]
    fn test_settings_reject_invalid_pool() {
        let res = Settings::from_toml_str(
            r#"
            [pools.proxy-1]
            max_concurrent_connections = 0
            "#,
        );
        assert!(res.is_err());
    }
}
