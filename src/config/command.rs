use serde::{Deserialize, Serialize};

use super::BreakerConfig;
use crate::error::{AdmissionError, Result};

/// Window length behind the operator-facing "requests per 10 seconds" setting.
pub const OPERATOR_WINDOW_MS: u64 = 10_000;

/// Settings-panel updates, as sent by the operator UI.
///
/// ```json
/// {"type": "SetRateLimiterConfig", "maxRequestsPer10s": 90, "maxConcurrentConnections": 35, "minDelayMs": 105}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperatorCommand {
    #[serde(rename_all = "camelCase")]
    SetRateLimiterConfig {
        /// Without a pool the default limits change.
        #[serde(default)]
        pool: Option<String>,
        #[serde(rename = "maxRequestsPer10s")]
        max_requests_per_10s: u32,
        max_concurrent_connections: usize,
        min_delay_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    SetGlobalConcurrency { max_concurrent: usize },
    #[serde(rename_all = "camelCase")]
    SetPacing { request_delay_ms: u64 },
    #[serde(rename_all = "camelCase")]
    SetBreakerPolicy {
        failure_threshold: u32,
        base_backoff_ms: u64,
        max_backoff_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ClearPoolOverride { pool: String },
}

impl OperatorCommand {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AdmissionError::InvalidConfig(format!("Malformed command: {}", e)))
    }

    /// Merges the breaker fields the panel exposes into the current policy.
    pub(crate) fn breaker_policy(
        current: &BreakerConfig,
        failure_threshold: u32,
        base_backoff_ms: u64,
        max_backoff_ms: u64,
    ) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            base_backoff_ms,
            max_backoff_ms,
            failure_lookback_ms: current.failure_lookback_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_limiter_command() {
        let cmd = OperatorCommand::from_json(
            r#"{"type":"SetRateLimiterConfig","pool":"solana-rpc","maxRequestsPer10s":90,"maxConcurrentConnections":35,"minDelayMs":105}"#,
        )
        .unwrap();

        assert_eq!(
            cmd,
            OperatorCommand::SetRateLimiterConfig {
                pool: Some("solana-rpc".into()),
                max_requests_per_10s: 90,
                max_concurrent_connections: 35,
                min_delay_ms: 105,
            }
        );
    }

    #[test]
    fn test_parse_global_commands() {
        let cmd = OperatorCommand::from_json(r#"{"type":"SetGlobalConcurrency","maxConcurrent":20}"#)
            .unwrap();
        assert_eq!(cmd, OperatorCommand::SetGlobalConcurrency { max_concurrent: 20 });

        let cmd = OperatorCommand::from_json(r#"{"type":"SetPacing","requestDelayMs":15}"#).unwrap();
        assert_eq!(cmd, OperatorCommand::SetPacing { request_delay_ms: 15 });
    }

    #[test]
    fn test_malformed_command() {
        let res = OperatorCommand::from_json(r#"{"type":"SetPacing"}"#);
        assert!(matches!(res, Err(AdmissionError::InvalidConfig(_))));
    }
}
