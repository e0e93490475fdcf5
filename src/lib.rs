//! Request admission control for rate-limited upstream RPC providers.
//!
//! Workers ask an [`AdmissionController`] for a [`Lease`] on a named pool before each
//! outbound call and release it with an [`Outcome`] afterwards. The controller keeps every
//! pool under its rolling-window limit, its minimum dispatch spacing and its connection
//! cap, spaces dispatches process-wide, caps total in-flight requests, and opens a circuit
//! breaker when a provider starts throttling.
//!
//! ```no_run
//! use rpc_admission::{AcquireContext, AdmissionController, Outcome};
//! use std::time::Duration;
//!
//! # async fn run() -> rpc_admission::Result<()> {
//! let controller = AdmissionController::default();
//! let lease = controller
//!     .acquire("solana-rpc", &AcquireContext::with_timeout(Duration::from_secs(5)))
//!     .await?;
//! // ... perform the RPC call ...
//! lease.release(Outcome::Success);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod analytics;
pub mod config;
pub mod error;
pub mod limiter;
pub mod utils;

pub use admission::{AcquireContext, AdmissionController, Lease, Priority};
pub use analytics::{AdmissionSnapshot, StatsReporter};
pub use config::{ConfigManager, OperatorCommand, RateLimiterConfig, Settings};
pub use error::{AdmissionError, Result};
pub use limiter::{CircuitState, Outcome};
