pub mod reporter;
pub mod stats;

pub use reporter::{AdmissionSnapshot, CircuitSnapshot, PoolSnapshot, StatsReporter};
pub use stats::PoolStats;
