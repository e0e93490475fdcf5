//! The admission path workers call: acquire a lease for a pool, release it with an outcome.

mod context;
mod controller;
mod lease;
mod pool;

pub use context::{AcquireContext, Priority};
pub use controller::AdmissionController;
pub use lease::Lease;
