//! Limiter primitives. Each type owns its own synchronization; callers never hold one of
//! their locks across an await.

pub mod backoff;
pub mod gate;
pub mod pacing;
pub mod window;

pub use backoff::{backoff_delay, Admission, BackoffCoordinator, BackoffState, CircuitState, Outcome};
pub use gate::{ConcurrencyGate, GateToken, Slots};
pub use pacing::{PacingClock, PacingSlot};
pub use window::{RateWindow, WindowTicket};
