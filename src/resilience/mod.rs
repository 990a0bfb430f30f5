//! Retry and time abstractions for remote calls.
//!
//! - `clock`: injectable time source so backoff schedules are testable
//! - `retry`: classification-driven retry with exponential backoff

mod clock;
mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{CallFailure, Idempotency, ResilientCaller, RetryContext, RetryPolicy};
