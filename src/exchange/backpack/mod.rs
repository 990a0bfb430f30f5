//! Backpack perpetuals integration.
//!
//! Public market data only. Backpack signs private requests with ED25519,
//! which this crate does not carry, so trading calls are refused and the
//! venue can only take part in paper (dry-run) sessions.

mod client;
mod types;

pub use client::BackpackClient;
pub use types::*;
