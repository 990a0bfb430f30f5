//! OKX perpetual swap integration.
//!
//! Signed REST v5 access for USDT-margined swaps. Order sizes on OKX are
//! expressed in contracts; the client converts to and from base units using
//! the configured contract value.

mod client;
mod types;

pub use client::OkxClient;
pub use types::*;
