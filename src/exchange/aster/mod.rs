//! Aster perpetual futures integration.
//!
//! Aster exposes a Binance-compatible futures REST API (`/fapi/...`):
//! - HMAC-SHA256 signed query strings with `X-MBX-APIKEY`
//! - `newClientOrderId` / `origClientOrderId` for idempotent placement
//! - Error bodies of the form `{"code": -1121, "msg": "..."}`

mod client;
mod types;

pub use client::AsterClient;
pub use types::*;
