//! Venue integrations for cross-venue hedged arbitrage.
//!
//! ## Aster
//! Signed REST access to the Binance-compatible futures API:
//! - Top of book, order placement/cancel/status by client id
//! - Positions, balance and leverage
//!
//! ## OKX
//! Signed REST v5 access to USDT swaps (sizes converted from contracts).
//!
//! ## Backpack
//! Public market data only; trades through the paper venue in dry runs.
//!
//! ## Paper
//! Simulated account used for dry runs and tests.

pub mod aster;
pub mod backpack;
mod factory;
pub mod okx;
pub mod paper;
mod symbol;
mod traits;
mod types;

pub use aster::AsterClient;
pub use backpack::BackpackClient;
pub use factory::connect;
pub use okx::OkxClient;
pub use paper::{PaperExchange, PaperFault, PaperOp};
pub use symbol::Symbol;
#[cfg(test)]
pub use traits::MockExchangeAdapter;
pub use traits::{ExchangeAdapter, ExchangeResult, Venue};
pub use types::*;
