//! # Hedge Arb
//!
//! Hedged cross-venue perpetual spread arbitrage. A session watches the
//! same perpetual on 2-3 venues, enters when one venue's bid clears
//! another's ask, holds the hedged position and exits once the spread
//! converges.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Adapter and session error types
//! - `exchange`: Venue adapters (Aster, OKX, Backpack) and the paper venue
//! - `resilience`: Retry policy and injectable clock for remote calls
//! - `strategy`: Spread monitor, leg workers, hedge coordinator and session runner
//! - `risk`: Operator alerts and the reconciliation auditor
//! - `persistence`: SQLite storage of finished sessions
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod resilience;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{ArbError, ExchangeError};
