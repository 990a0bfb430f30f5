//! Venue-agnostic adapter contract.
//!
//! The execution core only talks to venues through [`ExchangeAdapter`].
//! Each venue normalizes its own symbols, signing and error codes behind it.

use super::symbol::Symbol;
use super::types::{Balance, OrderHandle, OrderReport, OrderRequest, Position, TopOfBook};
use crate::error::ExchangeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result of a single adapter call.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Venue identifier for multi-venue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Aster,
    Okx,
    Backpack,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Aster => write!(f, "Aster"),
            Venue::Okx => write!(f, "OKX"),
            Venue::Backpack => write!(f, "Backpack"),
        }
    }
}

impl FromStr for Venue {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aster" => Ok(Venue::Aster),
            "okx" => Ok(Venue::Okx),
            "backpack" => Ok(Venue::Backpack),
            other => Err(ExchangeError::UnknownSymbol(format!("unknown venue '{}'", other))),
        }
    }
}

impl Venue {
    /// Short code for display (2-3 chars).
    pub fn short_code(&self) -> &'static str {
        match self {
            Venue::Aster => "AS",
            Venue::Okx => "OKX",
            Venue::Backpack => "BP",
        }
    }
}

/// Uniform order, position and market-data interface to one venue account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Returns the venue identifier.
    fn venue(&self) -> Venue;

    /// Best bid/ask for the symbol.
    async fn get_orderbook(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook>;

    /// Place an order. The request's client order id is forwarded to the venue
    /// so the order can be looked up after an ambiguous failure.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle>;

    /// Cancel an order. Returns `false` when the order was already closed.
    async fn cancel_order(&self, handle: &OrderHandle) -> ExchangeResult<bool>;

    /// Current fill state of an order. Looks up by venue order id when known,
    /// otherwise by client order id.
    async fn get_order_status(&self, handle: &OrderHandle) -> ExchangeResult<OrderReport>;

    /// All open positions on the account.
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>>;

    /// Close the whole position on `symbol` at market.
    async fn close_position(&self, symbol: &Symbol) -> ExchangeResult<Option<OrderHandle>>;

    /// Margin balance in the settlement currency.
    async fn get_balance(&self) -> ExchangeResult<Balance>;

    /// Set leverage for the symbol.
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> ExchangeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_display() {
        assert_eq!(Venue::Aster.to_string(), "Aster");
        assert_eq!(Venue::Okx.short_code(), "OKX");
        assert_eq!(Venue::Backpack.short_code(), "BP");
    }

    #[test]
    fn test_venue_from_str() {
        assert_eq!("OKX".parse::<Venue>().unwrap(), Venue::Okx);
        assert_eq!("backpack".parse::<Venue>().unwrap(), Venue::Backpack);
        assert!("binance".parse::<Venue>().is_err());
    }
}
