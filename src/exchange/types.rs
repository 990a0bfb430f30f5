//! Venue-neutral order, book and account types.

use super::symbol::Symbol;
use super::traits::Venue;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Side needed to move a position by `delta` (None when zero).
    pub fn for_delta(delta: Decimal) -> Option<Side> {
        if delta > Decimal::ZERO {
            Some(Side::Buy)
        } else if delta < Decimal::ZERO {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Lifecycle state of an order as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    /// No further fills can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled | OrderState::Rejected)
    }
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOfBook {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl TopOfBook {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self {
            bid,
            ask,
            bid_qty: Decimal::ZERO,
            ask_qty: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn with_quantities(mut self, bid_qty: Decimal, ask_qty: Decimal) -> Self {
        self.bid_qty = bid_qty;
        self.ask_qty = ask_qty;
        self
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Touch price a taker pays on `side`.
    pub fn touch(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Best price on the resting side of `side` (bid for buys, ask for sells).
    pub fn same_side(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    /// Both sides present and not crossed.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.bid <= self.ask
    }
}

/// New order request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    /// Caller-generated idempotency token
    pub client_order_id: String,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            side,
            quantity,
            price: Some(price),
            order_type: OrderType::Limit,
            client_order_id: client_order_id.into(),
            reduce_only: false,
        }
    }

    pub fn market(
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            side,
            quantity,
            price: None,
            order_type: OrderType::Market,
            client_order_id: client_order_id.into(),
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Reference to an order on a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub venue: Venue,
    pub symbol: Symbol,
    /// Venue-assigned id, unknown when the order was adopted by client id only
    pub order_id: Option<String>,
    pub client_order_id: String,
}

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order_id {
            Some(id) => write!(f, "{}:{}({})", self.venue.short_code(), id, self.client_order_id),
            None => write!(f, "{}:?({})", self.venue.short_code(), self.client_order_id),
        }
    }
}

/// Fill state of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub state: OrderState,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Volume-weighted fill price, zero when nothing filled
    pub avg_price: Decimal,
}

impl OrderReport {
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

/// Open position mirrored from the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed quantity in base units (negative = short)
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub side: Option<Side>,
}

impl Position {
    pub fn new(symbol: Symbol, quantity: Decimal, entry_price: Decimal, leverage: u32) -> Self {
        Self {
            symbol,
            quantity,
            entry_price,
            leverage,
            side: Side::for_delta(quantity),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.entry_price
    }
}

/// Net signed quantity held on `symbol` across a position list.
pub fn net_position(positions: &[Position], symbol: &Symbol) -> Decimal {
    positions
        .iter()
        .filter(|p| &p.symbol == symbol)
        .map(|p| p.quantity)
        .sum()
}

/// Account balance in the settlement asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), dec!(-1));
        assert_eq!(Side::for_delta(dec!(0.5)), Some(Side::Buy));
        assert_eq!(Side::for_delta(dec!(-0.5)), Some(Side::Sell));
        assert_eq!(Side::for_delta(Decimal::ZERO), None);
    }

    #[test]
    fn test_top_of_book_prices() {
        let book = TopOfBook::new(dec!(50010), dec!(50012));
        assert_eq!(book.mid(), dec!(50011));
        assert_eq!(book.touch(Side::Buy), dec!(50012));
        assert_eq!(book.same_side(Side::Buy), dec!(50010));
        assert!(book.is_valid());
        assert!(!TopOfBook::new(dec!(10), dec!(9)).is_valid());
    }

    #[test]
    fn test_net_position_filters_symbol() {
        let btc = Symbol::new("BTC", "USDT");
        let eth = Symbol::new("ETH", "USDT");
        let positions = vec![
            Position::new(btc.clone(), dec!(0.01), dec!(50000), 5),
            Position::new(eth, dec!(-1), dec!(3000), 5),
        ];
        assert_eq!(net_position(&positions, &btc), dec!(0.01));
        assert_eq!(positions[1].side, Some(Side::Sell));
    }
}
