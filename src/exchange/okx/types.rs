//! Wire types for OKX v5 responses.
//!
//! OKX encodes numbers as strings and uses the empty string for absent
//! values, so numeric fields are kept as `String` and parsed with
//! [`parse_decimal`].

use crate::exchange::types::OrderState;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Common response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// Order book snapshot. Levels are `[price, size, _, orders]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BookData {
    pub asks: Vec<Vec<String>>,
    pub bids: Vec<Vec<String>>,
    pub ts: String,
}

/// Per-order acknowledgement for place/cancel requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

/// Order details from `/api/v5/trade/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub state: String,
    pub side: String,
    pub sz: String,
    #[serde(default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub avg_px: String,
}

impl OrderDetail {
    pub fn order_state(&self) -> OrderState {
        match self.state.as_str() {
            "live" => OrderState::Open,
            "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "mmp_canceled" => OrderState::Canceled,
            _ => OrderState::Rejected,
        }
    }
}

/// Position entry from `/api/v5/account/positions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    pub inst_id: String,
    /// Contracts; signed in net mode
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub lever: String,
    /// `net`, `long` or `short`
    #[serde(default)]
    pub pos_side: String,
}

/// Account balance entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceData {
    #[serde(default)]
    pub details: Vec<BalanceDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDetail {
    pub ccy: String,
    #[serde(default)]
    pub avail_bal: String,
    #[serde(default)]
    pub frozen_bal: String,
    #[serde(default)]
    pub eq: String,
}

/// Parse an OKX numeric string, treating empty as zero.
pub fn parse_decimal(value: &str) -> Decimal {
    if value.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decimal_handles_empty() {
        assert_eq!(parse_decimal(""), Decimal::ZERO);
        assert_eq!(parse_decimal("50010.5"), dec!(50010.5));
    }

    #[test]
    fn test_order_state_mapping() {
        let json = r#"{"ordId":"1","clOrdId":"t","state":"partially_filled","side":"buy","sz":"2","accFillSz":"1","avgPx":"50000"}"#;
        let detail: OrderDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.order_state(), OrderState::PartiallyFilled);
    }
}
