//! Backpack public REST client.

use super::types::*;
use crate::config::VenueConfig;
use crate::error::ExchangeError;
use crate::exchange::symbol::Symbol;
use crate::exchange::traits::{ExchangeAdapter, ExchangeResult, Venue};
use crate::exchange::types::{Balance, OrderHandle, OrderReport, OrderRequest, Position, TopOfBook};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

const BASE_URL: &str = "https://api.backpack.exchange";
const READ_ONLY: &str = "signed Backpack requests are not supported";

/// Read-only Backpack client.
#[derive(Debug, Clone)]
pub struct BackpackClient {
    http: Client,
    base_url: String,
}

impl BackpackClient {
    pub fn new(venue: &VenueConfig) -> Result<Self> {
        Self::with_base_url(venue.base_url.as_deref().unwrap_or(BASE_URL))
    }

    /// Create a client against a custom endpoint.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn read_only<T>() -> ExchangeResult<T> {
        Err(ExchangeError::Auth(READ_ONLY.to_string()))
    }
}

fn classify_error(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| format!("{} ({})", e.message, e.code))
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));

    if status == StatusCode::TOO_MANY_REQUESTS {
        ExchangeError::RateLimited(message)
    } else if status.is_server_error() {
        ExchangeError::Network(message)
    } else if parsed.map(|e| e.code == "INVALID_SYMBOL").unwrap_or(false) {
        ExchangeError::UnknownSymbol(message)
    } else {
        ExchangeError::RejectedOrder(message)
    }
}

/// Best level on one side of the book.
fn best(levels: &[[String; 2]], highest: bool) -> (Decimal, Decimal) {
    let parsed = levels.iter().filter_map(|[px, qty]| {
        Some((Decimal::from_str(px).ok()?, Decimal::from_str(qty).ok()?))
    });
    let pick = if highest {
        parsed.max_by(|a, b| a.0.cmp(&b.0))
    } else {
        parsed.min_by(|a, b| a.0.cmp(&b.0))
    };
    pick.unwrap_or_default()
}

#[async_trait]
impl ExchangeAdapter for BackpackClient {
    fn venue(&self) -> Venue {
        Venue::Backpack
    }

    #[instrument(skip(self), name = "bp_orderbook")]
    async fn get_orderbook(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook> {
        let url = format!(
            "{}/api/v1/depth?symbol={}",
            self.base_url,
            urlencoding::encode(&symbol.native(Venue::Backpack))
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        let depth: Depth = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Network(format!("malformed Backpack depth: {}", e)))?;
        let (bid, bid_qty) = best(&depth.bids, true);
        let (ask, ask_qty) = best(&depth.asks, false);

        // Backpack reports microseconds
        let timestamp = depth
            .timestamp
            .and_then(|us| Utc.timestamp_micros(us).single())
            .unwrap_or_else(Utc::now);

        Ok(TopOfBook {
            bid,
            ask,
            bid_qty,
            ask_qty,
            timestamp,
        })
    }

    async fn place_order(&self, _request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        Self::read_only()
    }

    async fn cancel_order(&self, _handle: &OrderHandle) -> ExchangeResult<bool> {
        Self::read_only()
    }

    async fn get_order_status(&self, _handle: &OrderHandle) -> ExchangeResult<OrderReport> {
        Self::read_only()
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        Self::read_only()
    }

    async fn close_position(&self, _symbol: &Symbol) -> ExchangeResult<Option<OrderHandle>> {
        Self::read_only()
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        Self::read_only()
    }

    async fn set_leverage(&self, _symbol: &Symbol, _leverage: u32) -> ExchangeResult<()> {
        Self::read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_depth_picks_best_levels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/depth"))
            .and(query_param("symbol", "BTC_USDC_PERP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "asks": [["50012.0", "0.4"], ["50013.5", "1.0"]],
                "bids": [["50008.0", "2.0"], ["50010.0", "0.3"]],
                "lastUpdateId": "1",
                "timestamp": 1700000000000000i64
            })))
            .mount(&server)
            .await;

        let client = BackpackClient::with_base_url(&server.uri()).unwrap();
        let book = client.get_orderbook(&Symbol::new("BTC", "USDT")).await.unwrap();
        assert_eq!(book.bid, dec!(50010.0));
        assert_eq!(book.bid_qty, dec!(0.3));
        assert_eq!(book.ask, dec!(50012.0));
        assert!(book.is_valid());
    }

    #[tokio::test]
    async fn test_trading_is_refused() {
        let client = BackpackClient::with_base_url("http://127.0.0.1:9").unwrap();
        let err = client.get_positions().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/depth"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = BackpackClient::with_base_url(&server.uri()).unwrap();
        let err = client.get_orderbook(&Symbol::new("ETH", "USDT")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
