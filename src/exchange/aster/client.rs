//! Aster REST API client.

use super::types::*;
use crate::config::{AccountConfig, VenueConfig};
use crate::error::ExchangeError;
use crate::exchange::symbol::Symbol;
use crate::exchange::traits::{ExchangeAdapter, ExchangeResult, Venue};
use crate::exchange::types::{
    Balance, OrderHandle, OrderReport, OrderRequest, OrderType, Position, Side, TopOfBook,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const FUTURES_BASE_URL: &str = "https://fapi.asterdex.com";
const SETTLEMENT_ASSET: &str = "USDT";

/// Unknown symbol.
const CODE_BAD_SYMBOL: i64 = -1121;
/// Order does not exist (status/cancel lookups).
const CODE_NO_SUCH_ORDER: i64 = -2013;
/// Unknown order sent (cancel of a closed order).
const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Invalid API key, IP or permissions.
const CODE_BAD_API_KEY: i64 = -2015;
const CODE_REJECTED_MBX_KEY: i64 = -2014;
/// Signature check failed.
const CODE_BAD_SIGNATURE: i64 = -1022;

/// Aster futures client for one account.
pub struct AsterClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl AsterClient {
    /// Create a new Aster client from account and venue configuration.
    pub fn new(account: &AccountConfig, venue: &VenueConfig) -> Result<Self> {
        if account.testnet {
            warn!(account = %account.id, "Aster has no public testnet; using production endpoint");
        }
        let base_url = venue
            .base_url
            .clone()
            .unwrap_or_else(|| FUTURES_BASE_URL.to_string());
        Self::with_base_url(&account.api_key, &account.secret_key, &base_url)
    }

    /// Create a client against a custom endpoint.
    pub fn with_base_url(api_key: &str, secret_key: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> ExchangeResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid secret key: {}", e)))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Unsigned GET.
    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, Self::encode(params));
        let response = self.http.get(&url).send().await?;
        Self::decode(response).await
    }

    /// Signed request; parameters and signature travel in the query string.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        if self.api_key.is_empty() || self.secret_key.is_empty() {
            return Err(ExchangeError::Auth("Aster API credentials not configured".into()));
        }

        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = Self::encode(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Network(format!("malformed Aster response: {}", e)))
    }

    fn handle_for(&self, symbol: &Symbol, order: &OrderResponse) -> OrderHandle {
        OrderHandle {
            venue: Venue::Aster,
            symbol: symbol.clone(),
            order_id: Some(order.order_id.to_string()),
            client_order_id: order.client_order_id.clone(),
        }
    }

    fn order_params(handle: &OrderHandle) -> Vec<(&'static str, String)> {
        let mut params = vec![("symbol", handle.symbol.native(Venue::Aster))];
        match &handle.order_id {
            Some(id) => params.push(("orderId", id.clone())),
            None => params.push(("origClientOrderId", handle.client_order_id.clone())),
        }
        params
    }
}

/// Map an HTTP failure to the adapter error taxonomy.
pub(crate) fn classify_error(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| format!("{} ({})", e.msg, e.code))
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited(message);
    }
    if status.is_server_error() {
        return ExchangeError::Network(message);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Auth(message);
    }

    match parsed.map(|e| e.code) {
        Some(CODE_BAD_SYMBOL) => ExchangeError::UnknownSymbol(message),
        Some(CODE_NO_SUCH_ORDER) | Some(CODE_UNKNOWN_ORDER) => ExchangeError::OrderNotFound(message),
        Some(CODE_BAD_API_KEY) | Some(CODE_REJECTED_MBX_KEY) | Some(CODE_BAD_SIGNATURE) => {
            ExchangeError::Auth(message)
        }
        _ => ExchangeError::RejectedOrder(message),
    }
}

#[async_trait]
impl ExchangeAdapter for AsterClient {
    fn venue(&self) -> Venue {
        Venue::Aster
    }

    #[instrument(skip(self), name = "aster_orderbook")]
    async fn get_orderbook(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook> {
        let ticker: BookTicker = self
            .public_get("/fapi/v1/ticker/bookTicker", &[("symbol", symbol.native(Venue::Aster))])
            .await?;

        let timestamp = ticker
            .time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(TopOfBook {
            bid: ticker.bid_price,
            ask: ticker.ask_price,
            bid_qty: ticker.bid_qty,
            ask_qty: ticker.ask_qty,
            timestamp,
        })
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol, side = %request.side, qty = %request.quantity))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        let mut params = vec![
            ("symbol", request.symbol.native(Venue::Aster)),
            ("side", request.side.to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];

        match request.order_type {
            OrderType::Limit => {
                let price = request
                    .price
                    .ok_or_else(|| ExchangeError::RejectedOrder("limit order without price".into()))?;
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.normalize().to_string()));
            }
            OrderType::Market => params.push(("type", "MARKET".to_string())),
        }

        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!(client_order_id = %request.client_order_id, "Placing Aster order");
        let order: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;
        Ok(self.handle_for(&request.symbol, &order))
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn cancel_order(&self, handle: &OrderHandle) -> ExchangeResult<bool> {
        let result: ExchangeResult<OrderResponse> = self
            .signed(Method::DELETE, "/fapi/v1/order", Self::order_params(handle))
            .await;

        match result {
            Ok(_) => Ok(true),
            // Already filled or canceled
            Err(ExchangeError::OrderNotFound(msg)) if handle.order_id.is_some() => {
                debug!(%msg, "Cancel on closed Aster order");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn get_order_status(&self, handle: &OrderHandle) -> ExchangeResult<OrderReport> {
        let order: OrderResponse = self
            .signed(Method::GET, "/fapi/v1/order", Self::order_params(handle))
            .await?;

        let side = if order.side.eq_ignore_ascii_case("SELL") {
            Side::Sell
        } else {
            Side::Buy
        };

        Ok(OrderReport {
            order_id: Some(order.order_id.to_string()),
            client_order_id: order.client_order_id,
            state: order.status.into(),
            side,
            quantity: order.orig_qty,
            filled_quantity: order.executed_qty,
            avg_price: order.avg_price.unwrap_or(Decimal::ZERO),
        })
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let positions: Vec<PositionRisk> =
            self.signed(Method::GET, "/fapi/v2/positionRisk", Vec::new()).await?;

        Ok(positions
            .into_iter()
            .filter(|p| p.position_amt != Decimal::ZERO)
            .filter_map(|p| {
                let symbol = Symbol::from_native(Venue::Aster, &p.symbol).ok()?;
                let leverage = p.leverage.parse().unwrap_or(1);
                Some(Position::new(symbol, p.position_amt, p.entry_price, leverage))
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn close_position(&self, symbol: &Symbol) -> ExchangeResult<Option<OrderHandle>> {
        let held: Decimal = self
            .get_positions()
            .await?
            .iter()
            .filter(|p| &p.symbol == symbol)
            .map(|p| p.quantity)
            .sum();

        let Some(side) = Side::for_delta(-held) else {
            return Ok(None);
        };

        let request = OrderRequest::market(
            symbol.clone(),
            side,
            held.abs(),
            Uuid::new_v4().simple().to_string(),
        )
        .reduce_only();
        self.place_order(&request).await.map(Some)
    }

    #[instrument(skip(self))]
    async fn get_balance(&self) -> ExchangeResult<Balance> {
        let balances: Vec<AccountBalance> =
            self.signed(Method::GET, "/fapi/v2/balance", Vec::new()).await?;

        let usdt = balances
            .into_iter()
            .find(|b| b.asset == SETTLEMENT_ASSET)
            .ok_or_else(|| ExchangeError::Network("USDT balance missing from response".into()))?;

        let total = usdt
            .margin_balance
            .unwrap_or(usdt.wallet_balance + usdt.unrealized_profit.unwrap_or(Decimal::ZERO));
        Ok(Balance {
            asset: usdt.asset,
            free: usdt.available_balance,
            used: (total - usdt.available_balance).max(Decimal::ZERO),
            total,
        })
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> ExchangeResult<()> {
        let params = vec![
            ("symbol", symbol.native(Venue::Aster)),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/leverage", params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::OrderState;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    async fn client(server: &MockServer) -> AsterClient {
        AsterClient::with_base_url("key", "secret", &server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_orderbook_from_book_ticker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/bookTicker"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbol": "BTCUSDT",
                "bidPrice": "50010.0",
                "bidQty": "1.5",
                "askPrice": "50012.0",
                "askQty": "2.0",
                "time": 1700000000000i64
            })))
            .mount(&server)
            .await;

        let book = client(&server).await.get_orderbook(&btc()).await.unwrap();
        assert_eq!(book.bid, dec!(50010));
        assert_eq!(book.ask, dec!(50012));
        assert_eq!(book.ask_qty, dec!(2));
    }

    #[tokio::test]
    async fn test_place_order_is_signed_and_tagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header_exists("X-MBX-APIKEY"))
            .and(query_param("newClientOrderId", "tok123"))
            .and(query_param("type", "LIMIT"))
            .and(query_param("timeInForce", "GTC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderId": 42,
                "symbol": "BTCUSDT",
                "status": "NEW",
                "clientOrderId": "tok123",
                "price": "50000",
                "avgPrice": "0",
                "origQty": "0.010",
                "executedQty": "0",
                "side": "BUY",
                "updateTime": 1700000000000i64
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = OrderRequest::limit(btc(), Side::Buy, dec!(0.010), dec!(50000), "tok123");
        let handle = client(&server).await.place_order(&request).await.unwrap();
        assert_eq!(handle.order_id.as_deref(), Some("42"));
        assert_eq!(handle.client_order_id, "tok123");
    }

    #[tokio::test]
    async fn test_status_lookup_by_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/order"))
            .and(query_param("origClientOrderId", "tok9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderId": 7,
                "symbol": "BTCUSDT",
                "status": "PARTIALLY_FILLED",
                "clientOrderId": "tok9",
                "price": "50000",
                "avgPrice": "50000",
                "origQty": "0.02",
                "executedQty": "0.005",
                "side": "SELL"
            })))
            .mount(&server)
            .await;

        let handle = OrderHandle {
            venue: Venue::Aster,
            symbol: btc(),
            order_id: None,
            client_order_id: "tok9".to_string(),
        };
        let report = client(&server).await.get_order_status(&handle).await.unwrap();
        assert_eq!(report.state, OrderState::PartiallyFilled);
        assert_eq!(report.side, Side::Sell);
        assert_eq!(report.filled_quantity, dec!(0.005));
        assert_eq!(report.order_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "code": -1003,
                "msg": "Too many requests"
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.get_positions().await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_auth_error() {
        let server = MockServer::start().await;
        let client = AsterClient::with_base_url("", "", &server.uri()).unwrap();
        let err = client.get_balance().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn test_error_classification() {
        let body = r#"{"code":-1121,"msg":"Invalid symbol."}"#;
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, body),
            ExchangeError::UnknownSymbol(_)
        ));

        let body = r#"{"code":-2019,"msg":"Margin is insufficient."}"#;
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, body),
            ExchangeError::RejectedOrder(_)
        ));

        let body = r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#;
        assert!(matches!(
            classify_error(StatusCode::UNAUTHORIZED, body),
            ExchangeError::Auth(_)
        ));

        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "upstream"),
            ExchangeError::Network(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, r#"{"code":-2013,"msg":"Order does not exist."}"#),
            ExchangeError::OrderNotFound(_)
        ));
    }
}
