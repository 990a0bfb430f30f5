//! OKX v5 REST client.

use super::types::*;
use crate::config::{AccountConfig, VenueConfig};
use crate::error::ExchangeError;
use crate::exchange::symbol::Symbol;
use crate::exchange::traits::{ExchangeAdapter, ExchangeResult, Venue};
use crate::exchange::types::{
    Balance, OrderHandle, OrderReport, OrderRequest, OrderType, Position, Side, TopOfBook,
};
use crate::utils::decimal::round_down_to_lot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const BASE_URL: &str = "https://www.okx.com";
const MARGIN_MODE: &str = "cross";

/// System busy / request too frequent.
const CODE_RATE_LIMIT: &str = "50011";
const CODE_SYSTEM_BUSY: &str = "50013";
/// Invalid key, timestamp or signature.
const AUTH_CODES: &[&str] = &["50101", "50102", "50103", "50104", "50111", "50112", "50113"];
const CODE_UNKNOWN_INSTRUMENT: &str = "51001";
/// Order does not exist, or is already filled/canceled.
const ORDER_GONE_CODES: &[&str] = &["51400", "51401", "51402", "51603"];

/// OKX swap client for one account.
pub struct OkxClient {
    http: Client,
    api_key: String,
    secret_key: String,
    passphrase: String,
    simulated: bool,
    base_url: String,
    /// Base units per contract
    contract_value: Decimal,
}

impl OkxClient {
    /// Create a new OKX client from account and venue configuration.
    pub fn new(account: &AccountConfig, venue: &VenueConfig) -> Result<Self> {
        let base_url = venue
            .base_url
            .clone()
            .unwrap_or_else(|| BASE_URL.to_string());
        let mut client = Self::with_base_url(
            &account.api_key,
            &account.secret_key,
            account.passphrase.as_deref().unwrap_or_default(),
            &base_url,
            venue.contract_value,
        )?;
        client.simulated = account.testnet;
        Ok(client)
    }

    /// Create a client against a custom endpoint.
    pub fn with_base_url(
        api_key: &str,
        secret_key: &str,
        passphrase: &str,
        base_url: &str,
        contract_value: Decimal,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        anyhow::ensure!(contract_value > Decimal::ZERO, "OKX contract value must be positive");

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            passphrase: passphrase.to_string(),
            simulated: false,
            base_url: base_url.trim_end_matches('/').to_string(),
            contract_value,
        })
    }

    /// Base64 HMAC-SHA256 over `timestamp + method + path + body`.
    fn sign(&self, timestamp: &str, method: &Method, path: &str, body: &str) -> ExchangeResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid secret key: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_str().as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> ExchangeResult<Vec<T>> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let mut builder = self.http.request(method.clone(), &url);

        if signed {
            if self.api_key.is_empty() || self.secret_key.is_empty() || self.passphrase.is_empty() {
                return Err(ExchangeError::Auth("OKX API credentials not configured".into()));
            }
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            let signature = self.sign(&timestamp, &method, path, &body)?;
            builder = builder
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        }
        if self.simulated {
            builder = builder.header("x-simulated-trading", "1");
        }
        if !body.is_empty() {
            builder = builder.header("Content-Type", "application/json").body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: Envelope<serde_json::Value> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(ExchangeError::Network(format!("malformed OKX response: {}", e)))
            }
            Err(_) => return Err(classify_error(status, "", &text)),
        };

        if !status.is_success() || envelope.code != "0" {
            // Batch-style endpoints report the real cause per item
            let item = envelope.data.first();
            let code = item
                .and_then(|d| d.get("sCode"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty() && *c != "0")
                .unwrap_or(&envelope.code);
            let msg = item
                .and_then(|d| d.get("sMsg"))
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .unwrap_or(&envelope.msg);
            return Err(classify_error(status, code, msg));
        }

        envelope
            .data
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| ExchangeError::Network(format!("malformed OKX response: {}", e)))
    }

    fn to_contracts(&self, quantity: Decimal) -> Decimal {
        round_down_to_lot(quantity / self.contract_value, Decimal::new(1, 2))
    }

    fn to_base(&self, contracts: Decimal) -> Decimal {
        contracts * self.contract_value
    }

    fn order_key(handle: &OrderHandle) -> (&'static str, String) {
        match &handle.order_id {
            Some(id) => ("ordId", id.clone()),
            None => ("clOrdId", handle.client_order_id.clone()),
        }
    }

    /// Placement and cancel acks carry their own per-order status.
    fn check_ack(ack: &OrderAck) -> ExchangeResult<()> {
        if ack.s_code == "0" {
            Ok(())
        } else {
            Err(classify_error(StatusCode::OK, &ack.s_code, &ack.s_msg))
        }
    }
}

/// Map an OKX failure to the adapter error taxonomy.
pub(crate) fn classify_error(status: StatusCode, code: &str, msg: &str) -> ExchangeError {
    let message = if code.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), msg)
    } else {
        format!("{} ({})", msg, code)
    };

    if status == StatusCode::TOO_MANY_REQUESTS || code == CODE_RATE_LIMIT {
        return ExchangeError::RateLimited(message);
    }
    if status.is_server_error() || code == CODE_SYSTEM_BUSY {
        return ExchangeError::Network(message);
    }
    if status == StatusCode::UNAUTHORIZED || AUTH_CODES.contains(&code) {
        return ExchangeError::Auth(message);
    }
    if code == CODE_UNKNOWN_INSTRUMENT {
        return ExchangeError::UnknownSymbol(message);
    }
    if ORDER_GONE_CODES.contains(&code) {
        return ExchangeError::OrderNotFound(message);
    }
    ExchangeError::RejectedOrder(message)
}

fn first<T>(data: Vec<T>, what: &str) -> ExchangeResult<T> {
    data.into_iter()
        .next()
        .ok_or_else(|| ExchangeError::Network(format!("empty OKX {} response", what)))
}

#[async_trait]
impl ExchangeAdapter for OkxClient {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    #[instrument(skip(self), name = "okx_orderbook")]
    async fn get_orderbook(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook> {
        let path = format!(
            "/api/v5/market/books?instId={}&sz=1",
            urlencoding::encode(&symbol.native(Venue::Okx))
        );
        let book: BookData = first(self.request(Method::GET, &path, None, false).await?, "book")?;

        let level = |levels: &[Vec<String>]| -> (Decimal, Decimal) {
            levels
                .first()
                .map(|l| {
                    let px = l.first().map(|s| parse_decimal(s)).unwrap_or_default();
                    let sz = l.get(1).map(|s| parse_decimal(s)).unwrap_or_default();
                    (px, sz)
                })
                .unwrap_or_default()
        };
        let (bid, bid_sz) = level(&book.bids);
        let (ask, ask_sz) = level(&book.asks);

        let timestamp = book
            .ts
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(TopOfBook {
            bid,
            ask,
            bid_qty: self.to_base(bid_sz),
            ask_qty: self.to_base(ask_sz),
            timestamp,
        })
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol, side = %request.side, qty = %request.quantity))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        let contracts = self.to_contracts(request.quantity);
        if contracts <= Decimal::ZERO {
            return Err(ExchangeError::RejectedOrder(format!(
                "quantity {} is below one contract size",
                request.quantity
            )));
        }

        let mut body = json!({
            "instId": request.symbol.native(Venue::Okx),
            "tdMode": MARGIN_MODE,
            "side": request.side.to_string().to_lowercase(),
            "sz": contracts.normalize().to_string(),
            "clOrdId": request.client_order_id,
            "reduceOnly": request.reduce_only,
        });

        match request.order_type {
            OrderType::Limit => {
                let price = request
                    .price
                    .ok_or_else(|| ExchangeError::RejectedOrder("limit order without price".into()))?;
                body["ordType"] = json!("limit");
                body["px"] = json!(price.normalize().to_string());
            }
            OrderType::Market => body["ordType"] = json!("market"),
        }

        debug!(client_order_id = %request.client_order_id, %contracts, "Placing OKX order");
        let ack: OrderAck =
            first(self.request(Method::POST, "/api/v5/trade/order", Some(body), true).await?, "order")?;
        Self::check_ack(&ack)?;

        Ok(OrderHandle {
            venue: Venue::Okx,
            symbol: request.symbol.clone(),
            order_id: Some(ack.ord_id),
            client_order_id: request.client_order_id.clone(),
        })
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn cancel_order(&self, handle: &OrderHandle) -> ExchangeResult<bool> {
        let (key, value) = Self::order_key(handle);
        let body = json!({
            "instId": handle.symbol.native(Venue::Okx),
            key: value,
        });

        let result = self
            .request::<OrderAck>(Method::POST, "/api/v5/trade/cancel-order", Some(body), true)
            .await
            .and_then(|data| first(data, "cancel"))
            .and_then(|ack| Self::check_ack(&ack));

        match result {
            Ok(()) => Ok(true),
            Err(ExchangeError::OrderNotFound(msg)) if handle.order_id.is_some() => {
                debug!(%msg, "Cancel on closed OKX order");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn get_order_status(&self, handle: &OrderHandle) -> ExchangeResult<OrderReport> {
        let (key, value) = Self::order_key(handle);
        let path = format!(
            "/api/v5/trade/order?instId={}&{}={}",
            urlencoding::encode(&handle.symbol.native(Venue::Okx)),
            key,
            urlencoding::encode(&value)
        );
        let detail: OrderDetail = first(self.request(Method::GET, &path, None, true).await?, "order")?;

        let side = if detail.side == "sell" { Side::Sell } else { Side::Buy };
        Ok(OrderReport {
            order_id: Some(detail.ord_id.clone()),
            client_order_id: detail.cl_ord_id.clone(),
            state: detail.order_state(),
            side,
            quantity: self.to_base(parse_decimal(&detail.sz)),
            filled_quantity: self.to_base(parse_decimal(&detail.acc_fill_sz)),
            avg_price: parse_decimal(&detail.avg_px),
        })
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let data: Vec<PositionData> = self
            .request(Method::GET, "/api/v5/account/positions?instType=SWAP", None, true)
            .await?;

        Ok(data
            .into_iter()
            .filter_map(|p| {
                let contracts = parse_decimal(&p.pos);
                if contracts == Decimal::ZERO {
                    return None;
                }
                let signed = if p.pos_side == "short" { -contracts.abs() } else { contracts };
                let symbol = Symbol::from_native(Venue::Okx, &p.inst_id).ok()?;
                let leverage = parse_decimal(&p.lever).to_u32().unwrap_or(1);
                Some(Position::new(symbol, self.to_base(signed), parse_decimal(&p.avg_px), leverage))
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
        let data: Vec<BalanceData> = self
            .request(Method::GET, "/api/v5/account/balance?ccy=USDT", None, true)
            .await?;

        let detail = data
            .into_iter()
            .flat_map(|b| b.details)
            .find(|d| d.ccy == "USDT")
            .ok_or_else(|| ExchangeError::Network("USDT balance missing from response".into()))?;

        Ok(Balance {
            asset: detail.ccy,
            free: parse_decimal(&detail.avail_bal),
            used: parse_decimal(&detail.frozen_bal),
            total: parse_decimal(&detail.eq),
        })
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> ExchangeResult<()> {
        let body = json!({
            "instId": symbol.native(Venue::Okx),
            "lever": leverage.to_string(),
            "mgnMode": MARGIN_MODE,
        });
        let _: Vec<serde_json::Value> = self
            .request(Method::POST, "/api/v5/account/set-leverage", Some(body), true)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn client(server: &MockServer) -> OkxClient {
        OkxClient::with_base_url("key", "secret", "pass", &server.uri(), dec!(0.01)).unwrap()
    }

    #[tokio::test]
    async fn test_orderbook_converts_contracts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/market/books"))
            .and(query_param("instId", "BTC-USDT-SWAP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0",
                "msg": "",
                "data": [{
                    "asks": [["50008", "120", "0", "3"]],
                    "bids": [["50005", "80", "0", "2"]],
                    "ts": "1700000000000"
                }]
            })))
            .mount(&server)
            .await;

        let book = client(&server).get_orderbook(&btc()).await.unwrap();
        assert_eq!(book.bid, dec!(50005));
        assert_eq!(book.ask, dec!(50008));
        assert_eq!(book.ask_qty, dec!(1.2));
        assert_eq!(book.bid_qty, dec!(0.8));
    }

    #[tokio::test]
    async fn test_place_order_sends_contracts_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .and(header_exists("OK-ACCESS-SIGN"))
            .and(header("OK-ACCESS-PASSPHRASE", "pass"))
            .and(body_partial_json(serde_json::json!({
                "instId": "BTC-USDT-SWAP",
                "side": "sell",
                "sz": "1",
                "clOrdId": "tokA",
                "ordType": "limit"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0",
                "msg": "",
                "data": [{"ordId": "900", "clOrdId": "tokA", "sCode": "0", "sMsg": ""}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = OrderRequest::limit(btc(), Side::Sell, dec!(0.01), dec!(50010), "tokA");
        let handle = client(&server).place_order(&request).await.unwrap();
        assert_eq!(handle.order_id.as_deref(), Some("900"));
        assert_eq!(handle.venue, Venue::Okx);
    }

    #[tokio::test]
    async fn test_rejected_ack_maps_to_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v5/trade/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "1",
                "msg": "Operation failed.",
                "data": [{"ordId": "", "clOrdId": "tokB", "sCode": "51008", "sMsg": "Insufficient margin"}]
            })))
            .mount(&server)
            .await;

        let request = OrderRequest::market(btc(), Side::Buy, dec!(0.01), "tokB");
        let err = client(&server).place_order(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RejectedOrder(_)));
    }

    #[tokio::test]
    async fn test_short_position_is_negative() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0",
                "msg": "",
                "data": [{"instId": "BTC-USDT-SWAP", "pos": "2", "avgPx": "50000", "lever": "5", "posSide": "short"}]
            })))
            .mount(&server)
            .await;

        let positions = client(&server).get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(-0.02));
        assert_eq!(positions[0].leverage, 5);
        assert_eq!(positions[0].side, Some(Side::Sell));
    }

    #[tokio::test]
    async fn test_below_one_contract_is_rejected_locally() {
        let server = MockServer::start().await;
        let request = OrderRequest::market(btc(), Side::Buy, dec!(0.00001), "tiny");
        let err = client(&server).place_order(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RejectedOrder(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify_error(StatusCode::OK, "50011", "Too Many Requests"),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::UNAUTHORIZED, "50113", "Invalid Sign"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::OK, "51001", "Instrument ID does not exist"),
            ExchangeError::UnknownSymbol(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::OK, "51603", "Order does not exist"),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::SERVICE_UNAVAILABLE, "", "maintenance"),
            ExchangeError::Network(_)
        ));
    }
}
