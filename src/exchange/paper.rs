//! Paper venue for dry runs and tests.
//!
//! Simulates one venue account: a top-of-book per symbol, resting limit
//! orders that fill when the book crosses them, market orders that fill at
//! the touch, positions with realized PnL and fees, and a margin balance.
//!
//! In dry-run mode the book is pulled from a live adapter (`with_feed`), so
//! sessions trade against real prices without sending orders. Tests drive
//! the book directly and can inject faults or latency per operation.

use super::symbol::Symbol;
use super::traits::{ExchangeAdapter, ExchangeResult, Venue};
use super::types::*;
use crate::error::ExchangeError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Adapter operations that can be scripted to fail or stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Orderbook,
    Place,
    Cancel,
    Status,
    Positions,
    ClosePosition,
    Balance,
    Leverage,
}

/// Scripted outcome for the next call of an operation.
#[derive(Debug, Clone)]
pub enum PaperFault {
    /// Fail without touching venue state.
    Fail(ExchangeError),
    /// Apply the call, then report failure (ambiguous outcome).
    FailAfterApply(ExchangeError),
}

/// Simulated order.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub state: OrderState,
    pub reduce_only: bool,
}

impl PaperOrder {
    fn report(&self) -> OrderReport {
        OrderReport {
            order_id: Some(self.order_id.clone()),
            client_order_id: self.client_order_id.clone(),
            state: self.state,
            side: self.side,
            quantity: self.quantity,
            filled_quantity: self.filled,
            avg_price: self.avg_price,
        }
    }

    fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }
}

/// Simulated position.
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

impl PaperPosition {
    /// Apply a signed fill and return the realized PnL.
    fn apply(&mut self, delta: Decimal, price: Decimal) -> Decimal {
        let same_direction = self.quantity == Decimal::ZERO
            || (self.quantity > Decimal::ZERO) == (delta > Decimal::ZERO);

        if same_direction {
            let total = self.quantity.abs() + delta.abs();
            self.entry_price =
                (self.quantity.abs() * self.entry_price + delta.abs() * price) / total;
            self.quantity += delta;
            return Decimal::ZERO;
        }

        let closing = delta.abs().min(self.quantity.abs());
        let direction = if self.quantity > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
        let realized = closing * (price - self.entry_price) * direction;
        let was_long = self.quantity > Decimal::ZERO;
        self.quantity += delta;

        if self.quantity == Decimal::ZERO {
            self.entry_price = Decimal::ZERO;
        } else if (self.quantity > Decimal::ZERO) != was_long {
            self.entry_price = price;
        }
        realized
    }
}

/// Mutable state of the simulated account.
#[derive(Debug)]
pub struct PaperState {
    pub initial_balance: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub leverage: u32,
    pub books: HashMap<Symbol, TopOfBook>,
    pub orders: HashMap<String, PaperOrder>,
    pub client_index: HashMap<String, String>,
    pub positions: HashMap<Symbol, PaperPosition>,
    faults: HashMap<PaperOp, VecDeque<PaperFault>>,
    latency: HashMap<PaperOp, Duration>,
}

impl PaperState {
    fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            leverage: 1,
            books: HashMap::new(),
            orders: HashMap::new(),
            client_index: HashMap::new(),
            positions: HashMap::new(),
            faults: HashMap::new(),
            latency: HashMap::new(),
        }
    }
}

/// Simulated venue account implementing [`ExchangeAdapter`].
pub struct PaperExchange {
    venue: Venue,
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    /// Live adapter used for market data in dry-run mode
    feed: Option<Arc<dyn ExchangeAdapter>>,
    maker_fee: Decimal,
    taker_fee: Decimal,
}

impl PaperExchange {
    /// Create a paper account with the given starting balance.
    pub fn new(venue: Venue, initial_balance: Decimal) -> Self {
        Self {
            venue,
            state: Arc::new(RwLock::new(PaperState::new(initial_balance))),
            order_id_counter: AtomicU64::new(1),
            feed: None,
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0005),
        }
    }

    /// Pull books from a live adapter instead of `set_book`.
    pub fn with_feed(mut self, feed: Arc<dyn ExchangeAdapter>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_fees(mut self, maker_fee: Decimal, taker_fee: Decimal) -> Self {
        self.maker_fee = maker_fee;
        self.taker_fee = taker_fee;
        self
    }

    fn next_order_id(&self) -> String {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Replace the book for `symbol` and fill any resting orders it crosses.
    pub async fn set_book(&self, symbol: &Symbol, book: TopOfBook) {
        let mut state = self.state.write().await;
        state.books.insert(symbol.clone(), book);
        self.match_resting(&mut state, symbol);
    }

    /// Queue a fault for the next call of `op`.
    pub async fn inject(&self, op: PaperOp, fault: PaperFault) {
        let mut state = self.state.write().await;
        state.faults.entry(op).or_default().push_back(fault);
    }

    /// Delay every call of `op` by `latency`.
    pub async fn set_latency(&self, op: PaperOp, latency: Duration) {
        self.state.write().await.latency.insert(op, latency);
    }

    /// Force a position, e.g. to simulate activity outside the engine.
    pub async fn set_position(&self, symbol: &Symbol, quantity: Decimal, entry_price: Decimal) {
        let mut state = self.state.write().await;
        state.positions.insert(
            symbol.clone(),
            PaperPosition {
                quantity,
                entry_price,
            },
        );
    }

    /// Fill up to `quantity` of a resting order at its limit price.
    pub async fn fill_order(&self, client_order_id: &str, quantity: Decimal) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        let order_id = state
            .client_index
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;
        let price = state
            .orders
            .get(&order_id)
            .and_then(|o| o.price)
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;
        self.execute(&mut state, &order_id, quantity, price, self.maker_fee);
        Ok(())
    }

    /// Signed position on `symbol`.
    pub async fn position(&self, symbol: &Symbol) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Snapshot of every order ever placed, oldest first.
    pub async fn orders(&self) -> Vec<PaperOrder> {
        let state = self.state.read().await;
        let mut orders: Vec<PaperOrder> = state.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.order_id.parse::<u64>().unwrap_or(u64::MAX));
        orders
    }

    /// Orders still able to fill.
    pub async fn open_orders(&self) -> Vec<PaperOrder> {
        self.orders()
            .await
            .into_iter()
            .filter(|o| !o.state.is_terminal())
            .collect()
    }

    pub async fn realized_pnl(&self) -> Decimal {
        self.state.read().await.realized_pnl
    }

    async fn before_call(&self, op: PaperOp) -> Option<PaperFault> {
        let latency = self.state.read().await.latency.get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.write().await;
        state.faults.get_mut(&op).and_then(|q| q.pop_front())
    }

    async fn current_book(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook> {
        if let Some(feed) = &self.feed {
            let book = feed.get_orderbook(symbol).await?;
            let mut state = self.state.write().await;
            state.books.insert(symbol.clone(), book.clone());
            self.match_resting(&mut state, symbol);
            return Ok(book);
        }

        self.state
            .read()
            .await
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Network(format!("no market data for {}", symbol)))
    }

    /// Fill resting limit orders crossed by the current book at their limit price.
    fn match_resting(&self, state: &mut PaperState, symbol: &Symbol) {
        let Some(book) = state.books.get(symbol).cloned() else {
            return;
        };

        let crossed: Vec<(String, Decimal, Decimal)> = state
            .orders
            .values()
            .filter(|o| &o.symbol == symbol && !o.state.is_terminal())
            .filter_map(|o| {
                let price = o.price?;
                let crosses = match o.side {
                    Side::Buy => book.ask <= price,
                    Side::Sell => book.bid >= price,
                };
                crosses.then(|| (o.order_id.clone(), o.remaining(), price))
            })
            .collect();

        for (order_id, quantity, price) in crossed {
            self.execute(state, &order_id, quantity, price, self.maker_fee);
        }
    }

    /// Apply a fill to an order and the account.
    fn execute(
        &self,
        state: &mut PaperState,
        order_id: &str,
        quantity: Decimal,
        price: Decimal,
        fee_rate: Decimal,
    ) {
        let Some(order) = state.orders.get_mut(order_id) else {
            return;
        };
        if order.state.is_terminal() {
            return;
        }

        let quantity = quantity.min(order.remaining());
        if quantity <= Decimal::ZERO {
            return;
        }

        let notional_before = order.avg_price * order.filled;
        order.filled += quantity;
        order.avg_price = (notional_before + price * quantity) / order.filled;
        order.state = if order.remaining() == Decimal::ZERO {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };

        let delta = quantity * order.side.sign();
        let symbol = order.symbol.clone();
        let side = order.side;
        let fee = quantity * price * fee_rate;

        let realized = state.positions.entry(symbol.clone()).or_default().apply(delta, price);
        state.realized_pnl += realized;
        state.total_fees += fee;

        debug!(
            venue = %self.venue,
            %symbol,
            order_id,
            %side,
            qty = %quantity,
            price = %price,
            fee = %fee,
            "Paper fill"
        );
    }

    fn find_order_id(state: &PaperState, handle: &OrderHandle) -> ExchangeResult<String> {
        if let Some(id) = &handle.order_id {
            if state.orders.contains_key(id) {
                return Ok(id.clone());
            }
        }
        state
            .client_index
            .get(&handle.client_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(handle.to_string()))
    }

    async fn place(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::RejectedOrder(format!(
                "invalid quantity {}",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(ExchangeError::RejectedOrder("limit order without price".into()));
        }

        let book = self.current_book(&request.symbol).await?;
        let mut state = self.state.write().await;

        if state.client_index.contains_key(&request.client_order_id) {
            return Err(ExchangeError::RejectedOrder(format!(
                "duplicate client order id {}",
                request.client_order_id
            )));
        }

        let mut quantity = request.quantity;
        if request.reduce_only {
            let held = state
                .positions
                .get(&request.symbol)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            let reducible = if held * request.side.sign() < Decimal::ZERO {
                held.abs()
            } else {
                Decimal::ZERO
            };
            if reducible == Decimal::ZERO {
                return Err(ExchangeError::RejectedOrder(
                    "reduce-only order would increase position".into(),
                ));
            }
            quantity = quantity.min(reducible);
        }

        let order_id = self.next_order_id();
        let order = PaperOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity,
            price: request.price,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            state: OrderState::Open,
            reduce_only: request.reduce_only,
        };
        state.orders.insert(order_id.clone(), order);
        state
            .client_index
            .insert(request.client_order_id.clone(), order_id.clone());

        let touch = book.touch(request.side);
        let marketable = match (request.order_type, request.price) {
            (OrderType::Market, _) => true,
            (OrderType::Limit, Some(price)) => match request.side {
                Side::Buy => price >= touch,
                Side::Sell => price <= touch,
            },
            (OrderType::Limit, None) => false,
        };

        if marketable {
            self.execute(&mut state, &order_id, quantity, touch, self.taker_fee);
        }

        info!(
            venue = %self.venue,
            symbol = %request.symbol,
            order_id = %order_id,
            client_order_id = %request.client_order_id,
            side = %request.side,
            qty = %quantity,
            price = ?request.price,
            marketable,
            "Paper order accepted"
        );

        Ok(OrderHandle {
            venue: self.venue,
            symbol: request.symbol.clone(),
            order_id: Some(order_id),
            client_order_id: request.client_order_id.clone(),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn get_orderbook(&self, symbol: &Symbol) -> ExchangeResult<TopOfBook> {
        match self.before_call(PaperOp::Orderbook).await {
            Some(PaperFault::Fail(e)) => Err(e),
            Some(PaperFault::FailAfterApply(e)) => {
                self.current_book(symbol).await?;
                Err(e)
            }
            None => self.current_book(symbol).await,
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        match self.before_call(PaperOp::Place).await {
            Some(PaperFault::Fail(e)) => Err(e),
            Some(PaperFault::FailAfterApply(e)) => {
                self.place(request).await?;
                Err(e)
            }
            None => self.place(request).await,
        }
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> ExchangeResult<bool> {
        let fail_after = match self.before_call(PaperOp::Cancel).await {
            Some(PaperFault::Fail(e)) => return Err(e),
            Some(PaperFault::FailAfterApply(e)) => Some(e),
            None => None,
        };

        let mut state = self.state.write().await;
        let order_id = Self::find_order_id(&state, handle)?;
        let canceled = match state.orders.get_mut(&order_id) {
            Some(order) if !order.state.is_terminal() => {
                order.state = OrderState::Canceled;
                true
            }
            _ => false,
        };
        drop(state);

        debug!(venue = %self.venue, %handle, canceled, "Paper cancel");
        match fail_after {
            Some(e) => Err(e),
            None => Ok(canceled),
        }
    }

    async fn get_order_status(&self, handle: &OrderHandle) -> ExchangeResult<OrderReport> {
        if let Some(PaperFault::Fail(e) | PaperFault::FailAfterApply(e)) =
            self.before_call(PaperOp::Status).await
        {
            return Err(e);
        }
        if self.feed.is_some() {
            // Dry run: refresh the book so resting orders see the live market
            self.current_book(&handle.symbol).await?;
        }
        let state = self.state.read().await;
        let order_id = Self::find_order_id(&state, handle)?;
        state
            .orders
            .get(&order_id)
            .map(PaperOrder::report)
            .ok_or_else(|| ExchangeError::OrderNotFound(handle.to_string()))
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        if let Some(PaperFault::Fail(e) | PaperFault::FailAfterApply(e)) =
            self.before_call(PaperOp::Positions).await
        {
            return Err(e);
        }
        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .filter(|(_, p)| p.quantity != Decimal::ZERO)
            .map(|(symbol, p)| Position::new(symbol.clone(), p.quantity, p.entry_price, state.leverage))
            .collect())
    }

    async fn close_position(&self, symbol: &Symbol) -> ExchangeResult<Option<OrderHandle>> {
        if let Some(PaperFault::Fail(e) | PaperFault::FailAfterApply(e)) =
            self.before_call(PaperOp::ClosePosition).await
        {
            return Err(e);
        }
        let held = self.position(symbol).await;
        let Some(side) = Side::for_delta(-held) else {
            return Ok(None);
        };
        let request = OrderRequest::market(
            symbol.clone(),
            side,
            held.abs(),
            format!("close-{}", self.next_order_id()),
        )
        .reduce_only();
        self.place(&request).await.map(Some)
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        if let Some(PaperFault::Fail(e) | PaperFault::FailAfterApply(e)) =
            self.before_call(PaperOp::Balance).await
        {
            return Err(e);
        }
        let state = self.state.read().await;
        let total = state.initial_balance + state.realized_pnl - state.total_fees;
        let leverage = Decimal::from(state.leverage.max(1));
        let used: Decimal = state
            .positions
            .values()
            .map(|p| p.quantity.abs() * p.entry_price / leverage)
            .sum();
        Ok(Balance {
            asset: "USDT".to_string(),
            free: total - used,
            used,
            total,
        })
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> ExchangeResult<()> {
        if let Some(PaperFault::Fail(e) | PaperFault::FailAfterApply(e)) =
            self.before_call(PaperOp::Leverage).await
        {
            return Err(e);
        }
        debug!(venue = %self.venue, %symbol, leverage, "Paper set leverage");
        self.state.write().await.leverage = leverage;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    async fn venue_with_book(bid: Decimal, ask: Decimal) -> PaperExchange {
        let paper = PaperExchange::new(Venue::Aster, dec!(10000));
        paper.set_book(&btc(), TopOfBook::new(bid, ask)).await;
        paper
    }

    #[tokio::test]
    async fn test_market_order_fills_at_touch() {
        let paper = venue_with_book(dec!(50000), dec!(50001)).await;
        let handle = paper
            .place_order(&OrderRequest::market(btc(), Side::Buy, dec!(0.01), "m1"))
            .await
            .unwrap();

        let report = paper.get_order_status(&handle).await.unwrap();
        assert_eq!(report.state, OrderState::Filled);
        assert_eq!(report.avg_price, dec!(50001));
        assert_eq!(paper.position(&btc()).await, dec!(0.01));
    }

    #[tokio::test]
    async fn test_resting_limit_fills_when_book_crosses() {
        let paper = venue_with_book(dec!(50000), dec!(50002)).await;
        let handle = paper
            .place_order(&OrderRequest::limit(btc(), Side::Buy, dec!(0.02), dec!(50000.5), "l1"))
            .await
            .unwrap();
        assert_eq!(paper.get_order_status(&handle).await.unwrap().state, OrderState::Open);

        paper.set_book(&btc(), TopOfBook::new(dec!(49999), dec!(50000.5))).await;
        let report = paper.get_order_status(&handle).await.unwrap();
        assert_eq!(report.state, OrderState::Filled);
        assert_eq!(report.avg_price, dec!(50000.5));
    }

    #[tokio::test]
    async fn test_partial_fill_and_cancel() {
        let paper = venue_with_book(dec!(50000), dec!(50002)).await;
        let handle = paper
            .place_order(&OrderRequest::limit(btc(), Side::Sell, dec!(0.03), dec!(50001), "s1"))
            .await
            .unwrap();
        paper.fill_order("s1", dec!(0.01)).await.unwrap();

        assert!(paper.cancel_order(&handle).await.unwrap());
        assert!(!paper.cancel_order(&handle).await.unwrap());

        let report = paper.get_order_status(&handle).await.unwrap();
        assert_eq!(report.state, OrderState::Canceled);
        assert_eq!(report.filled_quantity, dec!(0.01));
        assert_eq!(paper.position(&btc()).await, dec!(-0.01));
    }

    #[tokio::test]
    async fn test_status_lookup_by_client_id() {
        let paper = venue_with_book(dec!(50000), dec!(50002)).await;
        paper
            .place_order(&OrderRequest::limit(btc(), Side::Buy, dec!(0.01), dec!(49000), "tok-1"))
            .await
            .unwrap();

        let adopted = OrderHandle {
            venue: Venue::Aster,
            symbol: btc(),
            order_id: None,
            client_order_id: "tok-1".to_string(),
        };
        let report = paper.get_order_status(&adopted).await.unwrap();
        assert_eq!(report.client_order_id, "tok-1");

        let missing = OrderHandle {
            client_order_id: "nope".to_string(),
            ..adopted
        };
        assert!(matches!(
            paper.get_order_status(&missing).await,
            Err(ExchangeError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_after_apply_leaves_order_on_venue() {
        let paper = venue_with_book(dec!(50000), dec!(50002)).await;
        paper
            .inject(PaperOp::Place, PaperFault::FailAfterApply(ExchangeError::Network("timeout".into())))
            .await;

        let result = paper
            .place_order(&OrderRequest::limit(btc(), Side::Buy, dec!(0.01), dec!(49000), "amb"))
            .await;
        assert!(matches!(result, Err(ExchangeError::Network(_))));
        assert_eq!(paper.orders().await.len(), 1);

        // Duplicate token is refused
        let dup = paper
            .place_order(&OrderRequest::limit(btc(), Side::Buy, dec!(0.01), dec!(49000), "amb"))
            .await;
        assert!(matches!(dup, Err(ExchangeError::RejectedOrder(_))));
    }

    #[tokio::test]
    async fn test_reduce_only_and_close_position() {
        let paper = venue_with_book(dec!(50000), dec!(50002)).await;
        let rejected = paper
            .place_order(&OrderRequest::market(btc(), Side::Sell, dec!(0.01), "r1").reduce_only())
            .await;
        assert!(rejected.is_err());

        paper
            .place_order(&OrderRequest::market(btc(), Side::Buy, dec!(0.02), "b1"))
            .await
            .unwrap();
        let handle = paper.close_position(&btc()).await.unwrap();
        assert!(handle.is_some());
        assert_eq!(paper.position(&btc()).await, Decimal::ZERO);
        assert!(paper.close_position(&btc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_realized_pnl_on_round_trip() {
        let paper = venue_with_book(dec!(50000), dec!(50000)).await;
        paper
            .place_order(&OrderRequest::market(btc(), Side::Sell, dec!(0.1), "s"))
            .await
            .unwrap();
        paper.set_book(&btc(), TopOfBook::new(dec!(49900), dec!(49900))).await;
        paper
            .place_order(&OrderRequest::market(btc(), Side::Buy, dec!(0.1), "b"))
            .await
            .unwrap();

        assert_eq!(paper.realized_pnl().await, dec!(10));
        let balance = paper.get_balance().await.unwrap();
        assert_eq!(balance.used, Decimal::ZERO);
        assert!(balance.total < dec!(10010));
    }

    #[test]
    fn test_position_flip_resets_entry() {
        let mut pos = PaperPosition::default();
        pos.apply(dec!(1), dec!(100));
        let realized = pos.apply(dec!(-3), dec!(110));
        assert_eq!(realized, dec!(10));
        assert_eq!(pos.quantity, dec!(-2));
        assert_eq!(pos.entry_price, dec!(110));
    }
}
