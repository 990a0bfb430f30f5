//! Leg order management.
//!
//! One [`LegOrderManager`] per venue leg. It owns at most one working order,
//! keeps the leg's fill ledger and turns order status changes into fills.

use crate::error::ExchangeError;
use crate::exchange::{
    net_position, ExchangeAdapter, OrderHandle, OrderReport, OrderRequest, OrderState, OrderType,
    Side, Symbol, Venue,
};
use crate::resilience::{CallFailure, Idempotency, ResilientCaller};
use crate::strategy::events::LegFill;
use crate::utils::decimal::round_down_to_lot;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Polls after a flattening order before giving up on it.
const FLATTEN_POLLS: u32 = 20;

/// Failure of a leg operation.
#[derive(Debug, Clone, Error)]
pub enum LegError {
    /// The venue refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(CallFailure),
    /// The venue could not be reached after all retries.
    #[error("unavailable: {0}")]
    Unavailable(CallFailure),
}

impl From<CallFailure> for LegError {
    fn from(failure: CallFailure) -> Self {
        if failure.is_rejection() {
            LegError::Rejected(failure)
        } else {
            LegError::Unavailable(failure)
        }
    }
}

/// What the coordinator wants a leg to do next.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    /// Signed position the leg should reach
    pub goal: Decimal,
    pub order_type: OrderType,
    /// Limit price, ignored for market orders
    pub price: Option<Decimal>,
}

impl OrderIntent {
    pub fn limit(goal: Decimal, price: Decimal) -> Self {
        Self {
            goal,
            order_type: OrderType::Limit,
            price: Some(price),
        }
    }

    pub fn market(goal: Decimal) -> Self {
        Self {
            goal,
            order_type: OrderType::Market,
            price: None,
        }
    }
}

/// The order currently working on the venue.
#[derive(Debug, Clone)]
pub struct WorkingOrder {
    pub handle: OrderHandle,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub goal: Decimal,
    pub filled: Decimal,
    pub avg_price: Decimal,
}

/// Places, cancels and tracks orders for one leg.
pub struct LegOrderManager {
    leg: usize,
    venue: Venue,
    symbol: Symbol,
    adapter: Arc<dyn ExchangeAdapter>,
    caller: ResilientCaller,
    lot_size: Decimal,
    tick_size: Decimal,
    poll_interval: Duration,
    /// Venue position for the symbol before the session traded
    baseline: Decimal,
    position: Decimal,
    working: Option<WorkingOrder>,
    fills: Vec<LegFill>,
}

impl LegOrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        leg: usize,
        symbol: Symbol,
        adapter: Arc<dyn ExchangeAdapter>,
        caller: ResilientCaller,
        lot_size: Decimal,
        tick_size: Decimal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            leg,
            venue: adapter.venue(),
            symbol,
            adapter,
            caller,
            lot_size,
            tick_size,
            poll_interval,
            baseline: Decimal::ZERO,
            position: Decimal::ZERO,
            working: None,
            fills: Vec::new(),
        }
    }

    /// Account position that predates the session and must survive it.
    pub fn with_baseline(mut self, baseline: Decimal) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn leg(&self) -> usize {
        self.leg
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn adapter(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.adapter
    }

    pub fn caller(&self) -> &ResilientCaller {
        &self.caller
    }

    pub fn lot_size(&self) -> Decimal {
        self.lot_size
    }

    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    /// Signed filled quantity since the session started.
    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn working(&self) -> Option<&WorkingOrder> {
        self.working.as_ref()
    }

    /// Within one lot of `goal`.
    pub fn reached(&self, goal: Decimal) -> bool {
        (goal - self.position).abs() < self.lot_size
    }

    /// Drain fills recorded since the last call.
    pub fn take_fills(&mut self) -> Vec<LegFill> {
        std::mem::take(&mut self.fills)
    }

    /// Place an order moving the leg toward `intent.goal`.
    ///
    /// Any working order is cancelled first. Returns `None` when nothing is
    /// left to do or the previous order could not be confirmed closed.
    #[instrument(skip(self, intent), fields(venue = %self.venue, goal = %intent.goal))]
    pub async fn submit(&mut self, intent: &OrderIntent) -> Result<Option<OrderHandle>, LegError> {
        if self.working.is_some() {
            self.cancel().await?;
            if self.working.is_some() {
                debug!("Previous order still open, deferring placement");
                return Ok(None);
            }
        }

        // Fills captured by the cancel change what is outstanding
        let outstanding = intent.goal - self.position;
        let quantity = round_down_to_lot(outstanding.abs(), self.lot_size);
        let Some(side) = Side::for_delta(outstanding) else {
            return Ok(None);
        };
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        // Reduce-only refers to the venue's net position, baseline included
        let venue_now = self.baseline + self.position;
        let venue_after = self.baseline + intent.goal;
        let reduce_only = venue_after.abs() < venue_now.abs() && venue_after * venue_now >= Decimal::ZERO;
        let token = Uuid::new_v4().simple().to_string();
        let mut request = match (intent.order_type, intent.price) {
            (OrderType::Limit, Some(price)) => {
                OrderRequest::limit(self.symbol.clone(), side, quantity, price, token.clone())
            }
            _ => OrderRequest::market(self.symbol.clone(), side, quantity, token.clone()),
        };
        request.reduce_only = reduce_only;

        let lookup = OrderHandle {
            venue: self.venue,
            symbol: self.symbol.clone(),
            order_id: None,
            client_order_id: token.clone(),
        };

        let adapter = self.adapter.clone();
        let handle = self
            .caller
            .call("place_order", Idempotency::Token(token.clone()), |ctx| {
                let adapter = adapter.clone();
                let request = request.clone();
                let lookup = lookup.clone();
                async move {
                    if ctx.is_retry() {
                        // The earlier attempt may have reached the venue
                        match adapter.get_order_status(&lookup).await {
                            Ok(report) => {
                                info!(client_order_id = %lookup.client_order_id, "Adopting order placed by earlier attempt");
                                return Ok(OrderHandle {
                                    order_id: report.order_id,
                                    ..lookup
                                });
                            }
                            Err(ExchangeError::OrderNotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    adapter.place_order(&request).await
                }
            })
            .await?;

        debug!(
            handle = %handle,
            %side,
            qty = %quantity,
            price = ?request.price,
            reduce_only,
            "Order working"
        );

        self.working = Some(WorkingOrder {
            handle: handle.clone(),
            side,
            quantity,
            price: request.price,
            goal: intent.goal,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        });
        Ok(Some(handle))
    }

    /// Cancel the working order and capture its final fills.
    ///
    /// Returns `true` when the venue cancelled something.
    pub async fn cancel(&mut self) -> Result<bool, LegError> {
        let Some(handle) = self.working.as_ref().map(|w| w.handle.clone()) else {
            return Ok(false);
        };

        let adapter = self.adapter.clone();
        let cancelled = self
            .caller
            .call("cancel_order", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let handle = handle.clone();
                async move {
                    match adapter.cancel_order(&handle).await {
                        Err(ExchangeError::OrderNotFound(_)) => Ok(false),
                        other => other,
                    }
                }
            })
            .await?;

        self.poll().await?;
        if cancelled {
            debug!(handle = %handle, "Order cancelled");
        }
        Ok(cancelled)
    }

    /// Move the working limit order to `price`, keeping its goal.
    pub async fn reprice(&mut self, price: Decimal) -> Result<Option<OrderHandle>, LegError> {
        let Some(working) = self.working.as_ref() else {
            return Ok(None);
        };
        if working.price == Some(price) {
            return Ok(Some(working.handle.clone()));
        }
        let goal = working.goal;
        self.submit(&OrderIntent::limit(goal, price)).await
    }

    /// Refresh the working order's state and record new fills.
    pub async fn poll(&mut self) -> Result<Option<OrderReport>, LegError> {
        let Some(handle) = self.working.as_ref().map(|w| w.handle.clone()) else {
            return Ok(None);
        };

        let adapter = self.adapter.clone();
        let report = self
            .caller
            .call("get_order_status", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let handle = handle.clone();
                async move { adapter.get_order_status(&handle).await }
            })
            .await?;

        self.absorb(&report);
        Ok(Some(report))
    }

    fn absorb(&mut self, report: &OrderReport) {
        let Some(working) = self.working.as_mut() else {
            return;
        };

        let delta = report.filled_quantity - working.filled;
        let done = report.state.is_terminal();
        if delta > Decimal::ZERO {
            // Price of the new fills only, from the change in cumulative notional
            let price = (report.avg_price * report.filled_quantity - working.avg_price * working.filled)
                / delta;
            working.filled = report.filled_quantity;
            working.avg_price = report.avg_price;
            working.side = report.side;
            self.position += delta * report.side.sign();

            self.fills.push(LegFill {
                leg: self.leg,
                venue: self.venue,
                client_order_id: working.handle.client_order_id.clone(),
                side: working.side,
                quantity: delta,
                price,
                position_after: self.position,
                order_done: done,
                timestamp: Utc::now(),
            });
        }

        if done {
            if report.state == OrderState::Rejected {
                warn!(venue = %self.venue, handle = %working.handle, "Order rejected after placement");
            }
            self.working = None;
        }
    }

    /// Cancel and close the leg with reduce-only market orders.
    ///
    /// Falls back to the venue's close-position call when orders do not get
    /// the leg flat. Returns the residual position.
    #[instrument(skip(self), fields(venue = %self.venue, position = %self.position))]
    pub async fn flatten(&mut self, attempts: u32) -> Decimal {
        if let Err(e) = self.cancel().await {
            warn!(error = %e, "Cancel before flatten failed");
        }

        for attempt in 1..=attempts.max(1) {
            if self.reached(Decimal::ZERO) {
                break;
            }
            match self.submit(&OrderIntent::market(Decimal::ZERO)).await {
                Ok(Some(_)) => self.await_working().await,
                Ok(None) => {}
                Err(e) => warn!(attempt, error = %e, "Flatten order failed"),
            }
        }

        if !self.reached(Decimal::ZERO) {
            self.close_via_venue().await;
        }

        if self.reached(Decimal::ZERO) {
            info!(venue = %self.venue, "✅ Leg flat");
        } else {
            warn!(venue = %self.venue, residual = %self.position, "Leg not flat after flatten");
        }
        self.position
    }

    /// Poll the working order until it closes.
    async fn await_working(&mut self) {
        for _ in 0..FLATTEN_POLLS {
            match self.poll().await {
                Ok(_) if self.working.is_none() => return,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Poll during flatten failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Last resort when orders did not get the leg flat.
    ///
    /// The venue-wide close only runs when the venue holds nothing but this
    /// session's position; otherwise one more order sized to the leg's own
    /// position is sent.
    async fn close_via_venue(&mut self) {
        if !self.baseline.is_zero() {
            warn!(
                venue = %self.venue,
                baseline = %self.baseline,
                "Account held a position before the session, closing only the leg's share"
            );
            match self.submit(&OrderIntent::market(Decimal::ZERO)).await {
                Ok(Some(_)) => self.await_working().await,
                Ok(None) => {}
                Err(e) => warn!(venue = %self.venue, error = %e, "Final flatten order failed"),
            }
            return;
        }

        let adapter = self.adapter.clone();
        let positions = self
            .caller
            .call("get_positions", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_positions().await }
            })
            .await;
        let held = match positions {
            Ok(positions) => net_position(&positions, &self.symbol),
            Err(e) => {
                warn!(venue = %self.venue, error = %e, "Position check before close failed");
                return;
            }
        };
        if (held - self.position).abs() >= self.lot_size {
            warn!(
                venue = %self.venue,
                venue_position = %held,
                leg_position = %self.position,
                "Venue position differs from the leg's, not closing it venue-wide"
            );
            return;
        }
        let Some(side) = Side::for_delta(-held) else {
            warn!(venue = %self.venue, "Venue reports no position to close");
            return;
        };

        let symbol = self.symbol.clone();
        let result = self
            .caller
            .call("close_position", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let symbol = symbol.clone();
                async move { adapter.close_position(&symbol).await }
            })
            .await;

        match result {
            Ok(Some(handle)) => {
                // Fills are booked on the side the venue reports
                self.working = Some(WorkingOrder {
                    handle,
                    side,
                    quantity: held.abs(),
                    price: None,
                    goal: Decimal::ZERO,
                    filled: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                });
                self.await_working().await;
            }
            Ok(None) => warn!(venue = %self.venue, "Venue reports no position to close"),
            Err(e) => warn!(venue = %self.venue, error = %e, "Close position failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, PaperFault, PaperOp, TopOfBook};
    use crate::resilience::{ManualClock, RetryPolicy};
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    async fn paper() -> Arc<PaperExchange> {
        let paper = Arc::new(PaperExchange::new(Venue::Aster, dec!(10000)));
        paper.set_book(&btc(), TopOfBook::new(dec!(50010), dec!(50012))).await;
        paper
    }

    fn manager(paper: Arc<PaperExchange>) -> LegOrderManager {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            multiplier: 1,
        };
        let caller = ResilientCaller::new(policy, Arc::new(ManualClock::default()));
        LegOrderManager::new(
            0,
            btc(),
            paper,
            caller,
            dec!(0.001),
            dec!(0.1),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_idempotent_resubmission_after_ambiguous_failure() {
        let paper = paper().await;
        paper
            .inject(PaperOp::Place, PaperFault::FailAfterApply(ExchangeError::Network("reset".into())))
            .await;
        let mut leg = manager(paper.clone());

        let handle = leg
            .submit(&OrderIntent::limit(dec!(0.01), dec!(50010.6)))
            .await
            .unwrap()
            .unwrap();

        let orders = paper.orders().await;
        assert_eq!(orders.len(), 1, "retry must adopt, not duplicate");
        assert_eq!(orders[0].client_order_id, handle.client_order_id);
        assert_eq!(handle.order_id.as_deref(), Some(orders[0].order_id.as_str()));
    }

    #[tokio::test]
    async fn test_partial_fills_update_ledger() {
        let paper = paper().await;
        let mut leg = manager(paper.clone());
        let handle = leg
            .submit(&OrderIntent::limit(dec!(-0.01), dec!(50011.4)))
            .await
            .unwrap()
            .unwrap();

        paper.fill_order(&handle.client_order_id, dec!(0.004)).await.unwrap();
        leg.poll().await.unwrap();
        paper.fill_order(&handle.client_order_id, dec!(0.006)).await.unwrap();
        leg.poll().await.unwrap();

        let fills = leg.take_fills();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].quantity, dec!(0.004));
        assert_eq!(fills[1].price, dec!(50011.4));
        assert!(fills[1].order_done);
        assert_eq!(leg.position(), dec!(-0.01));
        assert!(leg.working().is_none());
        assert!(leg.reached(dec!(-0.01)));
    }

    #[tokio::test]
    async fn test_replacement_never_exceeds_outstanding() {
        let paper = paper().await;
        let mut leg = manager(paper.clone());
        let first = leg
            .submit(&OrderIntent::limit(dec!(0.01), dec!(50010.6)))
            .await
            .unwrap()
            .unwrap();
        paper.fill_order(&first.client_order_id, dec!(0.003)).await.unwrap();

        // Reprice captures the partial fill before sizing the new order
        leg.reprice(dec!(50010.8)).await.unwrap().unwrap();

        let working = leg.working().unwrap();
        assert_eq!(working.quantity, dec!(0.007));
        assert_eq!(leg.position(), dec!(0.003));
        assert_eq!(paper.open_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_rejection_is_not_retried() {
        let paper = paper().await;
        paper
            .inject(PaperOp::Place, PaperFault::Fail(ExchangeError::RejectedOrder("margin".into())))
            .await;
        let mut leg = manager(paper.clone());

        let err = leg.submit(&OrderIntent::market(dec!(0.01))).await.unwrap_err();
        assert!(matches!(err, LegError::Rejected(_)));
        assert!(paper.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_flatten_closes_position() {
        let paper = paper().await;
        let mut leg = manager(paper.clone());
        leg.submit(&OrderIntent::market(dec!(-0.01))).await.unwrap();
        leg.poll().await.unwrap();
        assert_eq!(leg.position(), dec!(-0.01));

        let residual = leg.flatten(3).await;
        assert_eq!(residual, Decimal::ZERO);
        assert_eq!(paper.position(&btc()).await, Decimal::ZERO);
        assert!(leg.take_fills().iter().any(|f| f.side == Side::Buy));
    }

    #[tokio::test]
    async fn test_flatten_leaves_preexisting_position_alone() {
        let paper = paper().await;
        paper.set_position(&btc(), dec!(0.2), dec!(50000)).await;
        let mut leg = manager(paper.clone()).with_baseline(dec!(0.2));
        leg.submit(&OrderIntent::market(dec!(-0.01))).await.unwrap();
        leg.poll().await.unwrap();
        assert_eq!(paper.position(&btc()).await, dec!(0.19));

        // The regular flatten order is refused, forcing the fallback
        paper
            .inject(PaperOp::Place, PaperFault::Fail(ExchangeError::RejectedOrder("busy".into())))
            .await;
        let residual = leg.flatten(1).await;

        assert_eq!(residual, Decimal::ZERO);
        assert_eq!(leg.position(), Decimal::ZERO);
        assert_eq!(paper.position(&btc()).await, dec!(0.2));
        let fills = leg.take_fills();
        let last = fills.last().unwrap();
        assert_eq!(last.side, Side::Buy);
        assert_eq!(last.quantity, dec!(0.01));
    }

    #[tokio::test]
    async fn test_venue_close_books_reported_fill() {
        let paper = paper().await;
        let mut leg = manager(paper.clone());
        leg.submit(&OrderIntent::market(dec!(-0.01))).await.unwrap();
        leg.poll().await.unwrap();

        paper
            .inject(PaperOp::Place, PaperFault::Fail(ExchangeError::RejectedOrder("busy".into())))
            .await;
        let residual = leg.flatten(1).await;

        assert_eq!(residual, Decimal::ZERO);
        assert_eq!(paper.position(&btc()).await, Decimal::ZERO);
        let fills = leg.take_fills();
        let last = fills.last().unwrap();
        assert_eq!(last.side, Side::Buy);
        assert_eq!(last.quantity, dec!(0.01));
        assert_eq!(last.position_after, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_venue_close_skipped_when_venue_disagrees() {
        let paper = paper().await;
        let mut leg = manager(paper.clone());
        leg.submit(&OrderIntent::market(dec!(-0.01))).await.unwrap();
        leg.poll().await.unwrap();
        // Someone else adds to the account behind the session's back
        paper.set_position(&btc(), dec!(-0.05), dec!(50010)).await;

        paper
            .inject(PaperOp::Place, PaperFault::Fail(ExchangeError::RejectedOrder("busy".into())))
            .await;
        let residual = leg.flatten(1).await;

        assert_eq!(residual, dec!(-0.01));
        assert_eq!(paper.position(&btc()).await, dec!(-0.05));
    }
}
