//! Cross-venue spread monitoring.
//!
//! Polls top of book on every leg, evaluates all directional spreads and
//! offers opportunities above the threshold to the session coordinator.

use crate::config::MonitorConfig;
use crate::exchange::{ExchangeAdapter, Symbol, TopOfBook, Venue};
use crate::resilience::{Idempotency, ResilientCaller};
use crate::strategy::events::SessionEvent;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, Stream};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sell on leg `sell` (at its bid), buy on leg `buy` (at its ask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Direction {
    pub sell: usize,
    pub buy: usize,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sell, self.buy)
    }
}

/// Top of book for one leg.
#[derive(Debug, Clone, Serialize)]
pub struct LegQuote {
    pub leg: usize,
    pub venue: Venue,
    pub book: TopOfBook,
}

/// Books of all legs taken in one tick.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub quotes: Vec<LegQuote>,
    pub taken_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Average mid across legs.
    pub fn reference_price(&self) -> Decimal {
        if self.quotes.is_empty() {
            return Decimal::ZERO;
        }
        let total: Decimal = self.quotes.iter().map(|q| q.book.mid()).sum();
        total / Decimal::from(self.quotes.len())
    }

    pub fn book(&self, leg: usize) -> Option<&TopOfBook> {
        self.quotes.iter().find(|q| q.leg == leg).map(|q| &q.book)
    }

    /// Spread of one direction.
    pub fn spread(&self, direction: Direction) -> Option<DirectionalSpread> {
        let sell = self.book(direction.sell)?;
        let buy = self.book(direction.buy)?;
        Some(directional_spread(direction, sell, buy))
    }
}

/// Spread of selling on one leg and buying on another.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DirectionalSpread {
    pub direction: Direction,
    /// `sell.bid - buy.ask`
    pub raw: Decimal,
    /// `raw` over the average of both legs' mids
    pub normalized: Decimal,
}

/// A spread worth entering.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    pub snapshot: MarketSnapshot,
    pub spreads: Vec<DirectionalSpread>,
    pub best: DirectionalSpread,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn magnitude(&self) -> Decimal {
        self.best.normalized
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.detected_at
    }
}

fn directional_spread(direction: Direction, sell: &TopOfBook, buy: &TopOfBook) -> DirectionalSpread {
    let raw = sell.bid - buy.ask;
    let mid = (sell.mid() + buy.mid()) / Decimal::TWO;
    let normalized = if mid > Decimal::ZERO { raw / mid } else { Decimal::ZERO };
    DirectionalSpread {
        direction,
        raw,
        normalized,
    }
}

/// All ordered-pair spreads, in evaluation order.
pub fn evaluate(quotes: &[LegQuote]) -> Vec<DirectionalSpread> {
    let mut spreads = Vec::with_capacity(quotes.len() * quotes.len().saturating_sub(1));
    for x in quotes {
        for y in quotes {
            if x.leg == y.leg {
                continue;
            }
            let direction = Direction {
                sell: x.leg,
                buy: y.leg,
            };
            spreads.push(directional_spread(direction, &x.book, &y.book));
        }
    }
    spreads
}

/// Highest normalized spread.
///
/// Ties go to `active`, then to the pair with the lower combined taker fee,
/// then to the earlier entry.
pub fn best_direction(
    spreads: &[DirectionalSpread],
    taker_fees: &[Decimal],
    active: Option<Direction>,
) -> Option<DirectionalSpread> {
    let fee = |d: Direction| {
        taker_fees.get(d.sell).copied().unwrap_or_default()
            + taker_fees.get(d.buy).copied().unwrap_or_default()
    };

    let mut best: Option<DirectionalSpread> = None;
    for candidate in spreads {
        let Some(current) = best else {
            best = Some(*candidate);
            continue;
        };
        let better = if candidate.normalized != current.normalized {
            candidate.normalized > current.normalized
        } else if Some(current.direction) == active {
            false
        } else if Some(candidate.direction) == active {
            true
        } else {
            fee(candidate.direction) < fee(current.direction)
        };
        if better {
            best = Some(*candidate);
        }
    }
    best
}

/// One monitored leg.
#[derive(Clone)]
pub struct MonitoredLeg {
    pub venue: Venue,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub taker_fee: Decimal,
}

/// Spread monitor for one symbol across 2-3 legs.
pub struct SpreadMonitor {
    symbol: Symbol,
    legs: Vec<MonitoredLeg>,
    caller: ResilientCaller,
    config: MonitorConfig,
    cache: Mutex<Vec<Option<(Instant, TopOfBook)>>>,
}

impl SpreadMonitor {
    pub fn new(symbol: Symbol, legs: Vec<MonitoredLeg>, caller: ResilientCaller, config: MonitorConfig) -> Self {
        let cache = Mutex::new(vec![None; legs.len()]);
        Self {
            symbol,
            legs,
            caller,
            config,
            cache,
        }
    }

    fn cached(&self, leg: usize) -> Option<TopOfBook> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(leg)
            .and_then(|entry| entry.as_ref())
            .filter(|(at, _)| at.elapsed() < self.config.cache_ttl())
            .map(|(_, book)| book.clone())
    }

    fn store(&self, leg: usize, book: &TopOfBook) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = cache.get_mut(leg) {
            *slot = Some((Instant::now(), book.clone()));
        }
    }

    async fn fetch_book(&self, leg: usize) -> Result<TopOfBook, String> {
        if let Some(book) = self.cached(leg) {
            return Ok(book);
        }

        let adapter = self.legs[leg].adapter.clone();
        let call = self.caller.call("get_orderbook", Idempotency::Safe, |_| {
            let adapter = adapter.clone();
            let symbol = self.symbol.clone();
            async move { adapter.get_orderbook(&symbol).await }
        });

        let book = match tokio::time::timeout(self.config.book_timeout(), call).await {
            Ok(Ok(book)) => book,
            Ok(Err(failure)) => return Err(failure.to_string()),
            Err(_) => return Err(format!("timed out after {:?}", self.config.book_timeout())),
        };
        if !book.is_valid() {
            return Err(format!("invalid book bid={} ask={}", book.bid, book.ask));
        }

        self.store(leg, &book);
        Ok(book)
    }

    /// Books of every leg, or `None` if any leg failed this tick.
    pub async fn snapshot(&self) -> Option<MarketSnapshot> {
        let results = join_all((0..self.legs.len()).map(|leg| self.fetch_book(leg))).await;

        let mut quotes = Vec::with_capacity(results.len());
        for (leg, result) in results.into_iter().enumerate() {
            match result {
                Ok(book) => quotes.push(LegQuote {
                    leg,
                    venue: self.legs[leg].venue,
                    book,
                }),
                Err(error) => {
                    warn!(
                        venue = %self.legs[leg].venue,
                        symbol = %self.symbol,
                        %error,
                        "Book fetch failed, skipping tick"
                    );
                    return None;
                }
            }
        }

        Some(MarketSnapshot {
            symbol: self.symbol.clone(),
            quotes,
            taken_at: Utc::now(),
        })
    }

    /// Evaluate a snapshot against the threshold.
    pub fn opportunity(
        &self,
        snapshot: &MarketSnapshot,
        min_spread: Decimal,
        active: Option<Direction>,
    ) -> Option<Opportunity> {
        let spreads = evaluate(&snapshot.quotes);
        let fees: Vec<Decimal> = self.legs.iter().map(|l| l.taker_fee).collect();
        let best = best_direction(&spreads, &fees, active)?;

        if best.normalized < min_spread {
            debug!(
                symbol = %self.symbol,
                direction = %best.direction,
                spread = %best.normalized,
                "Best spread below threshold"
            );
            return None;
        }

        Some(Opportunity {
            id: Uuid::new_v4().simple().to_string(),
            snapshot: snapshot.clone(),
            spreads,
            best,
            detected_at: Utc::now(),
        })
    }

    /// Poll until cancelled, publishing each snapshot and offering
    /// opportunities to the session inbox without blocking.
    pub async fn run(
        self: Arc<Self>,
        min_spread: Decimal,
        inbox: mpsc::Sender<SessionEvent>,
        latest: watch::Sender<Option<MarketSnapshot>>,
        active: watch::Receiver<Option<Direction>>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(symbol = %self.symbol, legs = self.legs.len(), "📡 Spread monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(snapshot) = self.snapshot().await else {
                continue;
            };
            latest.send_replace(Some(snapshot.clone()));

            let active_direction = *active.borrow();
            let Some(opportunity) = self.opportunity(&snapshot, min_spread, active_direction) else {
                continue;
            };

            match inbox.try_send(SessionEvent::Opportunity(opportunity)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Coordinator inbox full, dropping opportunity"),
                Err(TrySendError::Closed(_)) => break,
            }
        }

        debug!(symbol = %self.symbol, "Spread monitor stopped");
    }

    /// Lazy, unbounded stream of opportunities.
    pub fn opportunities(self: Arc<Self>, min_spread: Decimal) -> impl Stream<Item = Opportunity> {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        stream::unfold((self, ticker), move |(monitor, mut ticker)| async move {
            loop {
                ticker.tick().await;
                let Some(snapshot) = monitor.snapshot().await else {
                    continue;
                };
                if let Some(opportunity) = monitor.opportunity(&snapshot, min_spread, None) {
                    return Some((opportunity, (monitor, ticker)));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::MockExchangeAdapter;
    use crate::resilience::RetryPolicy;
    use rust_decimal_macros::dec;

    fn quote(leg: usize, venue: Venue, bid: Decimal, ask: Decimal) -> LegQuote {
        LegQuote {
            leg,
            venue,
            book: TopOfBook::new(bid, ask),
        }
    }

    fn mock_leg(venue: Venue, bid: Decimal, ask: Decimal, calls: usize) -> MonitoredLeg {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_venue().return_const(venue);
        mock.expect_get_orderbook()
            .times(calls)
            .returning(move |_| Ok(TopOfBook::new(bid, ask)));
        MonitoredLeg {
            venue,
            adapter: Arc::new(mock),
            taker_fee: dec!(0.0005),
        }
    }

    fn monitor(legs: Vec<MonitoredLeg>, cache_ttl_ms: u64) -> SpreadMonitor {
        let config = MonitorConfig {
            poll_interval_ms: 10,
            book_timeout_ms: 500,
            cache_ttl_ms,
        };
        SpreadMonitor::new(
            Symbol::new("BTC", "USDT"),
            legs,
            ResilientCaller::with_system_clock(RetryPolicy::none()),
            config,
        )
    }

    #[test]
    fn test_spread_example() {
        let quotes = vec![
            quote(0, Venue::Aster, dec!(50010), dec!(50012)),
            quote(1, Venue::Okx, dec!(50005), dec!(50008)),
        ];
        let spreads = evaluate(&quotes);
        assert_eq!(spreads.len(), 2);

        let a_to_b = spreads.iter().find(|s| s.direction == Direction { sell: 0, buy: 1 }).unwrap();
        let b_to_a = spreads.iter().find(|s| s.direction == Direction { sell: 1, buy: 0 }).unwrap();
        assert_eq!(a_to_b.raw, dec!(2));
        assert_eq!(b_to_a.raw, dec!(-7));
        assert_eq!(a_to_b.normalized, dec!(2) / dec!(50008.75));

        let best = best_direction(&spreads, &[dec!(0.0005), dec!(0.0005)], None).unwrap();
        assert_eq!(best.direction, Direction { sell: 0, buy: 1 });
    }

    #[test]
    fn test_three_legs_give_six_directions() {
        let quotes = vec![
            quote(0, Venue::Aster, dec!(100), dec!(101)),
            quote(1, Venue::Okx, dec!(100), dec!(101)),
            quote(2, Venue::Backpack, dec!(100), dec!(101)),
        ];
        assert_eq!(evaluate(&quotes).len(), 6);
    }

    #[test]
    fn test_tie_break_order() {
        let spread = |sell, buy| DirectionalSpread {
            direction: Direction { sell, buy },
            raw: dec!(1),
            normalized: dec!(0.001),
        };
        let spreads = vec![spread(0, 1), spread(0, 2), spread(1, 2)];
        let fees = [dec!(0.0005), dec!(0.0005), dec!(0.0002)];

        // Active direction wins
        let best = best_direction(&spreads, &fees, Some(Direction { sell: 0, buy: 1 })).unwrap();
        assert_eq!(best.direction, Direction { sell: 0, buy: 1 });

        // Otherwise the cheaper pair
        let best = best_direction(&spreads, &fees, None).unwrap();
        assert_eq!(best.direction, Direction { sell: 0, buy: 2 });

        // Otherwise evaluation order
        let best = best_direction(&spreads, &[Decimal::ZERO; 3], None).unwrap();
        assert_eq!(best.direction, Direction { sell: 0, buy: 1 });
    }

    #[tokio::test]
    async fn test_snapshot_and_threshold() {
        let monitor = monitor(
            vec![
                mock_leg(Venue::Aster, dec!(50010), dec!(50012), 1),
                mock_leg(Venue::Okx, dec!(50005), dec!(50008), 1),
            ],
            1_000,
        );

        let snapshot = monitor.snapshot().await.unwrap();
        assert_eq!(snapshot.quotes.len(), 2);
        assert_eq!(snapshot.reference_price(), dec!(50008.75));

        assert!(monitor.opportunity(&snapshot, dec!(0.00001), None).is_some());
        assert!(monitor.opportunity(&snapshot, dec!(0.001), None).is_none());

        // Second read inside the TTL comes from the cache (mock allows one call)
        assert!(monitor.snapshot().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_leg_drops_tick() {
        let mut failing = MockExchangeAdapter::new();
        failing.expect_venue().return_const(Venue::Okx);
        failing
            .expect_get_orderbook()
            .returning(|_| Err(ExchangeError::UnknownSymbol("FOO-USDT-SWAP".into())));

        let monitor = monitor(
            vec![
                mock_leg(Venue::Aster, dec!(100), dec!(101), 1),
                MonitoredLeg {
                    venue: Venue::Okx,
                    adapter: Arc::new(failing),
                    taker_fee: dec!(0.0005),
                },
            ],
            0,
        );
        assert!(monitor.snapshot().await.is_none());
    }
}
