//! Leg worker task.
//!
//! Runs one [`LegOrderManager`] on its own tokio task. The coordinator sends
//! it [`LegCommand`]s; it polls order status on a fixed interval, chases the
//! price when asked to, and reports fills and outcomes to the session inbox.

use crate::config::ExecutionConfig;
use crate::exchange::{Side, TopOfBook};
use crate::resilience::Idempotency;
use crate::strategy::events::SessionEvent;
use crate::strategy::hedge::{chase_price, maker_price};
use crate::strategy::leg::{LegError, LegOrderManager, OrderIntent};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How hard a leg should push toward its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Rest a limit order at the given (maker) price
    Passive,
    /// Step a limit order toward the far touch, then go to market
    Chase,
    Market,
}

/// Instruction from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum LegCommand {
    Drive {
        goal: Decimal,
        urgency: Urgency,
        price: Option<Decimal>,
    },
    Cancel,
    Flatten,
    Shutdown,
}

#[derive(Debug, Clone)]
struct Drive {
    goal: Decimal,
    urgency: Urgency,
    price: Option<Decimal>,
    chase_started: Option<Instant>,
    last_step: Option<Instant>,
}

/// Outcome of one placement attempt.
enum Placement {
    Done,
    Rejected(String),
    Unavailable { operation: String, error: String },
}

/// Task wrapper around a leg's order manager.
pub struct LegWorker {
    manager: LegOrderManager,
    config: ExecutionConfig,
    events: mpsc::Sender<SessionEvent>,
    cancel: watch::Receiver<bool>,
    drive: Option<Drive>,
}

impl LegWorker {
    pub fn new(
        manager: LegOrderManager,
        config: ExecutionConfig,
        events: mpsc::Sender<SessionEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            config,
            events,
            cancel,
            drive: None,
        }
    }

    /// Start the worker; it runs until `Shutdown` or the sender is dropped.
    pub fn spawn(self, commands: mpsc::UnboundedReceiver<LegCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LegCommand>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(leg = self.manager.leg(), venue = %self.manager.venue(), "Leg worker started");

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    None | Some(LegCommand::Shutdown) => break,
                    Some(command) => self.handle(command).await,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        if self.manager.working().is_some() {
            if let Err(e) = self.manager.cancel().await {
                warn!(venue = %self.manager.venue(), error = %e, "Cancel on shutdown failed");
            }
            self.forward_fills().await;
        }
        debug!(leg = self.manager.leg(), "Leg worker stopped");
    }

    async fn emit(&self, event: SessionEvent) {
        // The coordinator may already be gone during shutdown
        let _ = self.events.send(event).await;
    }

    async fn forward_fills(&mut self) {
        for fill in self.manager.take_fills() {
            info!(
                venue = %fill.venue,
                side = %fill.side,
                qty = %fill.quantity,
                price = %fill.price,
                position = %fill.position_after,
                "💱 Fill"
            );
            self.emit(SessionEvent::Fill(fill)).await;
        }
    }

    async fn handle(&mut self, command: LegCommand) {
        let leg = self.manager.leg();
        match command {
            LegCommand::Drive { goal, urgency, price } => {
                debug!(leg, %goal, ?urgency, ?price, "Drive");
                let side = Side::for_delta(goal - self.manager.position());
                // A chase toward the same side keeps its clock and never steps back from market
                let carried = self.drive.as_ref().filter(|current| {
                    urgency == Urgency::Chase
                        && current.urgency != Urgency::Passive
                        && side.is_some()
                        && Side::for_delta(current.goal - self.manager.position()) == side
                });
                let drive = match carried {
                    Some(current) => Drive {
                        goal,
                        price,
                        ..current.clone()
                    },
                    None => Drive {
                        goal,
                        urgency,
                        price,
                        chase_started: None,
                        last_step: None,
                    },
                };
                self.drive = Some(drive);
                self.act().await;
            }
            LegCommand::Cancel => {
                self.drive = None;
                for attempt in 1..=self.config.flatten_attempts.max(1) {
                    match self.manager.cancel().await {
                        Ok(_) if self.manager.working().is_none() => break,
                        Ok(_) => debug!(leg, attempt, "Order still open after cancel"),
                        Err(e) => warn!(leg, attempt, error = %e, "Cancel failed"),
                    }
                }
                self.forward_fills().await;
                self.emit(SessionEvent::LegCanceled { leg }).await;
            }
            LegCommand::Flatten => {
                self.drive = None;
                let residual = self.manager.flatten(self.config.flatten_attempts).await;
                self.forward_fills().await;
                self.emit(SessionEvent::LegFlattened { leg, residual }).await;
            }
            LegCommand::Shutdown => {}
        }
    }

    async fn on_tick(&mut self) {
        if self.manager.working().is_some() {
            if let Err(e) = self.manager.poll().await {
                if let LegError::Unavailable(failure) = &e {
                    self.emit(SessionEvent::LegUnavailable {
                        leg: self.manager.leg(),
                        operation: failure.operation.clone(),
                        error: failure.to_string(),
                    })
                    .await;
                } else {
                    warn!(leg = self.manager.leg(), error = %e, "Status poll failed");
                }
            }
            self.forward_fills().await;
        }
        self.act().await;
    }

    async fn book(&self) -> Option<TopOfBook> {
        let adapter = self.manager.adapter().clone();
        let symbol = self.manager.symbol().clone();
        self.manager
            .caller()
            .call("get_orderbook", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let symbol = symbol.clone();
                async move { adapter.get_orderbook(&symbol).await }
            })
            .await
            .map_err(|e| warn!(leg = self.manager.leg(), error = %e, "Book unavailable"))
            .ok()
    }

    /// Push the current drive one step.
    async fn act(&mut self) {
        let Some(drive) = self.drive.clone() else {
            return;
        };
        let leg = self.manager.leg();

        if self.manager.reached(drive.goal) {
            if self.manager.working().is_some() {
                if let Err(e) = self.manager.cancel().await {
                    warn!(leg, error = %e, "Cancel at goal failed");
                }
                self.forward_fills().await;
            }
            self.drive = None;
            self.emit(SessionEvent::LegIdle {
                leg,
                position: self.manager.position(),
            })
            .await;
            return;
        }

        if *self.cancel.borrow() {
            debug!(leg, "Stop requested, holding new submissions");
            return;
        }

        let Some(side) = Side::for_delta(drive.goal - self.manager.position()) else {
            return;
        };

        let placement = match drive.urgency {
            Urgency::Passive => {
                if self.manager.working().is_some() {
                    return;
                }
                let price = match drive.price {
                    Some(price) => price,
                    None => match self.book().await {
                        Some(book) => maker_price(
                            &book,
                            side,
                            self.config.maker_offset_ratio,
                            self.manager.tick_size(),
                        ),
                        None => return,
                    },
                };
                self.place(OrderIntent::limit(drive.goal, price)).await
            }
            Urgency::Chase => {
                let now = Instant::now();
                let started = drive.chase_started.unwrap_or(now);
                if now.duration_since(started) >= self.config.chase_timeout() {
                    info!(leg, goal = %drive.goal, "⏱️ Chase timed out, going to market");
                    self.set_drive(Drive {
                        urgency: Urgency::Market,
                        ..drive.clone()
                    });
                    self.place(OrderIntent::market(drive.goal)).await
                } else {
                    let due = drive
                        .last_step
                        .map(|at| now.duration_since(at) >= self.config.chase_interval())
                        .unwrap_or(true);
                    if !due && self.manager.working().is_some() {
                        return;
                    }
                    let Some(book) = self.book().await else {
                        return;
                    };
                    let step = self.manager.tick_size() * Decimal::from(self.config.chase_step_ticks);
                    let previous = self.manager.working().and_then(|w| w.price);
                    let price = chase_price(previous, &book, side, step);
                    self.set_drive(Drive {
                        chase_started: Some(started),
                        last_step: Some(now),
                        ..drive.clone()
                    });
                    if self.manager.working().is_some() && previous == Some(price) {
                        return;
                    }
                    self.place(OrderIntent::limit(drive.goal, price)).await
                }
            }
            Urgency::Market => {
                if self.manager.working().is_some() {
                    return;
                }
                self.place(OrderIntent::market(drive.goal)).await
            }
        };

        match placement {
            Placement::Done => {}
            Placement::Rejected(reason) => {
                warn!(leg, %reason, "❌ Order rejected");
                self.drive = None;
                self.emit(SessionEvent::LegRejected { leg, reason }).await;
            }
            Placement::Unavailable { operation, error } => {
                warn!(leg, %error, "Venue unavailable, retrying next tick");
                self.emit(SessionEvent::LegUnavailable { leg, operation, error }).await;
            }
        }
    }

    fn set_drive(&mut self, drive: Drive) {
        self.drive = Some(drive);
    }

    async fn place(&mut self, intent: OrderIntent) -> Placement {
        let result = self.manager.submit(&intent).await;
        self.forward_fills().await;

        match result {
            Ok(Some(handle)) => {
                self.emit(SessionEvent::OrderPlaced {
                    leg: self.manager.leg(),
                    handle,
                })
                .await;
                Placement::Done
            }
            Ok(None) => Placement::Done,
            Err(LegError::Rejected(failure)) => Placement::Rejected(failure.source.to_string()),
            Err(LegError::Unavailable(failure)) => Placement::Unavailable {
                operation: failure.operation.clone(),
                error: failure.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, Symbol, Venue};
    use crate::resilience::{ResilientCaller, RetryPolicy};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            poll_interval_ms: 10,
            chase_interval_ms: 20,
            chase_timeout_ms: 100,
            ..ExecutionConfig::default()
        }
    }

    async fn start(
        paper: Arc<PaperExchange>,
    ) -> (
        mpsc::UnboundedSender<LegCommand>,
        mpsc::Receiver<SessionEvent>,
        watch::Sender<bool>,
        JoinHandle<()>,
    ) {
        let manager = LegOrderManager::new(
            0,
            btc(),
            paper,
            ResilientCaller::with_system_clock(RetryPolicy::none()),
            dec!(0.001),
            dec!(0.1),
            Duration::from_millis(5),
        );
        let (events_tx, events_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let join = LegWorker::new(manager, config(), events_tx, cancel_rx).spawn(commands_rx);
        (commands_tx, events_rx, cancel_tx, join)
    }

    async fn next_matching<F>(rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("worker closed inbox");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_chase_escalates_to_market() {
        let paper = Arc::new(PaperExchange::new(Venue::Okx, dec!(10000)));
        paper.set_book(&btc(), TopOfBook::new(dec!(50005), dec!(50008))).await;
        let (commands, mut events, _cancel, join) = start(paper.clone()).await;

        commands
            .send(LegCommand::Drive {
                goal: dec!(0.01),
                urgency: Urgency::Chase,
                price: None,
            })
            .unwrap();

        let idle = next_matching(&mut events, |e| matches!(e, SessionEvent::LegIdle { .. })).await;
        assert!(matches!(idle, SessionEvent::LegIdle { position, .. } if position == dec!(0.01)));
        assert_eq!(paper.position(&btc()).await, dec!(0.01));

        commands.send(LegCommand::Shutdown).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_acknowledges_after_order_closed() {
        let paper = Arc::new(PaperExchange::new(Venue::Aster, dec!(10000)));
        paper.set_book(&btc(), TopOfBook::new(dec!(50010), dec!(50012))).await;
        let (commands, mut events, _cancel, join) = start(paper.clone()).await;

        commands
            .send(LegCommand::Drive {
                goal: dec!(-0.01),
                urgency: Urgency::Passive,
                price: Some(dec!(50011.4)),
            })
            .unwrap();
        next_matching(&mut events, |e| matches!(e, SessionEvent::OrderPlaced { .. })).await;
        assert_eq!(paper.open_orders().await.len(), 1);

        commands.send(LegCommand::Cancel).unwrap();
        next_matching(&mut events, |e| matches!(e, SessionEvent::LegCanceled { leg: 0 })).await;
        assert!(paper.open_orders().await.is_empty());

        commands.send(LegCommand::Shutdown).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_signal_blocks_new_orders() {
        let paper = Arc::new(PaperExchange::new(Venue::Aster, dec!(10000)));
        paper.set_book(&btc(), TopOfBook::new(dec!(50010), dec!(50012))).await;
        let (commands, _events, cancel, join) = start(paper.clone()).await;

        cancel.send_replace(true);
        commands
            .send(LegCommand::Drive {
                goal: dec!(0.01),
                urgency: Urgency::Market,
                price: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(paper.orders().await.is_empty());

        commands.send(LegCommand::Shutdown).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_chase_drives_still_reach_market() {
        // Wide book: stepping one tick at a time would take many seconds
        let paper = Arc::new(PaperExchange::new(Venue::Okx, dec!(10000)));
        paper.set_book(&btc(), TopOfBook::new(dec!(50000), dec!(50100))).await;
        let (commands, mut events, _cancel, join) = start(paper.clone()).await;

        let reached = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                commands
                    .send(LegCommand::Drive {
                        goal: dec!(0.01),
                        urgency: Urgency::Chase,
                        price: None,
                    })
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                while let Ok(event) = events.try_recv() {
                    if matches!(event, SessionEvent::LegIdle { .. }) {
                        return;
                    }
                }
            }
        })
        .await;

        assert!(reached.is_ok(), "chase clock restarted on every drive");
        assert_eq!(paper.position(&btc()).await, dec!(0.01));

        commands.send(LegCommand::Shutdown).unwrap();
        join.await.unwrap();
    }
}
