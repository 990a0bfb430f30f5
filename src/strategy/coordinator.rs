//! Hedge coordinator.
//!
//! One actor per session. It owns the [`ArbitrageSession`], consumes the
//! session inbox in order and is the only place session state changes.
//! Leg workers do the trading; the coordinator decides goals and urgency.
//!
//! Unwinds (rejection, hedge timeout, drift, operator stop) always run in
//! two steps: every leg cancels its working order and acknowledges, and only
//! then does the session enter `EmergencyStop` and flatten what is held.

use crate::config::ExecutionConfig;
use crate::exchange::{Side, Venue};
use crate::risk::{AlertKind, AlertSeverity, OperatorAlert};
use crate::strategy::events::{DriftReport, LegFill, SessionEvent};
use crate::strategy::hedge::{allocate_targets, compensation_goals, maker_price, net_exposure};
use crate::strategy::monitor::{Direction, MarketSnapshot, Opportunity};
use crate::strategy::session::{
    ArbitrageSession, LegState, SessionState, SessionSummary, StateTransition, TerminationCause,
};
use crate::strategy::worker::{LegCommand, Urgency};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Command channel and sizing of one leg worker.
pub struct WorkerLink {
    pub commands: mpsc::UnboundedSender<LegCommand>,
    pub lot_size: Decimal,
    pub tick_size: Decimal,
}

/// Channels the coordinator reads from and publishes to.
pub struct CoordinatorLinks {
    pub inbox: mpsc::Receiver<SessionEvent>,
    pub cancel: watch::Receiver<bool>,
    pub state: watch::Sender<SessionState>,
    /// Session-relative position per leg, read by the auditor
    pub expected: watch::Sender<Vec<Decimal>>,
    /// Direction being traded, used by the monitor's tie-break
    pub active: watch::Sender<Option<Direction>>,
    pub latest: watch::Receiver<Option<MarketSnapshot>>,
    pub workers: Vec<WorkerLink>,
}

#[derive(Debug)]
enum UnwindStage {
    Canceling { pending: BTreeSet<usize>, deadline: Instant },
    Flattening { pending: BTreeSet<usize> },
}

#[derive(Debug)]
struct Unwind {
    cause: TerminationCause,
    stage: UnwindStage,
}

/// Session state machine.
pub struct HedgeCoordinator {
    session: ArbitrageSession,
    config: ExecutionConfig,
    links: CoordinatorLinks,
    direction: Option<Direction>,
    entry_spread: Decimal,
    entry_notional: Decimal,
    phase_started: Option<Instant>,
    escalated: bool,
    unhedged_since: Option<Instant>,
    held_since: Option<Instant>,
    last_price: Decimal,
    cause: Option<TerminationCause>,
    unwind: Option<Unwind>,
    residuals: Vec<Decimal>,
    /// Goal and urgency each worker is currently driving toward
    driving: Vec<Option<(Decimal, Urgency)>>,
    halted: bool,
    stop_seen: bool,
    terminate_requested: bool,
    fills: Vec<LegFill>,
    alerts: Vec<OperatorAlert>,
    transitions: Vec<StateTransition>,
}

impl HedgeCoordinator {
    pub fn new(session: ArbitrageSession, config: ExecutionConfig, links: CoordinatorLinks) -> Self {
        let legs = session.legs.len();
        Self {
            session,
            config,
            links,
            direction: None,
            entry_spread: Decimal::ZERO,
            entry_notional: Decimal::ZERO,
            phase_started: None,
            escalated: false,
            unhedged_since: None,
            held_since: None,
            last_price: Decimal::ZERO,
            cause: None,
            unwind: None,
            residuals: vec![Decimal::ZERO; legs],
            driving: vec![None; legs],
            halted: false,
            stop_seen: false,
            terminate_requested: false,
            fills: Vec::new(),
            alerts: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Run until the session is `Closed`, then shut the workers down.
    pub async fn run(mut self) -> SessionSummary {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.links.state.send_replace(self.session.state);
        info!(
            session = %self.session.id,
            symbol = %self.session.params.symbol,
            legs = self.session.legs.len(),
            qty = %self.session.params.quantity,
            "🚀 Session started"
        );

        if *self.links.cancel.borrow() {
            self.stop_seen = true;
            self.on_stop();
        }

        while self.session.state != SessionState::Closed {
            tokio::select! {
                biased;
                changed = self.links.cancel.changed(), if !self.stop_seen => {
                    match changed {
                        Ok(()) if *self.links.cancel.borrow() => {
                            self.stop_seen = true;
                            self.on_stop();
                        }
                        Ok(()) => {}
                        // Handle dropped: no stop can arrive any more
                        Err(_) => self.stop_seen = true,
                    }
                }
                event = self.links.inbox.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        warn!(session = %self.session.id, "Session inbox closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        for worker in &self.links.workers {
            let _ = worker.commands.send(LegCommand::Shutdown);
        }
        self.summary()
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.session.id.clone(),
            symbol: self.session.params.symbol.clone(),
            dry_run: self.session.params.dry_run,
            final_state: self.session.state,
            cause: self.cause,
            realized_pnl: self.session.realized_pnl,
            started_at: self.session.created_at,
            ended_at: Utc::now(),
            legs: self.session.legs.iter().map(|l| l.summary()).collect(),
            fills: self.fills.clone(),
            alerts: self.alerts.clone(),
            transitions: self.transitions.clone(),
        }
    }

    fn transition(&mut self, next: SessionState) -> bool {
        let from = self.session.state;
        if from == next {
            return true;
        }
        if !from.can_transition_to(next) {
            warn!(session = %self.session.id, %from, to = %next, "Ignoring invalid transition");
            return false;
        }

        info!(session = %self.session.id, "🔄 {} -> {}", from, next);
        self.session.state = next;
        self.transitions.push(StateTransition {
            from,
            to: next,
            at: Utc::now(),
        });
        self.links.state.send_replace(next);
        true
    }

    fn alert(&mut self, severity: AlertSeverity, kind: AlertKind, message: impl Into<String>) {
        let alert = OperatorAlert::new(self.session.id.clone(), severity, kind, message);
        alert.emit();
        self.alerts.push(alert);
    }

    fn send(&mut self, leg: usize, command: LegCommand) {
        if !matches!(command, LegCommand::Drive { .. }) {
            if let Some(driving) = self.driving.get_mut(leg) {
                *driving = None;
            }
        }
        if let Some(worker) = self.links.workers.get(leg) {
            if worker.commands.send(command).is_err() {
                warn!(session = %self.session.id, leg, "Leg worker is gone");
            }
        }
    }

    fn drive(&mut self, leg: usize, goal: Decimal, urgency: Urgency, price: Option<Decimal>) {
        // Re-sending an unchanged drive would restart the worker's chase clock
        if price.is_none() && self.driving[leg] == Some((goal, urgency)) {
            return;
        }
        self.driving[leg] = Some((goal, urgency));
        self.session.legs[leg].goal = goal;
        self.session.legs[leg].state = LegState::Working;
        debug!(session = %self.session.id, leg, %goal, ?urgency, ?price, "Driving leg");
        self.send(leg, LegCommand::Drive { goal, urgency, price });
    }

    fn lot(&self, leg: usize) -> Decimal {
        self.links.workers.get(leg).map(|w| w.lot_size).unwrap_or_default()
    }

    fn lots(&self) -> Vec<Decimal> {
        (0..self.session.legs.len()).map(|i| self.lot(i)).collect()
    }

    fn reference_price(&self) -> Decimal {
        self.links
            .latest
            .borrow()
            .as_ref()
            .map(MarketSnapshot::reference_price)
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(self.last_price)
    }

    fn exposure(&self) -> Decimal {
        net_exposure(&self.session.positions(), self.reference_price())
    }

    fn phase_goal(&self, leg: usize) -> Decimal {
        match self.session.state {
            SessionState::Entering => self.session.legs[leg].target,
            _ => Decimal::ZERO,
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opportunity(opportunity) => self.on_opportunity(opportunity),
            SessionEvent::OrderPlaced { leg, handle } => {
                if let Some(l) = self.session.legs.get_mut(leg) {
                    l.working = Some(handle.client_order_id);
                    l.state = LegState::Working;
                }
            }
            SessionEvent::Fill(fill) => self.on_fill(fill),
            SessionEvent::LegRejected { leg, reason } => {
                let venue = self.session.legs[leg].venue;
                self.session.legs[leg].state = LegState::Failed;
                self.session.legs[leg].working = None;
                self.driving[leg] = None;
                self.alert(
                    AlertSeverity::Error,
                    AlertKind::OrderRejected {
                        venue,
                        reason: reason.clone(),
                    },
                    format!("{} rejected an order: {}", venue, reason),
                );
                if self.unwind.is_none() && self.session.state.is_transitional() {
                    self.begin_unwind(TerminationCause::ExchangeRejection);
                }
            }
            SessionEvent::LegUnavailable { leg, operation, error } => {
                let venue = self.session.legs[leg].venue;
                self.alert(
                    AlertSeverity::Warning,
                    AlertKind::VenueUnavailable {
                        venue,
                        operation: operation.clone(),
                    },
                    format!("{} unavailable for {}: {}", venue, operation, error),
                );
            }
            SessionEvent::LegIdle { leg, position } => {
                self.driving[leg] = None;
                let l = &mut self.session.legs[leg];
                l.working = None;
                l.state = if position == Decimal::ZERO {
                    LegState::Flat
                } else {
                    LegState::Filled
                };
                self.check_progress();
            }
            SessionEvent::LegCanceled { leg } => {
                self.session.legs[leg].working = None;
                let ready = match self.unwind.as_mut() {
                    Some(Unwind {
                        stage: UnwindStage::Canceling { pending, .. },
                        ..
                    }) => {
                        pending.remove(&leg);
                        pending.is_empty()
                    }
                    _ => false,
                };
                if ready {
                    self.start_flatten();
                }
            }
            SessionEvent::LegFlattened { leg, residual } => {
                self.residuals[leg] = residual;
                self.session.legs[leg].state = if residual == Decimal::ZERO {
                    LegState::Flat
                } else {
                    LegState::Failed
                };
                let ready = match self.unwind.as_mut() {
                    Some(Unwind {
                        stage: UnwindStage::Flattening { pending },
                        ..
                    }) => {
                        pending.remove(&leg);
                        pending.is_empty()
                    }
                    _ => false,
                };
                if ready {
                    self.finish_unwind();
                }
            }
            SessionEvent::AuditViolation(report) => self.on_drift(report),
            SessionEvent::Resume => self.on_resume(),
            SessionEvent::Terminate => self.on_terminate(),
        }
    }

    fn on_opportunity(&mut self, opportunity: Opportunity) {
        if self.session.state != SessionState::Idle || self.unwind.is_some() || self.stop_seen {
            return;
        }

        let age = opportunity.age().to_std().unwrap_or_default();
        if age > self.config.opportunity_ttl() {
            debug!(id = %opportunity.id, ?age, "Stale opportunity dropped");
            return;
        }
        if opportunity.magnitude() < self.session.params.min_spread {
            return;
        }

        let direction = opportunity.best.direction;
        let lots = self.lots();
        let targets = allocate_targets(direction, self.session.params.quantity, &lots);
        for (leg, target) in self.session.legs.iter_mut().zip(&targets) {
            leg.target = *target;
        }

        info!(
            session = %self.session.id,
            id = %opportunity.id,
            %direction,
            spread = %opportunity.best.normalized,
            raw = %opportunity.best.raw,
            "🎯 Entering on opportunity"
        );

        self.direction = Some(direction);
        self.links.active.send_replace(Some(direction));
        self.entry_spread = opportunity.best.normalized;
        self.last_price = opportunity.snapshot.reference_price();
        if !self.transition(SessionState::Entering) {
            return;
        }
        self.start_phase();

        for (leg, target) in targets.into_iter().enumerate() {
            let Some(side) = Side::for_delta(target) else {
                continue;
            };
            let price = opportunity.snapshot.book(leg).map(|book| {
                maker_price(
                    book,
                    side,
                    self.config.maker_offset_ratio,
                    self.links.workers[leg].tick_size,
                )
            });
            let urgency = if price.is_some() { Urgency::Passive } else { Urgency::Chase };
            self.drive(leg, target, urgency, price);
        }
    }

    fn start_phase(&mut self) {
        self.phase_started = Some(Instant::now());
        self.escalated = false;
        self.unhedged_since = None;
    }

    fn on_fill(&mut self, fill: LegFill) {
        let Some(leg) = self.session.legs.get_mut(fill.leg) else {
            return;
        };
        leg.apply_fill(&fill);
        if fill.order_done {
            leg.working = None;
        }
        self.last_price = fill.price;
        self.fills.push(fill);
        self.links.expected.send_replace(self.session.positions());

        if self.unwind.is_none() && self.session.state.is_transitional() {
            self.rebalance();
            self.check_progress();
        }
    }

    /// Re-drive lagging legs when exposure leaves epsilon.
    fn rebalance(&mut self) {
        let exposure = self.exposure();
        if exposure.abs() <= self.config.exposure_epsilon {
            self.unhedged_since = None;
            return;
        }
        if self.unhedged_since.is_none() {
            self.unhedged_since = Some(Instant::now());
        }

        let entering = self.session.state == SessionState::Entering;
        let positions = self.session.positions();
        let targets: Vec<Decimal> = self.session.legs.iter().map(|l| l.target).collect();
        let goals = compensation_goals(entering, &positions, &targets, &self.lots());

        debug!(session = %self.session.id, %exposure, ?goals, "Compensating");
        for (leg, goal) in goals {
            if goal == positions[leg] {
                continue;
            }
            self.drive(leg, goal, Urgency::Chase, None);
        }
    }

    fn legs_complete(&self) -> bool {
        (0..self.session.legs.len()).all(|i| {
            let leg = &self.session.legs[i];
            (self.phase_goal(i) - leg.position).abs() < self.lot(i)
        })
    }

    fn check_progress(&mut self) {
        if self.unwind.is_some() || !self.session.state.is_transitional() || !self.legs_complete() {
            return;
        }
        if self.exposure().abs() > self.config.exposure_epsilon {
            return;
        }

        for i in 0..self.session.legs.len() {
            if self.session.legs[i].working.is_some() {
                self.send(i, LegCommand::Cancel);
            }
        }

        match self.session.state {
            SessionState::Entering => {
                self.entry_notional = self
                    .session
                    .legs
                    .iter()
                    .filter(|l| l.target < Decimal::ZERO)
                    .map(|l| l.sold_notional)
                    .sum();
                self.held_since = Some(Instant::now());
                self.unhedged_since = None;
                info!(
                    session = %self.session.id,
                    notional = %self.entry_notional,
                    positions = ?self.session.positions(),
                    "✅ Hedge complete, holding"
                );
                self.transition(SessionState::Holding);
            }
            SessionState::Exiting => {
                self.session.realized_pnl = self.session.legs.iter().map(|l| l.cash_flow()).sum();
                info!(
                    session = %self.session.id,
                    pnl = %self.session.realized_pnl,
                    "💰 Session closed"
                );
                self.cause.get_or_insert(TerminationCause::Completed);
                self.transition(SessionState::Closed);
            }
            _ => {}
        }
    }

    fn on_tick(&mut self) {
        if let Some(unwind) = &self.unwind {
            let expired = match &unwind.stage {
                UnwindStage::Canceling { deadline, pending } if Instant::now() >= *deadline => {
                    warn!(session = %self.session.id, ?pending, "Cancel acknowledgements timed out");
                    true
                }
                _ => false,
            };
            if expired {
                self.start_flatten();
            }
            return;
        }

        match self.session.state {
            SessionState::Entering | SessionState::Exiting => self.supervise_phase(),
            SessionState::Holding => self.evaluate_hold(),
            _ => {}
        }
    }

    fn supervise_phase(&mut self) {
        if let Some(since) = self.unhedged_since {
            if since.elapsed() >= self.config.hedge_grace() {
                let exposure = self.exposure();
                self.alert(
                    AlertSeverity::Critical,
                    AlertKind::HedgeTimeout {
                        net_exposure: exposure,
                    },
                    format!("Exposure {} unhedged for {:?}", exposure, since.elapsed()),
                );
                self.begin_unwind(TerminationCause::HedgeTimeout);
                return;
            }
        }

        let timed_out = self
            .phase_started
            .map(|at| at.elapsed() >= self.config.maker_timeout())
            .unwrap_or(false);
        if self.escalated || !timed_out {
            return;
        }

        self.escalated = true;
        info!(session = %self.session.id, state = %self.session.state, "⏱️ Maker timeout, chasing");
        for i in 0..self.session.legs.len() {
            let goal = self.phase_goal(i);
            if (goal - self.session.legs[i].position).abs() >= self.lot(i) {
                self.drive(i, goal, Urgency::Chase, None);
            }
        }
    }

    /// Unrealized PnL if every leg were closed at its touch.
    fn mark_to_market(&self, snapshot: &MarketSnapshot) -> Decimal {
        self.session
            .legs
            .iter()
            .map(|leg| {
                let close = snapshot
                    .book(leg.index)
                    .map(|book| {
                        if leg.position > Decimal::ZERO {
                            book.bid
                        } else {
                            book.ask
                        }
                    })
                    .unwrap_or(self.last_price);
                leg.cash_flow() + leg.position * close
            })
            .sum()
    }

    fn evaluate_hold(&mut self) {
        let Some(direction) = self.direction else {
            return;
        };

        let max_hold = self.session.params.max_hold.or(self.config.max_hold());
        if let (Some(limit), Some(since)) = (max_hold, self.held_since) {
            if since.elapsed() >= limit {
                info!(session = %self.session.id, ?limit, "⏰ Max hold reached");
                self.begin_exit();
                return;
            }
        }

        let Some(snapshot) = self.links.latest.borrow().clone() else {
            return;
        };

        let pnl = self.mark_to_market(&snapshot);
        let threshold = self.session.params.stop_loss * self.entry_notional;
        if pnl <= -threshold {
            self.alert(
                AlertSeverity::Error,
                AlertKind::StopLoss { pnl, threshold },
                format!("Unrealized PnL {} breached stop loss {}", pnl, threshold),
            );
            self.begin_exit();
            return;
        }

        let exit_at = self
            .session
            .params
            .exit_spread
            .unwrap_or(self.entry_spread * self.config.exit_spread_ratio);
        if let Some(spread) = snapshot.spread(direction) {
            if spread.normalized <= exit_at {
                info!(
                    session = %self.session.id,
                    spread = %spread.normalized,
                    exit_at = %exit_at,
                    %pnl,
                    "📉 Spread converged, exiting"
                );
                self.begin_exit();
            }
        }
    }

    fn begin_exit(&mut self) {
        if !self.transition(SessionState::Exiting) {
            return;
        }
        self.start_phase();

        let snapshot = self.links.latest.borrow().clone();
        for i in 0..self.session.legs.len() {
            let position = self.session.legs[i].position;
            let Some(side) = Side::for_delta(-position) else {
                continue;
            };
            let price = snapshot.as_ref().and_then(|s| s.book(i)).map(|book| {
                maker_price(
                    book,
                    side,
                    self.config.maker_offset_ratio,
                    self.links.workers[i].tick_size,
                )
            });
            let urgency = if price.is_some() { Urgency::Passive } else { Urgency::Chase };
            self.drive(i, Decimal::ZERO, urgency, price);
        }
        self.check_progress();
    }

    fn on_stop(&mut self) {
        info!(session = %self.session.id, state = %self.session.state, "Stop requested");
        match self.session.state {
            SessionState::Idle => {
                self.cause.get_or_insert(TerminationCause::UserCancellation);
                self.transition(SessionState::Closed);
            }
            SessionState::EmergencyStop if self.halted => {
                self.cause.get_or_insert(TerminationCause::UserCancellation);
                self.transition(SessionState::Closed);
            }
            SessionState::Closed => {}
            _ => self.begin_unwind(TerminationCause::UserCancellation),
        }
    }

    fn on_drift(&mut self, report: DriftReport) {
        self.alert(
            AlertSeverity::Critical,
            AlertKind::PositionDrift {
                venue: report.venue,
                expected: report.expected,
                actual: report.actual,
                consecutive: report.consecutive,
            },
            format!(
                "{} leg {} holds {} but the session expects {}",
                report.venue, report.leg, report.actual, report.expected
            ),
        );
        if self.unwind.is_some() || self.halted || self.session.state == SessionState::Closed {
            return;
        }
        self.begin_unwind(TerminationCause::ConsistencyViolation);
    }

    /// Step one of an unwind: cancel everything and wait for acks.
    fn begin_unwind(&mut self, cause: TerminationCause) {
        if self.unwind.is_some() {
            return;
        }
        warn!(session = %self.session.id, %cause, state = %self.session.state, "🛑 Unwinding");
        self.cause.get_or_insert(cause);
        self.unhedged_since = None;

        let pending: BTreeSet<usize> = (0..self.session.legs.len()).collect();
        for leg in &pending {
            self.send(*leg, LegCommand::Cancel);
        }
        self.unwind = Some(Unwind {
            cause,
            stage: UnwindStage::Canceling {
                pending,
                deadline: Instant::now() + self.config.cancel_ack_timeout(),
            },
        });
    }

    /// Step two: enter `EmergencyStop` and flatten held legs.
    fn start_flatten(&mut self) {
        let Some(cause) = self.unwind.as_ref().map(|u| u.cause) else {
            return;
        };
        self.transition(SessionState::EmergencyStop);

        let severity = if cause == TerminationCause::UserCancellation {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Critical
        };
        self.alert(
            severity,
            AlertKind::EmergencyStop {
                cause: cause.to_string(),
            },
            format!("Session {} unwinding: {}", self.session.id, cause),
        );

        let pending: BTreeSet<usize> = self
            .session
            .legs
            .iter()
            .filter(|l| l.position != Decimal::ZERO)
            .map(|l| l.index)
            .collect();
        for leg in &pending {
            self.session.legs[*leg].state = LegState::Flattening;
            self.send(*leg, LegCommand::Flatten);
        }

        if pending.is_empty() {
            self.finish_unwind();
        } else {
            self.unwind = Some(Unwind {
                cause,
                stage: UnwindStage::Flattening { pending },
            });
        }
    }

    fn finish_unwind(&mut self) {
        let Some(unwind) = self.unwind.take() else {
            return;
        };
        self.session.realized_pnl = self.session.legs.iter().map(|l| l.cash_flow()).sum();

        let residual: Vec<(Venue, Decimal)> = self
            .session
            .legs
            .iter()
            .zip(&self.residuals)
            .filter(|(leg, r)| leg.position != Decimal::ZERO || **r != Decimal::ZERO)
            .map(|(leg, r)| (leg.venue, if *r != Decimal::ZERO { *r } else { leg.position }))
            .collect();
        for (venue, quantity) in &residual {
            self.alert(
                AlertSeverity::Critical,
                AlertKind::ResidualPosition {
                    venue: *venue,
                    quantity: *quantity,
                },
                format!("{} still holds {} after flatten", venue, quantity),
            );
        }

        if self.terminate_requested
            || (unwind.cause == TerminationCause::UserCancellation && residual.is_empty())
        {
            info!(session = %self.session.id, pnl = %self.session.realized_pnl, "Unwind complete");
            self.transition(SessionState::Closed);
        } else {
            self.halted = true;
            warn!(
                session = %self.session.id,
                cause = %unwind.cause,
                residual = residual.len(),
                "Session halted, waiting for resume or terminate"
            );
        }
    }

    fn on_resume(&mut self) {
        if !self.halted {
            debug!(session = %self.session.id, "Resume ignored, session not halted");
            return;
        }
        self.halted = false;
        info!(session = %self.session.id, "▶️ Resuming halted session");

        if self.session.legs.iter().all(|l| l.position == Decimal::ZERO) {
            self.transition(SessionState::Closed);
            return;
        }
        if !self.transition(SessionState::Exiting) {
            return;
        }
        self.start_phase();
        for i in 0..self.session.legs.len() {
            if self.session.legs[i].position != Decimal::ZERO {
                self.drive(i, Decimal::ZERO, Urgency::Chase, None);
            }
        }
    }

    fn on_terminate(&mut self) {
        if self.unwind.is_some() {
            self.terminate_requested = true;
            return;
        }
        match self.session.state {
            SessionState::Idle | SessionState::EmergencyStop => {
                self.cause.get_or_insert(TerminationCause::Operator);
                let residual: Vec<Decimal> = self.session.positions();
                if residual.iter().any(|p| *p != Decimal::ZERO) {
                    warn!(session = %self.session.id, ?residual, "Terminated with residual positions");
                }
                self.transition(SessionState::Closed);
            }
            state => warn!(session = %self.session.id, %state, "Terminate only applies to halted sessions"),
        }
    }
}
