//! Session data model.
//!
//! An [`ArbitrageSession`] is one hedged round trip on 2-3 legs: enter on a
//! spread, hold, exit. Only the hedge coordinator mutates it.

use crate::exchange::{Symbol, Venue};
use crate::risk::OperatorAlert;
use crate::strategy::events::LegFill;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Entering,
    Holding,
    Exiting,
    EmergencyStop,
    Closed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Entering)
                | (Idle, EmergencyStop)
                | (Idle, Closed)
                | (Entering, Holding)
                | (Entering, EmergencyStop)
                | (Holding, Exiting)
                | (Holding, EmergencyStop)
                | (Exiting, Closed)
                | (Exiting, EmergencyStop)
                | (EmergencyStop, Exiting)
                | (EmergencyStop, Closed)
        )
    }

    /// Phases in which legs are actively trading toward a goal.
    pub fn is_transitional(self) -> bool {
        matches!(self, SessionState::Entering | SessionState::Exiting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Entering => "Entering",
            SessionState::Holding => "Holding",
            SessionState::Exiting => "Exiting",
            SessionState::EmergencyStop => "EmergencyStop",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended (or halted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationCause {
    /// Entered, held and exited normally
    Completed,
    /// Operator stop (Ctrl-C or `stop()`)
    UserCancellation,
    /// A venue refused an order
    ExchangeRejection,
    /// Exposure stayed outside epsilon past the grace window
    HedgeTimeout,
    /// Auditor found sustained position drift
    ConsistencyViolation,
    /// Operator terminated a halted session
    Operator,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-leg state as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegState {
    Idle,
    Working,
    Filled,
    Flattening,
    Flat,
    Failed,
}

/// Operator request for a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub symbol: Symbol,
    /// Base quantity of the sell leg
    pub quantity: Decimal,
    pub leverage: u32,
    /// Minimum normalized spread to enter
    pub min_spread: Decimal,
    /// Loss fraction of entry notional that forces an exit
    pub stop_loss: Decimal,
    /// Normalized spread at or below which a held position exits
    pub exit_spread: Option<Decimal>,
    pub max_hold: Option<Duration>,
    pub dry_run: bool,
}

/// One venue leg of a session.
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub index: usize,
    pub venue: Venue,
    pub account_id: String,
    /// Order the leg worker is currently working, if known
    pub working: Option<String>,
    /// Signed filled quantity since session start
    pub position: Decimal,
    /// Goal of the current drive
    pub goal: Decimal,
    /// Hedged entry target
    pub target: Decimal,
    pub bought_qty: Decimal,
    pub bought_notional: Decimal,
    pub sold_qty: Decimal,
    pub sold_notional: Decimal,
    pub state: LegState,
}

impl Leg {
    pub fn new(index: usize, venue: Venue, account_id: impl Into<String>) -> Self {
        Self {
            index,
            venue,
            account_id: account_id.into(),
            working: None,
            position: Decimal::ZERO,
            goal: Decimal::ZERO,
            target: Decimal::ZERO,
            bought_qty: Decimal::ZERO,
            bought_notional: Decimal::ZERO,
            sold_qty: Decimal::ZERO,
            sold_notional: Decimal::ZERO,
            state: LegState::Idle,
        }
    }

    /// Fold a fill into the ledger.
    pub fn apply_fill(&mut self, fill: &LegFill) {
        let notional = fill.quantity * fill.price;
        match fill.side {
            crate::exchange::Side::Buy => {
                self.bought_qty += fill.quantity;
                self.bought_notional += notional;
                self.position += fill.quantity;
            }
            crate::exchange::Side::Sell => {
                self.sold_qty += fill.quantity;
                self.sold_notional += notional;
                self.position -= fill.quantity;
            }
        }
    }

    /// Volume-weighted price of the fills that opened the current position.
    pub fn vwap(&self) -> Decimal {
        if self.position > Decimal::ZERO && self.bought_qty > Decimal::ZERO {
            self.bought_notional / self.bought_qty
        } else if self.position < Decimal::ZERO && self.sold_qty > Decimal::ZERO {
            self.sold_notional / self.sold_qty
        } else {
            Decimal::ZERO
        }
    }

    /// Cash flow of all fills: positive when more was sold than bought.
    pub fn cash_flow(&self) -> Decimal {
        self.sold_notional - self.bought_notional
    }

    pub fn summary(&self) -> LegSummary {
        LegSummary {
            index: self.index,
            venue: self.venue,
            account_id: self.account_id.clone(),
            position: self.position,
            target: self.target,
            bought_qty: self.bought_qty,
            sold_qty: self.sold_qty,
            bought_notional: self.bought_notional,
            sold_notional: self.sold_notional,
        }
    }
}

/// The session aggregate owned by the coordinator.
#[derive(Debug, Clone)]
pub struct ArbitrageSession {
    pub id: String,
    pub params: SessionParams,
    pub legs: Vec<Leg>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
}

impl ArbitrageSession {
    pub fn new(id: impl Into<String>, params: SessionParams, legs: Vec<Leg>) -> Self {
        Self {
            id: id.into(),
            params,
            legs,
            state: SessionState::Idle,
            created_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn positions(&self) -> Vec<Decimal> {
        self.legs.iter().map(|l| l.position).collect()
    }

    /// Net signed base quantity across legs.
    pub fn net_quantity(&self) -> Decimal {
        self.legs.iter().map(|l| l.position).sum()
    }
}

/// Recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

/// Final per-leg figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegSummary {
    pub index: usize,
    pub venue: Venue,
    pub account_id: String,
    pub position: Decimal,
    pub target: Decimal,
    pub bought_qty: Decimal,
    pub sold_qty: Decimal,
    pub bought_notional: Decimal,
    pub sold_notional: Decimal,
}

/// What a finished session reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub symbol: Symbol,
    pub dry_run: bool,
    pub final_state: SessionState,
    pub cause: Option<TerminationCause>,
    pub realized_pnl: Decimal,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub legs: Vec<LegSummary>,
    pub fills: Vec<LegFill>,
    pub alerts: Vec<OperatorAlert>,
    pub transitions: Vec<StateTransition>,
}

impl SessionSummary {
    pub fn duration_secs(&self) -> i64 {
        (self.ended_at - self.started_at).num_seconds()
    }

    /// Legs still holding a position.
    pub fn residual(&self) -> Vec<&LegSummary> {
        self.legs
            .iter()
            .filter(|l| l.position != Decimal::ZERO)
            .collect()
    }

    /// Whether the session entered `state` at any point.
    pub fn visited(&self, state: SessionState) -> bool {
        self.transitions.iter().any(|t| t.to == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Entering));
        assert!(Entering.can_transition_to(EmergencyStop));
        assert!(EmergencyStop.can_transition_to(Exiting));
        assert!(!Holding.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Entering.can_transition_to(Exiting));
    }

    #[test]
    fn test_leg_ledger() {
        let mut leg = Leg::new(0, Venue::Aster, "a");
        let fill = |side, quantity, price| LegFill {
            leg: 0,
            venue: Venue::Aster,
            client_order_id: "x".into(),
            side,
            quantity,
            price,
            position_after: Decimal::ZERO,
            order_done: true,
            timestamp: Utc::now(),
        };

        leg.apply_fill(&fill(Side::Sell, dec!(0.01), dec!(50011.4)));
        assert_eq!(leg.position, dec!(-0.01));
        assert_eq!(leg.vwap(), dec!(50011.4));

        leg.apply_fill(&fill(Side::Buy, dec!(0.01), dec!(50000.3)));
        assert_eq!(leg.position, Decimal::ZERO);
        assert_eq!(leg.cash_flow(), dec!(0.111));
    }
}
