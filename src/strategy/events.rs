//! Messages flowing into a session's coordinator inbox.
//!
//! Every producer (leg workers, spread monitor, auditor, the session handle)
//! writes into one ordered `mpsc` channel, so the coordinator sees a single
//! serialized event stream per session.

use crate::exchange::{OrderHandle, Side, Venue};
use crate::strategy::monitor::Opportunity;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A fill observed on one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegFill {
    pub leg: usize,
    pub venue: Venue,
    pub client_order_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Leg position after this fill (session-relative)
    pub position_after: Decimal,
    /// The order reached a terminal state with this fill
    pub order_done: bool,
    pub timestamp: DateTime<Utc>,
}

/// Position drift reported by the reconciliation auditor.
#[derive(Debug, Clone)]
pub struct DriftReport {
    pub leg: usize,
    pub venue: Venue,
    pub expected: Decimal,
    pub actual: Decimal,
    pub consecutive: u32,
}

/// Coordinator inbox message.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opportunity(Opportunity),
    OrderPlaced { leg: usize, handle: OrderHandle },
    Fill(LegFill),
    /// Terminal refusal from the venue; the leg dropped its drive
    LegRejected { leg: usize, reason: String },
    /// Retries exhausted; the leg keeps its drive and tries again next tick
    LegUnavailable { leg: usize, operation: String, error: String },
    /// The leg reached its goal and has nothing working
    LegIdle { leg: usize, position: Decimal },
    /// Working order cancelled (or there was none)
    LegCanceled { leg: usize },
    /// Flatten finished; `residual` is what could not be closed
    LegFlattened { leg: usize, residual: Decimal },
    AuditViolation(DriftReport),
    /// Operator resumes a halted session
    Resume,
    /// Operator closes a halted session as-is
    Terminate,
}
