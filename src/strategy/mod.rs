//! Hedged spread arbitrage.
//!
//! - `monitor`: cross-venue spread evaluation and opportunity detection
//! - `hedge`: target allocation, compensation and order pricing
//! - `leg` / `worker`: per-leg order management and its task
//! - `coordinator`: the session state machine
//! - `registry` / `runner`: session locks and lifecycle

mod coordinator;
mod events;
mod hedge;
mod leg;
mod monitor;
mod registry;
mod runner;
mod session;
mod worker;

pub use coordinator::{CoordinatorLinks, HedgeCoordinator, WorkerLink};
pub use events::{DriftReport, LegFill, SessionEvent};
pub use hedge::{allocate_targets, chase_price, compensation_goals, maker_price, net_exposure};
pub use leg::{LegError, LegOrderManager, OrderIntent, WorkingOrder};
pub use monitor::{
    best_direction, evaluate, DirectionalSpread, Direction, LegQuote, MarketSnapshot, MonitoredLeg,
    Opportunity, SpreadMonitor,
};
pub use registry::{LockKey, RegisteredLeg, SessionEntry, SessionLease, SessionRegistry};
pub use runner::{LegBinding, SessionHandle, SessionRunner, StopSignal};
pub use session::{
    ArbitrageSession, Leg, LegState, LegSummary, SessionParams, SessionState, SessionSummary,
    StateTransition, TerminationCause,
};
pub use worker::{LegCommand, LegWorker, Urgency};
