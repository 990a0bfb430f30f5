//! Operator alerts and position reconciliation.
//!
//! - `alert`: structured operator alerts on their own log target
//! - `auditor`: periodic venue-vs-ledger position checks

mod alert;
mod auditor;

pub use alert::{AlertKind, AlertSeverity, OperatorAlert};
pub use auditor::ReconciliationAuditor;
