//! Operator alerts.
//!
//! Alerts are emitted as single-line JSON on the `operator_alert` log target
//! so they can be grepped or shipped separately from the regular log stream.

use crate::exchange::Venue;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the alert is about.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// A session entered `EmergencyStop`
    EmergencyStop { cause: String },
    /// A leg could not be reached after all retries
    VenueUnavailable { venue: Venue, operation: String },
    /// A venue refused an order or request
    OrderRejected { venue: Venue, reason: String },
    /// Exposure stayed unhedged past the grace window
    HedgeTimeout { net_exposure: Decimal },
    /// Venue position disagrees with the session ledger
    PositionDrift {
        venue: Venue,
        expected: Decimal,
        actual: Decimal,
        consecutive: u32,
    },
    /// Unrealized loss crossed the stop-loss threshold
    StopLoss { pnl: Decimal, threshold: Decimal },
    /// A leg still holds a position the engine could not flatten
    ResidualPosition { venue: Venue, quantity: Decimal },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A structured alert for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub message: String,
}

impl OperatorAlert {
    pub fn new(
        session_id: impl Into<String>,
        severity: AlertSeverity,
        kind: AlertKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: format!("alert-{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            severity,
            kind,
            message: message.into(),
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "operator_alert", "OPERATOR_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "operator_alert", "OPERATOR_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "operator_alert", "OPERATOR_ALERT: {}", json)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alert_serializes_kind_tag() {
        let alert = OperatorAlert::new(
            "s1",
            AlertSeverity::Critical,
            AlertKind::PositionDrift {
                venue: Venue::Okx,
                expected: dec!(0.01),
                actual: dec!(0.015),
                consecutive: 2,
            },
            "drift",
        );
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"type\":\"PositionDrift\""));
        assert!(json.contains("\"venue\":\"okx\""));
        assert!(alert.alert_id.starts_with("alert-"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
        assert_eq!(AlertSeverity::Error.as_str(), "ERROR");
    }
}
