//! Error taxonomy for the execution engine.
//!
//! Two layers:
//! - [`ExchangeError`]: what a venue adapter reports for a single remote call.
//! - [`ArbError`]: what a session or the operator surface reports.
//!
//! Adapter errors are classified as transient or terminal so the retry
//! wrapper can decide whether a call may be attempted again.

use crate::exchange::Venue;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure of a single venue call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Connection failure, timeout or venue-side 5xx.
    #[error("network error: {0}")]
    Network(String),
    /// Venue throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Venue refused the order (insufficient margin, bad price, ...).
    #[error("order rejected: {0}")]
    RejectedOrder(String),
    /// Credentials missing, invalid or lacking permission.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Instrument not listed on the venue.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    /// Order id or client order id not known to the venue.
    #[error("order not found: {0}")]
    OrderNotFound(String),
}

/// Whether a failed call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

impl ExchangeError {
    /// Classify the error for the retry wrapper.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExchangeError::Network(_) | ExchangeError::RateLimited(_) => ErrorClass::Transient,
            ExchangeError::RejectedOrder(_)
            | ExchangeError::Auth(_)
            | ExchangeError::UnknownSymbol(_)
            | ExchangeError::OrderNotFound(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Network(err.to_string())
    }
}

/// Session and operator level errors.
#[derive(Debug, Error)]
pub enum ArbError {
    /// Invalid configuration, parameters or credentials. Fatal at session creation.
    #[error("configuration error: {0}")]
    Config(String),
    /// A remote call kept failing after all retries.
    #[error("connectivity error on {venue} during {operation}: {source}")]
    Connectivity {
        venue: Venue,
        operation: String,
        #[source]
        source: ExchangeError,
    },
    /// A venue refused an order or request in a way retrying cannot fix.
    #[error("{venue} rejected request: {reason}")]
    ExchangeRejection { venue: Venue, reason: String },
    /// Venue positions disagree with the session's own ledger.
    #[error(
        "position drift on {venue}: expected {expected}, actual {actual} ({consecutive} consecutive audits)"
    )]
    ConsistencyViolation {
        venue: Venue,
        expected: Decimal,
        actual: Decimal,
        consecutive: u32,
    },
    /// The operator asked the session to stop.
    #[error("session stopped by operator")]
    UserCancellation,
    /// Another session already holds one of the requested (venue, account, symbol) tuples.
    #[error("resource busy: {0}")]
    Registry(String),
}

impl ArbError {
    /// Whether this error came from bad input rather than runtime conditions.
    pub fn is_config(&self) -> bool {
        matches!(self, ArbError::Config(_) | ArbError::Registry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(ExchangeError::Network("timeout".into()).class(), ErrorClass::Transient);
        assert_eq!(ExchangeError::RateLimited("429".into()).class(), ErrorClass::Transient);
        assert_eq!(ExchangeError::RejectedOrder("margin".into()).class(), ErrorClass::Terminal);
        assert_eq!(ExchangeError::Auth("bad key".into()).class(), ErrorClass::Terminal);
        assert_eq!(ExchangeError::UnknownSymbol("FOO".into()).class(), ErrorClass::Terminal);
        assert_eq!(ExchangeError::OrderNotFound("42".into()).class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_arb_error_display() {
        let err = ArbError::ConsistencyViolation {
            venue: Venue::Okx,
            expected: rust_decimal_macros::dec!(0.01),
            actual: rust_decimal_macros::dec!(0.015),
            consecutive: 2,
        };
        assert!(err.to_string().contains("expected 0.01"));
        assert!(ArbError::Config("x".into()).is_config());
        assert!(!ArbError::UserCancellation.is_config());
    }
}
