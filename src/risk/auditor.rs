//! Reconciliation auditor.
//!
//! Periodically compares every active session's ledger against what the
//! venues report. Sustained drift is escalated to the session as an
//! [`SessionEvent::AuditViolation`], which forces an emergency unwind.

use crate::config::AuditConfig;
use crate::error::ArbError;
use crate::exchange::net_position;
use crate::resilience::{Idempotency, ResilientCaller};
use crate::strategy::{DriftReport, RegisteredLeg, SessionEntry, SessionEvent, SessionRegistry};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Checks venue positions against session ledgers.
pub struct ReconciliationAuditor {
    registry: Arc<SessionRegistry>,
    caller: ResilientCaller,
    config: AuditConfig,
    /// Consecutive breaches per (session, leg)
    breaches: HashMap<(String, usize), u32>,
}

impl ReconciliationAuditor {
    pub fn new(registry: Arc<SessionRegistry>, caller: ResilientCaller, config: AuditConfig) -> Self {
        Self {
            registry,
            caller,
            config,
            breaches: HashMap::new(),
        }
    }

    /// Current breach streak of one leg.
    pub fn streak(&self, session_id: &str, leg: usize) -> u32 {
        self.breaches
            .get(&(session_id.to_string(), leg))
            .copied()
            .unwrap_or(0)
    }

    /// Audit every active session once.
    ///
    /// Returns the violations raised by this pass. A violation is raised
    /// once, on the audit where the streak reaches the configured count.
    pub async fn audit_once(&mut self) -> Vec<ArbError> {
        let sessions = self.registry.active();
        self.breaches
            .retain(|(id, _), _| sessions.iter().any(|s| &s.session_id == id));

        let mut violations = Vec::new();
        for session in &sessions {
            let expected = session.expected.borrow().clone();
            for leg in &session.legs {
                let want = expected.get(leg.index).copied().unwrap_or_default();
                if let Some(report) = self.audit_leg(session, leg, want).await {
                    violations.push(ArbError::ConsistencyViolation {
                        venue: report.venue,
                        expected: report.expected,
                        actual: report.actual,
                        consecutive: report.consecutive,
                    });
                    if session
                        .inbox
                        .send(SessionEvent::AuditViolation(report))
                        .await
                        .is_err()
                    {
                        debug!(session = %session.session_id, "Session finished before drift was delivered");
                    }
                }
                self.log_balance(leg).await;
            }
        }
        violations
    }

    async fn audit_leg(
        &mut self,
        session: &SessionEntry,
        leg: &RegisteredLeg,
        expected: Decimal,
    ) -> Option<DriftReport> {
        let adapter = leg.adapter.clone();
        let positions = match self
            .caller
            .call("get_positions", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_positions().await }
            })
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                warn!(session = %session.session_id, venue = %leg.venue, error = %e, "Position audit skipped");
                return None;
            }
        };

        let actual = net_position(&positions, &session.symbol) - leg.baseline;
        let key = (session.session_id.clone(), leg.index);
        let discrepancy = (actual - expected).abs();

        if discrepancy <= self.config.position_epsilon {
            if self.breaches.remove(&key).is_some() {
                info!(session = %session.session_id, venue = %leg.venue, "Position drift cleared");
            }
            debug!(
                session = %session.session_id,
                venue = %leg.venue,
                %expected,
                %actual,
                "Position reconciled"
            );
            return None;
        }

        let streak = self.breaches.entry(key).or_insert(0);
        *streak += 1;
        let consecutive = *streak;

        if consecutive == self.config.consecutive_breaches {
            error!(
                session = %session.session_id,
                venue = %leg.venue,
                %expected,
                %actual,
                consecutive,
                "🚨 Sustained position drift"
            );
            Some(DriftReport {
                leg: leg.index,
                venue: leg.venue,
                expected,
                actual,
                consecutive,
            })
        } else {
            warn!(
                session = %session.session_id,
                venue = %leg.venue,
                %expected,
                %actual,
                consecutive,
                "Position drift observed"
            );
            None
        }
    }

    async fn log_balance(&self, leg: &RegisteredLeg) {
        let adapter = leg.adapter.clone();
        match self
            .caller
            .call("get_balance", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_balance().await }
            })
            .await
        {
            Ok(balance) => info!(
                venue = %leg.venue,
                account = %leg.account_id,
                asset = %balance.asset,
                free = %balance.free,
                used = %balance.used,
                total = %balance.total,
                "💵 Balance"
            ),
            Err(e) => debug!(venue = %leg.venue, error = %e, "Balance unavailable"),
        }
    }

    /// Audit on a fixed interval until cancelled.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.config.interval(), "🔍 Reconciliation auditor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let violations = self.audit_once().await;
                    if !violations.is_empty() {
                        warn!(count = violations.len(), "Audit raised violations");
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Reconciliation auditor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, Symbol, Venue};
    use crate::resilience::RetryPolicy;
    use crate::strategy::LockKey;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        paper: Arc<PaperExchange>,
        expected: watch::Sender<Vec<Decimal>>,
        inbox: mpsc::Receiver<SessionEvent>,
        _lease: crate::strategy::SessionLease,
    }

    async fn fixture(baseline: Decimal) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let paper = Arc::new(PaperExchange::new(Venue::Okx, dec!(10000)));
        let lease = registry
            .acquire(
                "s1",
                vec![LockKey {
                    venue: Venue::Okx,
                    account_id: "o1".into(),
                    symbol: btc(),
                }],
            )
            .unwrap();
        let (expected_tx, expected_rx) = watch::channel(vec![dec!(0.01)]);
        let (inbox_tx, inbox_rx) = mpsc::channel(8);
        registry.register(SessionEntry {
            session_id: "s1".into(),
            symbol: btc(),
            legs: vec![RegisteredLeg {
                index: 0,
                venue: Venue::Okx,
                account_id: "o1".into(),
                adapter: paper.clone(),
                baseline,
            }],
            expected: expected_rx,
            inbox: inbox_tx,
        });
        Fixture {
            registry,
            paper,
            expected: expected_tx,
            inbox: inbox_rx,
            _lease: lease,
        }
    }

    fn auditor(registry: Arc<SessionRegistry>) -> ReconciliationAuditor {
        ReconciliationAuditor::new(
            registry,
            ResilientCaller::with_system_clock(RetryPolicy::none()),
            AuditConfig {
                interval_ms: 10,
                position_epsilon: dec!(0.0001),
                consecutive_breaches: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_drift_raised_after_two_consecutive_audits() {
        let mut f = fixture(Decimal::ZERO).await;
        f.paper.set_position(&btc(), dec!(0.015), dec!(50000)).await;
        let mut auditor = auditor(f.registry.clone());

        assert!(auditor.audit_once().await.is_empty());
        assert_eq!(auditor.streak("s1", 0), 1);
        assert!(f.inbox.try_recv().is_err());

        let violations = auditor.audit_once().await;
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            ArbError::ConsistencyViolation { consecutive: 2, .. }
        ));
        match f.inbox.try_recv().unwrap() {
            SessionEvent::AuditViolation(report) => {
                assert_eq!(report.expected, dec!(0.01));
                assert_eq!(report.actual, dec!(0.015));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Raised once per streak
        assert!(auditor.audit_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_baseline_is_subtracted() {
        let f = fixture(dec!(0.2)).await;
        f.paper.set_position(&btc(), dec!(0.21), dec!(50000)).await;
        let mut auditor = auditor(f.registry.clone());

        assert!(auditor.audit_once().await.is_empty());
        assert_eq!(auditor.streak("s1", 0), 0);
    }

    #[tokio::test]
    async fn test_single_breach_resets_when_positions_agree() {
        let f = fixture(Decimal::ZERO).await;
        f.paper.set_position(&btc(), dec!(0.015), dec!(50000)).await;
        let mut auditor = auditor(f.registry.clone());

        auditor.audit_once().await;
        assert_eq!(auditor.streak("s1", 0), 1);

        f.expected.send_replace(vec![dec!(0.015)]);
        auditor.audit_once().await;
        assert_eq!(auditor.streak("s1", 0), 0);
    }
}
