//! Registry of running sessions.
//!
//! Holds the (venue, account, symbol) locks that keep two sessions from
//! trading the same position, plus what the reconciliation auditor needs to
//! reach each active session.

use crate::error::ArbError;
use crate::exchange::{ExchangeAdapter, Symbol, Venue};
use crate::strategy::events::SessionEvent;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// One lockable position slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub venue: Venue,
    pub account_id: String,
    pub symbol: Symbol,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.venue, self.account_id, self.symbol)
    }
}

/// A leg as the auditor sees it.
#[derive(Clone)]
pub struct RegisteredLeg {
    pub index: usize,
    pub venue: Venue,
    pub account_id: String,
    pub adapter: Arc<dyn ExchangeAdapter>,
    /// Venue position when the session started
    pub baseline: Decimal,
}

/// An active session.
#[derive(Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub symbol: Symbol,
    pub legs: Vec<RegisteredLeg>,
    /// Coordinator's session-relative positions per leg
    pub expected: watch::Receiver<Vec<Decimal>>,
    pub inbox: mpsc::Sender<SessionEvent>,
}

#[derive(Default)]
struct RegistryInner {
    locks: HashMap<LockKey, String>,
    sessions: HashMap<String, SessionEntry>,
}

/// Shared session store. The lock is never held across an await.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every key for `session_id`, or none of them.
    pub fn acquire(
        self: &Arc<Self>,
        session_id: &str,
        keys: Vec<LockKey>,
    ) -> Result<SessionLease, ArbError> {
        let mut inner = self.lock();
        if let Some((key, owner)) = keys
            .iter()
            .find_map(|k| inner.locks.get(k).map(|owner| (k, owner)))
        {
            return Err(ArbError::Registry(format!("{} is held by session {}", key, owner)));
        }

        for key in &keys {
            inner.locks.insert(key.clone(), session_id.to_string());
        }
        debug!(session = session_id, keys = keys.len(), "Locks acquired");

        Ok(SessionLease {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            keys,
        })
    }

    pub fn register(&self, entry: SessionEntry) {
        info!(session = %entry.session_id, symbol = %entry.symbol, "Session registered");
        self.lock().sessions.insert(entry.session_id.clone(), entry);
    }

    /// Snapshot of active sessions.
    pub fn active(&self) -> Vec<SessionEntry> {
        let mut sessions: Vec<SessionEntry> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.lock().locks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, session_id: &str, keys: &[LockKey]) {
        let mut inner = self.lock();
        for key in keys {
            if inner.locks.get(key).map(String::as_str) == Some(session_id) {
                inner.locks.remove(key);
            }
        }
        inner.sessions.remove(session_id);
        debug!(session = session_id, "Session released");
    }
}

/// Locks held by one session; released on drop.
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
    keys: Vec<LockKey>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.session_id, &self.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(venue: Venue, account: &str) -> LockKey {
        LockKey {
            venue,
            account_id: account.to_string(),
            symbol: Symbol::new("BTC", "USDT"),
        }
    }

    #[test]
    fn test_conflicting_session_is_refused() {
        let registry = Arc::new(SessionRegistry::new());
        let _lease = registry
            .acquire("s1", vec![key(Venue::Aster, "a1"), key(Venue::Okx, "o1")])
            .unwrap();

        let err = registry
            .acquire("s2", vec![key(Venue::Okx, "o1"), key(Venue::Backpack, "b1")])
            .err()
            .unwrap();
        assert!(matches!(err, ArbError::Registry(_)));
        // Nothing from the refused request was taken
        assert!(!registry.is_locked(&key(Venue::Backpack, "b1")));

        // Same venue, different account is a different slot
        assert!(registry.acquire("s3", vec![key(Venue::Okx, "o2")]).is_ok());
    }

    #[test]
    fn test_drop_releases_locks() {
        let registry = Arc::new(SessionRegistry::new());
        let lease = registry.acquire("s1", vec![key(Venue::Aster, "a1")]).unwrap();
        assert!(registry.is_locked(&key(Venue::Aster, "a1")));
        assert_eq!(lease.session_id(), "s1");

        drop(lease);
        assert!(!registry.is_locked(&key(Venue::Aster, "a1")));
        assert!(registry.acquire("s2", vec![key(Venue::Aster, "a1")]).is_ok());
    }

    #[test]
    fn test_registered_session_is_listed_until_released() {
        let registry = Arc::new(SessionRegistry::new());
        let lease = registry.acquire("s1", vec![key(Venue::Aster, "a1")]).unwrap();
        let (_expected_tx, expected_rx) = watch::channel(Vec::new());
        let (inbox_tx, _inbox_rx) = mpsc::channel(4);

        registry.register(SessionEntry {
            session_id: "s1".into(),
            symbol: Symbol::new("BTC", "USDT"),
            legs: Vec::new(),
            expected: expected_rx,
            inbox: inbox_tx,
        });
        assert_eq!(registry.active().len(), 1);

        drop(lease);
        assert!(registry.is_empty());
    }
}
