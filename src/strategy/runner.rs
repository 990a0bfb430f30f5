//! Session runner.
//!
//! Validates an operator request, takes the registry locks, prepares each
//! venue (leverage, balance, baseline position) and spawns the session's
//! tasks: one worker per leg, the spread monitor and the coordinator.

use crate::config::{Config, VenueConfig};
use crate::error::ArbError;
use crate::exchange::{net_position, ExchangeAdapter, Venue};
use crate::persistence::PersistenceManager;
use crate::resilience::{CallFailure, Idempotency, ResilientCaller, RetryPolicy};
use crate::strategy::coordinator::{CoordinatorLinks, HedgeCoordinator, WorkerLink};
use crate::strategy::events::SessionEvent;
use crate::strategy::leg::LegOrderManager;
use crate::strategy::monitor::{MonitoredLeg, SpreadMonitor};
use crate::strategy::registry::{LockKey, RegisteredLeg, SessionEntry, SessionRegistry};
use crate::strategy::session::{ArbitrageSession, Leg, SessionParams, SessionState, SessionSummary};
use crate::strategy::worker::LegWorker;
use crate::utils::decimal::round_down_to_lot;
use anyhow::Context;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// One venue account taking part in a session.
#[derive(Clone)]
pub struct LegBinding {
    pub account_id: String,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub venue_config: VenueConfig,
}

impl LegBinding {
    pub fn venue(&self) -> Venue {
        self.adapter.venue()
    }
}

fn venue_error(venue: Venue, failure: CallFailure) -> ArbError {
    if failure.is_rejection() {
        ArbError::Config(format!("{} refused {}: {}", venue, failure.operation, failure.source))
    } else {
        ArbError::Connectivity {
            venue,
            operation: failure.operation,
            source: failure.source,
        }
    }
}

/// Requests stop of a running session; cheap to clone.
#[derive(Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Control surface of a running session.
pub struct SessionHandle {
    id: String,
    state: watch::Receiver<SessionState>,
    expected: watch::Receiver<Vec<Decimal>>,
    control: mpsc::Sender<SessionEvent>,
    stop: StopSignal,
    join: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Positions the coordinator currently expects per leg.
    pub fn expected_positions(&self) -> Vec<Decimal> {
        self.expected.borrow().clone()
    }

    /// Cooperative stop: the session unwinds and closes once flat.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Resume a session halted in `EmergencyStop`.
    pub async fn resume(&self) -> anyhow::Result<()> {
        self.control
            .send(SessionEvent::Resume)
            .await
            .context("session already finished")
    }

    /// Close a halted session as it is.
    pub async fn terminate(&self) -> anyhow::Result<()> {
        self.control
            .send(SessionEvent::Terminate)
            .await
            .context("session already finished")
    }

    /// Wait until the session reaches `target`; `false` on timeout.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        // Bound first so the borrow guard is dropped before `state`
        let reached = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Wait for the session to finish.
    pub async fn join(self) -> anyhow::Result<SessionSummary> {
        self.join.await.context("session task failed")
    }
}

/// Builds and launches sessions.
pub struct SessionRunner {
    config: Config,
    registry: Arc<SessionRegistry>,
    caller: ResilientCaller,
    persistence: Option<Arc<Mutex<PersistenceManager>>>,
}

impl SessionRunner {
    pub fn new(config: &Config, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: config.clone(),
            registry,
            caller: ResilientCaller::with_system_clock(RetryPolicy::from(&config.retry)),
            persistence: None,
        }
    }

    pub fn with_caller(mut self, caller: ResilientCaller) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<Mutex<PersistenceManager>>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Reject requests no session could run.
    pub fn validate(&self, params: &SessionParams, legs: &[LegBinding]) -> Result<(), ArbError> {
        if !(2..=3).contains(&legs.len()) {
            return Err(ArbError::Config(format!(
                "a session needs 2 or 3 legs, got {}",
                legs.len()
            )));
        }
        let venues: HashSet<Venue> = legs.iter().map(LegBinding::venue).collect();
        if venues.len() != legs.len() {
            return Err(ArbError::Config("legs must be on distinct venues".into()));
        }
        if params.quantity <= Decimal::ZERO {
            return Err(ArbError::Config(format!("quantity must be positive, got {}", params.quantity)));
        }
        for leg in legs {
            let lot = leg.venue_config.lot_size;
            if round_down_to_lot(params.quantity, lot) != params.quantity {
                return Err(ArbError::Config(format!(
                    "quantity {} is not a multiple of the {} lot size {}",
                    params.quantity,
                    leg.venue(),
                    lot
                )));
            }
        }
        let max = self.config.execution.max_leverage;
        if params.leverage == 0 || params.leverage > max {
            return Err(ArbError::Config(format!(
                "leverage must be between 1 and {}, got {}",
                max, params.leverage
            )));
        }
        if params.stop_loss <= Decimal::ZERO {
            return Err(ArbError::Config("stop loss must be positive".into()));
        }
        if params.min_spread < Decimal::ZERO {
            return Err(ArbError::Config("minimum spread cannot be negative".into()));
        }
        Ok(())
    }

    /// Set leverage, check margin and record the starting position.
    async fn prepare_leg(&self, params: &SessionParams, leg: &LegBinding) -> Result<Decimal, ArbError> {
        let venue = leg.venue();
        let adapter = leg.adapter.clone();
        let symbol = params.symbol.clone();

        self.caller
            .call("set_leverage", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let symbol = symbol.clone();
                let leverage = params.leverage;
                async move { adapter.set_leverage(&symbol, leverage).await }
            })
            .await
            .map_err(|f| venue_error(venue, f))?;

        let book = self
            .caller
            .call("get_orderbook", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                let symbol = symbol.clone();
                async move { adapter.get_orderbook(&symbol).await }
            })
            .await
            .map_err(|f| venue_error(venue, f))?;

        let balance = self
            .caller
            .call("get_balance", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_balance().await }
            })
            .await
            .map_err(|f| venue_error(venue, f))?;

        let required = params.quantity * book.mid() / Decimal::from(params.leverage);
        if balance.free < required {
            return Err(ArbError::Config(format!(
                "{} account {} has {} free, session needs {}",
                venue, leg.account_id, balance.free, required
            )));
        }

        let positions = self
            .caller
            .call("get_positions", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_positions().await }
            })
            .await
            .map_err(|f| venue_error(venue, f))?;
        let baseline = net_position(&positions, &params.symbol);

        info!(
            %venue,
            account = %leg.account_id,
            leverage = params.leverage,
            free = %balance.free,
            required = %required,
            %baseline,
            "Leg ready"
        );
        Ok(baseline)
    }

    /// Start a session; returns once every task is running.
    pub async fn start(&self, params: SessionParams, legs: Vec<LegBinding>) -> Result<SessionHandle, ArbError> {
        self.validate(&params, &legs)?;

        let session_id = format!("sess-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let keys = legs
            .iter()
            .map(|leg| LockKey {
                venue: leg.venue(),
                account_id: leg.account_id.clone(),
                symbol: params.symbol.clone(),
            })
            .collect();
        let lease = self.registry.acquire(&session_id, keys)?;

        let mut baselines = Vec::with_capacity(legs.len());
        for leg in &legs {
            baselines.push(self.prepare_leg(&params, leg).await?);
        }

        let execution = self.config.execution.clone();
        let (inbox_tx, inbox_rx) = mpsc::channel(execution.inbox_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (expected_tx, expected_rx) = watch::channel(vec![Decimal::ZERO; legs.len()]);
        let (active_tx, active_rx) = watch::channel(None);
        let (latest_tx, latest_rx) = watch::channel(None);

        let mut workers = Vec::with_capacity(legs.len());
        let mut worker_tasks = Vec::with_capacity(legs.len());
        for (index, leg) in legs.iter().enumerate() {
            let manager = LegOrderManager::new(
                index,
                params.symbol.clone(),
                leg.adapter.clone(),
                self.caller.clone(),
                leg.venue_config.lot_size,
                leg.venue_config.tick_size,
                execution.poll_interval(),
            )
            .with_baseline(baselines[index]);
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let worker = LegWorker::new(manager, execution.clone(), inbox_tx.clone(), cancel_rx.clone());
            worker_tasks.push(worker.spawn(commands_rx));
            workers.push(WorkerLink {
                commands: commands_tx,
                lot_size: leg.venue_config.lot_size,
                tick_size: leg.venue_config.tick_size,
            });
        }

        let monitor = Arc::new(SpreadMonitor::new(
            params.symbol.clone(),
            legs.iter()
                .map(|leg| MonitoredLeg {
                    venue: leg.venue(),
                    adapter: leg.adapter.clone(),
                    taker_fee: leg.venue_config.taker_fee,
                })
                .collect(),
            self.caller.clone(),
            self.config.monitor.clone(),
        ));
        let monitor_task = tokio::spawn(monitor.run(
            params.min_spread,
            inbox_tx.clone(),
            latest_tx,
            active_rx,
            cancel_rx.clone(),
        ));

        self.registry.register(SessionEntry {
            session_id: session_id.clone(),
            symbol: params.symbol.clone(),
            legs: legs
                .iter()
                .zip(&baselines)
                .enumerate()
                .map(|(index, (leg, baseline))| RegisteredLeg {
                    index,
                    venue: leg.venue(),
                    account_id: leg.account_id.clone(),
                    adapter: leg.adapter.clone(),
                    baseline: *baseline,
                })
                .collect(),
            expected: expected_rx.clone(),
            inbox: inbox_tx.clone(),
        });

        let session_legs = legs
            .iter()
            .enumerate()
            .map(|(index, leg)| Leg::new(index, leg.venue(), leg.account_id.clone()))
            .collect();
        let session = ArbitrageSession::new(session_id.clone(), params, session_legs);
        let coordinator = HedgeCoordinator::new(
            session,
            execution,
            CoordinatorLinks {
                inbox: inbox_rx,
                cancel: cancel_rx,
                state: state_tx,
                expected: expected_tx,
                active: active_tx,
                latest: latest_rx,
                workers,
            },
        );

        let persistence = self.persistence.clone();
        let join = tokio::spawn(async move {
            let summary = coordinator.run().await;
            monitor_task.abort();
            for task in worker_tasks {
                let _ = task.await;
            }

            if let Some(persistence) = persistence {
                let saved = persistence
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .save_summary(&summary);
                if let Err(e) = saved {
                    warn!(session = %summary.id, error = %e, "Failed to persist session");
                }
            }

            info!(
                session = %summary.id,
                state = %summary.final_state,
                cause = ?summary.cause,
                pnl = %summary.realized_pnl,
                secs = summary.duration_secs(),
                "Session finished"
            );
            drop(lease);
            summary
        });

        Ok(SessionHandle {
            id: session_id,
            state: state_rx,
            expected: expected_rx,
            control: inbox_tx,
            stop: StopSignal(Arc::new(cancel_tx)),
            join,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, Symbol, TopOfBook};
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn params(quantity: Decimal, leverage: u32) -> SessionParams {
        SessionParams {
            symbol: btc(),
            quantity,
            leverage,
            min_spread: dec!(0.001),
            stop_loss: dec!(0.05),
            exit_spread: None,
            max_hold: None,
            dry_run: true,
        }
    }

    async fn binding(venue: Venue, account: &str, balance: Decimal) -> LegBinding {
        let paper = PaperExchange::new(venue, balance);
        paper.set_book(&btc(), TopOfBook::new(dec!(50000), dec!(50001))).await;
        LegBinding {
            account_id: account.to_string(),
            adapter: Arc::new(paper),
            venue_config: Config::default().venues.get(venue).clone(),
        }
    }

    fn runner() -> SessionRunner {
        SessionRunner::new(&Config::default(), Arc::new(SessionRegistry::new()))
            .with_caller(ResilientCaller::with_system_clock(RetryPolicy::none()))
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_requests() {
        let runner = runner();
        let aster = binding(Venue::Aster, "a1", dec!(10000)).await;
        let okx = binding(Venue::Okx, "o1", dec!(10000)).await;
        let aster2 = binding(Venue::Aster, "a2", dec!(10000)).await;

        let two = vec![aster.clone(), okx.clone()];
        assert!(runner.validate(&params(dec!(0.01), 5), &two).is_ok());
        assert!(runner.validate(&params(dec!(0.01), 5), &[aster.clone()]).is_err());
        assert!(runner
            .validate(&params(dec!(0.01), 5), &[aster.clone(), aster2])
            .is_err());
        assert!(runner.validate(&params(dec!(0.0105), 5), &two).is_err());
        assert!(runner.validate(&params(dec!(0.01), 0), &two).is_err());
        assert!(runner.validate(&params(dec!(0.01), 500), &two).is_err());
        assert!(runner.validate(&params(Decimal::ZERO, 5), &two).is_err());
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_config_error_and_releases_locks() {
        let runner = runner();
        let legs = vec![
            binding(Venue::Aster, "a1", dec!(10000)).await,
            binding(Venue::Okx, "o1", dec!(10)).await,
        ];

        let err = runner.start(params(dec!(0.01), 2), legs).await.err().unwrap();
        assert!(err.is_config());
        assert!(!runner.registry().is_locked(&LockKey {
            venue: Venue::Aster,
            account_id: "a1".into(),
            symbol: btc(),
        }));
    }

    #[tokio::test]
    async fn test_second_session_on_same_account_is_refused() {
        let runner = runner();
        let aster = binding(Venue::Aster, "a1", dec!(10000)).await;
        let okx = binding(Venue::Okx, "o1", dec!(10000)).await;
        let handle = runner
            .start(params(dec!(0.01), 2), vec![aster.clone(), okx.clone()])
            .await
            .ok()
            .unwrap();

        let err = runner
            .start(params(dec!(0.01), 2), vec![aster, okx])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ArbError::Registry(_)));

        // No spread on identical books: the session idles until stopped
        handle.stop();
        let summary = handle.join().await.unwrap();
        assert_eq!(summary.final_state, SessionState::Closed);
        assert!(runner.registry().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_state_reports_timeout_and_arrival() {
        let runner = runner();
        let legs = vec![
            binding(Venue::Aster, "a1", dec!(10000)).await,
            binding(Venue::Okx, "o1", dec!(10000)).await,
        ];
        let handle = runner.start(params(dec!(0.01), 2), legs).await.ok().unwrap();

        assert!(handle.wait_for_state(SessionState::Idle, Duration::from_millis(50)).await);
        assert!(!handle.wait_for_state(SessionState::Holding, Duration::from_millis(50)).await);

        handle.stop();
        assert!(handle.wait_for_state(SessionState::Closed, Duration::from_secs(2)).await);
        handle.join().await.unwrap();
    }
}
