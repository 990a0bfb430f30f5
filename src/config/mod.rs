//! Configuration management for the hedge arbitrage engine.
//!
//! Loads settings from an optional `config.toml` and from environment
//! variables prefixed with `HEDGE_ARB` (nested keys separated by `__`,
//! e.g. `HEDGE_ARB__EXECUTION__HEDGE_GRACE_MS=5000`).

use crate::exchange::Venue;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Venue accounts available to sessions
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Per-venue instrument and fee settings
    #[serde(default)]
    pub venues: VenuesConfig,
    /// Order placement, chasing and hedge timing
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Retry policy for remote calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Spread monitor polling
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Reconciliation auditor
    #[serde(default)]
    pub audit: AuditConfig,
    /// SQLite session history
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Credentials for one venue account.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Operator-chosen identifier referenced by `--account`
    pub id: String,
    pub exchange: Venue,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Required by OKX
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("exchange", &self.exchange)
            .field("label", &self.label)
            .field("api_key", &redact(&self.api_key))
            .field("testnet", &self.testnet)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", secret.chars().take(4).collect::<String>())
    }
}

impl AccountConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuesConfig {
    #[serde(default = "default_aster_venue")]
    pub aster: VenueConfig,
    #[serde(default = "default_okx_venue")]
    pub okx: VenueConfig,
    #[serde(default = "default_backpack_venue")]
    pub backpack: VenueConfig,
}

impl VenuesConfig {
    pub fn get(&self, venue: Venue) -> &VenueConfig {
        match venue {
            Venue::Aster => &self.aster,
            Venue::Okx => &self.okx,
            Venue::Backpack => &self.backpack,
        }
    }
}

/// Instrument precision and fees for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Minimum quantity increment in base units
    pub lot_size: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    /// Base units per contract (OKX swaps trade in contracts)
    #[serde(default = "default_contract_value")]
    pub contract_value: Decimal,
    /// Override the REST endpoint (testing, proxies)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Starting balance of the paper account in dry-run mode
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum leverage a session may request
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    /// Passive price offset into the spread (0 = at own touch, 1 = at far touch)
    #[serde(default = "default_maker_offset_ratio")]
    pub maker_offset_ratio: Decimal,
    /// Time a phase may rest passively before chasing
    #[serde(default = "default_maker_timeout_ms")]
    pub maker_timeout_ms: u64,
    /// Interval between chase re-prices
    #[serde(default = "default_chase_interval_ms")]
    pub chase_interval_ms: u64,
    /// Ticks moved toward the market per chase step
    #[serde(default = "default_chase_step_ticks")]
    pub chase_step_ticks: u32,
    /// Chase duration before escalating to a market order
    #[serde(default = "default_chase_timeout_ms")]
    pub chase_timeout_ms: u64,
    /// Maximum time net exposure may stay outside epsilon
    #[serde(default = "default_hedge_grace_ms")]
    pub hedge_grace_ms: u64,
    /// Order status polling interval in leg workers
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Coordinator timer resolution
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Tolerated net notional exposure in quote currency
    #[serde(default = "default_exposure_epsilon")]
    pub exposure_epsilon: Decimal,
    /// Default exit threshold as a fraction of the entry spread
    #[serde(default = "default_exit_spread_ratio")]
    pub exit_spread_ratio: Decimal,
    /// Maximum holding time in seconds (0 = unlimited)
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
    /// Opportunities older than this are ignored
    #[serde(default = "default_opportunity_ttl_ms")]
    pub opportunity_ttl_ms: u64,
    /// Time to wait for cancel acknowledgements before unwinding anyway
    #[serde(default = "default_cancel_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: u64,
    /// Market flatten attempts before falling back to close-position
    #[serde(default = "default_flatten_attempts")]
    pub flatten_attempts: u32,
    /// Coordinator inbox capacity
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl ExecutionConfig {
    pub fn maker_timeout(&self) -> Duration {
        Duration::from_millis(self.maker_timeout_ms)
    }

    pub fn chase_interval(&self) -> Duration {
        Duration::from_millis(self.chase_interval_ms)
    }

    pub fn chase_timeout(&self) -> Duration {
        Duration::from_millis(self.chase_timeout_ms)
    }

    pub fn hedge_grace(&self) -> Duration {
        Duration::from_millis(self.hedge_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_hold(&self) -> Option<Duration> {
        (self.max_hold_secs > 0).then(|| Duration::from_secs(self.max_hold_secs))
    }

    pub fn opportunity_ttl(&self) -> Duration {
        Duration::from_millis(self.opportunity_ttl_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between spread evaluations
    #[serde(default = "default_monitor_poll_ms")]
    pub poll_interval_ms: u64,
    /// Per-leg orderbook fetch timeout
    #[serde(default = "default_book_timeout_ms")]
    pub book_timeout_ms: u64,
    /// Orderbook cache lifetime
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn book_timeout(&self) -> Duration {
        Duration::from_millis(self.book_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_interval_ms")]
    pub interval_ms: u64,
    /// Tolerated position discrepancy in base units
    #[serde(default = "default_position_epsilon")]
    pub position_epsilon: Decimal,
    /// Consecutive breaches before a consistency violation is raised
    #[serde(default = "default_consecutive_breaches")]
    pub consecutive_breaches: u32,
}

impl AuditConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_aster_venue() -> VenueConfig {
    VenueConfig {
        tick_size: Decimal::new(1, 1),   // 0.1
        lot_size: Decimal::new(1, 3),    // 0.001
        maker_fee: Decimal::new(1, 4),   // 0.01%
        taker_fee: Decimal::new(35, 5),  // 0.035%
        contract_value: default_contract_value(),
        base_url: None,
        paper_balance: default_paper_balance(),
    }
}

fn default_okx_venue() -> VenueConfig {
    VenueConfig {
        tick_size: Decimal::new(1, 1),   // 0.1
        lot_size: Decimal::new(1, 4),    // 0.0001 (0.01 contract of 0.01 BTC)
        maker_fee: Decimal::new(2, 4),   // 0.02%
        taker_fee: Decimal::new(5, 4),   // 0.05%
        contract_value: Decimal::new(1, 2), // 0.01 BTC per BTC-USDT-SWAP contract
        base_url: None,
        paper_balance: default_paper_balance(),
    }
}

fn default_backpack_venue() -> VenueConfig {
    VenueConfig {
        tick_size: Decimal::new(1, 2),   // 0.01
        lot_size: Decimal::new(1, 5),    // 0.00001
        maker_fee: Decimal::new(2, 4),   // 0.02%
        taker_fee: Decimal::new(5, 4),   // 0.05%
        contract_value: default_contract_value(),
        base_url: None,
        paper_balance: default_paper_balance(),
    }
}

fn default_contract_value() -> Decimal {
    Decimal::ONE
}

fn default_paper_balance() -> Decimal {
    Decimal::new(10_000, 0) // $10k paper account
}

fn default_max_leverage() -> u32 {
    20
}

fn default_maker_offset_ratio() -> Decimal {
    Decimal::new(3, 1) // 0.3 into the spread
}

fn default_maker_timeout_ms() -> u64 {
    3_000
}

fn default_chase_interval_ms() -> u64 {
    200
}

fn default_chase_step_ticks() -> u32 {
    1
}

fn default_chase_timeout_ms() -> u64 {
    3_000
}

fn default_hedge_grace_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_exposure_epsilon() -> Decimal {
    Decimal::new(5, 0) // $5 of net notional
}

fn default_exit_spread_ratio() -> Decimal {
    Decimal::new(5, 1) // exit once half the entry spread has converged
}

fn default_max_hold_secs() -> u64 {
    300
}

fn default_opportunity_ttl_ms() -> u64 {
    1_000
}

fn default_cancel_ack_timeout_ms() -> u64 {
    5_000
}

fn default_flatten_attempts() -> u32 {
    3
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_monitor_poll_ms() -> u64 {
    200
}

fn default_book_timeout_ms() -> u64 {
    1_500
}

fn default_cache_ttl_ms() -> u64 {
    50
}

fn default_audit_interval_ms() -> u64 {
    5_000
}

fn default_position_epsilon() -> Decimal {
    Decimal::new(1, 4) // 0.0001 base units
}

fn default_consecutive_breaches() -> u32 {
    2
}

fn default_db_path() -> String {
    "data/hedge_arb.db".to_string()
}

fn default_persistence_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("HEDGE_ARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for account in &self.accounts {
            anyhow::ensure!(!account.id.is_empty(), "account id must not be empty");
            anyhow::ensure!(ids.insert(&account.id), "duplicate account id '{}'", account.id);
        }

        for venue in [Venue::Aster, Venue::Okx, Venue::Backpack] {
            let v = self.venues.get(venue);
            anyhow::ensure!(v.tick_size > Decimal::ZERO, "{} tick_size must be positive", venue);
            anyhow::ensure!(v.lot_size > Decimal::ZERO, "{} lot_size must be positive", venue);
            anyhow::ensure!(
                v.contract_value > Decimal::ZERO,
                "{} contract_value must be positive",
                venue
            );
        }

        let ex = &self.execution;
        anyhow::ensure!(
            ex.maker_offset_ratio >= Decimal::ZERO && ex.maker_offset_ratio < Decimal::ONE,
            "maker_offset_ratio must be in [0, 1)"
        );
        anyhow::ensure!(
            ex.exit_spread_ratio >= Decimal::ZERO && ex.exit_spread_ratio < Decimal::ONE,
            "exit_spread_ratio must be in [0, 1)"
        );
        anyhow::ensure!(ex.max_leverage >= 1, "max_leverage must be >= 1");
        anyhow::ensure!(ex.chase_step_ticks >= 1, "chase_step_ticks must be >= 1");
        anyhow::ensure!(ex.exposure_epsilon >= Decimal::ZERO, "exposure_epsilon must be >= 0");
        anyhow::ensure!(ex.poll_interval_ms > 0, "poll_interval_ms must be > 0");
        anyhow::ensure!(ex.tick_interval_ms > 0, "tick_interval_ms must be > 0");
        anyhow::ensure!(ex.inbox_capacity > 0, "inbox_capacity must be > 0");

        anyhow::ensure!(self.retry.max_attempts >= 1, "retry.max_attempts must be >= 1");
        anyhow::ensure!(
            self.retry.initial_backoff_ms <= self.retry.max_backoff_ms,
            "retry.initial_backoff_ms must not exceed retry.max_backoff_ms"
        );
        anyhow::ensure!(
            self.retry.backoff_multiplier >= 1,
            "retry.backoff_multiplier must be >= 1"
        );

        anyhow::ensure!(self.monitor.poll_interval_ms > 0, "monitor.poll_interval_ms must be > 0");
        anyhow::ensure!(self.audit.interval_ms > 0, "audit.interval_ms must be > 0");
        anyhow::ensure!(
            self.audit.position_epsilon >= Decimal::ZERO,
            "audit.position_epsilon must be >= 0"
        );
        anyhow::ensure!(
            self.audit.consecutive_breaches >= 1,
            "audit.consecutive_breaches must be >= 1"
        );

        Ok(())
    }

    /// Look up an account by id.
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            venues: VenuesConfig::default(),
            execution: ExecutionConfig::default(),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            audit: AuditConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for VenuesConfig {
    fn default() -> Self {
        Self {
            aster: default_aster_venue(),
            okx: default_okx_venue(),
            backpack: default_backpack_venue(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            maker_offset_ratio: default_maker_offset_ratio(),
            maker_timeout_ms: default_maker_timeout_ms(),
            chase_interval_ms: default_chase_interval_ms(),
            chase_step_ticks: default_chase_step_ticks(),
            chase_timeout_ms: default_chase_timeout_ms(),
            hedge_grace_ms: default_hedge_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            exposure_epsilon: default_exposure_epsilon(),
            exit_spread_ratio: default_exit_spread_ratio(),
            max_hold_secs: default_max_hold_secs(),
            opportunity_ttl_ms: default_opportunity_ttl_ms(),
            cancel_ack_timeout_ms: default_cancel_ack_timeout_ms(),
            flatten_attempts: default_flatten_attempts(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_monitor_poll_ms(),
            book_timeout_ms: default_book_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_audit_interval_ms(),
            position_epsilon: default_position_epsilon(),
            consecutive_breaches: default_consecutive_breaches(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            enabled: default_persistence_enabled(),
        }
    }
}
