//! Hedge Arb - Main Entry Point
//!
//! Runs hedged spread sessions across venues, watches spreads without
//! trading, and reports persisted session history.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use hedge_arb::config::Config;
use hedge_arb::error::ArbError;
use hedge_arb::exchange::{connect, net_position, ExchangeAdapter, Symbol};
use hedge_arb::persistence::PersistenceManager;
use hedge_arb::resilience::{Idempotency, ResilientCaller, RetryPolicy};
use hedge_arb::risk::ReconciliationAuditor;
use hedge_arb::strategy::{
    LegBinding, MonitoredLeg, SessionParams, SessionRegistry, SessionRunner, SessionState,
    SessionSummary, SpreadMonitor, TerminationCause,
};
use hedge_arb::utils::decimal::to_basis_points;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Hedge Arb CLI
#[derive(Parser)]
#[command(name = "hedge-arb")]
#[command(version, about = "Hedged cross-venue perpetual spread arbitrage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run arbitrage sessions (paper trading unless --real-trade)
    Run {
        /// Symbol, e.g. BTC/USDT or BTCUSDT
        #[arg(short, long)]
        symbol: String,

        /// Base quantity of the sell leg
        #[arg(short, long)]
        amount: Decimal,

        /// Leverage applied on every leg
        #[arg(short, long, default_value = "1")]
        leverage: u32,

        /// Minimum normalized spread to enter (0.0005 = 5 bps)
        #[arg(long)]
        min_spread: Decimal,

        /// Loss fraction of entry notional that forces an exit
        #[arg(long, default_value = "0.01")]
        stop_loss: Decimal,

        /// Account ids from config, 2 or 3 times
        #[arg(long = "account", required = true)]
        accounts: Vec<String>,

        /// Normalized spread at or below which a held position exits
        #[arg(long)]
        exit_spread: Option<Decimal>,

        /// Maximum seconds to hold before exiting
        #[arg(long)]
        max_hold_secs: Option<u64>,

        /// Trade on the real accounts
        #[arg(long)]
        real_trade: bool,

        /// Number of sessions to run (0 = until stopped)
        #[arg(long, default_value = "1")]
        loop_count: u32,

        /// Seconds to wait between sessions
        #[arg(long, default_value = "5")]
        loop_delay: u64,
    },

    /// Print spread opportunities without trading
    Monitor {
        #[arg(short, long)]
        symbol: String,

        #[arg(long = "account", required = true)]
        accounts: Vec<String>,

        #[arg(long, default_value = "0")]
        min_spread: Decimal,

        /// Stop after this many opportunities (0 = until stopped)
        #[arg(long, default_value = "0")]
        count: usize,
    },

    /// Show persisted session history
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List configured accounts
    Accounts,
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Clean,
    Emergency,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    let result = match cli.command {
        Commands::Run {
            symbol,
            amount,
            leverage,
            min_spread,
            stop_loss,
            accounts,
            exit_spread,
            max_hold_secs,
            real_trade,
            loop_count,
            loop_delay,
        } => {
            let request = RunRequest {
                symbol,
                amount,
                leverage,
                min_spread,
                stop_loss,
                accounts,
                exit_spread,
                max_hold: max_hold_secs.map(Duration::from_secs),
                dry_run: !real_trade,
                loop_count,
                loop_delay: Duration::from_secs(loop_delay),
            };
            run(request).await
        }
        Commands::Monitor {
            symbol,
            accounts,
            min_spread,
            count,
        } => monitor(&symbol, &accounts, min_spread, count)
            .await
            .map(|_| Outcome::Clean),
        Commands::Status { db, limit } => show_status(db, limit).map(|_| Outcome::Clean),
        Commands::Accounts => show_accounts().map(|_| Outcome::Clean),
    };

    match result {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Emergency) => ExitCode::from(3),
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<ArbError>() {
        Some(e) if e.is_config() => 2,
        _ => 1,
    }
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "hedge-arb.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hedge_arb=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Load and validate config; failures are configuration errors.
fn load_config() -> Result<Config> {
    let config = Config::load().map_err(|e| ArbError::Config(format!("{:#}", e)))?;
    config
        .validate()
        .map_err(|e| ArbError::Config(format!("{:#}", e)))?;
    Ok(config)
}

fn parse_symbol(raw: &str) -> Result<Symbol> {
    Symbol::from_str(raw).map_err(|e| ArbError::Config(format!("bad symbol '{}': {}", raw, e)).into())
}

/// Resolve `--account` ids into connected legs.
fn bind_accounts(config: &Config, ids: &[String], dry_run: bool) -> Result<Vec<LegBinding>> {
    ids.iter()
        .map(|id| {
            let account = config
                .account(id)
                .ok_or_else(|| ArbError::Config(format!("unknown account '{}'", id)))?;
            let venue_config = config.venues.get(account.exchange).clone();
            let adapter = connect(account, &venue_config, dry_run)
                .map_err(|e| ArbError::Config(format!("{:#}", e)))?;
            Ok(LegBinding {
                account_id: account.id.clone(),
                adapter,
                venue_config,
            })
        })
        .collect()
}

/// Ctrl-C flips the returned flag.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, stopping");
            tx.send_replace(true);
        }
        // Keep the sender alive so receivers do not see a closed channel
        std::future::pending::<()>().await;
    });
    rx
}

struct RunRequest {
    symbol: String,
    amount: Decimal,
    leverage: u32,
    min_spread: Decimal,
    stop_loss: Decimal,
    accounts: Vec<String>,
    exit_spread: Option<Decimal>,
    max_hold: Option<Duration>,
    dry_run: bool,
    loop_count: u32,
    loop_delay: Duration,
}

async fn venue_positions(legs: &[LegBinding], symbol: &Symbol, caller: &ResilientCaller) -> Result<Vec<Decimal>> {
    let mut positions = Vec::with_capacity(legs.len());
    for leg in legs {
        let adapter: Arc<dyn ExchangeAdapter> = leg.adapter.clone();
        let held = caller
            .call("get_positions", Idempotency::Safe, |_| {
                let adapter = adapter.clone();
                async move { adapter.get_positions().await }
            })
            .await
            .with_context(|| format!("position check on {}", leg.venue()))?;
        positions.push(net_position(&held, symbol));
    }
    Ok(positions)
}

async fn run(request: RunRequest) -> Result<Outcome> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              Hedge Arb v{}                              ║", env!("CARGO_PKG_VERSION"));
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = load_config()?;
    let symbol = parse_symbol(&request.symbol)?;
    if request.dry_run {
        info!("📝 DRY RUN - paper accounts on live prices");
    } else {
        warn!("⚠️  REAL TRADING - real money at risk!");
    }

    let legs = bind_accounts(&config, &request.accounts, request.dry_run)?;
    log_config(&config, &request, &legs);

    let registry = Arc::new(SessionRegistry::new());
    let mut runner = SessionRunner::new(&config, registry.clone());
    if config.persistence.enabled {
        if let Some(parent) = Path::new(&config.persistence.db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persistence = PersistenceManager::new(&config.persistence.db_path)?;
        runner = runner.with_persistence(Arc::new(Mutex::new(persistence)));
    }

    let caller = ResilientCaller::with_system_clock(RetryPolicy::from(&config.retry));
    let (audit_stop, audit_stop_rx) = watch::channel(false);
    let auditor = ReconciliationAuditor::new(registry.clone(), caller.clone(), config.audit.clone());
    let audit_task = tokio::spawn(auditor.run(audit_stop_rx));

    let mut shutdown = shutdown_signal();
    let baseline = venue_positions(&legs, &symbol, &caller).await?;
    let mut outcome = Outcome::Clean;
    let mut total_pnl = Decimal::ZERO;
    let mut iteration = 0u32;

    while request.loop_count == 0 || iteration < request.loop_count {
        if *shutdown.borrow() {
            break;
        }
        iteration += 1;
        info!(iteration, of = request.loop_count, "🔁 Starting session");

        let params = SessionParams {
            symbol: symbol.clone(),
            quantity: request.amount,
            leverage: request.leverage,
            min_spread: request.min_spread,
            stop_loss: request.stop_loss,
            exit_spread: request.exit_spread,
            max_hold: request.max_hold,
            dry_run: request.dry_run,
        };
        let handle = runner.start(params, legs.clone()).await?;
        info!(session = %handle.id(), "Session running, Ctrl-C to stop");

        let stop = handle.stop_signal();
        let mut stop_rx = shutdown.clone();
        let watcher = tokio::spawn(async move {
            if stop_rx.wait_for(|s| *s).await.is_ok() {
                stop.stop();
            }
        });

        let summary = handle.join().await?;
        watcher.abort();
        print_summary(&summary);
        total_pnl += summary.realized_pnl;

        if !finished_cleanly(&summary) {
            error!(session = %summary.id, cause = ?summary.cause, "🚨 Session ended in emergency state");
            outcome = Outcome::Emergency;
            break;
        }

        let now = venue_positions(&legs, &symbol, &caller).await?;
        let drifted: Vec<String> = legs
            .iter()
            .zip(baseline.iter().zip(&now))
            .filter(|(_, (before, after))| (**after - **before).abs() > config.audit.position_epsilon)
            .map(|(leg, (before, after))| format!("{} {} -> {}", leg.venue(), before, after))
            .collect();
        if !drifted.is_empty() {
            error!(?drifted, "🚨 Accounts not flat after session");
            outcome = Outcome::Emergency;
            break;
        }
        info!("✅ Accounts verified flat");

        if request.loop_count != 0 && iteration >= request.loop_count {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(request.loop_delay) => {}
            _ = shutdown.wait_for(|s| *s) => {}
        }
    }

    audit_stop.send_replace(true);
    let _ = audit_task.await;

    info!(sessions = iteration, pnl = %total_pnl, "👋 Hedge Arb shutdown complete");
    Ok(outcome)
}

/// Whether a session closed without leaving risk behind.
fn finished_cleanly(summary: &SessionSummary) -> bool {
    summary.final_state == SessionState::Closed
        && summary.residual().is_empty()
        && matches!(
            summary.cause,
            None | Some(TerminationCause::Completed) | Some(TerminationCause::UserCancellation)
        )
}

fn log_config(config: &Config, request: &RunRequest, legs: &[LegBinding]) {
    info!("📋 Configuration:");
    info!("   Symbol:        {}", request.symbol);
    info!("   Amount:        {}", request.amount);
    info!("   Leverage:      {}x", request.leverage);
    info!("   Min Spread:    {:.3} bps", to_basis_points(request.min_spread));
    info!("   Stop Loss:     {:.2}%", request.stop_loss * dec!(100));
    for leg in legs {
        info!("   Leg:           {} ({})", leg.venue(), leg.account_id);
    }
    info!("   Maker Timeout: {}ms", config.execution.maker_timeout_ms);
    info!("   Hedge Grace:   {}ms", config.execution.hedge_grace_ms);
    info!("   Audit Every:   {}ms", config.audit.interval_ms);
}

fn print_summary(summary: &SessionSummary) {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              SESSION SUMMARY                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("   ├─ Session:      {}", summary.id);
    println!("   ├─ Symbol:       {}", summary.symbol);
    println!("   ├─ Mode:         {}", if summary.dry_run { "dry run" } else { "real" });
    println!("   ├─ Final State:  {}", summary.final_state);
    println!(
        "   ├─ Cause:        {}",
        summary.cause.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("   ├─ Realized PnL: ${:.4}", summary.realized_pnl);
    println!("   ├─ Duration:     {}s", summary.duration_secs());
    println!("   ├─ Fills:        {}", summary.fills.len());
    println!("   └─ Alerts:       {}", summary.alerts.len());
    for leg in &summary.legs {
        println!(
            "   [{}] {:<8} {:<12} pos {:>10}  bought {} / sold {}",
            leg.index, leg.venue, leg.account_id, leg.position, leg.bought_qty, leg.sold_qty
        );
    }
}

async fn monitor(symbol: &str, accounts: &[String], min_spread: Decimal, count: usize) -> Result<()> {
    let config = load_config()?;
    let symbol = parse_symbol(symbol)?;
    let legs = bind_accounts(&config, accounts, true)?;
    if !(2..=3).contains(&legs.len()) {
        return Err(ArbError::Config("monitor needs 2 or 3 accounts".into()).into());
    }

    let monitor = Arc::new(SpreadMonitor::new(
        symbol.clone(),
        legs.iter()
            .map(|leg| MonitoredLeg {
                venue: leg.venue(),
                adapter: leg.adapter.clone(),
                taker_fee: leg.venue_config.taker_fee,
            })
            .collect(),
        ResilientCaller::with_system_clock(RetryPolicy::from(&config.retry)),
        config.monitor.clone(),
    ));

    info!(%symbol, legs = legs.len(), %min_spread, "📡 Watching spreads, Ctrl-C to stop");
    let limit = if count > 0 { count } else { usize::MAX };
    let mut stream = Box::pin(monitor.opportunities(min_spread).take(limit));
    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            next = stream.next() => {
                let Some(opportunity) = next else { break };
                let best = opportunity.best;
                let sell = &legs[best.direction.sell];
                let buy = &legs[best.direction.buy];
                println!(
                    "{}  sell {} / buy {}  raw {}  {:.3} bps",
                    opportunity.detected_at.format("%H:%M:%S%.3f"),
                    sell.venue(),
                    buy.venue(),
                    best.raw,
                    to_basis_points(best.normalized)
                );
            }
            _ = shutdown.wait_for(|s| *s) => break,
        }
    }
    Ok(())
}

fn show_status(db: Option<String>, limit: usize) -> Result<()> {
    let db_path = match db {
        Some(path) => path,
        None => load_config()?.persistence.db_path,
    };

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              HEDGE ARB SESSIONS                            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(&db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No session has finished yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(&db_path)?;
    let sessions = persistence.recent_sessions(limit)?;
    if sessions.is_empty() {
        println!("\n❌ No sessions recorded.");
        return Ok(());
    }

    println!("\n💰 Total realized PnL: ${:.4}", persistence.total_realized_pnl()?);
    for session in &sessions {
        println!("\n   ┌─ {} {}", session.id, session.symbol);
        println!(
            "   ├─ {} ({})  {}",
            session.final_state,
            session.cause.as_deref().unwrap_or("-"),
            if session.dry_run { "dry run" } else { "real" }
        );
        println!("   ├─ PnL:      ${:.4}", session.realized_pnl);
        println!(
            "   ├─ Ended:    {} ({}s)",
            session.ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
            session.duration_secs()
        );
        for leg in &session.legs {
            println!("   ├─ {} {}: pos {}", leg.venue, leg.account_id, leg.position);
        }
        println!("   └─ Fills: {}  Alerts: {}", session.fill_count, session.alert_count);
    }
    Ok(())
}

fn show_accounts() -> Result<()> {
    let config = load_config()?;
    if config.accounts.is_empty() {
        println!("No accounts configured. Add [[accounts]] entries to config.toml.");
        return Ok(());
    }

    println!("{:<16} {:<10} {:<20} {:<8} {}", "ID", "VENUE", "LABEL", "TESTNET", "CREDENTIALS");
    for account in &config.accounts {
        println!(
            "{:<16} {:<10} {:<20} {:<8} {}",
            account.id,
            account.exchange.to_string(),
            account.label,
            account.testnet,
            if account.has_credentials() { "yes" } else { "no" }
        );
    }
    Ok(())
}
