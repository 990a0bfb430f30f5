//! SQLite persistence for finished sessions.
//!
//! Stores one row per session summary plus its complete fill history, so
//! the `status` command can report past runs after a restart.

use crate::exchange::{Side, Venue};
use crate::strategy::{LegFill, LegSummary, SessionSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// A session as read back from the database.
#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub id: String,
    pub symbol: String,
    pub dry_run: bool,
    pub final_state: String,
    pub cause: Option<String>,
    pub realized_pnl: Decimal,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub legs: Vec<LegSummary>,
    pub fill_count: u32,
    pub alert_count: u32,
}

impl PersistedSession {
    pub fn duration_secs(&self) -> i64 {
        (self.ended_at - self.started_at).num_seconds()
    }
}

fn parse_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_default()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                dry_run INTEGER NOT NULL,
                final_state TEXT NOT NULL,
                cause TEXT,
                realized_pnl TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                legs TEXT NOT NULL,
                fill_count INTEGER NOT NULL,
                alert_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);

            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                leg INTEGER NOT NULL,
                venue TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                position_after TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_session ON fills(session_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Store a finished session and its fills.
    pub fn save_summary(&self, summary: &SessionSummary) -> Result<()> {
        let legs = serde_json::to_string(&summary.legs).context("Failed to encode legs")?;
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO sessions (id, symbol, dry_run, final_state, cause, realized_pnl,
                                  started_at, ended_at, legs, fill_count, alert_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                final_state = ?4,
                cause = ?5,
                realized_pnl = ?6,
                ended_at = ?8,
                legs = ?9,
                fill_count = ?10,
                alert_count = ?11
            "#,
            params![
                summary.id,
                summary.symbol.to_string(),
                summary.dry_run as i32,
                summary.final_state.to_string(),
                summary.cause.map(|c| c.to_string()),
                summary.realized_pnl.to_string(),
                summary.started_at.to_rfc3339(),
                summary.ended_at.to_rfc3339(),
                legs,
                summary.fills.len() as i64,
                summary.alerts.len() as i64,
            ],
        )?;

        tx.execute("DELETE FROM fills WHERE session_id = ?1", params![summary.id])?;
        for fill in &summary.fills {
            tx.execute(
                r#"
                INSERT INTO fills (session_id, leg, venue, client_order_id, side, quantity,
                                   price, position_after, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    summary.id,
                    fill.leg as i64,
                    fill.venue.to_string(),
                    fill.client_order_id,
                    fill.side.to_string(),
                    fill.quantity.to_string(),
                    fill.price.to_string(),
                    fill.position_after.to_string(),
                    fill.timestamp.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            session = %summary.id,
            state = %summary.final_state,
            fills = summary.fills.len(),
            "Session saved to database"
        );
        Ok(())
    }

    /// Most recently finished sessions first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<PersistedSession>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, symbol, dry_run, final_state, cause, realized_pnl, started_at, ended_at,
                   legs, fill_count, alert_count
            FROM sessions
            ORDER BY ended_at DESC
            LIMIT ?1
            "#,
        )?;

        let sessions = stmt
            .query_map([limit as i64], |row| {
                let id: String = row.get(0)?;
                let legs_json: String = row.get(8)?;
                let legs = serde_json::from_str(&legs_json).unwrap_or_else(|e| {
                    warn!(session = %id, error = %e, "Unreadable legs column");
                    Vec::new()
                });
                Ok(PersistedSession {
                    id,
                    symbol: row.get(1)?,
                    dry_run: row.get::<_, i64>(2)? != 0,
                    final_state: row.get(3)?,
                    cause: row.get(4)?,
                    realized_pnl: parse_decimal(&row.get::<_, String>(5)?),
                    started_at: parse_time(&row.get::<_, String>(6)?),
                    ended_at: parse_time(&row.get::<_, String>(7)?),
                    legs,
                    fill_count: row.get(9)?,
                    alert_count: row.get(10)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(sessions)
    }

    /// Fill history of one session in arrival order.
    pub fn fills(&self, session_id: &str) -> Result<Vec<LegFill>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT leg, venue, client_order_id, side, quantity, price, position_after, timestamp
            FROM fills
            WHERE session_id = ?1
            ORDER BY id
            "#,
        )?;

        let fills = stmt
            .query_map([session_id], |row| {
                let venue: String = row.get(1)?;
                let side: String = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    venue,
                    row.get::<_, String>(2)?,
                    side,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(leg, venue, client_order_id, side, qty, price, after, ts)| {
                Some(LegFill {
                    leg: leg as usize,
                    venue: Venue::from_str(&venue).ok()?,
                    client_order_id,
                    side: if side == "BUY" { Side::Buy } else { Side::Sell },
                    quantity: parse_decimal(&qty),
                    price: parse_decimal(&price),
                    position_after: parse_decimal(&after),
                    order_done: true,
                    timestamp: parse_time(&ts),
                })
            })
            .collect();

        Ok(fills)
    }

    /// Sum of realized PnL over all stored sessions.
    pub fn total_realized_pnl(&self) -> Result<Decimal> {
        let mut stmt = self.conn.prepare("SELECT realized_pnl FROM sessions")?;
        let total = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(|raw| parse_decimal(&raw))
            .sum();
        Ok(total)
    }

    pub fn has_session(&self, session_id: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
