// =============================================================================
// Database — SQLite persistence for bars, state, trades, signals, registry
// =============================================================================
//
// A single connection behind a `parking_lot::Mutex`, WAL journal mode so
// readers do not block the batched writers. All writes are batched inside
// transactions; bar and state writes are idempotent upserts so a retried
// flush never duplicates rows.
//
// The in-memory stores are authoritative; everything here is a read-through
// snapshot for the API and recovery.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::classifiers::Signal;
use crate::commands::registry::CommandSpec;
use crate::ledger::{Position, PositionStatus};
use crate::market_data::SymbolState;
use crate::screener::Alert;
use crate::types::{Bar, BarSource, ClassifierKind, Side};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_state (
    symbol TEXT PRIMARY KEY,
    last_price REAL NOT NULL,
    last_bid REAL,
    last_ask REAL,
    last_update INTEGER NOT NULL,
    yesterday_close REAL,
    today_open REAL NOT NULL,
    pct_from_yesterday REAL,
    pct_from_open REAL NOT NULL,
    pct_from_1m REAL NOT NULL,
    pct_from_5m REAL NOT NULL,
    pct_from_15m REAL NOT NULL,
    hod_price REAL NOT NULL,
    hod_ts INTEGER NOT NULL,
    lod_price REAL NOT NULL,
    lod_ts INTEGER NOT NULL,
    spread_pct REAL,
    tier INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS price_bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    minute_start INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trade_count INTEGER NOT NULL,
    source TEXT NOT NULL,
    UNIQUE(symbol, minute_start)
);
CREATE INDEX IF NOT EXISTS idx_price_bars_symbol_minute
    ON price_bars(symbol, minute_start);

CREATE TABLE IF NOT EXISTS historical_bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    minute_start INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    trade_count INTEGER NOT NULL,
    source TEXT NOT NULL,
    UNIQUE(symbol, minute_start)
);
CREATE INDEX IF NOT EXISTS idx_historical_bars_symbol_minute
    ON historical_bars(symbol, minute_start);

CREATE TABLE IF NOT EXISTS screener_alerts (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    trigger_price REAL NOT NULL,
    trigger_time INTEGER NOT NULL,
    conditions TEXT NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_time ON screener_alerts(trigger_time DESC);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'default',
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    entry_price REAL NOT NULL,
    entry_value REAL NOT NULL,
    entry_time TEXT NOT NULL,
    exit_price REAL,
    exit_time TEXT,
    status TEXT NOT NULL,
    realized_pnl_cum REAL NOT NULL,
    session_id TEXT NOT NULL,
    stop_loss REAL,
    target REAL
);
CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_id, status);

CREATE TABLE IF NOT EXISTS trade_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_name TEXT NOT NULL UNIQUE,
    handler_key TEXT NOT NULL,
    category TEXT NOT NULL,
    is_implemented INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS trade_aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id INTEGER NOT NULL REFERENCES trade_commands(id),
    alias TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_phrases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id INTEGER NOT NULL REFERENCES trade_commands(id),
    phrase TEXT NOT NULL,
    confidence REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS controller_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    control TEXT NOT NULL UNIQUE,
    command_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_state (
    session_id TEXT PRIMARY KEY,
    flags TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS signal_records (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    symbol TEXT NOT NULL,
    classifier TEXT NOT NULL,
    bar_index INTEGER NOT NULL,
    emitted_at INTEGER NOT NULL,
    features TEXT NOT NULL,
    direction TEXT NOT NULL,
    stars INTEGER NOT NULL,
    grade INTEGER NOT NULL,
    confidence REAL NOT NULL,
    level_price REAL,
    displayed INTEGER NOT NULL,
    filter_reason TEXT,
    price_at_2m REAL,
    price_at_5m REAL,
    price_at_10m REAL,
    price_at_30m REAL,
    correct_2m INTEGER,
    correct_5m INTEGER,
    correct_10m INTEGER,
    final_correct INTEGER,
    eval_complete INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_signals_symbol_time
    ON signal_records(symbol, emitted_at DESC);

CREATE TABLE IF NOT EXISTS test_sessions (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    config TEXT NOT NULL,
    metrics TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER
);
"#;

/// Aggregate counts for `GET /alerts/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertStats {
    pub total: u64,
    pub today: u64,
    pub by_kind: Vec<(String, u64)>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply database schema")?;
        info!("database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Symbol state
    // =========================================================================

    /// Batched upsert of symbol-state snapshots.
    pub fn upsert_symbol_states(&self, states: &[SymbolState]) -> Result<usize> {
        if states.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO symbol_state (symbol, last_price, last_bid, last_ask, last_update,
                    yesterday_close, today_open, pct_from_yesterday, pct_from_open,
                    pct_from_1m, pct_from_5m, pct_from_15m,
                    hod_price, hod_ts, lod_price, lod_ts, spread_pct, tier)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                 ON CONFLICT(symbol) DO UPDATE SET
                    last_price=excluded.last_price, last_bid=excluded.last_bid,
                    last_ask=excluded.last_ask, last_update=excluded.last_update,
                    yesterday_close=excluded.yesterday_close, today_open=excluded.today_open,
                    pct_from_yesterday=excluded.pct_from_yesterday,
                    pct_from_open=excluded.pct_from_open, pct_from_1m=excluded.pct_from_1m,
                    pct_from_5m=excluded.pct_from_5m, pct_from_15m=excluded.pct_from_15m,
                    hod_price=excluded.hod_price, hod_ts=excluded.hod_ts,
                    lod_price=excluded.lod_price, lod_ts=excluded.lod_ts,
                    spread_pct=excluded.spread_pct, tier=excluded.tier",
            )?;
            for s in states {
                stmt.execute(params![
                    s.symbol,
                    s.last_price,
                    s.last_bid,
                    s.last_ask,
                    s.last_update,
                    s.yesterday_close,
                    s.today_open,
                    s.pct_from_yesterday,
                    s.pct_from_open,
                    s.pct_from_1m,
                    s.pct_from_5m,
                    s.pct_from_15m,
                    s.hod_price,
                    s.hod_ts,
                    s.lod_price,
                    s.lod_ts,
                    s.spread_pct,
                    s.tier as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(states.len())
    }

    // =========================================================================
    // Bars
    // =========================================================================

    /// Batched idempotent upsert keyed on (symbol, minute_start). Re-seals of
    /// the same minute overwrite in place.
    pub fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        self.upsert_bars_into("price_bars", bars)
    }

    /// Insert bars into the replay corpus.
    pub fn upsert_historical_bars(&self, bars: &[Bar]) -> Result<usize> {
        self.upsert_bars_into("historical_bars", bars)
    }

    fn upsert_bars_into(&self, table: &str, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {table} (symbol, minute_start, open, high, low, close, volume, trade_count, source)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(symbol, minute_start) DO UPDATE SET
                open=excluded.open, high=excluded.high, low=excluded.low,
                close=excluded.close, volume=excluded.volume,
                trade_count=excluded.trade_count, source=excluded.source"
        );
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for b in bars {
                stmt.execute(params![
                    b.symbol,
                    b.minute_start,
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.volume,
                    b.trade_count as i64,
                    b.source.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    fn row_to_bar(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bar> {
        let source: String = row.get(8)?;
        Ok(Bar {
            symbol: row.get(0)?,
            minute_start: row.get(1)?,
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: row.get(6)?,
            trade_count: row.get::<_, i64>(7)? as u64,
            source: BarSource::from_str(&source).unwrap_or(BarSource::Legacy),
        })
    }

    /// Ordered bars for a symbol in `[from, to]` (epoch ms). Legacy bars are
    /// excluded unless requested.
    pub fn query_bars(
        &self,
        symbol: &str,
        from: i64,
        to: i64,
        include_legacy: bool,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let sql = if include_legacy {
            "SELECT symbol, minute_start, open, high, low, close, volume, trade_count, source
             FROM price_bars WHERE symbol=?1 AND minute_start>=?2 AND minute_start<=?3
             ORDER BY minute_start ASC"
        } else {
            "SELECT symbol, minute_start, open, high, low, close, volume, trade_count, source
             FROM price_bars WHERE symbol=?1 AND minute_start>=?2 AND minute_start<=?3
               AND source != 'legacy'
             ORDER BY minute_start ASC"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![symbol, from, to], Self::row_to_bar)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Page of replay-corpus bars ordered by minute, starting at `offset`.
    pub fn historical_bars_page(
        &self,
        symbol: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, minute_start, open, high, low, close, volume, trade_count, source
             FROM historical_bars WHERE symbol=?1
             ORDER BY minute_start ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit as i64, offset as i64], Self::row_to_bar)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Total bars available in the replay corpus for a symbol.
    pub fn historical_bar_count(&self, symbol: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM historical_bars WHERE symbol=?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    pub fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO screener_alerts (id, symbol, kind, trigger_price, trigger_time, conditions, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                alert.id,
                alert.symbol,
                alert.kind.as_str(),
                alert.trigger_price,
                alert.trigger_time,
                alert.conditions.to_string(),
                alert.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn query_alerts(&self, since: i64, limit: u64) -> Result<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, kind, trigger_price, trigger_time, conditions, metadata
             FROM screener_alerts WHERE trigger_time >= ?1
             ORDER BY trigger_time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since, limit as i64], |row| {
                let kind: String = row.get(2)?;
                let conditions: String = row.get(5)?;
                let metadata: String = row.get(6)?;
                Ok(Alert {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    kind: kind.parse().unwrap_or_default(),
                    trigger_price: row.get(3)?,
                    trigger_time: row.get(4)?,
                    conditions: serde_json::from_str(&conditions)
                        .unwrap_or(serde_json::Value::Null),
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn alert_stats(&self, today_start: i64) -> Result<AlertStats> {
        let conn = self.conn.lock();
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM screener_alerts", [], |r| r.get(0))?;
        let today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM screener_alerts WHERE trigger_time >= ?1",
            params![today_start],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare_cached(
            "SELECT kind, COUNT(*) FROM screener_alerts GROUP BY kind ORDER BY COUNT(*) DESC",
        )?;
        let by_kind = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(AlertStats {
            total: total as u64,
            today: today as u64,
            by_kind,
        })
    }

    // =========================================================================
    // Trades
    // =========================================================================

    pub fn upsert_trade(&self, pos: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (id, symbol, side, quantity, entry_price, entry_value, entry_time,
                exit_price, exit_time, status, realized_pnl_cum, session_id, stop_loss, target)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(id) DO UPDATE SET
                quantity=excluded.quantity, entry_price=excluded.entry_price,
                entry_value=excluded.entry_value, exit_price=excluded.exit_price,
                exit_time=excluded.exit_time, status=excluded.status,
                realized_pnl_cum=excluded.realized_pnl_cum,
                stop_loss=excluded.stop_loss, target=excluded.target",
            params![
                pos.id,
                pos.symbol,
                pos.side.to_string(),
                pos.quantity,
                pos.entry_price,
                pos.entry_value,
                pos.entry_time,
                pos.exit_price,
                pos.exit_time,
                pos.status.to_string(),
                pos.realized_pnl_cum,
                pos.session_id,
                pos.stop_loss,
                pos.target,
            ],
        )?;
        Ok(())
    }

    /// Closed trades of a session, newest first. Recovery path: restores the
    /// ledger's realized P&L after a restart.
    pub fn closed_trades(&self, session_id: &str, limit: u64) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, side, quantity, entry_price, entry_value, entry_time,
                    exit_price, exit_time, status, realized_pnl_cum, session_id, stop_loss, target
             FROM trades WHERE session_id=?1 AND status='closed'
             ORDER BY exit_time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let side: String = row.get(2)?;
                let status: String = row.get(9)?;
                Ok(Position {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    side: if side == "short" { Side::Short } else { Side::Long },
                    quantity: row.get(3)?,
                    entry_price: row.get(4)?,
                    entry_value: row.get(5)?,
                    entry_time: row.get(6)?,
                    exit_price: row.get(7)?,
                    exit_time: row.get(8)?,
                    status: if status == "open" {
                        PositionStatus::Open
                    } else {
                        PositionStatus::Closed
                    },
                    realized_pnl_cum: row.get(10)?,
                    session_id: row.get(11)?,
                    stop_loss: row.get(12)?,
                    target: row.get(13)?,
                    current_price: 0.0,
                    unrealized_pnl: 0.0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Session state
    // =========================================================================

    pub fn save_session_id(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_state", [])?;
        conn.execute(
            "INSERT INTO session_state (session_id, flags) VALUES (?1, '{}')",
            params![session_id],
        )?;
        Ok(())
    }

    pub fn load_session_id(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row("SELECT session_id FROM session_state LIMIT 1", [], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(id)
    }

    // =========================================================================
    // Command registry
    // =========================================================================

    /// Load the full registry: commands with their aliases and phrases.
    pub fn load_command_registry(&self) -> Result<Vec<CommandSpec>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, command_name, handler_key, category, is_implemented FROM trade_commands",
        )?;
        let mut specs: Vec<(i64, CommandSpec)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    CommandSpec {
                        name: row.get(1)?,
                        handler_key: row.get(2)?,
                        category: row.get(3)?,
                        aliases: Vec::new(),
                        phrases: Vec::new(),
                        is_implemented: row.get::<_, i64>(4)? != 0,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut alias_stmt =
            conn.prepare_cached("SELECT alias FROM trade_aliases WHERE command_id=?1")?;
        let mut phrase_stmt = conn
            .prepare_cached("SELECT phrase, confidence FROM trade_phrases WHERE command_id=?1")?;

        for (id, spec) in specs.iter_mut() {
            spec.aliases = alias_stmt
                .query_map(params![*id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            spec.phrases = phrase_stmt
                .query_map(params![*id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        Ok(specs.into_iter().map(|(_, s)| s).collect())
    }

    /// Install the built-in command set on first run. No-op when the table
    /// already has rows.
    pub fn seed_command_registry(&self, specs: &[CommandSpec]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM trade_commands", [], |r| r.get(0))?;
        if existing > 0 {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        for spec in specs {
            tx.execute(
                "INSERT INTO trade_commands (command_name, handler_key, category, is_implemented)
                 VALUES (?1,?2,?3,?4)",
                params![spec.name, spec.handler_key, spec.category, spec.is_implemented as i64],
            )?;
            let command_id = tx.last_insert_rowid();
            for alias in &spec.aliases {
                tx.execute(
                    "INSERT INTO trade_aliases (command_id, alias) VALUES (?1,?2)",
                    params![command_id, alias],
                )?;
            }
            for (phrase, confidence) in &spec.phrases {
                tx.execute(
                    "INSERT INTO trade_phrases (command_id, phrase, confidence) VALUES (?1,?2,?3)",
                    params![command_id, phrase, confidence],
                )?;
            }
        }
        tx.commit()?;
        info!(count = specs.len(), "command registry seeded");
        Ok(specs.len())
    }

    // =========================================================================
    // Signal records & evaluations
    // =========================================================================

    pub fn insert_signal(&self, signal: &Signal, session_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signal_records (id, session_id, symbol, classifier, bar_index, emitted_at,
                features, direction, stars, grade, confidence, level_price, displayed, filter_reason)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                signal.id,
                session_id,
                signal.symbol,
                signal.classifier.as_str(),
                signal.bar_index as i64,
                signal.emit_time,
                signal.features.to_string(),
                signal.direction.as_str(),
                signal.stars as i64,
                signal.grade as i64,
                signal.confidence,
                signal.level_price,
                signal.displayed as i64,
                signal.filter_reason,
            ],
        )?;
        Ok(())
    }

    /// Record one horizon's evaluated price and verdict. `horizon_index` is
    /// the position within the configured horizon list (0 → 2m column, …).
    /// `correct` is `None` for a skipped (stale) horizon.
    pub fn update_signal_horizon(
        &self,
        signal_id: &str,
        horizon_index: usize,
        price: Option<f64>,
        correct: Option<bool>,
    ) -> Result<()> {
        let (price_col, correct_col) = match horizon_index {
            0 => ("price_at_2m", "correct_2m"),
            1 => ("price_at_5m", "correct_5m"),
            2 => ("price_at_10m", "correct_10m"),
            _ => ("price_at_30m", "final_correct"),
        };
        let sql = format!(
            "UPDATE signal_records SET {price_col}=?1, {correct_col}=?2 WHERE id=?3"
        );
        let conn = self.conn.lock();
        conn.execute(&sql, params![price, correct.map(|c| c as i64), signal_id])?;
        Ok(())
    }

    pub fn mark_signal_complete(&self, signal_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signal_records SET eval_complete=1 WHERE id=?1",
            params![signal_id],
        )?;
        Ok(())
    }

    /// `(emitted_at, final_correct)` of the most recent fully evaluated Momo
    /// signals, oldest first. Recovery path: re-seeds the reverse-psychology
    /// accuracy window after a restart.
    pub fn momo_eval_history(&self, limit: u64) -> Result<Vec<(i64, bool)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT emitted_at, final_correct FROM (
                 SELECT emitted_at, final_correct FROM signal_records
                 WHERE eval_complete=1 AND classifier='momo' AND final_correct IS NOT NULL
                 ORDER BY emitted_at DESC LIMIT ?1
             ) ORDER BY emitted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Recent signals of one classifier for a symbol (API surface).
    pub fn recent_signals(
        &self,
        symbol: &str,
        classifier: Option<ClassifierKind>,
        limit: u64,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock();
        let classifier_filter = classifier.map(|c| c.as_str().to_string()).unwrap_or_default();
        let sql = if classifier.is_some() {
            "SELECT id, classifier, emitted_at, direction, stars, grade, confidence, displayed,
                    filter_reason, final_correct
             FROM signal_records WHERE symbol=?1 AND classifier=?2
             ORDER BY emitted_at DESC LIMIT ?3"
        } else {
            "SELECT id, classifier, emitted_at, direction, stars, grade, confidence, displayed,
                    filter_reason, final_correct
             FROM signal_records WHERE symbol=?1 AND classifier!=?2
             ORDER BY emitted_at DESC LIMIT ?3"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![symbol, classifier_filter, limit as i64], |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "classifier": row.get::<_, String>(1)?,
                    "emitted_at": row.get::<_, i64>(2)?,
                    "direction": row.get::<_, String>(3)?,
                    "stars": row.get::<_, i64>(4)?,
                    "grade": row.get::<_, i64>(5)?,
                    "confidence": row.get::<_, f64>(6)?,
                    "displayed": row.get::<_, i64>(7)? != 0,
                    "filter_reason": row.get::<_, Option<String>>(8)?,
                    "final_correct": row.get::<_, Option<i64>>(9)?.map(|v| v != 0),
                }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Test sessions
    // =========================================================================

    pub fn insert_test_session(
        &self,
        id: &str,
        symbol: &str,
        config: &serde_json::Value,
        started_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO test_sessions (id, symbol, config, metrics, status, started_at)
             VALUES (?1,?2,?3,'{}','active',?4)",
            params![id, symbol, config.to_string(), started_at],
        )?;
        Ok(())
    }

    pub fn finish_test_session(
        &self,
        id: &str,
        metrics: &serde_json::Value,
        status: &str,
        ended_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE test_sessions SET metrics=?1, status=?2, ended_at=?3 WHERE id=?4",
            params![metrics.to_string(), status, ended_at, id],
        )?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarSource, Side};

    fn bar(symbol: &str, minute: i64, close: f64, source: BarSource) -> Bar {
        Bar {
            symbol: symbol.into(),
            minute_start: minute * 60_000,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100.0,
            trade_count: 10,
            source,
        }
    }

    #[test]
    fn bar_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let b = bar("AAPL", 1, 10.0, BarSource::Live);
        db.upsert_bars(&[b.clone()]).unwrap();
        // Re-seal of the same minute overwrites, never duplicates.
        let resealed = Bar { close: 11.0, ..b };
        db.upsert_bars(&[resealed]).unwrap();

        let bars = db.query_bars("AAPL", 0, i64::MAX, false).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 11.0);
    }

    #[test]
    fn default_bar_query_excludes_legacy() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_bars(&[
            bar("AAPL", 1, 10.0, BarSource::Live),
            bar("AAPL", 2, 10.5, BarSource::Legacy),
        ])
        .unwrap();

        assert_eq!(db.query_bars("AAPL", 0, i64::MAX, false).unwrap().len(), 1);
        assert_eq!(db.query_bars("AAPL", 0, i64::MAX, true).unwrap().len(), 2);
    }

    #[test]
    fn historical_pagination() {
        let db = Database::open_in_memory().unwrap();
        let bars: Vec<Bar> = (0..10).map(|i| bar("BYND", i, 1.0 + i as f64, BarSource::Live)).collect();
        db.upsert_historical_bars(&bars).unwrap();

        assert_eq!(db.historical_bar_count("BYND").unwrap(), 10);
        let page = db.historical_bars_page("BYND", 4, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].minute_start, 4 * 60_000);
    }

    #[test]
    fn trade_upsert_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let pos = Position {
            id: "t1".into(),
            symbol: "BYND".into(),
            side: Side::Long,
            quantity: 0.0,
            entry_price: 1.0,
            entry_value: 100.0,
            entry_time: "2026-08-01T10:00:00Z".into(),
            exit_price: Some(1.1),
            exit_time: Some("2026-08-01T10:30:00Z".into()),
            status: PositionStatus::Closed,
            realized_pnl_cum: 10.0,
            session_id: "s1".into(),
            stop_loss: None,
            target: None,
            current_price: 1.1,
            unrealized_pnl: 0.0,
        };
        db.upsert_trade(&pos).unwrap();
        db.upsert_trade(&pos).unwrap(); // idempotent

        let closed = db.closed_trades("s1", 10).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].side, Side::Long);
        assert!((closed[0].realized_pnl_cum - 10.0).abs() < 1e-9);
        assert!(db.closed_trades("other", 10).unwrap().is_empty());
    }

    #[test]
    fn session_id_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_session_id().unwrap().is_none());
        db.save_session_id("abc").unwrap();
        assert_eq!(db.load_session_id().unwrap().as_deref(), Some("abc"));
        db.save_session_id("def").unwrap();
        assert_eq!(db.load_session_id().unwrap().as_deref(), Some("def"));
    }

    #[test]
    fn registry_seed_and_load() {
        let db = Database::open_in_memory().unwrap();
        let specs = vec![CommandSpec {
            name: "close".into(),
            handler_key: "close_position".into(),
            category: "exit".into(),
            aliases: vec!["exit".into(), "flat".into()],
            phrases: vec![("get me out".into(), 0.9)],
            is_implemented: true,
        }];
        assert_eq!(db.seed_command_registry(&specs).unwrap(), 1);
        // Second seed is a no-op.
        assert_eq!(db.seed_command_registry(&specs).unwrap(), 0);

        let loaded = db.load_command_registry().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].aliases, vec!["exit", "flat"]);
        assert_eq!(loaded[0].phrases[0].0, "get me out");
    }
}
