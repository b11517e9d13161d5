// =============================================================================
// Position Ledger — state machine for open / averaged / reversed / closed trades
// =============================================================================
//
// Life-cycle:
//   Open  ->  Open (same-side add: quantity-weighted average entry)
//   Open  ->  Closed + Open opposite (reversal: realize, then flip)
//   Open  ->  Open (partial close: scaleout chunk, realized accumulates)
//   Open  ->  Closed (full close / final scaleout chunk / manual)
//
// Invariants:
//   - at most one open position per symbol;
//   - a closed position is frozen;
//   - MasterPnL = realized P&L of the current session's closed positions
//     plus realized-so-far and unrealized on the open book.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`. The
// command executor serializes mutations per session, so writers never race.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::db::Database;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    /// Quantity-weighted average entry price.
    pub entry_price: f64,
    /// Notional at entry, maintained through averaging.
    pub entry_value: f64,
    pub entry_time: String,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<String>,
    pub status: PositionStatus,
    /// Realized P&L accumulated on this position (partial closes + final).
    #[serde(default)]
    pub realized_pnl_cum: f64,
    pub session_id: String,
    /// Advisory stop level; not auto-enforced.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    /// Advisory bracket target; not auto-enforced.
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

impl Position {
    /// Signed P&L of closing `qty` at `price` against the average entry.
    fn pnl_of(&self, qty: f64, price: f64) -> f64 {
        (price - self.entry_price) * qty * self.side.sign()
    }
}

/// Snapshot published on `position.<symbol>` after every ledger mutation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub symbol: String,
    /// The open position after the mutation, if one remains.
    pub position: Option<Position>,
    pub master_pnl: f64,
}

/// Result of an entry command against the current book.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    /// No position existed; a fresh one was opened.
    Opened(Position),
    /// Same-side add: entry price re-averaged.
    Averaged(Position),
    /// Opposite-side entry: the old position was closed at the new price and
    /// a fresh position opened on the new side.
    Reversed {
        closed: Position,
        realized_delta: f64,
        opened: Position,
    },
}

// ---------------------------------------------------------------------------
// Position Ledger
// ---------------------------------------------------------------------------

/// Thread-safe ledger that owns all position mutations.
pub struct PositionLedger {
    /// Open book: at most one position per symbol.
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    session_id: RwLock<String>,
    /// Durable mirror; writes are best-effort and never block a mutation.
    db: Option<Arc<Database>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            session_id: RwLock::new(Uuid::new_v4().to_string()),
            db: None,
        }
    }

    /// Attach a database mirror. Restores the persisted session id and that
    /// session's closed trades, so MasterPnL survives a restart.
    pub fn with_db(db: Arc<Database>) -> Self {
        let ledger = Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            session_id: RwLock::new(Uuid::new_v4().to_string()),
            db: Some(db.clone()),
        };
        match db.load_session_id() {
            Ok(Some(session)) => {
                *ledger.session_id.write() = session.clone();
                match db.closed_trades(&session, 1000) {
                    Ok(mut trades) => {
                        if !trades.is_empty() {
                            info!(
                                session_id = %session,
                                trades = trades.len(),
                                "restored closed trades for session"
                            );
                        }
                        trades.reverse(); // newest-first on disk, oldest-first here
                        *ledger.closed.write() = trades;
                    }
                    Err(e) => warn!(error = %e, "failed to restore closed trades"),
                }
            }
            Ok(None) => {
                let session = ledger.session_id.read().clone();
                if let Err(e) = db.save_session_id(&session) {
                    warn!(error = %e, "failed to persist initial session id");
                }
            }
            Err(e) => warn!(error = %e, "failed to load session id"),
        }
        ledger
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    /// Start a new session. Historical rows are preserved but excluded from
    /// the running MasterPnL.
    pub fn reset_session(&self) -> String {
        let new_id = Uuid::new_v4().to_string();
        *self.session_id.write() = new_id.clone();
        if let Some(db) = &self.db {
            if let Err(e) = db.save_session_id(&new_id) {
                warn!(error = %e, "failed to persist session id");
            }
        }
        info!(session_id = %new_id, "session reset");
        new_id
    }

    fn persist(&self, pos: &Position) {
        if let Some(db) = &self.db {
            if let Err(e) = db.upsert_trade(pos) {
                warn!(id = %pos.id, error = %e, "trade persistence failed — will retry on next mutation");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entry (open / average / reverse)
    // -------------------------------------------------------------------------

    /// Apply an entry of `qty` at `price` on `side`.
    pub fn enter(&self, symbol: &str, side: Side, qty: f64, price: f64) -> EntryOutcome {
        let now = Utc::now().to_rfc3339();
        let mut open = self.open.write();

        match open.remove(symbol) {
            None => {
                let pos = self.fresh_position(symbol, side, qty, price, &now);
                info!(
                    id = %pos.id,
                    symbol,
                    side = %side,
                    qty,
                    price,
                    "position opened"
                );
                open.insert(symbol.to_string(), pos.clone());
                drop(open);
                self.persist(&pos);
                EntryOutcome::Opened(pos)
            }
            Some(mut pos) if pos.side == side => {
                // Averaging: entry' = (q·e + q'·p') / (q + q'), realized unchanged.
                let new_qty = pos.quantity + qty;
                pos.entry_price = (pos.quantity * pos.entry_price + qty * price) / new_qty;
                pos.quantity = new_qty;
                pos.entry_value = pos.entry_price * new_qty;
                pos.current_price = price;
                pos.unrealized_pnl = pos.pnl_of(pos.quantity, price);
                info!(
                    id = %pos.id,
                    symbol,
                    added_qty = qty,
                    new_qty,
                    avg_entry = pos.entry_price,
                    "position averaged"
                );
                open.insert(symbol.to_string(), pos.clone());
                drop(open);
                self.persist(&pos);
                EntryOutcome::Averaged(pos)
            }
            Some(pos) => {
                // Reversal: close the old side at the new entry price, then
                // open fresh on the new side.
                let (closed, realized_delta) = self.seal_position(pos, price, &now);
                let opened = self.fresh_position(symbol, side, qty, price, &now);
                info!(
                    closed_id = %closed.id,
                    opened_id = %opened.id,
                    symbol,
                    realized_delta,
                    new_side = %side,
                    "position reversed"
                );
                open.insert(symbol.to_string(), opened.clone());
                drop(open);
                self.persist(&closed);
                self.persist(&opened);
                EntryOutcome::Reversed {
                    closed,
                    realized_delta,
                    opened,
                }
            }
        }
    }

    fn fresh_position(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        now: &str,
    ) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            entry_price: price,
            entry_value: qty * price,
            entry_time: now.to_string(),
            exit_price: None,
            exit_time: None,
            status: PositionStatus::Open,
            realized_pnl_cum: 0.0,
            session_id: self.session_id(),
            stop_loss: None,
            target: None,
            current_price: price,
            unrealized_pnl: 0.0,
        }
    }

    /// Freeze a position at `price` and move it to the closed list. Returns
    /// the frozen row and the realized delta of this final fill.
    fn seal_position(&self, mut pos: Position, price: f64, now: &str) -> (Position, f64) {
        let final_pnl = pos.pnl_of(pos.quantity, price);
        pos.realized_pnl_cum += final_pnl;
        pos.exit_price = Some(price);
        pos.exit_time = Some(now.to_string());
        pos.status = PositionStatus::Closed;
        pos.current_price = price;
        pos.unrealized_pnl = 0.0;
        pos.quantity = 0.0;

        self.closed.write().push(pos.clone());
        (pos, final_pnl)
    }

    // -------------------------------------------------------------------------
    // Close paths
    // -------------------------------------------------------------------------

    /// Fully close the open position on `symbol` at `price`. Returns the
    /// frozen row, or `None` when nothing is open.
    pub fn close(&self, symbol: &str, price: f64) -> Option<Position> {
        let now = Utc::now().to_rfc3339();
        let pos = self.open.write().remove(symbol)?;
        let (closed, final_pnl) = self.seal_position(pos, price, &now);
        info!(
            id = %closed.id,
            symbol,
            exit_price = price,
            realized_delta = final_pnl,
            realized_cum = closed.realized_pnl_cum,
            "position closed"
        );
        self.persist(&closed);
        Some(closed)
    }

    /// Close `qty` of the open position at `price` (a scaleout chunk or a
    /// `sell <N>` command). Accumulates realized P&L on the open row; closing
    /// the last share routes through the full close path.
    ///
    /// Returns `(realized_delta, position_after)`.
    pub fn partial_close(&self, symbol: &str, qty: f64, price: f64) -> Option<(f64, Position)> {
        let mut open = self.open.write();
        let pos = open.get_mut(symbol)?;

        let close_qty = qty.min(pos.quantity);
        if close_qty <= 0.0 {
            return None;
        }

        if (pos.quantity - close_qty).abs() < f64::EPSILON || close_qty >= pos.quantity {
            // Final chunk: full close.
            let pos = open.remove(symbol)?;
            drop(open);
            let now = Utc::now().to_rfc3339();
            let (closed, delta) = self.seal_position(pos, price, &now);
            info!(
                id = %closed.id,
                symbol,
                realized_delta = delta,
                "final partial close sealed position"
            );
            self.persist(&closed);
            return Some((delta, closed));
        }

        let delta = pos.pnl_of(close_qty, price);
        pos.quantity -= close_qty;
        pos.realized_pnl_cum += delta;
        pos.current_price = price;
        pos.unrealized_pnl = pos.pnl_of(pos.quantity, price);
        let snapshot = pos.clone();
        drop(open);

        info!(
            id = %snapshot.id,
            symbol,
            closed_qty = close_qty,
            remaining_qty = snapshot.quantity,
            realized_delta = delta,
            "partial close"
        );
        self.persist(&snapshot);
        Some((delta, snapshot))
    }

    // -------------------------------------------------------------------------
    // Risk levels & price updates
    // -------------------------------------------------------------------------

    /// Record advisory stop/target levels on the open position.
    pub fn set_risk_levels(
        &self,
        symbol: &str,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> Option<Position> {
        let mut open = self.open.write();
        let pos = open.get_mut(symbol)?;
        pos.stop_loss = stop;
        pos.target = target;
        let snapshot = pos.clone();
        drop(open);
        self.persist(&snapshot);
        Some(snapshot)
    }

    /// Refresh `current_price` / unrealized P&L on the open position.
    pub fn update_price(&self, symbol: &str, price: f64) {
        let mut open = self.open.write();
        if let Some(pos) = open.get_mut(symbol) {
            pos.current_price = price;
            pos.unrealized_pnl = pos.pnl_of(pos.quantity, price);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_open(&self, symbol: &str) -> Option<Position> {
        self.open.read().get(symbol).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    /// The most recent `count` closed positions (newest first).
    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// Session-cumulative MasterPnL: realized P&L of closed positions in the
    /// current session, plus realized-so-far and unrealized on the open book.
    pub fn master_pnl(&self) -> f64 {
        let session = self.session_id();
        let closed: f64 = self
            .closed
            .read()
            .iter()
            .filter(|p| p.session_id == session)
            .map(|p| p.realized_pnl_cum)
            .sum();
        let open: f64 = self
            .open
            .read()
            .values()
            .filter(|p| p.session_id == session)
            .map(|p| p.realized_pnl_cum + p.unrealized_pnl)
            .sum();
        closed + open
    }

    /// Realized-only MasterPnL (closed rows plus partials on the open book).
    pub fn master_pnl_realized(&self) -> f64 {
        let session = self.session_id();
        let closed: f64 = self
            .closed
            .read()
            .iter()
            .filter(|p| p.session_id == session)
            .map(|p| p.realized_pnl_cum)
            .sum();
        let open: f64 = self
            .open
            .read()
            .values()
            .filter(|p| p.session_id == session)
            .map(|p| p.realized_pnl_cum)
            .sum();
        closed + open
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_close_realizes_pnl() {
        let ledger = PositionLedger::new();
        ledger.enter("BYND", Side::Long, 100.0, 1.00);
        let closed = ledger.close("BYND", 1.10).unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.realized_pnl_cum - 10.0).abs() < 1e-9);
        assert_eq!(closed.quantity, 0.0);
        assert!((ledger.master_pnl() - 10.0).abs() < 1e-9);
        assert!(ledger.get_open("BYND").is_none());
    }

    #[test]
    fn averaging_law() {
        let ledger = PositionLedger::new();
        ledger.enter("AAPL", Side::Long, 100.0, 10.0);
        let outcome = ledger.enter("AAPL", Side::Long, 50.0, 13.0);

        match outcome {
            EntryOutcome::Averaged(pos) => {
                assert_eq!(pos.quantity, 150.0);
                // (100*10 + 50*13) / 150 = 11.0
                assert!((pos.entry_price - 11.0).abs() < 1e-9);
                assert_eq!(pos.realized_pnl_cum, 0.0);
            }
            other => panic!("expected Averaged, got {other:?}"),
        }
    }

    #[test]
    fn reversal_law_scenario_s1() {
        // long 50000 @ 0.55, then short 10000 @ 0.60:
        // realized = (0.60 - 0.55) * 50000 = +2500, fresh short at 0.60.
        let ledger = PositionLedger::new();
        ledger.enter("BYND", Side::Long, 50_000.0, 0.55);
        let outcome = ledger.enter("BYND", Side::Short, 10_000.0, 0.60);

        match outcome {
            EntryOutcome::Reversed {
                closed,
                realized_delta,
                opened,
            } => {
                assert!((realized_delta - 2500.0).abs() < 1e-6);
                assert_eq!(closed.status, PositionStatus::Closed);
                assert_eq!(opened.side, Side::Short);
                assert_eq!(opened.quantity, 10_000.0);
                assert!((opened.entry_price - 0.60).abs() < 1e-9);
            }
            other => panic!("expected Reversed, got {other:?}"),
        }

        // pos query after the reversal: unrealized 0, master +2500.
        ledger.update_price("BYND", 0.60);
        let open = ledger.get_open("BYND").unwrap();
        assert!(open.unrealized_pnl.abs() < 1e-9);
        assert!((ledger.master_pnl() - 2500.0).abs() < 1e-6);
    }

    #[test]
    fn short_reversal_sign() {
        let ledger = PositionLedger::new();
        ledger.enter("TSLA", Side::Short, 10.0, 100.0);
        let outcome = ledger.enter("TSLA", Side::Long, 10.0, 95.0);
        match outcome {
            EntryOutcome::Reversed { realized_delta, .. } => {
                // Short from 100 covered at 95: +5 * 10 = +50.
                assert!((realized_delta - 50.0).abs() < 1e-9);
            }
            other => panic!("expected Reversed, got {other:?}"),
        }
    }

    #[test]
    fn partial_close_accumulates_and_final_chunk_seals() {
        let ledger = PositionLedger::new();
        ledger.enter("BYND", Side::Long, 3000.0, 1.00);

        let (d1, pos) = ledger.partial_close("BYND", 1000.0, 1.01).unwrap();
        assert!((d1 - 10.0).abs() < 1e-9);
        assert_eq!(pos.quantity, 2000.0);
        assert_eq!(pos.status, PositionStatus::Open);

        let (d2, _) = ledger.partial_close("BYND", 1000.0, 1.02).unwrap();
        assert!((d2 - 20.0).abs() < 1e-9);

        let (d3, sealed) = ledger.partial_close("BYND", 1000.0, 1.03).unwrap();
        assert!((d3 - 30.0).abs() < 1e-9);
        assert_eq!(sealed.status, PositionStatus::Closed);
        assert!((sealed.realized_pnl_cum - 60.0).abs() < 1e-9);
        assert!(ledger.get_open("BYND").is_none());
        assert!((ledger.master_pnl() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn master_pnl_nonzero_after_full_close() {
        // Scenario S3: realized survives the close.
        let ledger = PositionLedger::new();
        ledger.enter("BYND", Side::Long, 9000.0, 1.00);
        ledger.close("BYND", 1.05);
        assert!(ledger.get_open("BYND").is_none());
        assert!((ledger.master_pnl() - 450.0).abs() < 1e-6);
    }

    #[test]
    fn session_reset_excludes_prior_realized() {
        let ledger = PositionLedger::new();
        ledger.enter("BYND", Side::Long, 100.0, 1.00);
        ledger.close("BYND", 2.00);
        assert!((ledger.master_pnl() - 100.0).abs() < 1e-9);

        ledger.reset_session();
        assert_eq!(ledger.master_pnl(), 0.0);
        // Historical rows preserved.
        assert_eq!(ledger.closed_positions(10).len(), 1);
    }

    #[test]
    fn at_most_one_open_position_per_symbol() {
        let ledger = PositionLedger::new();
        ledger.enter("AAPL", Side::Long, 10.0, 1.0);
        ledger.enter("AAPL", Side::Long, 10.0, 1.0);
        ledger.enter("AAPL", Side::Short, 5.0, 1.0);
        assert_eq!(ledger.open_positions().len(), 1);
    }

    #[test]
    fn master_pnl_survives_restart() {
        let db = Arc::new(Database::open_in_memory().unwrap());

        let ledger = PositionLedger::with_db(db.clone());
        let session = ledger.session_id();
        ledger.enter("BYND", Side::Long, 100.0, 1.00);
        ledger.close("BYND", 1.50);
        assert!((ledger.master_pnl() - 50.0).abs() < 1e-9);
        drop(ledger);

        // A fresh ledger over the same database resumes the session.
        let restored = PositionLedger::with_db(db);
        assert_eq!(restored.session_id(), session);
        assert!((restored.master_pnl() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn risk_levels_are_advisory() {
        let ledger = PositionLedger::new();
        ledger.enter("AAPL", Side::Long, 10.0, 100.0);
        let pos = ledger
            .set_risk_levels("AAPL", Some(98.0), Some(106.0))
            .unwrap();
        assert_eq!(pos.stop_loss, Some(98.0));
        assert_eq!(pos.target, Some(106.0));
        // Price through the stop does not auto-close.
        ledger.update_price("AAPL", 97.0);
        assert!(ledger.get_open("AAPL").is_some());
    }
}
