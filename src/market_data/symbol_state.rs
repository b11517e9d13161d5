// =============================================================================
// Symbol State Store — per-symbol real-time screening state
// =============================================================================
//
// One row per symbol, created on the first event and updated on every event:
// last price/quote, multi-window percent-move baselines, high/low of day, and
// a persistence tier derived from the magnitude of the move off yesterday's
// close.  The in-memory map is authoritative; the database is a read-through
// snapshot maintained by the tier flusher.
//
// Write discipline: `on_event` is called only from the store's ingest task
// (single writer).  Readers take point-in-time clones.
// =============================================================================

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::MINUTE_MS;

/// Window lengths for the rolling percent-move baselines, in milliseconds.
const WINDOW_1M_MS: i64 = MINUTE_MS;
const WINDOW_5M_MS: i64 = 5 * MINUTE_MS;
const WINDOW_15M_MS: i64 = 15 * MINUTE_MS;

// =============================================================================
// SymbolState
// =============================================================================

/// Hot per-symbol state used for screening, the UI snapshot, and classifier
/// context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    pub last_price: f64,
    pub last_bid: Option<f64>,
    pub last_ask: Option<f64>,
    /// Epoch milliseconds of the most recent event.
    pub last_update: i64,

    /// Previous session close, if known. Percent-from-yesterday and tiering
    /// stay unset until this arrives.
    pub yesterday_close: Option<f64>,
    /// First price seen this session.
    pub today_open: f64,

    pub price_1m_ago: f64,
    pub snapshot_ts_1m: i64,
    pub price_5m_ago: f64,
    pub snapshot_ts_5m: i64,
    pub price_15m_ago: f64,
    pub snapshot_ts_15m: i64,

    pub pct_from_yesterday: Option<f64>,
    pub pct_from_open: f64,
    pub pct_from_1m: f64,
    pub pct_from_5m: f64,
    pub pct_from_15m: f64,

    pub hod_price: f64,
    pub hod_ts: i64,
    pub lod_price: f64,
    pub lod_ts: i64,

    /// (ask - bid) / mid, when a quote is available.
    pub spread_pct: Option<f64>,

    /// Persistence tier 1..=4 by |pct_from_yesterday| (1 = hottest), 0 when
    /// the move is under 1% or yesterday's close is unknown.
    pub tier: u8,
}

impl SymbolState {
    fn new(symbol: &str, ts: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_price: price,
            last_bid: None,
            last_ask: None,
            last_update: ts,
            yesterday_close: None,
            today_open: price,
            price_1m_ago: price,
            snapshot_ts_1m: ts,
            price_5m_ago: price,
            snapshot_ts_5m: ts,
            price_15m_ago: price,
            snapshot_ts_15m: ts,
            pct_from_yesterday: None,
            pct_from_open: 0.0,
            pct_from_1m: 0.0,
            pct_from_5m: 0.0,
            pct_from_15m: 0.0,
            hod_price: price,
            hod_ts: ts,
            lod_price: price,
            lod_ts: ts,
            spread_pct: None,
            tier: 0,
        }
    }

    /// Tier by magnitude of the move off yesterday's close.
    fn compute_tier(pct_from_yesterday: Option<f64>) -> u8 {
        match pct_from_yesterday {
            Some(pct) => {
                let mag = pct.abs();
                if mag >= 0.20 {
                    1
                } else if mag >= 0.10 {
                    2
                } else if mag >= 0.05 {
                    3
                } else if mag >= 0.01 {
                    4
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

// =============================================================================
// Leaderboard metrics
// =============================================================================

/// Metric used by `query_top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopMetric {
    PctFromYesterday,
    PctFromOpen,
    PctFrom15m,
    SpreadPct,
}

impl TopMetric {
    fn value(&self, state: &SymbolState) -> f64 {
        match self {
            Self::PctFromYesterday => state.pct_from_yesterday.unwrap_or(0.0).abs(),
            Self::PctFromOpen => state.pct_from_open.abs(),
            Self::PctFrom15m => state.pct_from_15m.abs(),
            Self::SpreadPct => state.spread_pct.unwrap_or(0.0),
        }
    }
}

// =============================================================================
// SymbolStateStore
// =============================================================================

/// Process-wide map of per-symbol state. Shared via `Arc`.
pub struct SymbolStateStore {
    states: RwLock<HashMap<String, SymbolState>>,
    /// Symbols with unsaved changes, tagged with the tier at dirty time. The
    /// flusher drains these per tier.
    dirty: Mutex<HashMap<String, u8>>,
}

impl SymbolStateStore {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
        }
    }

    /// Install the previous session close for a symbol (bootstrap, or a late
    /// mapping message carrying reference data).
    pub fn set_yesterday_close(&self, symbol: &str, close: f64) {
        if close <= 0.0 {
            return;
        }
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(symbol) {
            state.yesterday_close = Some(close);
            if state.last_price > 0.0 {
                state.pct_from_yesterday = Some((state.last_price - close) / close);
                state.tier = SymbolState::compute_tier(state.pct_from_yesterday);
            }
        } else {
            let mut state = SymbolState::new(symbol, 0, 0.0);
            state.yesterday_close = Some(close);
            states.insert(symbol.to_string(), state);
        }
    }

    /// O(1) update from a single price event. Returns a snapshot of the row
    /// after the update (consumed by the alert screener).
    pub fn on_event(
        &self,
        symbol: &str,
        ts: i64,
        price: f64,
        bid: Option<f64>,
        ask: Option<f64>,
    ) -> SymbolState {
        let mut states = self.states.write();
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(symbol, ts, price));

        // A row pre-seeded by set_yesterday_close has no prices yet.
        if state.last_price <= 0.0 {
            state.today_open = price;
            state.price_1m_ago = price;
            state.snapshot_ts_1m = ts;
            state.price_5m_ago = price;
            state.snapshot_ts_5m = ts;
            state.price_15m_ago = price;
            state.snapshot_ts_15m = ts;
            state.hod_price = price;
            state.hod_ts = ts;
            state.lod_price = price;
            state.lod_ts = ts;
        }

        state.last_price = price;
        state.last_update = ts;

        if let (Some(b), Some(a)) = (bid, ask) {
            state.last_bid = Some(b);
            state.last_ask = Some(a);
            let mid = (a + b) / 2.0;
            if mid > 0.0 {
                state.spread_pct = Some((a - b) / mid);
            }
        }

        if let Some(yc) = state.yesterday_close {
            state.pct_from_yesterday = Some((price - yc) / yc);
        }
        if state.today_open > 0.0 {
            state.pct_from_open = (price - state.today_open) / state.today_open;
        }

        // Rolling window baselines: refresh each baseline once its snapshot
        // is older than the window, then measure against it.
        if ts.saturating_sub(state.snapshot_ts_1m) >= WINDOW_1M_MS {
            state.price_1m_ago = price;
            state.snapshot_ts_1m = ts;
        }
        if ts.saturating_sub(state.snapshot_ts_5m) >= WINDOW_5M_MS {
            state.price_5m_ago = price;
            state.snapshot_ts_5m = ts;
        }
        if ts.saturating_sub(state.snapshot_ts_15m) >= WINDOW_15M_MS {
            state.price_15m_ago = price;
            state.snapshot_ts_15m = ts;
        }
        if state.price_1m_ago > 0.0 {
            state.pct_from_1m = (price - state.price_1m_ago) / state.price_1m_ago;
        }
        if state.price_5m_ago > 0.0 {
            state.pct_from_5m = (price - state.price_5m_ago) / state.price_5m_ago;
        }
        if state.price_15m_ago > 0.0 {
            state.pct_from_15m = (price - state.price_15m_ago) / state.price_15m_ago;
        }

        if price > state.hod_price {
            state.hod_price = price;
            state.hod_ts = ts;
        }
        if price < state.lod_price || state.lod_price <= 0.0 {
            state.lod_price = price;
            state.lod_ts = ts;
        }

        state.tier = SymbolState::compute_tier(state.pct_from_yesterday);

        let snapshot = state.clone();
        drop(states);

        self.dirty.lock().insert(symbol.to_string(), snapshot.tier);
        snapshot
    }

    /// Point-in-time copy of one symbol's state.
    pub fn get(&self, symbol: &str) -> Option<SymbolState> {
        self.states.read().get(symbol).cloned()
    }

    /// Last trade price, 0.0 when the symbol is unknown.
    pub fn last_price(&self, symbol: &str) -> f64 {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.last_price)
            .unwrap_or(0.0)
    }

    /// Leaderboard: the `n` symbols with the largest `metric` magnitude,
    /// descending.
    pub fn query_top(&self, metric: TopMetric, n: usize) -> Vec<SymbolState> {
        let states = self.states.read();
        let mut rows: Vec<SymbolState> = states.values().cloned().collect();
        rows.sort_by(|a, b| {
            metric
                .value(b)
                .partial_cmp(&metric.value(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(n);
        rows
    }

    /// Drain dirty rows belonging to `tier` and return their snapshots for
    /// persistence. Rows dirtied again after this call are picked up on the
    /// next cycle.
    pub fn take_dirty(&self, tier: u8) -> Vec<SymbolState> {
        let symbols: Vec<String> = {
            let mut dirty = self.dirty.lock();
            let picked: Vec<String> = dirty
                .iter()
                .filter(|(_, t)| **t == tier)
                .map(|(s, _)| s.clone())
                .collect();
            for s in &picked {
                dirty.remove(s);
            }
            picked
        };

        let states = self.states.read();
        symbols
            .iter()
            .filter_map(|s| states.get(s).cloned())
            .collect()
    }

    /// Drain every dirty row regardless of tier (shutdown flush).
    pub fn take_all_dirty(&self) -> Vec<SymbolState> {
        let symbols: Vec<String> = self.dirty.lock().drain().map(|(s, _)| s).collect();
        let states = self.states.read();
        symbols
            .iter()
            .filter_map(|s| states.get(s).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl Default for SymbolStateStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_creates_row_with_today_open() {
        let store = SymbolStateStore::new();
        let state = store.on_event("BYND", 1_000, 0.55, None, None);
        assert_eq!(state.today_open, 0.55);
        assert_eq!(state.last_price, 0.55);
        assert_eq!(state.tier, 0);
        assert!(state.pct_from_yesterday.is_none());
    }

    #[test]
    fn pct_from_yesterday_and_tier() {
        let store = SymbolStateStore::new();
        store.on_event("BYND", 1_000, 0.55, None, None);
        store.set_yesterday_close("BYND", 0.50);

        // +10% -> tier 2
        let state = store.on_event("BYND", 2_000, 0.55, None, None);
        let pct = state.pct_from_yesterday.unwrap();
        assert!((pct - 0.10).abs() < 1e-9);
        assert_eq!(state.tier, 2);

        // +22% -> tier 1
        let state = store.on_event("BYND", 3_000, 0.61, None, None);
        assert_eq!(state.tier, 1);

        // +2% -> tier 4
        let state = store.on_event("BYND", 4_000, 0.51, None, None);
        assert_eq!(state.tier, 4);

        // +0.2% -> tier 0
        let state = store.on_event("BYND", 5_000, 0.501, None, None);
        assert_eq!(state.tier, 0);
    }

    #[test]
    fn hod_lod_tracking() {
        let store = SymbolStateStore::new();
        store.on_event("AAPL", 1_000, 100.0, None, None);
        store.on_event("AAPL", 2_000, 105.0, None, None);
        store.on_event("AAPL", 3_000, 98.0, None, None);
        let state = store.on_event("AAPL", 4_000, 101.0, None, None);

        assert_eq!(state.hod_price, 105.0);
        assert_eq!(state.hod_ts, 2_000);
        assert_eq!(state.lod_price, 98.0);
        assert_eq!(state.lod_ts, 3_000);
    }

    #[test]
    fn window_baseline_refresh() {
        let store = SymbolStateStore::new();
        store.on_event("TSLA", 0, 100.0, None, None);

        // Within the 1m window the baseline stays put.
        let state = store.on_event("TSLA", 30_000, 102.0, None, None);
        assert_eq!(state.price_1m_ago, 100.0);
        assert!((state.pct_from_1m - 0.02).abs() < 1e-9);

        // After 60s the baseline refreshes to the current price.
        let state = store.on_event("TSLA", 61_000, 104.0, None, None);
        assert_eq!(state.price_1m_ago, 104.0);
        assert_eq!(state.pct_from_1m, 0.0);
        // 5m baseline still the original.
        assert_eq!(state.price_5m_ago, 100.0);
    }

    #[test]
    fn spread_pct_from_quote() {
        let store = SymbolStateStore::new();
        let state = store.on_event("AAPL", 1_000, 100.0, Some(99.0), Some(101.0));
        let spread = state.spread_pct.unwrap();
        assert!((spread - 0.02).abs() < 1e-9);
    }

    #[test]
    fn query_top_orders_by_magnitude() {
        let store = SymbolStateStore::new();
        for (sym, yc, price) in [("A", 10.0, 12.0), ("B", 10.0, 10.5), ("C", 10.0, 8.0)] {
            store.on_event(sym, 1_000, price, None, None);
            store.set_yesterday_close(sym, yc);
            store.on_event(sym, 2_000, price, None, None);
        }

        let top = store.query_top(TopMetric::PctFromYesterday, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].symbol, "A"); // +20%
        assert_eq!(top[1].symbol, "C"); // -20%
    }

    #[test]
    fn take_dirty_drains_by_tier() {
        let store = SymbolStateStore::new();
        store.on_event("HOT", 1_000, 12.0, None, None);
        store.set_yesterday_close("HOT", 10.0);
        store.on_event("HOT", 2_000, 12.0, None, None); // +20% -> tier 1
        store.on_event("QUIET", 1_000, 10.0, None, None); // tier 0

        let tier1 = store.take_dirty(1);
        assert_eq!(tier1.len(), 1);
        assert_eq!(tier1[0].symbol, "HOT");

        // Already drained.
        assert!(store.take_dirty(1).is_empty());

        let tier0 = store.take_dirty(0);
        assert_eq!(tier0.len(), 1);
        assert_eq!(tier0[0].symbol, "QUIET");
    }
}
