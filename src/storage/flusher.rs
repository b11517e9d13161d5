// =============================================================================
// Persistence Flusher — tier-priority batched writes to SQLite
// =============================================================================
//
// Two timer-driven loops, spawned once at engine startup:
//
//   run_state_flusher — drains dirty symbol-state rows per tier, hottest
//     tier first (tier 1 every 5s … tier 0 every 600s by default), and
//     upserts them in one transaction per tier.
//
//   run_bar_flusher — every bar-flush interval, seals stale in-flight bars
//     and upserts the completed-bar buffer.
//
// Database errors never propagate: failed batches are carried over and
// retried on the next cycle.  In-memory state is authoritative throughout.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::market_data::{BarAggregator, SymbolState, SymbolStateStore};
use crate::storage::db::Database;
use crate::types::Bar;

/// Tiers in drain-priority order: hottest first, tier 0 last.
const TIER_PRIORITY: [u8; 5] = [1, 2, 3, 4, 0];

/// Run the symbol-state flusher. `tier_intervals` is indexed by tier 0..=4.
pub async fn run_state_flusher(
    store: Arc<SymbolStateStore>,
    db: Arc<Database>,
    tier_intervals: [u64; 5],
) {
    info!(?tier_intervals, "state flusher started");

    let mut ticker = interval(Duration::from_secs(1));
    let mut elapsed: u64 = 0;
    // Rows whose write failed, retried next cycle.
    let mut carryover: Vec<SymbolState> = Vec::new();

    loop {
        ticker.tick().await;
        elapsed += 1;

        let mut batch: Vec<SymbolState> = std::mem::take(&mut carryover);
        for &tier in TIER_PRIORITY.iter() {
            let every = tier_intervals[tier as usize].max(1);
            if elapsed % every == 0 {
                batch.extend(store.take_dirty(tier));
            }
        }

        if batch.is_empty() {
            continue;
        }

        match db.upsert_symbol_states(&batch) {
            Ok(n) => debug!(rows = n, "symbol state flushed"),
            Err(e) => {
                warn!(rows = batch.len(), error = %e, "state flush failed — retrying next cycle");
                carryover = batch;
            }
        }
    }
}

/// Run the bar flusher: seal stale in-flight bars and persist sealed bars.
pub async fn run_bar_flusher(
    aggregator: Arc<BarAggregator>,
    db: Arc<Database>,
    flush_interval_seconds: u64,
) {
    info!(interval_secs = flush_interval_seconds, "bar flusher started");

    let mut ticker = interval(Duration::from_secs(flush_interval_seconds.max(1)));
    let mut carryover: Vec<Bar> = Vec::new();

    loop {
        ticker.tick().await;

        let stale = aggregator.flush_stale(Utc::now().timestamp_millis());
        if stale > 0 {
            debug!(count = stale, "stale in-flight bars sealed");
        }

        let mut batch = std::mem::take(&mut carryover);
        batch.extend(aggregator.take_completed());
        if batch.is_empty() {
            continue;
        }

        match db.upsert_bars(&batch) {
            Ok(n) => debug!(rows = n, "bars flushed"),
            Err(e) => {
                warn!(rows = batch.len(), error = %e, "bar flush failed — retrying next cycle");
                carryover = batch;
            }
        }
    }
}

/// Final synchronous flush on shutdown: every dirty state row and every
/// sealed bar, best-effort.
pub fn flush_all_now(
    store: &SymbolStateStore,
    aggregator: &BarAggregator,
    db: &Database,
) {
    let states = store.take_all_dirty();
    if !states.is_empty() {
        match db.upsert_symbol_states(&states) {
            Ok(n) => info!(rows = n, "final state flush"),
            Err(e) => warn!(error = %e, "final state flush failed"),
        }
    }

    aggregator.flush_stale(Utc::now().timestamp_millis() + 10 * crate::types::MINUTE_MS);
    let bars = aggregator.take_completed();
    if !bars.is_empty() {
        match db.upsert_bars(&bars) {
            Ok(n) => info!(rows = n, "final bar flush"),
            Err(e) => warn!(error = %e, "final bar flush failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::types::{BarSource, Tick, TickKind};

    #[test]
    fn final_flush_persists_everything() {
        let store = SymbolStateStore::new();
        let bus = Arc::new(EventBus::new(16));
        let agg = BarAggregator::new(BarSource::Live, bus);
        let db = Database::open_in_memory().unwrap();

        store.on_event("AAPL", 1_000, 100.0, None, None);
        agg.on_tick(&Tick {
            symbol: "AAPL".into(),
            event_time: 60_000,
            price: 100.0,
            size: 10.0,
            bid: None,
            ask: None,
            kind: TickKind::Trade,
        });

        flush_all_now(&store, &agg, &db);

        // The in-flight bar was force-sealed and written.
        let bars = db.query_bars("AAPL", 0, i64::MAX, false).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].minute_start, 60_000);
        // Nothing left dirty.
        assert!(store.take_all_dirty().is_empty());
    }
}
