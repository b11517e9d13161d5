// =============================================================================
// Bar Aggregator — folds ticks into immutable 1-minute OHLCV bars
// =============================================================================
//
// One in-flight bar per symbol.  A tick for a later minute seals the current
// bar (publish on the event bus + move to the completed buffer for the
// persistence flusher) and opens a new one.  A periodic stale flush seals
// bars on illiquid symbols that stopped ticking.
//
// Invariants:
//   - at most one in-flight bar per symbol;
//   - sealed bars for a symbol have strictly increasing minute_start;
//   - a minute with no ticks produces no bar.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::bus::{topics, BusEvent, EventBus};
use crate::types::{Bar, BarSource, Tick, MINUTE_MS};

/// Seal an in-flight bar once its minute is more than this far behind wall
/// clock.
const STALE_AFTER_MS: i64 = MINUTE_MS;

pub struct BarAggregator {
    in_flight: RwLock<HashMap<String, Bar>>,
    /// Sealed bars awaiting a batched write; drained by the flusher.
    completed: Mutex<Vec<Bar>>,
    /// Last sealed minute per symbol, used to reject out-of-order ticks.
    last_sealed: RwLock<HashMap<String, i64>>,
    /// Source tag stamped on every bar this aggregator seals.
    source: BarSource,
    bus: Arc<EventBus>,
}

impl BarAggregator {
    /// `source` is [`BarSource::Live`] under a trade schema and
    /// [`BarSource::Legacy`] under a quotes-only schema (volume is 0 there).
    pub fn new(source: BarSource, bus: Arc<EventBus>) -> Self {
        Self {
            in_flight: RwLock::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            last_sealed: RwLock::new(HashMap::new()),
            source,
            bus,
        }
    }

    /// Fold one tick. Seals and publishes the previous bar when the tick
    /// opens a new minute.
    pub fn on_tick(&self, tick: &Tick) {
        let minute = Bar::align_minute(tick.event_time);

        let sealed = {
            let mut in_flight = self.in_flight.write();
            match in_flight.get_mut(&tick.symbol) {
                None => {
                    in_flight.insert(tick.symbol.clone(), self.start_bar(tick, minute));
                    None
                }
                Some(bar) if minute == bar.minute_start => {
                    bar.high = bar.high.max(tick.price);
                    bar.low = bar.low.min(tick.price);
                    bar.close = tick.price;
                    bar.volume += tick.size;
                    bar.trade_count += 1;
                    None
                }
                Some(bar) if minute > bar.minute_start => {
                    let sealed = std::mem::replace(bar, self.start_bar(tick, minute));
                    Some(sealed)
                }
                Some(bar) => {
                    // Late tick for an already-advanced minute; dropping it
                    // preserves the strictly-increasing seal order.
                    debug!(
                        symbol = %tick.symbol,
                        tick_minute = minute,
                        in_flight_minute = bar.minute_start,
                        "dropping out-of-order tick"
                    );
                    None
                }
            }
        };

        if let Some(bar) = sealed {
            self.seal(bar);
        }
    }

    fn start_bar(&self, tick: &Tick, minute: i64) -> Bar {
        Bar {
            symbol: tick.symbol.clone(),
            minute_start: minute,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size,
            trade_count: 1,
            source: self.source,
        }
    }

    /// Seal: enforce per-symbol ordering, publish, queue for persistence.
    fn seal(&self, bar: Bar) {
        {
            let mut last = self.last_sealed.write();
            if let Some(&prev) = last.get(&bar.symbol) {
                if bar.minute_start <= prev {
                    warn!(
                        symbol = %bar.symbol,
                        minute = bar.minute_start,
                        prev_sealed = prev,
                        "refusing to seal non-increasing bar"
                    );
                    return;
                }
            }
            last.insert(bar.symbol.clone(), bar.minute_start);
        }

        debug!(
            symbol = %bar.symbol,
            minute = bar.minute_start,
            close = bar.close,
            volume = bar.volume,
            "bar sealed"
        );

        self.bus
            .publish(&topics::bar(&bar.symbol), BusEvent::Bar(bar.clone()));
        self.bus
            .publish(&topics::bar_all(), BusEvent::Bar(bar.clone()));
        self.completed.lock().push(bar);
    }

    /// Seal every in-flight bar whose minute is more than one minute behind
    /// `now_ms`. Called from the aggregator's flush timer; handles symbols
    /// with no fresh ticks.
    pub fn flush_stale(&self, now_ms: i64) -> usize {
        let stale: Vec<Bar> = {
            let mut in_flight = self.in_flight.write();
            let cutoff = now_ms - STALE_AFTER_MS;
            let keys: Vec<String> = in_flight
                .iter()
                .filter(|(_, bar)| bar.minute_start < cutoff)
                .map(|(sym, _)| sym.clone())
                .collect();
            keys.iter()
                .filter_map(|sym| in_flight.remove(sym))
                .collect()
        };

        let count = stale.len();
        for bar in stale {
            self.seal(bar);
        }
        count
    }

    /// Drain sealed bars for a batched, idempotent upsert.
    pub fn take_completed(&self) -> Vec<Bar> {
        std::mem::take(&mut *self.completed.lock())
    }

    /// Number of symbols with an in-flight bar.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
