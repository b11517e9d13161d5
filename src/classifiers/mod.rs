// =============================================================================
// Classifier Engine
// =============================================================================
//
// Two independent classifiers per active symbol:
// - Murphy: structure-aware (SMC) feature extraction
// - Momo: multi-timeframe momentum with session context
//
// Per symbol, subscription spawns one worker task per classifier, each with
// its own sliding bar buffer driven by `bar.<symbol>` events. Workers are
// cooperative: one classification pass per bar, no suspension points inside
// a pass. A pass that exceeds its budget is logged and its result discarded.
//
// Publication goes through the sticky filter: publish only the first signal,
// a strictly stronger same-direction signal, or a high-conviction flip.
// Every generated signal — published or filtered — is handed to the
// evaluation recorder.

pub mod momo;
pub mod murphy;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{topics, BusEvent, EventBus};
use crate::evaluation::EvaluationRecorder;
use crate::market_data::SymbolStateStore;
use crate::types::{Bar, ClassifierKind, Direction};

pub use momo::{AccuracyTracker, MomoAction, ShadowTracker, TimePeriod, VwapZone};

/// Budget for one classification pass.
const PASS_BUDGET_MS: u128 = 200;

// =============================================================================
// Signal
// =============================================================================

/// A classifier emission. Every generation is recorded; `displayed` marks the
/// ones that survived the sticky publication filter.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    /// Ordinal of the driving bar within the worker's stream.
    pub bar_index: u64,
    /// Epoch milliseconds.
    pub emit_time: i64,
    pub classifier: ClassifierKind,
    pub direction: Direction,
    /// Murphy 0..=4, Momo 0..=7.
    pub stars: u8,
    pub grade: u8,
    pub confidence: f64,
    pub features: serde_json::Value,
    pub level_price: Option<f64>,
    pub displayed: bool,
    pub filter_reason: Option<String>,
}

// =============================================================================
// Sticky publication filter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct StickySnapshot {
    direction: Direction,
    stars: u8,
    grade: u8,
}

/// Per (symbol, classifier) cell holding the last published signal. Cleared
/// on symbol unsubscribe.
#[derive(Default)]
pub struct StickyFilter {
    last: Mutex<HashMap<(String, ClassifierKind), StickySnapshot>>,
}

/// Outcome of the sticky check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StickyDecision {
    Publish,
    Suppress(&'static str),
}

impl StickyFilter {
    /// Publish iff: first signal for the symbol, OR same direction and
    /// strictly stronger (higher grade or more stars), OR an opposite
    /// direction with grade >= 7 or stars >= 3.
    pub fn decide(
        &self,
        symbol: &str,
        classifier: ClassifierKind,
        direction: Direction,
        stars: u8,
        grade: u8,
    ) -> StickyDecision {
        let key = (symbol.to_string(), classifier);
        let mut last = self.last.lock();

        let decision = match last.get(&key) {
            None => StickyDecision::Publish,
            Some(prev) if prev.direction == direction => {
                if grade > prev.grade || stars > prev.stars {
                    StickyDecision::Publish
                } else {
                    StickyDecision::Suppress("same direction not stronger")
                }
            }
            Some(_) => {
                if grade >= 7 || stars >= 3 {
                    StickyDecision::Publish
                } else {
                    StickyDecision::Suppress("flip below conviction gate")
                }
            }
        };

        if decision == StickyDecision::Publish {
            last.insert(
                key,
                StickySnapshot {
                    direction,
                    stars,
                    grade,
                },
            );
        }
        decision
    }

    /// Drop the sticky cells for a symbol (both classifiers).
    pub fn clear_symbol(&self, symbol: &str) {
        self.last.lock().retain(|(sym, _), _| sym != symbol);
    }
}

// =============================================================================
// Engine
// =============================================================================

struct SymbolWorkers {
    murphy: JoinHandle<()>,
    momo: JoinHandle<()>,
}

/// Owns the per-symbol classifier workers.
pub struct ClassifierEngine {
    bus: Arc<EventBus>,
    store: Arc<SymbolStateStore>,
    evaluation: Arc<EvaluationRecorder>,
    accuracy: Arc<AccuracyTracker>,
    sticky: Arc<StickyFilter>,
    warmup_bars: usize,
    history_bars: usize,
    workers: Mutex<HashMap<String, SymbolWorkers>>,
}

impl ClassifierEngine {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<SymbolStateStore>,
        evaluation: Arc<EvaluationRecorder>,
        accuracy: Arc<AccuracyTracker>,
        warmup_bars: usize,
        history_bars: usize,
    ) -> Self {
        Self {
            bus,
            store,
            evaluation,
            accuracy,
            sticky: Arc::new(StickyFilter::default()),
            warmup_bars,
            history_bars,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn both classifier workers for a symbol. Idempotent.
    pub fn subscribe_symbol(&self, symbol: &str) {
        let mut workers = self.workers.lock();
        if workers.contains_key(symbol) {
            return;
        }

        info!(symbol, "classifier workers starting");

        let murphy = tokio::spawn(run_murphy_worker(
            symbol.to_string(),
            self.bus.clone(),
            self.evaluation.clone(),
            self.sticky.clone(),
            self.warmup_bars,
            self.history_bars,
        ));
        let momo = tokio::spawn(run_momo_worker(
            symbol.to_string(),
            self.bus.clone(),
            self.store.clone(),
            self.evaluation.clone(),
            self.accuracy.clone(),
            self.sticky.clone(),
            self.warmup_bars,
            self.history_bars,
        ));

        workers.insert(symbol.to_string(), SymbolWorkers { murphy, momo });
    }

    /// Tear down both workers; in-flight work is cancelled at the next bar
    /// boundary (the only await point). Clears the sticky cells.
    pub fn unsubscribe_symbol(&self, symbol: &str) {
        if let Some(handles) = self.workers.lock().remove(symbol) {
            handles.murphy.abort();
            handles.momo.abort();
            self.sticky.clear_symbol(symbol);
            info!(symbol, "classifier workers stopped");
        }
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }
}

// =============================================================================
// Workers
// =============================================================================

fn push_bar(buffer: &mut VecDeque<Bar>, bar: Bar, cap: usize) {
    buffer.push_back(bar);
    while buffer.len() > cap {
        buffer.pop_front();
    }
}

/// Finalize a candidate through the sticky filter, publish when displayed,
/// and record unconditionally.
#[allow(clippy::too_many_arguments)]
fn emit_signal(
    bus: &EventBus,
    evaluation: &EvaluationRecorder,
    sticky: &StickyFilter,
    symbol: &str,
    classifier: ClassifierKind,
    bar_index: u64,
    emit_time: i64,
    direction: Direction,
    stars: u8,
    grade: u8,
    confidence: f64,
    features: serde_json::Value,
    level_price: Option<f64>,
) {
    let decision = sticky.decide(symbol, classifier, direction, stars, grade);
    let (displayed, filter_reason) = match decision {
        StickyDecision::Publish => (true, None),
        StickyDecision::Suppress(reason) => (false, Some(reason.to_string())),
    };

    let signal = Signal {
        id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        bar_index,
        emit_time,
        classifier,
        direction,
        stars,
        grade,
        confidence,
        features,
        level_price,
        displayed,
        filter_reason,
    };

    if signal.displayed {
        debug!(
            symbol,
            classifier = %classifier,
            direction = %direction,
            stars,
            grade,
            "signal published"
        );
        bus.publish(
            &topics::signal(classifier, symbol),
            BusEvent::Signal(signal.clone()),
        );
    }

    evaluation.record(signal);
}

async fn run_murphy_worker(
    symbol: String,
    bus: Arc<EventBus>,
    evaluation: Arc<EvaluationRecorder>,
    sticky: Arc<StickyFilter>,
    warmup: usize,
    history: usize,
) {
    let mut sub = bus.subscribe(&topics::bar(&symbol));
    let mut buffer: VecDeque<Bar> = VecDeque::with_capacity(history + 1);
    let mut bar_index: u64 = 0;

    while let Some(event) = sub.recv().await {
        let BusEvent::Bar(bar) = event else { continue };
        push_bar(&mut buffer, bar, history);
        bar_index += 1;

        if buffer.len() < warmup {
            continue;
        }

        let started = Instant::now();
        let bars: Vec<Bar> = buffer.iter().cloned().collect();
        let outcome = murphy::classify(&bars, None);
        if started.elapsed().as_millis() > PASS_BUDGET_MS {
            warn!(
                symbol = %symbol,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "murphy pass over budget — result discarded"
            );
            continue;
        }

        let emit_time = chrono::Utc::now().timestamp_millis();
        let features = serde_json::to_value(&outcome.features)
            .unwrap_or(serde_json::Value::Null);
        emit_signal(
            &bus,
            &evaluation,
            &sticky,
            &symbol,
            ClassifierKind::Murphy,
            bar_index,
            emit_time,
            outcome.direction,
            outcome.stars,
            outcome.grade,
            outcome.confidence,
            features,
            outcome.level_price,
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_momo_worker(
    symbol: String,
    bus: Arc<EventBus>,
    store: Arc<SymbolStateStore>,
    evaluation: Arc<EvaluationRecorder>,
    accuracy: Arc<AccuracyTracker>,
    sticky: Arc<StickyFilter>,
    warmup: usize,
    history: usize,
) {
    let mut sub = bus.subscribe(&topics::bar(&symbol));
    let mut buffer: VecDeque<Bar> = VecDeque::with_capacity(history + 1);
    let mut shadow = ShadowTracker::default();
    let mut bar_index: u64 = 0;

    while let Some(event) = sub.recv().await {
        let BusEvent::Bar(bar) = event else { continue };
        push_bar(&mut buffer, bar, history);
        bar_index += 1;

        if buffer.len() < warmup {
            continue;
        }
        let Some(state) = store.get(&symbol) else {
            continue;
        };

        let started = Instant::now();
        // Volume-normalized features exclude legacy (volume-less) bars.
        let bars: Vec<Bar> = buffer
            .iter()
            .filter(|b| b.source != crate::types::BarSource::Legacy)
            .cloned()
            .collect();
        let bars = if bars.len() >= warmup {
            bars
        } else {
            buffer.iter().cloned().collect()
        };
        let outcome = momo::classify(&state, &bars, &mut shadow, &accuracy);
        if started.elapsed().as_millis() > PASS_BUDGET_MS {
            warn!(
                symbol = %symbol,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "momo pass over budget — result discarded"
            );
            continue;
        }

        let emit_time = chrono::Utc::now().timestamp_millis();
        let features = serde_json::json!({
            "action": outcome.action,
            "vwap_zone": outcome.vwap_zone,
            "vwap_distance_pct": outcome.vwap_distance_pct,
            "period": outcome.period.as_str(),
            "timeframes": outcome.timeframes,
            "legs": outcome.legs,
            "shadow_support": outcome.shadow_support,
            "reversal_reason": outcome.reversal_reason,
        });
        emit_signal(
            &bus,
            &evaluation,
            &sticky,
            &symbol,
            ClassifierKind::Momo,
            bar_index,
            emit_time,
            outcome.direction,
            outcome.stars,
            outcome.grade,
            outcome.confidence,
            features,
            None,
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_filter_scenario_s4() {
        // A=(up,2,6) publish; B=(up,2,6) suppress; C=(up,3,7) publish;
        // D=(down,4,8) publish.
        let sticky = StickyFilter::default();
        let decide = |dir, stars, grade| {
            sticky.decide("BYND", ClassifierKind::Murphy, dir, stars, grade)
        };

        assert_eq!(decide(Direction::Up, 2, 6), StickyDecision::Publish);
        assert_eq!(
            decide(Direction::Up, 2, 6),
            StickyDecision::Suppress("same direction not stronger")
        );
        assert_eq!(decide(Direction::Up, 3, 7), StickyDecision::Publish);
        assert_eq!(decide(Direction::Down, 4, 8), StickyDecision::Publish);
    }

    #[test]
    fn sticky_flip_requires_conviction() {
        let sticky = StickyFilter::default();
        let decide = |dir, stars, grade| {
            sticky.decide("AAPL", ClassifierKind::Momo, dir, stars, grade)
        };

        assert_eq!(decide(Direction::Up, 3, 8), StickyDecision::Publish);
        // Weak flip: suppressed.
        assert_eq!(
            decide(Direction::Down, 1, 4),
            StickyDecision::Suppress("flip below conviction gate")
        );
        // stars >= 3 clears the gate even at a low grade.
        assert_eq!(decide(Direction::Down, 3, 4), StickyDecision::Publish);
    }

    #[test]
    fn sticky_published_sequence_is_monotone_per_direction() {
        // Two consecutive same-direction publishes must have grade2>grade1
        // or stars2>stars1.
        let sticky = StickyFilter::default();
        let mut published: Vec<(u8, u8)> = Vec::new();
        let attempts = [(1u8, 3u8), (1, 3), (2, 3), (2, 5), (1, 2), (3, 9)];
        for (stars, grade) in attempts {
            if sticky.decide("X", ClassifierKind::Murphy, Direction::Up, stars, grade)
                == StickyDecision::Publish
            {
                published.push((stars, grade));
            }
        }
        for pair in published.windows(2) {
            let (s1, g1) = pair[0];
            let (s2, g2) = pair[1];
            assert!(g2 > g1 || s2 > s1, "non-monotone publish: {pair:?}");
        }
    }

    #[test]
    fn sticky_cells_are_per_symbol_and_classifier() {
        let sticky = StickyFilter::default();
        assert_eq!(
            sticky.decide("A", ClassifierKind::Murphy, Direction::Up, 2, 6),
            StickyDecision::Publish
        );
        // Different symbol: fresh cell.
        assert_eq!(
            sticky.decide("B", ClassifierKind::Murphy, Direction::Up, 2, 6),
            StickyDecision::Publish
        );
        // Same symbol, other classifier: fresh cell.
        assert_eq!(
            sticky.decide("A", ClassifierKind::Momo, Direction::Up, 2, 6),
            StickyDecision::Publish
        );

        sticky.clear_symbol("A");
        assert_eq!(
            sticky.decide("A", ClassifierKind::Murphy, Direction::Up, 2, 6),
            StickyDecision::Publish
        );
    }
}
