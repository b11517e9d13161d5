// =============================================================================
// Evaluation Recorder — forward scoring of every generated signal
// =============================================================================
//
// Every signal from either classifier (displayed or filtered) is persisted
// and scheduled for evaluation at the configured forward horizons (2m, 5m,
// 10m, 30m by default).  At each horizon the recorder reads the symbol
// store's last price and judges the call:
//
//   bullish correct  if (price_H - price_emit) / price_emit >= +threshold
//   bearish correct  if                      ... <= -threshold
//   otherwise        neutral — counted as not-correct, never as wrong
//
// `final_correct` is set at the longest horizon. A horizon missed by more
// than twice the scan interval is marked skipped rather than judged late.
// A test session aggregates the running metrics for later analysis.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifiers::{momo::TimePeriod, AccuracyTracker, Signal};
use crate::market_data::SymbolStateStore;
use crate::storage::db::Database;
use crate::types::{ClassifierKind, Direction};

/// Scan cadence of the background evaluator.
pub const SCAN_INTERVAL_SECS: u64 = 10;

/// A horizon this late is skipped, not judged.
const STALE_AFTER_MS: i64 = 2 * SCAN_INTERVAL_SECS as i64 * 1000;

// =============================================================================
// Judgement
// =============================================================================

/// Outcome of judging one horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    Incorrect,
    /// Move stayed inside the threshold band (or the call was neutral).
    Neutral,
}

/// Pure judgement of a price move against a directional call.
pub fn judge(direction: Direction, emit_price: f64, horizon_price: f64, threshold: f64) -> Verdict {
    if emit_price <= 0.0 {
        return Verdict::Neutral;
    }
    let pct = (horizon_price - emit_price) / emit_price;
    match direction {
        Direction::Up => {
            if pct >= threshold {
                Verdict::Correct
            } else if pct <= -threshold {
                Verdict::Incorrect
            } else {
                Verdict::Neutral
            }
        }
        Direction::Down => {
            if pct <= -threshold {
                Verdict::Correct
            } else if pct >= threshold {
                Verdict::Incorrect
            } else {
                Verdict::Neutral
            }
        }
        Direction::Neutral => Verdict::Neutral,
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Running aggregates over everything the recorder has seen.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EvalMetrics {
    pub generated: u64,
    pub displayed: u64,
    pub filtered: u64,

    pub up_total: u64,
    pub up_correct: u64,
    pub down_total: u64,
    pub down_correct: u64,

    /// Indexed by horizon position (0 = shortest).
    pub horizon_total: [u64; 4],
    pub horizon_correct: [u64; 4],

    pub displayed_evaluated: u64,
    pub displayed_correct: u64,
    pub filtered_evaluated: u64,
    pub filtered_correct: u64,
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

impl EvalMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "generated": self.generated,
            "displayed": self.displayed,
            "filtered": self.filtered,
            "accuracy_up": ratio(self.up_correct, self.up_total),
            "accuracy_down": ratio(self.down_correct, self.down_total),
            "accuracy_by_horizon": (0..4)
                .map(|i| ratio(self.horizon_correct[i], self.horizon_total[i]))
                .collect::<Vec<_>>(),
            "accuracy_displayed": ratio(self.displayed_correct, self.displayed_evaluated),
            "accuracy_filtered": ratio(self.filtered_correct, self.filtered_evaluated),
        })
    }
}

// =============================================================================
// Pending bookkeeping
// =============================================================================

#[derive(Debug, Clone)]
struct PendingSignal {
    signal_id: String,
    symbol: String,
    classifier: ClassifierKind,
    direction: Direction,
    displayed: bool,
    emit_time: i64,
    emit_price: f64,
    period: TimePeriod,
    /// Next horizon to evaluate, index into `horizons_ms`.
    next_horizon: usize,
}

struct ActiveTestSession {
    id: String,
    symbol: String,
}

// =============================================================================
// Recorder
// =============================================================================

pub struct EvaluationRecorder {
    store: Arc<SymbolStateStore>,
    accuracy: Arc<AccuracyTracker>,
    db: Option<Arc<Database>>,
    horizons_ms: Vec<i64>,
    move_threshold: f64,
    pending: Mutex<Vec<PendingSignal>>,
    metrics: Mutex<EvalMetrics>,
    test_session: Mutex<Option<ActiveTestSession>>,
}

impl EvaluationRecorder {
    pub fn new(
        store: Arc<SymbolStateStore>,
        accuracy: Arc<AccuracyTracker>,
        db: Option<Arc<Database>>,
        horizons_seconds: &[u64],
        move_threshold: f64,
    ) -> Self {
        Self {
            store,
            accuracy,
            db,
            horizons_ms: horizons_seconds.iter().map(|s| *s as i64 * 1000).collect(),
            move_threshold,
            pending: Mutex::new(Vec::new()),
            metrics: Mutex::new(EvalMetrics::default()),
            test_session: Mutex::new(None),
        }
    }

    /// Record one generated signal and schedule its forward evaluations.
    pub fn record(&self, signal: Signal) {
        {
            let mut metrics = self.metrics.lock();
            metrics.generated += 1;
            if signal.displayed {
                metrics.displayed += 1;
            } else {
                metrics.filtered += 1;
            }
        }

        let session_id = self.test_session.lock().as_ref().map(|s| s.id.clone());
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_signal(&signal, session_id.as_deref()) {
                warn!(id = %signal.id, error = %e, "signal persistence failed");
            }
        }

        // Emission price: live last trade, falling back to nothing — signals
        // for symbols with no state yet cannot be scored.
        let emit_price = self.store.last_price(&signal.symbol);
        if emit_price <= 0.0 {
            debug!(id = %signal.id, symbol = %signal.symbol, "no emission price — signal not scheduled");
            return;
        }

        self.pending.lock().push(PendingSignal {
            signal_id: signal.id,
            symbol: signal.symbol,
            classifier: signal.classifier,
            direction: signal.direction,
            displayed: signal.displayed,
            emit_time: signal.emit_time,
            emit_price,
            period: TimePeriod::from_ts(signal.emit_time),
            next_horizon: 0,
        });
    }

    /// Evaluate every due horizon as of `now_ms`. Returns the number of
    /// horizon judgements made. Idempotent for a fixed clock: a judged
    /// horizon leaves the pending set.
    pub fn evaluate_due(&self, now_ms: i64) -> usize {
        let mut judged = 0;
        let mut pending = self.pending.lock();
        let mut i = 0;

        while i < pending.len() {
            let mut done = false;
            {
                let entry = &mut pending[i];
                while entry.next_horizon < self.horizons_ms.len() {
                    let due_at = entry.emit_time + self.horizons_ms[entry.next_horizon];
                    if now_ms < due_at {
                        break;
                    }

                    let horizon_idx = entry.next_horizon;
                    let is_final = horizon_idx == self.horizons_ms.len() - 1;

                    if now_ms - due_at > STALE_AFTER_MS {
                        // Horizon missed: skip rather than judge stale data.
                        debug!(
                            id = %entry.signal_id,
                            horizon = horizon_idx,
                            late_ms = now_ms - due_at,
                            "evaluation horizon skipped (stale)"
                        );
                        self.persist_horizon(&entry.signal_id, horizon_idx, None, None);
                        entry.next_horizon += 1;
                        if is_final {
                            self.finish_signal(entry, None);
                            done = true;
                            break;
                        }
                        continue;
                    }

                    let price = self.store.last_price(&entry.symbol);
                    if price <= 0.0 {
                        // No market data right now; retry on the next scan
                        // until the staleness window closes.
                        break;
                    }

                    let verdict = judge(
                        entry.direction,
                        entry.emit_price,
                        price,
                        self.move_threshold,
                    );
                    let correct = verdict == Verdict::Correct;
                    judged += 1;

                    self.persist_horizon(&entry.signal_id, horizon_idx, Some(price), Some(correct));
                    self.tally_horizon(entry, horizon_idx, correct);
                    entry.next_horizon += 1;

                    if is_final {
                        self.finish_signal(entry, Some(correct));
                        done = true;
                        break;
                    }
                }
            }

            if done {
                pending.swap_remove(i);
            } else {
                i += 1;
            }
        }

        judged
    }

    fn persist_horizon(
        &self,
        signal_id: &str,
        horizon_idx: usize,
        price: Option<f64>,
        correct: Option<bool>,
    ) {
        if let Some(db) = &self.db {
            if let Err(e) = db.update_signal_horizon(signal_id, horizon_idx, price, correct) {
                warn!(id = %signal_id, error = %e, "horizon persistence failed");
            }
        }
    }

    fn tally_horizon(&self, entry: &PendingSignal, horizon_idx: usize, correct: bool) {
        let mut metrics = self.metrics.lock();
        if horizon_idx < 4 {
            metrics.horizon_total[horizon_idx] += 1;
            if correct {
                metrics.horizon_correct[horizon_idx] += 1;
            }
        }
    }

    /// Final-horizon bookkeeping: per-direction and displayed-vs-filtered
    /// tallies, the reverse-psychology accuracy feed, completion flag.
    fn finish_signal(&self, entry: &PendingSignal, final_correct: Option<bool>) {
        if let Some(correct) = final_correct {
            let mut metrics = self.metrics.lock();
            match entry.direction {
                Direction::Up => {
                    metrics.up_total += 1;
                    if correct {
                        metrics.up_correct += 1;
                    }
                }
                Direction::Down => {
                    metrics.down_total += 1;
                    if correct {
                        metrics.down_correct += 1;
                    }
                }
                Direction::Neutral => {}
            }
            if entry.displayed {
                metrics.displayed_evaluated += 1;
                if correct {
                    metrics.displayed_correct += 1;
                }
            } else {
                metrics.filtered_evaluated += 1;
                if correct {
                    metrics.filtered_correct += 1;
                }
            }
            drop(metrics);

            // Momo's reverse-psychology rule keys off per-period hit rate.
            if entry.classifier == ClassifierKind::Momo && entry.direction != Direction::Neutral {
                self.accuracy.record(entry.period, correct);
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.mark_signal_complete(&entry.signal_id) {
                warn!(id = %entry.signal_id, error = %e, "completion flag persistence failed");
            }
        }
    }

    pub fn metrics(&self) -> EvalMetrics {
        self.metrics.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // =========================================================================
    // Test sessions
    // =========================================================================

    /// Begin a test session wrapping subsequent signals for a symbol.
    pub fn start_test_session(&self, symbol: &str, config: serde_json::Value) -> String {
        let id = Uuid::new_v4().to_string();
        if let Some(db) = &self.db {
            if let Err(e) =
                db.insert_test_session(&id, symbol, &config, Utc::now().timestamp_millis())
            {
                warn!(error = %e, "test session persistence failed");
            }
        }
        *self.test_session.lock() = Some(ActiveTestSession {
            id: id.clone(),
            symbol: symbol.to_string(),
        });
        info!(id = %id, symbol, "test session started");
        id
    }

    /// Close the active test session with the current aggregate metrics.
    pub fn finish_test_session(&self, status: &str) -> Option<serde_json::Value> {
        let session = self.test_session.lock().take()?;
        let metrics = self.metrics.lock().to_json();
        if let Some(db) = &self.db {
            if let Err(e) = db.finish_test_session(
                &session.id,
                &metrics,
                status,
                Utc::now().timestamp_millis(),
            ) {
                warn!(error = %e, "test session close persistence failed");
            }
        }
        info!(id = %session.id, symbol = %session.symbol, status, "test session finished");
        Some(metrics)
    }
}

/// Background evaluator loop: scan for due horizons every 10 seconds.
pub async fn run_evaluator(recorder: Arc<EvaluationRecorder>) {
    info!(scan_secs = SCAN_INTERVAL_SECS, "evaluator started");
    let mut ticker = interval(Duration::from_secs(SCAN_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let judged = recorder.evaluate_due(Utc::now().timestamp_millis());
        if judged > 0 {
            debug!(judged, "evaluation horizons judged");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(symbol: &str, direction: Direction, displayed: bool, emit_time: i64) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            bar_index: 1,
            emit_time,
            classifier: ClassifierKind::Momo,
            direction,
            stars: 5,
            grade: 7,
            confidence: 7.0,
            features: serde_json::Value::Null,
            level_price: None,
            displayed,
            filter_reason: None,
        }
    }

    fn recorder(store: Arc<SymbolStateStore>) -> EvaluationRecorder {
        EvaluationRecorder::new(
            store,
            Arc::new(AccuracyTracker::default()),
            None,
            &[120, 300, 600, 1800],
            0.003,
        )
    }

    #[test]
    fn judge_thresholds() {
        // Scenario S5 boundary: +0.5% at 2m is correct for a bullish call.
        assert_eq!(judge(Direction::Up, 1.00, 1.005, 0.003), Verdict::Correct);
        // -1% at 30m is incorrect.
        assert_eq!(judge(Direction::Up, 1.00, 0.99, 0.003), Verdict::Incorrect);
        // Inside the band: neutral.
        assert_eq!(judge(Direction::Up, 1.00, 1.001, 0.003), Verdict::Neutral);
        // Bearish mirror.
        assert_eq!(judge(Direction::Down, 1.00, 0.99, 0.003), Verdict::Correct);
        assert_eq!(judge(Direction::Down, 1.00, 1.01, 0.003), Verdict::Incorrect);
        // Neutral calls never score.
        assert_eq!(judge(Direction::Neutral, 1.00, 2.00, 0.003), Verdict::Neutral);
    }

    #[test]
    fn evaluation_scenario_s5() {
        let store = Arc::new(SymbolStateStore::new());
        store.on_event("BYND", 0, 1.00, None, None);
        let rec = recorder(store.clone());

        rec.record(signal("BYND", Direction::Up, true, 0));
        assert_eq!(rec.pending_count(), 1);

        // t+120s, price 1.005: correct_2m = true.
        store.on_event("BYND", 120_000, 1.005, None, None);
        assert_eq!(rec.evaluate_due(120_000), 1);

        // 5m and 10m horizons in the band.
        store.on_event("BYND", 300_000, 1.001, None, None);
        rec.evaluate_due(300_000);
        store.on_event("BYND", 600_000, 1.000, None, None);
        rec.evaluate_due(600_000);

        // t+1800s, price 0.99: final_correct = false.
        store.on_event("BYND", 1_800_000, 0.99, None, None);
        rec.evaluate_due(1_800_000);

        assert_eq!(rec.pending_count(), 0);
        let metrics = rec.metrics();
        assert_eq!(metrics.horizon_correct[0], 1);
        assert_eq!(metrics.horizon_total[3], 1);
        assert_eq!(metrics.horizon_correct[3], 0);
        assert_eq!(metrics.up_total, 1);
        assert_eq!(metrics.up_correct, 0);
    }

    #[test]
    fn evaluation_is_idempotent_per_horizon() {
        let store = Arc::new(SymbolStateStore::new());
        store.on_event("AAPL", 0, 100.0, None, None);
        let rec = recorder(store.clone());

        rec.record(signal("AAPL", Direction::Up, true, 0));
        store.on_event("AAPL", 120_000, 101.0, None, None);

        assert_eq!(rec.evaluate_due(120_000), 1);
        // Re-running at the same clock judges nothing new.
        assert_eq!(rec.evaluate_due(120_000), 0);
        assert_eq!(rec.evaluate_due(120_000), 0);
        let metrics = rec.metrics();
        assert_eq!(metrics.horizon_total[0], 1);
    }

    #[test]
    fn stale_horizon_is_skipped() {
        let store = Arc::new(SymbolStateStore::new());
        store.on_event("TSLA", 0, 50.0, None, None);
        let rec = recorder(store.clone());

        rec.record(signal("TSLA", Direction::Up, true, 0));

        // The evaluator comes back far past every horizon: all skipped, no
        // judgements, signal completed with final_correct unset.
        store.on_event("TSLA", 10_000_000, 60.0, None, None);
        assert_eq!(rec.evaluate_due(10_000_000), 0);
        assert_eq!(rec.pending_count(), 0);
        let metrics = rec.metrics();
        assert_eq!(metrics.up_total, 0);
    }

    #[test]
    fn displayed_and_filtered_tracked_separately() {
        let store = Arc::new(SymbolStateStore::new());
        store.on_event("X", 0, 1.00, None, None);
        let rec = recorder(store.clone());

        rec.record(signal("X", Direction::Up, true, 0));
        rec.record(signal("X", Direction::Up, false, 0));
        let metrics = rec.metrics();
        assert_eq!(metrics.generated, 2);
        assert_eq!(metrics.displayed, 1);
        assert_eq!(metrics.filtered, 1);

        // Run all horizons with a +2% move: both correct at the final bar.
        for (ts, price) in [
            (120_000, 1.02),
            (300_000, 1.02),
            (600_000, 1.02),
            (1_800_000, 1.02),
        ] {
            store.on_event("X", ts, price, None, None);
            rec.evaluate_due(ts);
        }

        let metrics = rec.metrics();
        assert_eq!(metrics.displayed_evaluated, 1);
        assert_eq!(metrics.displayed_correct, 1);
        assert_eq!(metrics.filtered_evaluated, 1);
        assert_eq!(metrics.filtered_correct, 1);
    }

    #[test]
    fn momo_outcomes_feed_accuracy_tracker() {
        let store = Arc::new(SymbolStateStore::new());
        store.on_event("Y", 0, 1.00, None, None);
        let accuracy = Arc::new(AccuracyTracker::default());
        let rec = EvaluationRecorder::new(
            store.clone(),
            accuracy.clone(),
            None,
            &[120, 300, 600, 1800],
            0.003,
        );

        // 20 losing momo signals in the same period.
        for _ in 0..20 {
            rec.record(signal("Y", Direction::Up, true, 0));
        }
        for (ts, price) in [
            (120_000, 0.98),
            (300_000, 0.98),
            (600_000, 0.98),
            (1_800_000, 0.98),
        ] {
            store.on_event("Y", ts, price, None, None);
            rec.evaluate_due(ts);
        }

        let period = TimePeriod::from_ts(0);
        let acc = accuracy.accuracy(period).expect("enough samples");
        assert!(acc < 0.05);
    }
}
