// =============================================================================
// Momo Classifier — multi-timeframe momentum with session context
// =============================================================================
//
// Measures percent change across seven timeframes (yesterday close, premarket
// gap, open, 1h, 15m, 5m, 1m).  The count of same-sign timeframes is the star
// rating.  Context layers:
//
//   VWAP zone     deep-value < -5% | value | fair | extended | extreme > +5%
//   Legs          recent swings segmented into legs 1..n; the probability of
//                 one more leg decays 85/65/45/25/10%
//   Time of day   premarket-early .. after-hours, with confidence adjustments
//   Shadow        a synthetic accumulation series; repeatedly lower
//                 hypothetical entries raise confidence that support is near
//
// A reverse-psychology rule tracks per-period accuracy over the trailing 50
// evaluated signals and inverts the call for a period running under 35%.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::market_data::SymbolState;
use crate::types::{Bar, Direction};

/// Fixed US-Eastern offset from UTC, in hours. The engine trades the regular
/// US session; DST drift is absorbed by `PULSE_ET_OFFSET_HOURS`.
fn et_offset_hours() -> i64 {
    std::env::var("PULSE_ET_OFFSET_HOURS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(-4)
}

/// Next-leg continuation probabilities, indexed by completed leg count.
const LEG_PROBABILITIES: [f64; 5] = [0.85, 0.65, 0.45, 0.25, 0.10];

/// A leg turns when price retraces this much against the move.
const LEG_REVERSAL_PCT: f64 = 0.005;

/// Trailing evaluated-signal window for the reverse-psychology rule.
const ACCURACY_WINDOW: usize = 50;

/// Minimum samples before a period's accuracy is trusted.
const ACCURACY_MIN_SAMPLES: usize = 20;

/// Invert a period's calls when its accuracy drops below this.
const REVERSE_PSYCHOLOGY_FLOOR: f64 = 0.35;

// =============================================================================
// Session context
// =============================================================================

/// Intraday period (US/Eastern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePeriod {
    PremarketEarly,
    PremarketPullback,
    MorningRun,
    LunchChop,
    PowerHour,
    Close,
    AfterHours,
}

impl TimePeriod {
    /// Classify an epoch-millisecond timestamp.
    pub fn from_ts(ts_ms: i64) -> Self {
        let secs_utc = ts_ms / 1000;
        let secs_et = secs_utc + et_offset_hours() * 3600;
        let minutes_of_day = (secs_et.rem_euclid(86_400)) / 60;
        match minutes_of_day {
            m if (4 * 60..8 * 60).contains(&m) => Self::PremarketEarly,
            m if (8 * 60..9 * 60 + 30).contains(&m) => Self::PremarketPullback,
            m if (9 * 60 + 30..11 * 60 + 30).contains(&m) => Self::MorningRun,
            m if (11 * 60 + 30..14 * 60).contains(&m) => Self::LunchChop,
            m if (14 * 60..15 * 60 + 30).contains(&m) => Self::PowerHour,
            m if (15 * 60 + 30..16 * 60).contains(&m) => Self::Close,
            _ => Self::AfterHours,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PremarketEarly => "premarket-early",
            Self::PremarketPullback => "premarket-pullback",
            Self::MorningRun => "morning-run",
            Self::LunchChop => "lunch-chop",
            Self::PowerHour => "power-hour",
            Self::Close => "close",
            Self::AfterHours => "after-hours",
        }
    }
}

/// Distance of price from session VWAP, bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VwapZone {
    DeepValue,
    Value,
    Fair,
    Extended,
    Extreme,
}

impl VwapZone {
    pub fn from_distance(pct: f64) -> Self {
        if pct < -0.05 {
            Self::DeepValue
        } else if pct < -0.02 {
            Self::Value
        } else if pct <= 0.02 {
            Self::Fair
        } else if pct <= 0.05 {
            Self::Extended
        } else {
            Self::Extreme
        }
    }
}

/// Session VWAP over the bar buffer: Σ(close·volume)/Σvolume, falling back to
/// the mean close for volume-less (legacy) tapes.
pub fn session_vwap(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    let vol: f64 = bars.iter().map(|b| b.volume).sum();
    if vol > 0.0 {
        let pv: f64 = bars.iter().map(|b| b.close * b.volume).sum();
        Some(pv / vol)
    } else {
        let sum: f64 = bars.iter().map(|b| b.close).sum();
        Some(sum / bars.len() as f64)
    }
}

// =============================================================================
// Legs
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LegState {
    /// 1-based index of the current leg in the active direction.
    pub leg_number: usize,
    pub direction: Direction,
    /// Probability that one more leg follows.
    pub next_leg_probability: f64,
}

/// Segment closes into directional legs: a leg ends when price retraces more
/// than [`LEG_REVERSAL_PCT`] against it. Counts legs in the final direction.
pub fn detect_legs(bars: &[Bar]) -> Option<LegState> {
    if bars.len() < 3 {
        return None;
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let mut legs: Vec<Direction> = Vec::new();
    let mut dir = Direction::Neutral;
    let mut extreme = closes[0];

    for &price in &closes[1..] {
        match dir {
            Direction::Neutral => {
                if extreme > 0.0 && (price - extreme) / extreme > LEG_REVERSAL_PCT {
                    dir = Direction::Up;
                    legs.push(dir);
                    extreme = price;
                } else if extreme > 0.0 && (extreme - price) / extreme > LEG_REVERSAL_PCT {
                    dir = Direction::Down;
                    legs.push(dir);
                    extreme = price;
                }
            }
            Direction::Up => {
                if price > extreme {
                    extreme = price;
                } else if extreme > 0.0 && (extreme - price) / extreme > LEG_REVERSAL_PCT {
                    dir = Direction::Down;
                    legs.push(dir);
                    extreme = price;
                }
            }
            Direction::Down => {
                if price < extreme {
                    extreme = price;
                } else if extreme > 0.0 && (price - extreme) / extreme > LEG_REVERSAL_PCT {
                    dir = Direction::Up;
                    legs.push(dir);
                    extreme = price;
                }
            }
        }
    }

    if legs.is_empty() {
        return None;
    }
    let last_dir = *legs.last()?;
    let leg_number = legs.iter().filter(|d| **d == last_dir).count().max(1);
    let prob_idx = (leg_number - 1).min(LEG_PROBABILITIES.len() - 1);

    Some(LegState {
        leg_number,
        direction: last_dir,
        next_leg_probability: LEG_PROBABILITIES[prob_idx],
    })
}

// =============================================================================
// Shadow accumulation tracker
// =============================================================================

/// Synthetic accumulation series: records hypothetical entries as price makes
/// lower lows. A deepening ladder of entries reads as support being probed.
#[derive(Debug, Default)]
pub struct ShadowTracker {
    entries: Vec<f64>,
}

impl ShadowTracker {
    /// Feed the latest close. Adds an entry on each ~0.5% markdown below the
    /// last entry; clears once price reclaims the average entry by 1%.
    pub fn observe(&mut self, price: f64) {
        if price <= 0.0 {
            return;
        }
        match self.entries.last() {
            None => self.entries.push(price),
            Some(&last) => {
                if (last - price) / last > 0.005 {
                    self.entries.push(price);
                } else if let Some(avg) = self.average_entry() {
                    if (price - avg) / avg > 0.01 {
                        self.entries.clear();
                        self.entries.push(price);
                    }
                }
            }
        }
    }

    pub fn average_entry(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.iter().sum::<f64>() / self.entries.len() as f64)
    }

    /// 0..=1 confidence that support is being found: grows with each
    /// successively lower entry.
    pub fn support_confidence(&self) -> f64 {
        match self.entries.len() {
            0 | 1 => 0.0,
            n => (0.2 * (n as f64 - 1.0)).min(1.0),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Accuracy tracker (reverse psychology)
// =============================================================================

/// Trailing per-period hit rate of evaluated Momo signals. Fed by the
/// evaluation recorder, read by the classifier.
#[derive(Debug, Default)]
pub struct AccuracyTracker {
    windows: Mutex<HashMap<TimePeriod, VecDeque<bool>>>,
}

impl AccuracyTracker {
    pub fn record(&self, period: TimePeriod, correct: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(period).or_default();
        window.push_back(correct);
        while window.len() > ACCURACY_WINDOW {
            window.pop_front();
        }
    }

    /// Hit rate for a period, once enough samples exist.
    pub fn accuracy(&self, period: TimePeriod) -> Option<f64> {
        let windows = self.windows.lock();
        let window = windows.get(&period)?;
        if window.len() < ACCURACY_MIN_SAMPLES {
            return None;
        }
        let hits = window.iter().filter(|c| **c).count();
        Some(hits as f64 / window.len() as f64)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Trading action derived from stars and VWAP zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MomoAction {
    StrongBuy,
    Buy,
    Sell,
    StrongSell,
    Wait,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeframeChange {
    pub name: &'static str,
    pub pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MomoOutcome {
    pub direction: Direction,
    /// Same-sign timeframe count, 0..=7.
    pub stars: u8,
    pub grade: u8,
    pub confidence: f64,
    pub action: MomoAction,
    pub vwap_zone: VwapZone,
    pub vwap_distance_pct: f64,
    pub period: TimePeriod,
    pub timeframes: Vec<TimeframeChange>,
    pub legs: Option<LegState>,
    pub shadow_support: f64,
    /// Set when the reverse-psychology rule inverted the call.
    pub reversal_reason: Option<String>,
}

// =============================================================================
// Classifier
// =============================================================================

/// The seven timeframe percent changes, given the symbol state and bar buffer.
fn timeframe_changes(state: &SymbolState, bars: &[Bar]) -> Vec<TimeframeChange> {
    let mut out = Vec::with_capacity(7);

    out.push(TimeframeChange {
        name: "yesterday",
        pct: state.pct_from_yesterday.unwrap_or(0.0),
    });

    // Premarket gap: today's open against yesterday's close.
    let premarket = match state.yesterday_close {
        Some(yc) if yc > 0.0 => (state.today_open - yc) / yc,
        _ => 0.0,
    };
    out.push(TimeframeChange {
        name: "premarket",
        pct: premarket,
    });

    out.push(TimeframeChange {
        name: "open",
        pct: state.pct_from_open,
    });

    // Last hour from the bar buffer.
    let pct_1h = if bars.len() >= 2 {
        let lookback = bars.len().min(61);
        let past = bars[bars.len() - lookback].close;
        if past > 0.0 {
            (state.last_price - past) / past
        } else {
            0.0
        }
    } else {
        0.0
    };
    out.push(TimeframeChange {
        name: "1h",
        pct: pct_1h,
    });

    out.push(TimeframeChange {
        name: "15m",
        pct: state.pct_from_15m,
    });
    out.push(TimeframeChange {
        name: "5m",
        pct: state.pct_from_5m,
    });
    out.push(TimeframeChange {
        name: "1m",
        pct: state.pct_from_1m,
    });

    out
}

/// Map stars + zone to an action, mirrored for bearish tapes.
fn map_action(direction: Direction, stars: u8, opposed: u8, zone: VwapZone) -> MomoAction {
    match direction {
        Direction::Up => {
            if stars >= 6 && matches!(zone, VwapZone::Value | VwapZone::DeepValue) {
                MomoAction::StrongBuy
            } else if stars == 5 && zone != VwapZone::Extreme {
                MomoAction::Buy
            } else if opposed >= 3 && zone == VwapZone::Extreme {
                MomoAction::Sell
            } else {
                MomoAction::Wait
            }
        }
        Direction::Down => {
            if stars >= 6 && matches!(zone, VwapZone::Extended | VwapZone::Extreme) {
                MomoAction::StrongSell
            } else if stars == 5 && zone != VwapZone::DeepValue {
                MomoAction::Sell
            } else if opposed >= 3 && zone == VwapZone::DeepValue {
                MomoAction::Buy
            } else {
                MomoAction::Wait
            }
        }
        Direction::Neutral => MomoAction::Wait,
    }
}

/// One Momo pass. `shadow` is the per-symbol tracker owned by the worker;
/// `accuracy` is the shared evaluated-signal history.
pub fn classify(
    state: &SymbolState,
    bars: &[Bar],
    shadow: &mut ShadowTracker,
    accuracy: &AccuracyTracker,
) -> MomoOutcome {
    shadow.observe(state.last_price);

    let timeframes = timeframe_changes(state, bars);
    let up = timeframes.iter().filter(|t| t.pct > 0.0).count() as u8;
    let down = timeframes.iter().filter(|t| t.pct < 0.0).count() as u8;

    let (mut direction, stars, opposed) = if up >= down {
        (
            if up > 0 { Direction::Up } else { Direction::Neutral },
            up,
            down,
        )
    } else {
        (Direction::Down, down, up)
    };

    let vwap = session_vwap(bars).unwrap_or(state.last_price);
    let vwap_distance_pct = if vwap > 0.0 {
        (state.last_price - vwap) / vwap
    } else {
        0.0
    };
    let zone = VwapZone::from_distance(vwap_distance_pct);
    let period = TimePeriod::from_ts(state.last_update);
    let legs = detect_legs(bars);
    let shadow_support = shadow.support_confidence();

    // Base confidence from alignment, on the 1-10 scale.
    let mut confidence = stars as f64 / 7.0 * 10.0;
    match period {
        TimePeriod::MorningRun => confidence *= 1.10,
        TimePeriod::LunchChop => confidence *= 0.85,
        _ => {}
    }
    if stars == 7 {
        confidence *= 1.10;
    }
    // A deepening shadow ladder argues support under a falling tape.
    if direction == Direction::Down {
        confidence *= 1.0 - 0.2 * shadow_support;
    }
    // Fading continuation odds temper conviction late in a move.
    if let Some(leg) = &legs {
        if leg.direction == direction {
            confidence *= 0.8 + 0.2 * leg.next_leg_probability;
        }
    }
    confidence = confidence.min(10.0);

    // Reverse psychology: a period running cold gets inverted, tagged.
    let mut reversal_reason = None;
    if direction != Direction::Neutral {
        if let Some(acc) = accuracy.accuracy(period) {
            if acc < REVERSE_PSYCHOLOGY_FLOOR {
                direction = direction.flipped();
                reversal_reason = Some(format!(
                    "reverse-psychology: {} accuracy {:.0}% over last {} signals",
                    period.as_str(),
                    acc * 100.0,
                    ACCURACY_WINDOW
                ));
            }
        }
    }

    let action = map_action(direction, stars, opposed, zone);
    let grade = (confidence.round() as i64).clamp(1, 10) as u8;

    MomoOutcome {
        direction,
        stars,
        grade,
        confidence,
        action,
        vwap_zone: zone,
        vwap_distance_pct,
        period,
        timeframes,
        legs,
        shadow_support,
        reversal_reason,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::SymbolStateStore;
    use crate::types::BarSource;

    fn bar(minute: i64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            minute_start: minute * 60_000,
            open: close,
            high: close + 0.01,
            low: close - 0.01,
            close,
            volume,
            trade_count: 5,
            source: BarSource::Live,
        }
    }

    /// State with every timeframe positive. The staging event 30s before the
    /// final one keeps the short-window baselines behind the last price.
    fn bullish_state(ts: i64) -> SymbolState {
        let store = SymbolStateStore::new();
        store.on_event("TEST", 0, 10.0, None, None);
        store.set_yesterday_close("TEST", 9.0);
        store.on_event("TEST", ts - 30_000, 10.3, None, None);
        store.on_event("TEST", ts, 10.5, None, None)
    }

    #[test]
    fn vwap_zone_buckets() {
        assert_eq!(VwapZone::from_distance(-0.08), VwapZone::DeepValue);
        assert_eq!(VwapZone::from_distance(-0.03), VwapZone::Value);
        assert_eq!(VwapZone::from_distance(0.0), VwapZone::Fair);
        assert_eq!(VwapZone::from_distance(0.03), VwapZone::Extended);
        assert_eq!(VwapZone::from_distance(0.08), VwapZone::Extreme);
    }

    #[test]
    fn session_vwap_weights_by_volume() {
        let bars = vec![bar(0, 10.0, 100.0), bar(1, 20.0, 300.0)];
        let vwap = session_vwap(&bars).unwrap();
        assert!((vwap - 17.5).abs() < 1e-9);
    }

    #[test]
    fn session_vwap_falls_back_without_volume() {
        let bars = vec![bar(0, 10.0, 0.0), bar(1, 20.0, 0.0)];
        assert!((session_vwap(&bars).unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn time_periods_cover_the_session() {
        // 2026-08-01 is EDT (UTC-4). 14:30 UTC = 10:30 ET.
        std::env::remove_var("PULSE_ET_OFFSET_HOURS");
        let base = 1_700_000_000_000_i64; // anchor; derive offsets below
        let at = |utc_minutes: i64| {
            let day = (base / 86_400_000) * 86_400_000;
            day + utc_minutes * 60_000
        };
        assert_eq!(TimePeriod::from_ts(at(9 * 60)), TimePeriod::PremarketEarly); // 05:00 ET
        assert_eq!(TimePeriod::from_ts(at(12 * 60 + 30)), TimePeriod::PremarketPullback); // 08:30 ET
        assert_eq!(TimePeriod::from_ts(at(14 * 60 + 30)), TimePeriod::MorningRun); // 10:30 ET
        assert_eq!(TimePeriod::from_ts(at(16 * 60)), TimePeriod::LunchChop); // 12:00 ET
        assert_eq!(TimePeriod::from_ts(at(18 * 60 + 30)), TimePeriod::PowerHour); // 14:30 ET
        assert_eq!(TimePeriod::from_ts(at(19 * 60 + 45)), TimePeriod::Close); // 15:45 ET
        assert_eq!(TimePeriod::from_ts(at(21 * 60)), TimePeriod::AfterHours); // 17:00 ET
    }

    #[test]
    fn legs_count_and_probability_decay() {
        // Two up-legs separated by a pullback.
        let mut closes = Vec::new();
        closes.extend((0..10).map(|i| 10.0 + i as f64 * 0.02)); // leg 1 up
        closes.extend((0..5).map(|i| 10.18 - i as f64 * 0.03)); // pullback
        closes.extend((0..10).map(|i| 10.06 + i as f64 * 0.03)); // leg 2 up
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i as i64, c, 100.0))
            .collect();

        let legs = detect_legs(&bars).expect("legs expected");
        assert_eq!(legs.direction, Direction::Up);
        assert_eq!(legs.leg_number, 2);
        assert!((legs.next_leg_probability - 0.65).abs() < 1e-9);
    }

    #[test]
    fn shadow_tracker_ladders_down() {
        let mut shadow = ShadowTracker::default();
        shadow.observe(10.0);
        assert_eq!(shadow.support_confidence(), 0.0);

        shadow.observe(9.9); // -1%
        shadow.observe(9.8); // another -1%
        assert_eq!(shadow.entry_count(), 3);
        assert!((shadow.support_confidence() - 0.4).abs() < 1e-9);

        // Reclaim above the average entry resets the ladder.
        shadow.observe(10.2);
        assert_eq!(shadow.entry_count(), 1);
        assert_eq!(shadow.support_confidence(), 0.0);
    }

    #[test]
    fn aligned_bullish_tape_scores_high() {
        let state = bullish_state(20 * 60_000);
        // Flat-to-rising bars keep VWAP below price but within value band.
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 10.4 + i as f64 * 0.001, 100.0)).collect();
        let mut shadow = ShadowTracker::default();
        let tracker = AccuracyTracker::default();

        let outcome = classify(&state, &bars, &mut shadow, &tracker);
        assert_eq!(outcome.direction, Direction::Up);
        assert!(outcome.stars >= 5, "stars = {}", outcome.stars);
        assert!(outcome.grade >= 5);
    }

    #[test]
    fn strong_buy_needs_value_zone() {
        let state = bullish_state(20 * 60_000);
        // VWAP well above price => value/deep-value zone.
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 11.0, 100.0)).collect();
        let mut shadow = ShadowTracker::default();
        let tracker = AccuracyTracker::default();

        let outcome = classify(&state, &bars, &mut shadow, &tracker);
        if outcome.stars >= 6 {
            assert_eq!(outcome.action, MomoAction::StrongBuy);
        }
    }

    #[test]
    fn wait_when_extended() {
        let state = bullish_state(20 * 60_000);
        // VWAP far below price => extreme zone; no chasing.
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 9.0, 100.0)).collect();
        let mut shadow = ShadowTracker::default();
        let tracker = AccuracyTracker::default();

        let outcome = classify(&state, &bars, &mut shadow, &tracker);
        assert_eq!(outcome.vwap_zone, VwapZone::Extreme);
        assert_eq!(outcome.action, MomoAction::Wait);
    }

    #[test]
    fn reverse_psychology_inverts_cold_period() {
        let state = bullish_state(20 * 60_000);
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 10.4, 100.0)).collect();
        let mut shadow = ShadowTracker::default();

        let tracker = AccuracyTracker::default();
        let period = TimePeriod::from_ts(state.last_update);
        // 20 samples at 25% accuracy: well under the 35% floor.
        for i in 0..20 {
            tracker.record(period, i % 4 == 0);
        }

        let outcome = classify(&state, &bars, &mut shadow, &tracker);
        assert_eq!(outcome.direction, Direction::Down);
        assert!(outcome.reversal_reason.is_some());
    }

    #[test]
    fn accuracy_needs_minimum_samples() {
        let tracker = AccuracyTracker::default();
        tracker.record(TimePeriod::MorningRun, false);
        assert!(tracker.accuracy(TimePeriod::MorningRun).is_none());

        for _ in 0..20 {
            tracker.record(TimePeriod::MorningRun, true);
        }
        assert!(tracker.accuracy(TimePeriod::MorningRun).unwrap() > 0.9);
    }
}
