// =============================================================================
// Murphy Classifier — structure-aware (SMC) bar analysis
// =============================================================================
//
// Consumes the last up-to-100 bars for one symbol plus an optional level
// price.  When no level is supplied, prior levels are auto-detected from
// fractal swings in a 50-bar lookback and the swing nearest to the current
// price becomes the working level.
//
// Features scored per pass:
//   BoS        close beyond the last swing high/low
//   CHoCH      a BoS against the prior 10-20 bar trend
//   FVG        three-bar imbalance, tracked until filled
//   Sweep      brief penetration of the level that reverses within 2 bars
//   Rejection  wick through the level at least 2x the body, opposite close
//   Pattern    three soldiers / three crows / exhaustion gap
//   RVOL       current volume over the trailing 20-bar mean
//
// Each feature carries a 1-10 sub-confidence with size/age/volume/distance
// deductions.  The pass folds them into stars (0-4 conviction), grade (1-10)
// and a combined confidence with a confluence bonus.
// =============================================================================

use serde::Serialize;

use crate::types::{Bar, Direction};

/// Fractal width: a swing needs this many lower highs (or higher lows) on
/// each side.
const SWING_WING: usize = 2;

/// Swing-detection lookback.
const LEVEL_LOOKBACK: usize = 50;

/// Bars examined for liquidity sweeps.
const SWEEP_LOOKBACK: usize = 10;

/// Bars used for the trend read behind CHoCH.
const TREND_LOOKBACK: usize = 15;

/// Minimum history before RVOL is reported.
const RVOL_MIN_BARS: usize = 14;

/// RVOL at or above this counts as a volume surge for the confluence bonus.
const VOLUME_SURGE_RVOL: f64 = 2.0;

// =============================================================================
// Feature records
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StructureBreak {
    pub direction: Direction,
    pub level: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FairValueGap {
    pub direction: Direction,
    pub top: f64,
    pub bottom: f64,
    pub filled: bool,
    /// Bars since the gap formed.
    pub age_bars: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquiditySweep {
    pub direction: Direction,
    pub level: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub direction: Direction,
    pub wick_to_body: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ThreeSoldiers,
    ThreeCrows,
    ExhaustionGap,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandlePattern {
    pub kind: PatternKind,
    pub direction: Direction,
    pub confidence: f64,
}

/// All features extracted in one pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MurphyFeatures {
    pub bos: Option<StructureBreak>,
    pub choch: Option<StructureBreak>,
    pub fvg: Option<FairValueGap>,
    pub sweep: Option<LiquiditySweep>,
    pub rejection: Option<Rejection>,
    pub pattern: Option<CandlePattern>,
    pub rvol: Option<f64>,
}

/// Result of one classification pass.
#[derive(Debug, Clone, Serialize)]
pub struct MurphyOutcome {
    pub direction: Direction,
    /// Conviction count, 0..=4.
    pub stars: u8,
    /// Quality, 1..=10.
    pub grade: u8,
    /// Signed-magnitude confidence on the 1-10 scale.
    pub confidence: f64,
    pub level_price: Option<f64>,
    pub features: MurphyFeatures,
}

// =============================================================================
// Level detection
// =============================================================================

/// Fractal swing highs within the lookback: a bar whose high exceeds the
/// highs of the two bars on each side. Returns the level prices.
pub fn swing_highs(bars: &[Bar]) -> Vec<f64> {
    swings(bars, true)
}

/// Symmetric fractal swing lows.
pub fn swing_lows(bars: &[Bar]) -> Vec<f64> {
    swings(bars, false)
}

fn swings(bars: &[Bar], highs: bool) -> Vec<f64> {
    let start = bars.len().saturating_sub(LEVEL_LOOKBACK);
    let window = &bars[start..];
    let mut out = Vec::new();
    if window.len() < 2 * SWING_WING + 1 {
        return out;
    }
    for i in SWING_WING..window.len() - SWING_WING {
        let candidate = if highs { window[i].high } else { window[i].low };
        let mut is_swing = true;
        for j in 1..=SWING_WING {
            let left = if highs { window[i - j].high } else { window[i - j].low };
            let right = if highs { window[i + j].high } else { window[i + j].low };
            let beats = if highs {
                candidate > left && candidate > right
            } else {
                candidate < left && candidate < right
            };
            if !beats {
                is_swing = false;
                break;
            }
        }
        if is_swing {
            out.push(candidate);
        }
    }
    out
}

/// The swing level (high or low) nearest to `price`.
pub fn auto_detect_level(bars: &[Bar], price: f64) -> Option<f64> {
    let mut levels = swing_highs(bars);
    levels.extend(swing_lows(bars));
    levels
        .into_iter()
        .min_by(|a, b| {
            (a - price)
                .abs()
                .partial_cmp(&(b - price).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

// =============================================================================
// Trend
// =============================================================================

/// Coarse trend over the last 10-20 bars: the sign of the close-to-close
/// drift, neutral inside a 0.1% band.
fn trend(bars: &[Bar]) -> Direction {
    if bars.len() < 2 {
        return Direction::Neutral;
    }
    let span = bars.len().min(TREND_LOOKBACK);
    let first = bars[bars.len() - span].close;
    let last = bars[bars.len() - 1].close;
    if first <= 0.0 {
        return Direction::Neutral;
    }
    let drift = (last - first) / first;
    if drift > 0.001 {
        Direction::Up
    } else if drift < -0.001 {
        Direction::Down
    } else {
        Direction::Neutral
    }
}

// =============================================================================
// Feature extraction
// =============================================================================

fn detect_bos(bars: &[Bar]) -> Option<StructureBreak> {
    let last = bars.last()?;
    // Exclude the current bar from the swing scan so a break is measured
    // against prior structure.
    let prior = &bars[..bars.len() - 1];
    let highs = swing_highs(prior);
    let lows = swing_lows(prior);

    if let Some(&level) = highs.last() {
        if last.close > level {
            let mut confidence: f64 = 7.0;
            // Distance deduction: a marginal break is weaker.
            let margin = (last.close - level) / level;
            if margin < 0.001 {
                confidence -= 2.0;
            }
            // Volume deduction when the breaking bar is quiet.
            if mean_volume(prior, 20).map_or(false, |m| last.volume < m * 0.8) {
                confidence -= 1.0;
            }
            return Some(StructureBreak {
                direction: Direction::Up,
                level,
                confidence: confidence.clamp(1.0, 10.0),
            });
        }
    }
    if let Some(&level) = lows.last() {
        if last.close < level {
            let mut confidence: f64 = 7.0;
            let margin = (level - last.close) / level;
            if margin < 0.001 {
                confidence -= 2.0;
            }
            if mean_volume(prior, 20).map_or(false, |m| last.volume < m * 0.8) {
                confidence -= 1.0;
            }
            return Some(StructureBreak {
                direction: Direction::Down,
                level,
                confidence: confidence.clamp(1.0, 10.0),
            });
        }
    }
    None
}

fn detect_choch(bars: &[Bar], bos: Option<&StructureBreak>) -> Option<StructureBreak> {
    let bos = bos?;
    let prior_trend = trend(&bars[..bars.len() - 1]);
    if prior_trend != Direction::Neutral && bos.direction == prior_trend.flipped() {
        // A reversal break is a stronger statement than a continuation one.
        Some(StructureBreak {
            direction: bos.direction,
            level: bos.level,
            confidence: (bos.confidence + 1.0).min(10.0),
        })
    } else {
        None
    }
}

fn detect_fvg(bars: &[Bar]) -> Option<FairValueGap> {
    if bars.len() < 3 {
        return None;
    }
    let current_price = bars.last()?.close;

    // Scan newest-first so the most recent unfilled gap wins.
    let mut best: Option<FairValueGap> = None;
    for i in (0..bars.len() - 2).rev() {
        let a = &bars[i];
        let c = &bars[i + 2];
        let (direction, bottom, top) = if a.high < c.low {
            (Direction::Up, a.high, c.low)
        } else if a.low > c.high {
            (Direction::Down, c.high, a.low)
        } else {
            continue;
        };

        // Filled when any later bar traded back through the gap.
        let filled = bars[i + 3..]
            .iter()
            .any(|b| b.low <= top && b.high >= bottom);

        let age_bars = bars.len() - 1 - (i + 2);
        let mid = (top + bottom) / 2.0;
        let size_pct = if mid > 0.0 { (top - bottom) / mid } else { 0.0 };

        let mut confidence = 6.0;
        // Size: tiny gaps carry little intent.
        if size_pct < 0.001 {
            confidence -= 2.0;
        } else if size_pct > 0.005 {
            confidence += 1.0;
        }
        // Age deduction: stale gaps fade.
        confidence -= (age_bars as f64 / 20.0).min(2.0);
        // Distance from price deduction.
        if mid > 0.0 && ((current_price - mid).abs() / mid) > 0.02 {
            confidence -= 1.0;
        }
        if filled {
            confidence -= 3.0;
        }

        let gap = FairValueGap {
            direction,
            top,
            bottom,
            filled,
            age_bars,
            confidence: confidence.clamp(1.0, 10.0),
        };

        if !gap.filled {
            return Some(gap);
        }
        if best.is_none() {
            best = Some(gap);
        }
    }
    best
}

fn detect_sweep(bars: &[Bar], level: f64) -> Option<LiquiditySweep> {
    if bars.len() < 3 || level <= 0.0 {
        return None;
    }
    let start = bars.len().saturating_sub(SWEEP_LOOKBACK);
    let window = &bars[start..];

    for i in 0..window.len() {
        let bar = &window[i];
        // Sweep below the level that recovers within 2 bars -> bullish.
        if bar.low < level && bar.close < level {
            let recovered = window[i + 1..]
                .iter()
                .take(2)
                .any(|b| b.close > level);
            if recovered {
                let depth = (level - bar.low) / level;
                let mut confidence = 6.0 + (depth * 1000.0).min(2.0);
                if bar.volume <= 0.0 {
                    confidence -= 1.0;
                }
                return Some(LiquiditySweep {
                    direction: Direction::Up,
                    level,
                    confidence: confidence.clamp(1.0, 10.0),
                });
            }
        }
        // Sweep above that fails within 2 bars -> bearish.
        if bar.high > level && bar.close > level {
            let rejected = window[i + 1..]
                .iter()
                .take(2)
                .any(|b| b.close < level);
            if rejected {
                let depth = (bar.high - level) / level;
                let mut confidence = 6.0 + (depth * 1000.0).min(2.0);
                if bar.volume <= 0.0 {
                    confidence -= 1.0;
                }
                return Some(LiquiditySweep {
                    direction: Direction::Down,
                    level,
                    confidence: confidence.clamp(1.0, 10.0),
                });
            }
        }
    }
    None
}

fn detect_rejection(bars: &[Bar], level: f64) -> Option<Rejection> {
    let bar = bars.last()?;
    if level <= 0.0 {
        return None;
    }
    let body = (bar.close - bar.open).abs().max(f64::EPSILON);

    // Lower wick through the level with a close back above: bullish.
    let lower_wick = bar.open.min(bar.close) - bar.low;
    if bar.low < level && bar.close > level && lower_wick >= 2.0 * body {
        let ratio = lower_wick / body;
        return Some(Rejection {
            direction: Direction::Up,
            wick_to_body: ratio,
            confidence: (5.0 + ratio.min(4.0)).clamp(1.0, 10.0),
        });
    }
    // Upper wick through the level with a close back below: bearish.
    let upper_wick = bar.high - bar.open.max(bar.close);
    if bar.high > level && bar.close < level && upper_wick >= 2.0 * body {
        let ratio = upper_wick / body;
        return Some(Rejection {
            direction: Direction::Down,
            wick_to_body: ratio,
            confidence: (5.0 + ratio.min(4.0)).clamp(1.0, 10.0),
        });
    }
    None
}

fn detect_pattern(bars: &[Bar]) -> Option<CandlePattern> {
    if bars.len() < 4 {
        return None;
    }
    let n = bars.len();
    let last3 = &bars[n - 3..];

    let all_up = last3.iter().all(|b| b.close > b.open)
        && last3.windows(2).all(|w| w[1].close > w[0].close);
    if all_up {
        return Some(CandlePattern {
            kind: PatternKind::ThreeSoldiers,
            direction: Direction::Up,
            confidence: 6.0,
        });
    }

    let all_down = last3.iter().all(|b| b.close < b.open)
        && last3.windows(2).all(|w| w[1].close < w[0].close);
    if all_down {
        return Some(CandlePattern {
            kind: PatternKind::ThreeCrows,
            direction: Direction::Down,
            confidence: 6.0,
        });
    }

    // Exhaustion gap: an opening gap beyond the prior bar's range that closes
    // back against the gap direction.
    let prev = &bars[n - 2];
    let last = &bars[n - 1];
    if prev.close > 0.0 {
        let gap_up = (last.open - prev.high) / prev.close;
        if gap_up > 0.005 && last.close < last.open {
            return Some(CandlePattern {
                kind: PatternKind::ExhaustionGap,
                direction: Direction::Down,
                confidence: 7.0,
            });
        }
        let gap_down = (prev.low - last.open) / prev.close;
        if gap_down > 0.005 && last.close > last.open {
            return Some(CandlePattern {
                kind: PatternKind::ExhaustionGap,
                direction: Direction::Up,
                confidence: 7.0,
            });
        }
    }
    None
}

fn mean_volume(bars: &[Bar], window: usize) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    let start = bars.len().saturating_sub(window);
    let slice = &bars[start..];
    let sum: f64 = slice.iter().map(|b| b.volume).sum();
    if sum <= 0.0 {
        return None;
    }
    Some(sum / slice.len() as f64)
}

fn compute_rvol(bars: &[Bar]) -> Option<f64> {
    if bars.len() < RVOL_MIN_BARS {
        return None;
    }
    let last = bars.last()?;
    let prior = &bars[..bars.len() - 1];
    let mean = mean_volume(prior, 20)?;
    Some(last.volume / mean)
}

// =============================================================================
// Classification
// =============================================================================

/// One full Murphy pass over `bars` (oldest first). `level_override` pins the
/// working level; otherwise the nearest auto-detected swing is used.
pub fn classify(bars: &[Bar], level_override: Option<f64>) -> MurphyOutcome {
    let current_price = bars.last().map(|b| b.close).unwrap_or(0.0);
    let level_price =
        level_override.or_else(|| auto_detect_level(bars, current_price));

    let bos = detect_bos(bars);
    let choch = detect_choch(bars, bos.as_ref());
    let fvg = detect_fvg(bars);
    let sweep = level_price.and_then(|lvl| detect_sweep(bars, lvl));
    let rejection = level_price.and_then(|lvl| detect_rejection(bars, lvl));
    let pattern = detect_pattern(bars);
    let rvol = compute_rvol(bars);

    let features = MurphyFeatures {
        bos,
        choch,
        fvg,
        sweep,
        rejection,
        pattern,
        rvol,
    };

    let (direction, stars) = direction_and_stars(&features);
    let confidence = combined_confidence(bars.len(), &features);
    let grade = (confidence.round() as i64).clamp(1, 10) as u8;

    MurphyOutcome {
        direction,
        stars,
        grade,
        confidence,
        level_price,
        features,
    }
}

/// Directional votes and the conviction count.
fn direction_and_stars(features: &MurphyFeatures) -> (Direction, u8) {
    let mut up = 0u8;
    let mut down = 0u8;

    let mut vote = |dir: Direction| match dir {
        Direction::Up => up += 1,
        Direction::Down => down += 1,
        Direction::Neutral => {}
    };

    if let Some(f) = &features.bos {
        vote(f.direction);
    }
    if let Some(f) = &features.choch {
        vote(f.direction);
    }
    if let Some(f) = &features.fvg {
        if !f.filled {
            vote(f.direction);
        }
    }
    if let Some(f) = &features.sweep {
        vote(f.direction);
    }
    if let Some(f) = &features.rejection {
        vote(f.direction);
    }
    if let Some(f) = &features.pattern {
        vote(f.direction);
    }

    if up == down {
        (Direction::Neutral, 0)
    } else if up > down {
        (Direction::Up, up.min(4))
    } else {
        (Direction::Down, down.min(4))
    }
}

/// Combined confidence: the average of overall pattern quality and the best
/// feature confidence, times a confluence bonus (1.2x when BoS and FVG align,
/// 1.3x with a volume surge on top).
fn combined_confidence(bar_count: usize, features: &MurphyFeatures) -> f64 {
    let quality = (bar_count as f64 / 20.0).min(10.0);

    let best_feature = [
        features.bos.as_ref().map(|f| f.confidence),
        features.choch.as_ref().map(|f| f.confidence),
        features.fvg.as_ref().filter(|f| !f.filled).map(|f| f.confidence),
        features.sweep.as_ref().map(|f| f.confidence),
        features.rejection.as_ref().map(|f| f.confidence),
        features.pattern.as_ref().map(|f| f.confidence),
    ]
    .into_iter()
    .flatten()
    .fold(0.0_f64, f64::max);

    let base = (quality + best_feature) / 2.0;

    let bonus = match (&features.bos, &features.fvg) {
        (Some(bos), Some(fvg)) if !fvg.filled && bos.direction == fvg.direction => {
            if features.rvol.map_or(false, |r| r >= VOLUME_SURGE_RVOL) {
                1.3
            } else {
                1.2
            }
        }
        _ => 1.0,
    };

    (base * bonus).min(10.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn bar(minute: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            minute_start: minute * 60_000,
            open,
            high,
            low,
            close,
            volume,
            trade_count: 10,
            source: BarSource::Live,
        }
    }

    /// Flat tape around `price` with a gentle wiggle so swings exist.
    fn flat_tape(n: usize, price: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 6 == 3 { 0.3 } else { 0.0 };
                let dip = if i % 6 == 0 { 0.3 } else { 0.0 };
                bar(
                    i as i64,
                    price,
                    price + 0.1 + wiggle,
                    price - 0.1 - dip,
                    price,
                    100.0,
                )
            })
            .collect()
    }

    #[test]
    fn swing_detection_finds_fractals() {
        let mut bars = flat_tape(20, 10.0);
        // Plant an unmistakable swing high in the middle.
        bars[10] = bar(10, 10.0, 12.0, 9.9, 10.0, 100.0);
        let highs = swing_highs(&bars);
        assert!(highs.contains(&12.0));
    }

    #[test]
    fn auto_level_picks_nearest_swing() {
        let mut bars = flat_tape(30, 10.0);
        bars[10] = bar(10, 10.0, 12.0, 9.9, 10.0, 100.0);
        bars[20] = bar(20, 10.0, 10.2, 8.0, 10.0, 100.0);
        // Price at 8.5 is nearer the 8.0 swing low than the 12.0 swing high.
        let level = auto_detect_level(&bars, 8.5).unwrap();
        assert_eq!(level, 8.0);
    }

    #[test]
    fn bos_detected_on_close_beyond_swing_high() {
        let mut bars = flat_tape(30, 10.0);
        bars[15] = bar(15, 10.0, 11.0, 9.9, 10.0, 100.0);
        // Current bar closes decisively above the 11.0 swing high.
        bars.push(bar(30, 10.0, 11.6, 10.0, 11.5, 300.0));

        let outcome = classify(&bars, None);
        let bos = outcome.features.bos.expect("BoS expected");
        assert_eq!(bos.direction, Direction::Up);
        // Broken level is the most recent swing high on the tape.
        assert!(bos.level < 11.5);
        assert_eq!(outcome.direction, Direction::Up);
        assert!(outcome.stars >= 1);
    }

    #[test]
    fn choch_requires_opposite_prior_trend() {
        // Downtrend, then a close above the last swing high: CHoCH up.
        let mut bars: Vec<Bar> = (0..30)
            .map(|i| {
                let p = 12.0 - i as f64 * 0.05;
                bar(i as i64, p, p + 0.1, p - 0.1, p, 100.0)
            })
            .collect();
        // Plant a swing high within the recent window.
        bars[25] = bar(25, 10.8, 11.2, 10.7, 10.8, 100.0);
        bars.push(bar(30, 10.6, 11.5, 10.6, 11.4, 250.0));

        let outcome = classify(&bars, None);
        assert!(outcome.features.bos.is_some());
        let choch = outcome.features.choch.expect("CHoCH expected");
        assert_eq!(choch.direction, Direction::Up);
    }

    #[test]
    fn fvg_detection_and_fill() {
        let mut bars = vec![
            bar(0, 10.0, 10.2, 9.9, 10.1, 100.0),
            bar(1, 10.2, 10.9, 10.15, 10.8, 200.0),
            // bar0.high (10.2) < bar2.low (10.5): bullish gap [10.2, 10.5].
            bar(2, 10.8, 11.0, 10.5, 10.9, 150.0),
            bar(3, 10.9, 11.1, 10.8, 11.0, 100.0),
        ];
        let outcome = classify(&bars, None);
        let fvg = outcome.features.fvg.expect("FVG expected");
        assert_eq!(fvg.direction, Direction::Up);
        assert!(!fvg.filled);
        assert_eq!(fvg.bottom, 10.2);
        assert_eq!(fvg.top, 10.5);

        // A bar trading back into the gap fills it.
        bars.push(bar(4, 10.9, 10.95, 10.3, 10.4, 100.0));
        let outcome = classify(&bars, None);
        let fvg = outcome.features.fvg.expect("FVG still reported");
        assert!(fvg.filled);
    }

    #[test]
    fn sweep_below_level_that_recovers_is_bullish() {
        let level = 10.0;
        let bars = vec![
            bar(0, 10.2, 10.3, 10.1, 10.2, 100.0),
            bar(1, 10.2, 10.25, 9.8, 9.9, 300.0), // pierces and closes below
            bar(2, 9.9, 10.3, 9.9, 10.2, 250.0),  // recovers above within 2
            bar(3, 10.2, 10.3, 10.1, 10.25, 100.0),
        ];
        let sweep = detect_sweep(&bars, level).expect("sweep expected");
        assert_eq!(sweep.direction, Direction::Up);
        assert_eq!(sweep.level, level);
    }

    #[test]
    fn rejection_needs_wick_twice_body() {
        let level = 10.0;
        // Long lower wick through the level, small body closing above.
        let bars = vec![
            bar(0, 10.1, 10.2, 10.0, 10.1, 100.0),
            bar(1, 10.05, 10.15, 9.6, 10.10, 200.0),
        ];
        let rejection = detect_rejection(&bars, level).expect("rejection expected");
        assert_eq!(rejection.direction, Direction::Up);
        assert!(rejection.wick_to_body >= 2.0);

        // Wick shorter than 2x body: no rejection.
        let weak = vec![
            bar(0, 10.1, 10.2, 10.0, 10.1, 100.0),
            bar(1, 10.05, 10.2, 9.95, 10.18, 200.0),
        ];
        assert!(detect_rejection(&weak, level).is_none());
    }

    #[test]
    fn three_soldiers_and_crows() {
        let mut bars = flat_tape(10, 10.0);
        bars.push(bar(10, 10.0, 10.3, 9.95, 10.2, 100.0));
        bars.push(bar(11, 10.2, 10.5, 10.15, 10.4, 100.0));
        bars.push(bar(12, 10.4, 10.7, 10.35, 10.6, 100.0));
        let pattern = detect_pattern(&bars).expect("soldiers expected");
        assert_eq!(pattern.kind, PatternKind::ThreeSoldiers);
        assert_eq!(pattern.direction, Direction::Up);

        let mut bars = flat_tape(10, 10.0);
        bars.push(bar(10, 10.0, 10.05, 9.7, 9.8, 100.0));
        bars.push(bar(11, 9.8, 9.85, 9.5, 9.6, 100.0));
        bars.push(bar(12, 9.6, 9.65, 9.3, 9.4, 100.0));
        let pattern = detect_pattern(&bars).expect("crows expected");
        assert_eq!(pattern.kind, PatternKind::ThreeCrows);
    }

    #[test]
    fn rvol_needs_history() {
        let bars = flat_tape(10, 10.0);
        assert!(compute_rvol(&bars).is_none());

        let mut bars = flat_tape(20, 10.0);
        bars.push(bar(20, 10.0, 10.1, 9.9, 10.0, 300.0));
        let rvol = compute_rvol(&bars).unwrap();
        assert!((rvol - 3.0).abs() < 1e-9);
    }

    #[test]
    fn quiet_tape_is_neutral() {
        let bars = flat_tape(40, 10.0);
        let outcome = classify(&bars, None);
        assert_eq!(outcome.direction, Direction::Neutral);
        assert_eq!(outcome.stars, 0);
    }

    #[test]
    fn confluence_bonus_applies() {
        // Build BoS + aligned unfilled FVG with a volume surge.
        let mut bars = flat_tape(30, 10.0);
        bars[15] = bar(15, 10.0, 11.0, 9.9, 10.0, 100.0);
        bars.push(bar(30, 10.1, 10.9, 10.05, 10.8, 100.0));
        bars.push(bar(31, 10.9, 11.8, 10.85, 11.6, 600.0)); // gap + break + surge

        let outcome = classify(&bars, None);
        assert_eq!(outcome.direction, Direction::Up);
        assert!(outcome.grade >= 5, "grade was {}", outcome.grade);
    }
}
