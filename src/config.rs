// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Pulse intraday engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::screener::AlertKind;
use crate::types::FeedSchema;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_db_path() -> String {
    "pulse.db".to_string()
}

fn default_alert_threshold_pct() -> f64 {
    0.03
}

fn default_alert_cooldown_seconds() -> u64 {
    900
}

fn default_alert_reset_band() -> f64 {
    0.5
}

fn default_alert_baselines() -> Vec<AlertKind> {
    vec![AlertKind::PctFromYesterday]
}

/// Flush intervals in seconds, indexed by tier 0..=4.
fn default_tier_flush_seconds() -> [u64; 5] {
    [600, 5, 30, 60, 120]
}

fn default_bar_flush_interval_seconds() -> u64 {
    60
}

fn default_classifier_warmup_bars() -> usize {
    20
}

fn default_classifier_history_bars() -> usize {
    100
}

fn default_replay_default_speed() -> f64 {
    1.0
}

fn default_eval_horizons_seconds() -> Vec<u64> {
    vec![120, 300, 600, 1800]
}

fn default_eval_move_threshold() -> f64 {
    0.003
}

fn default_bus_capacity() -> usize {
    256
}

fn default_feed_ws_url() -> String {
    "wss://feed.pulsedata.example/v1/stream".to_string()
}

fn default_feed_rest_url() -> String {
    "https://api.pulsedata.example/v1".to_string()
}

// =============================================================================
// Universe
// =============================================================================

/// Which symbols the feed subscribes to: the full US equities universe, or an
/// explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Universe {
    AllUsEquities,
    Symbols(Vec<String>),
}

impl Default for Universe {
    fn default() -> Self {
        Self::AllUsEquities
    }
}

impl Universe {
    /// The wire-level subscription selector sent to the feed provider.
    pub fn selector(&self) -> String {
        match self {
            Self::AllUsEquities => "ALL_US_EQUITIES".to_string(),
            Self::Symbols(list) => list.join(","),
        }
    }
}

// =============================================================================
// Scale speeds
// =============================================================================

/// One scaleout/scalein speed: number of chunks and total duration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleSpeed {
    pub chunks: u32,
    pub duration_seconds: u64,
}

impl ScaleSpeed {
    /// Sleep between chunks. The first chunk executes immediately.
    pub fn interval_seconds(&self) -> u64 {
        if self.chunks <= 1 {
            0
        } else {
            self.duration_seconds / self.chunks as u64
        }
    }
}

fn default_scale_fast() -> ScaleSpeed {
    ScaleSpeed {
        chunks: 9,
        duration_seconds: 120,
    }
}

fn default_scale_medium() -> ScaleSpeed {
    ScaleSpeed {
        chunks: 6,
        duration_seconds: 720,
    }
}

fn default_scale_slow() -> ScaleSpeed {
    ScaleSpeed {
        chunks: 4,
        duration_seconds: 3600,
    }
}

/// The three user-selectable scale worker speeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSpeeds {
    #[serde(default = "default_scale_fast")]
    pub fast: ScaleSpeed,
    #[serde(default = "default_scale_medium")]
    pub medium: ScaleSpeed,
    #[serde(default = "default_scale_slow")]
    pub slow: ScaleSpeed,
}

impl Default for ScaleSpeeds {
    fn default() -> Self {
        Self {
            fast: default_scale_fast(),
            medium: default_scale_medium(),
            slow: default_scale_slow(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Pulse engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed -----------------------------------------------------------------

    /// Preferred upstream schema. Trades carry real volume; quotes fall back
    /// to volume-0 legacy bars.
    #[serde(default)]
    pub feed_schema: FeedSchema,

    /// Symbol universe the feed subscribes to.
    #[serde(default)]
    pub universe: Universe,

    /// WebSocket endpoint of the market-data provider.
    #[serde(default = "default_feed_ws_url")]
    pub feed_ws_url: String,

    /// REST endpoint of the market-data provider (previous-close bootstrap).
    #[serde(default = "default_feed_rest_url")]
    pub feed_rest_url: String,

    // --- Storage --------------------------------------------------------------

    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Per-tier persistence flush intervals in seconds, indexed by tier 0..=4.
    #[serde(default = "default_tier_flush_seconds")]
    pub tier_flush_seconds: [u64; 5],

    /// Interval of the bar aggregator's stale-bar flush timer.
    #[serde(default = "default_bar_flush_interval_seconds")]
    pub bar_flush_interval_seconds: u64,

    // --- Screener -------------------------------------------------------------

    /// Percent-move threshold that fires an alert (fraction, e.g. 0.03 = 3%).
    #[serde(default = "default_alert_threshold_pct")]
    pub alert_threshold_pct: f64,

    /// Cooldown before the same (symbol, kind) alert may fire again.
    #[serde(default = "default_alert_cooldown_seconds")]
    pub alert_cooldown_seconds: u64,

    /// Re-arm band as a fraction of the trigger threshold (0.5 = re-arm when
    /// |pct| falls below half the trigger).
    #[serde(default = "default_alert_reset_band")]
    pub alert_reset_band: f64,

    /// Baselines the screener watches.
    #[serde(default = "default_alert_baselines")]
    pub alert_baselines: Vec<AlertKind>,

    // --- Classifiers ----------------------------------------------------------

    /// Bars that must accumulate before a classifier emits any signal.
    #[serde(default = "default_classifier_warmup_bars")]
    pub classifier_warmup_bars: usize,

    /// Sliding-window length of each classifier's bar buffer.
    #[serde(default = "default_classifier_history_bars")]
    pub classifier_history_bars: usize,

    // --- Replay ---------------------------------------------------------------

    /// Default replay speed multiplier (1.0 = real time).
    #[serde(default = "default_replay_default_speed")]
    pub replay_default_speed: f64,

    // --- Scale workers --------------------------------------------------------

    #[serde(default)]
    pub scale_speeds: ScaleSpeeds,

    // --- Evaluation -----------------------------------------------------------

    /// Forward horizons (seconds) at which each signal is scored.
    #[serde(default = "default_eval_horizons_seconds")]
    pub eval_horizons_seconds: Vec<u64>,

    /// Minimum favourable move for a horizon to count as correct (fraction).
    #[serde(default = "default_eval_move_threshold")]
    pub eval_move_threshold: f64,

    // --- Event bus ------------------------------------------------------------

    /// Bounded per-subscriber buffer; overflow drops oldest.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feed_schema: FeedSchema::Trades,
            universe: Universe::AllUsEquities,
            feed_ws_url: default_feed_ws_url(),
            feed_rest_url: default_feed_rest_url(),
            db_path: default_db_path(),
            tier_flush_seconds: default_tier_flush_seconds(),
            bar_flush_interval_seconds: default_bar_flush_interval_seconds(),
            alert_threshold_pct: default_alert_threshold_pct(),
            alert_cooldown_seconds: default_alert_cooldown_seconds(),
            alert_reset_band: default_alert_reset_band(),
            alert_baselines: default_alert_baselines(),
            classifier_warmup_bars: default_classifier_warmup_bars(),
            classifier_history_bars: default_classifier_history_bars(),
            replay_default_speed: default_replay_default_speed(),
            scale_speeds: ScaleSpeeds::default(),
            eval_horizons_seconds: default_eval_horizons_seconds(),
            eval_move_threshold: default_eval_move_threshold(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            feed_schema = %config.feed_schema,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides. Called once at startup, after
    /// loading the JSON file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(schema) = std::env::var("PULSE_FEED_SCHEMA") {
            match schema.to_lowercase().as_str() {
                "trades" => self.feed_schema = FeedSchema::Trades,
                "quotes" => self.feed_schema = FeedSchema::Quotes,
                other => info!(value = %other, "ignoring unknown PULSE_FEED_SCHEMA"),
            }
        }

        if let Ok(syms) = std::env::var("PULSE_SYMBOLS") {
            let list: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                self.universe = Universe::Symbols(list);
            }
        }

        if let Ok(url) = std::env::var("PULSE_FEED_WS_URL") {
            self.feed_ws_url = url;
        }
        if let Ok(url) = std::env::var("PULSE_FEED_REST_URL") {
            self.feed_rest_url = url;
        }
        if let Ok(path) = std::env::var("PULSE_DB_PATH") {
            self.db_path = path;
        }
        if let Ok(pct) = std::env::var("PULSE_ALERT_THRESHOLD_PCT") {
            if let Ok(v) = pct.parse::<f64>() {
                self.alert_threshold_pct = v;
            }
        }
        if let Ok(speed) = std::env::var("PULSE_REPLAY_DEFAULT_SPEED") {
            if let Ok(v) = speed.parse::<f64>() {
                self.replay_default_speed = v;
            }
        }
    }

    /// Flush interval for a symbol tier, clamped to the valid tier range.
    pub fn tier_flush_interval(&self, tier: u8) -> u64 {
        let idx = (tier as usize).min(4);
        self.tier_flush_seconds[idx]
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.feed_schema, FeedSchema::Trades);
        assert_eq!(cfg.universe, Universe::AllUsEquities);
        assert!((cfg.alert_threshold_pct - 0.03).abs() < f64::EPSILON);
        assert_eq!(cfg.tier_flush_seconds, [600, 5, 30, 60, 120]);
        assert_eq!(cfg.bar_flush_interval_seconds, 60);
        assert_eq!(cfg.classifier_warmup_bars, 20);
        assert_eq!(cfg.eval_horizons_seconds, vec![120, 300, 600, 1800]);
        assert!((cfg.eval_move_threshold - 0.003).abs() < f64::EPSILON);
        assert_eq!(cfg.scale_speeds.fast.chunks, 9);
        assert_eq!(cfg.scale_speeds.slow.duration_seconds, 3600);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.universe, Universe::AllUsEquities);
        assert_eq!(cfg.bus_capacity, 256);
        assert_eq!(cfg.classifier_history_bars, 100);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "feed_schema": "Quotes", "universe": { "symbols": ["BYND", "TSLA"] } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.feed_schema, FeedSchema::Quotes);
        assert_eq!(
            cfg.universe,
            Universe::Symbols(vec!["BYND".into(), "TSLA".into()])
        );
        assert_eq!(cfg.classifier_warmup_bars, 20);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.universe, cfg2.universe);
        assert_eq!(cfg.tier_flush_seconds, cfg2.tier_flush_seconds);
        assert_eq!(cfg.eval_horizons_seconds, cfg2.eval_horizons_seconds);
    }

    #[test]
    fn tier_flush_interval_clamps() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.tier_flush_interval(1), 5);
        assert_eq!(cfg.tier_flush_interval(4), 120);
        assert_eq!(cfg.tier_flush_interval(0), 600);
        assert_eq!(cfg.tier_flush_interval(9), 120);
    }

    #[test]
    fn scale_speed_interval() {
        let fast = default_scale_fast();
        assert_eq!(fast.interval_seconds(), 13);
        let single = ScaleSpeed {
            chunks: 1,
            duration_seconds: 60,
        };
        assert_eq!(single.interval_seconds(), 0);
    }

    #[test]
    fn universe_selector() {
        assert_eq!(Universe::AllUsEquities.selector(), "ALL_US_EQUITIES");
        let list = Universe::Symbols(vec!["AAPL".into(), "BYND".into()]);
        assert_eq!(list.selector(), "AAPL,BYND");
    }
}
