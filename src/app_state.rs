// =============================================================================
// Central Application State — Pulse Intraday Desk
// =============================================================================
//
// The single source of truth for the engine. All subsystems hold Arc
// references to their own state; AppState ties them together and provides a
// unified snapshot for the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::classifiers::{AccuracyTracker, ClassifierEngine};
use crate::commands::{CommandExecutor, CommandRegistry};
use crate::config::RuntimeConfig;
use crate::evaluation::{EvalMetrics, EvaluationRecorder};
use crate::ledger::{Position, PositionLedger};
use crate::market_data::{BarAggregator, SymbolState, SymbolStateStore, TopMetric};
use crate::replay::ReplayServer;
use crate::scale::ScaleManager;
use crate::screener::AlertScreener;
use crate::storage::Database;
use crate::types::{BarSource, FeedSchema};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation; the WebSocket push feed uses it to detect
    /// changes.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<RuntimeConfig>>,

    pub bus: Arc<crate::bus::EventBus>,
    pub store: Arc<SymbolStateStore>,
    pub aggregator: Arc<BarAggregator>,
    pub screener: Arc<AlertScreener>,
    pub db: Arc<Database>,
    pub ledger: Arc<PositionLedger>,
    pub scale: Arc<ScaleManager>,
    pub registry: Arc<CommandRegistry>,
    pub executor: Arc<CommandExecutor>,
    pub accuracy: Arc<AccuracyTracker>,
    pub evaluation: Arc<EvaluationRecorder>,
    pub classifiers: Arc<ClassifierEngine>,
    pub replay: Arc<ReplayServer>,

    /// Installed by main once the gateway is constructed; the snapshot
    /// surfaces its ingest counters.
    pub feed: RwLock<Option<Arc<crate::feed::FeedGateway>>>,

    /// Set when a fatal feed error stopped ingestion.
    pub no_go_reason: RwLock<Option<String>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full subsystem graph from the runtime configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let bus = Arc::new(crate::bus::EventBus::new(config.bus_capacity));
        let store = Arc::new(SymbolStateStore::new());
        let db = Arc::new(Database::open(&config.db_path)?);

        let bar_source = match config.feed_schema {
            FeedSchema::Trades => BarSource::Live,
            FeedSchema::Quotes => BarSource::Legacy,
        };
        let aggregator = Arc::new(BarAggregator::new(bar_source, bus.clone()));
        let screener = Arc::new(
            AlertScreener::new(
                config.alert_threshold_pct,
                config.alert_cooldown_seconds,
                config.alert_reset_band,
                bus.clone(),
                Some(db.clone()),
            )
            .with_kinds(config.alert_baselines.clone()),
        );

        let ledger = Arc::new(PositionLedger::with_db(db.clone()));
        let scale = Arc::new(ScaleManager::new(
            ledger.clone(),
            store.clone(),
            bus.clone(),
        ));
        let registry = Arc::new(CommandRegistry::load(db.clone())?);
        let executor = Arc::new(CommandExecutor::new(
            registry.clone(),
            ledger.clone(),
            store.clone(),
            scale.clone(),
            bus.clone(),
            config.scale_speeds.clone(),
        ));

        let accuracy = Arc::new(AccuracyTracker::default());
        // Re-seed the reverse-psychology window from evaluated history.
        match db.momo_eval_history(200) {
            Ok(rows) => {
                for (emitted_at, correct) in rows {
                    accuracy.record(
                        crate::classifiers::TimePeriod::from_ts(emitted_at),
                        correct,
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to restore momo accuracy history"),
        }
        let evaluation = Arc::new(EvaluationRecorder::new(
            store.clone(),
            accuracy.clone(),
            Some(db.clone()),
            &config.eval_horizons_seconds,
            config.eval_move_threshold,
        ));
        let classifiers = Arc::new(ClassifierEngine::new(
            bus.clone(),
            store.clone(),
            evaluation.clone(),
            accuracy.clone(),
            config.classifier_warmup_bars,
            config.classifier_history_bars,
        ));
        let replay = Arc::new(ReplayServer::new(
            db.clone(),
            bus.clone(),
            config.replay_default_speed,
        ));

        Ok(Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(config)),
            bus,
            store,
            aggregator,
            screener,
            db,
            ledger,
            scale,
            registry,
            executor,
            accuracy,
            evaluation,
            classifiers,
            replay,
            feed: RwLock::new(None),
            no_go_reason: RwLock::new(None),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call after every meaningful
    /// mutation so WebSocket clients know fresh data is available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted.
    pub fn push_error(&self, msg: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the engine for the REST
    /// `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let version = self.current_state_version();

        let top_movers = self
            .store
            .query_top(TopMetric::PctFromYesterday, 20)
            .into_iter()
            .collect();

        let bus_stats = self
            .bus
            .stats()
            .into_iter()
            .map(|(topic, subscribers, dropped)| BusTopicStats {
                topic,
                subscribers,
                dropped,
            })
            .collect();

        let feed = self.feed.read().as_ref().map(|gateway| {
            use std::sync::atomic::Ordering::Relaxed;
            FeedStatsSnapshot {
                messages: gateway.stats.messages.load(Relaxed),
                ticks: gateway.stats.ticks.load(Relaxed),
                dropped_wide_spread: gateway.stats.dropped_wide_spread.load(Relaxed),
                dropped_unmapped: gateway.stats.dropped_unmapped.load(Relaxed),
                reconnects: gateway.stats.reconnects.load(Relaxed),
                mapped_instruments: gateway.directory_len(),
            }
        });

        StateSnapshot {
            state_version: version,
            server_time: Utc::now().timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            feed,
            no_go_reason: self.no_go_reason.read().clone(),
            session_id: self.ledger.session_id(),
            master_pnl: self.ledger.master_pnl(),
            open_positions: self.ledger.open_positions(),
            tracked_symbols: self.store.len(),
            top_movers,
            active_classifiers: self.classifiers.active_symbols(),
            active_replays: self.replay.active_sessions(),
            evaluation: self.evaluation.metrics(),
            bus: bus_stats,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BusTopicStats {
    pub topic: String,
    pub subscribers: usize,
    pub dropped: u64,
}

/// Gateway ingest counters.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatsSnapshot {
    pub messages: u64,
    pub ticks: u64,
    pub dropped_wide_spread: u64,
    pub dropped_unmapped: u64,
    pub reconnects: u64,
    pub mapped_instruments: usize,
}

/// Full engine snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_go_reason: Option<String>,
    pub session_id: String,
    pub master_pnl: f64,
    pub open_positions: Vec<Position>,
    pub tracked_symbols: usize,
    pub top_movers: Vec<SymbolState>,
    pub active_classifiers: Vec<String>,
    pub active_replays: Vec<String>,
    pub evaluation: EvalMetrics,
    pub bus: Vec<BusTopicStats>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.db_path = dir.path().join("state.db").to_string_lossy().into_owned();
        (AppState::new(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn version_increments() {
        let (state, _dir) = test_state();
        let v1 = state.current_state_version();
        state.increment_version();
        assert!(state.current_state_version() > v1);
    }

    #[tokio::test]
    async fn error_ring_is_capped() {
        let (state, _dir) = test_state();
        for i in 0..60 {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "error 59");
    }

    #[tokio::test]
    async fn snapshot_reflects_engine_state() {
        let (state, _dir) = test_state();
        state.store.on_event("BYND", 1_000, 0.55, None, None);
        state.ledger.enter("BYND", crate::types::Side::Long, 100.0, 0.55);

        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.tracked_symbols, 1);
        assert_eq!(snapshot.open_positions.len(), 1);
        assert!(!snapshot.session_id.is_empty());

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"master_pnl\""));
    }
}
