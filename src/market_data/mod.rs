// =============================================================================
// Market Data Module
// =============================================================================
//
// Real-time market state for the engine:
// - Per-symbol screening state (baselines, HOD/LOD, tiering)
// - Tick-to-bar aggregation (1-minute OHLCV)

pub mod bar_aggregator;
pub mod symbol_state;

pub use bar_aggregator::BarAggregator;
pub use symbol_state::{SymbolState, SymbolStateStore, TopMetric};
