// =============================================================================
// Shared types used across the Pulse intraday engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position: long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Sign multiplier for P&L math: +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// The opposite side.
    pub fn flipped(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Which upstream feed schema we are subscribed to. Trades carry real volume;
/// quotes do not, so bars built from a quote feed have volume 0 and are
/// tagged [`BarSource::Legacy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedSchema {
    Trades,
    Quotes,
}

impl Default for FeedSchema {
    fn default() -> Self {
        Self::Trades
    }
}

impl std::fmt::Display for FeedSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trades => write!(f, "trades"),
            Self::Quotes => write!(f, "quotes"),
        }
    }
}

/// Whether a price event is a quote midpoint update or an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickKind {
    Quote,
    Trade,
}

/// A single normalized price event from the feed gateway. Ephemeral — never
/// persisted; lifetime is one call into ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    /// Event timestamp in epoch milliseconds.
    pub event_time: i64,
    pub price: f64,
    pub size: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub kind: TickKind,
}

/// Where a bar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSource {
    Live,
    Replay,
    /// Built under a quotes-only schema; volume is 0 and the bar is excluded
    /// from default queries and volume-normalized features.
    Legacy,
}

impl BarSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Replay => "replay",
            Self::Legacy => "legacy",
        }
    }
}

impl std::str::FromStr for BarSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "replay" => Ok(Self::Replay),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!("unknown bar source: {other}")),
        }
    }
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable 1-minute OHLCV bar for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Start of the minute in epoch milliseconds, aligned to a 60s boundary.
    pub minute_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub source: BarSource,
}

/// Milliseconds per bar minute.
pub const MINUTE_MS: i64 = 60_000;

impl Bar {
    /// Align an epoch-millisecond timestamp down to its minute boundary.
    /// A tick exactly on the boundary `t = 60k` belongs to minute `k`.
    pub fn align_minute(ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(MINUTE_MS)
    }

    /// Whether the OHLCV values are internally consistent:
    /// `low <= open,close <= high` and `volume >= 0`.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
            && self.minute_start % MINUTE_MS == 0
    }
}

/// Trend direction attached to a classifier signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Neutral => "neutral",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "neutral" => Ok(Self::Neutral),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which classifier produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassifierKind {
    Murphy,
    Momo,
}

impl ClassifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Murphy => "murphy",
            Self::Momo => "momo",
        }
    }
}

impl std::str::FromStr for ClassifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "murphy" => Ok(Self::Murphy),
            "momo" => Ok(Self::Momo),
            other => Err(format!("unknown classifier: {other}")),
        }
    }
}

impl std::fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
