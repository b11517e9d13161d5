// =============================================================================
// Feed Gateway — upstream WebSocket ingest with reconnection
// =============================================================================
//
// Subscribes to the configured universe, rebuilds the instrument directory on
// every reconnect, normalizes trades/quotes into ticks, and forwards them in
// arrival order to the symbol state store, the alert screener, and the bar
// aggregator.
//
// Reconnection: exponential backoff 1s doubling to a 60s cap, with a 30s
// outer timeout per attempt.  A fatal auth/quota status stops the gateway and
// propagates to the supervisor task; everything else is retried internally.
//
// Delivery is best-effort at-most-once — downstream components tolerate loss
// across a reconnect boundary.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::feed::provider::{
    build_subscribe, parse_feed_message, FeedError, FeedMessage,
};
use crate::market_data::{BarAggregator, SymbolStateStore};
use crate::screener::AlertScreener;
use crate::types::{FeedSchema, Tick, TickKind};

/// Quotes with a spread above this fraction of mid are treated as noise.
const MAX_SPREAD_PCT: f64 = 0.02;

/// Reconnect backoff bounds (seconds).
const BACKOFF_INITIAL_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

/// Outer timeout for a single connection attempt.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Next backoff step: double, capped.
fn next_backoff(current: u64) -> u64 {
    (current * 2).min(BACKOFF_CAP_SECS)
}

/// Gateway ingest counters, surfaced in the engine snapshot.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub messages: AtomicU64,
    pub ticks: AtomicU64,
    pub dropped_wide_spread: AtomicU64,
    pub dropped_unmapped: AtomicU64,
    pub reconnects: AtomicU64,
}

pub struct FeedGateway {
    ws_url: String,
    api_key: String,
    api_secret: String,
    schema: FeedSchema,
    universe_selector: String,
    /// instrument_id → symbol, rebuilt on every reconnect.
    directory: RwLock<HashMap<u64, String>>,
    store: Arc<SymbolStateStore>,
    aggregator: Arc<BarAggregator>,
    screener: Arc<AlertScreener>,
    pub stats: FeedStats,
}

impl FeedGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws_url: String,
        api_key: String,
        api_secret: String,
        schema: FeedSchema,
        universe_selector: String,
        store: Arc<SymbolStateStore>,
        aggregator: Arc<BarAggregator>,
        screener: Arc<AlertScreener>,
    ) -> Self {
        Self {
            ws_url,
            api_key,
            api_secret,
            schema,
            universe_selector,
            directory: RwLock::new(HashMap::new()),
            store,
            aggregator,
            screener,
            stats: FeedStats::default(),
        }
    }

    /// Run the gateway until a fatal error. Transient failures reconnect with
    /// backoff; only auth/quota rejection returns.
    pub async fn run(&self) -> Result<(), FeedError> {
        let mut backoff = BACKOFF_INITIAL_SECS;

        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    // Orderly remote close; reconnect promptly.
                    warn!("feed stream ended — reconnecting");
                    backoff = BACKOFF_INITIAL_SECS;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal feed error — gateway stopping");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff, "feed error — reconnecting after backoff");
                }
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(tokio::time::Duration::from_secs(backoff)).await;
            backoff = next_backoff(backoff);
        }
    }

    /// One connection lifetime: connect, subscribe, stream until error/close.
    async fn connect_and_stream(&self) -> Result<(), FeedError> {
        info!(url = %self.ws_url, universe = %self.universe_selector, schema = %self.schema, "connecting to feed");

        let connect = connect_async(&self.ws_url);
        let (ws_stream, _response) = match tokio::time::timeout(
            tokio::time::Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect,
        )
        .await
        {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(FeedError::ConnectionRefused(e.to_string())),
            Err(_) => {
                return Err(FeedError::ConnectionRefused(format!(
                    "connect timed out after {CONNECT_TIMEOUT_SECS}s"
                )))
            }
        };

        info!("feed connected");
        // Mappings from the previous connection are stale.
        self.directory.write().clear();

        let (mut write, mut read) = ws_stream.split();

        let subscribe = build_subscribe(
            &self.api_key,
            &self.api_secret,
            &self.universe_selector,
            self.schema,
            chrono::Utc::now().timestamp_millis(),
        );
        let payload = serde_json::to_string(&subscribe)
            .map_err(|e| FeedError::Transport(e.into()))?;
        write
            .send(Message::Text(payload))
            .await
            .map_err(|e| FeedError::Transport(e.into()))?;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.stats.messages.fetch_add(1, Ordering::Relaxed);
                    match parse_feed_message(&text) {
                        Ok(msg) => {
                            if let Some(fatal) = self.handle_message(msg) {
                                return Err(fatal);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse feed message");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("feed sent close frame");
                    return Ok(());
                }
                // Ping/Pong handled by tungstenite; binary ignored.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(FeedError::Transport(e.into()));
                }
                None => return Ok(()),
            }
        }
    }

    /// Dispatch one parsed message. Returns a fatal error for auth/quota
    /// status codes.
    fn handle_message(&self, msg: FeedMessage) -> Option<FeedError> {
        match msg {
            FeedMessage::Mapping {
                instrument_id,
                symbol,
                previous_close,
            } => {
                debug!(instrument_id, symbol = %symbol, "symbol mapped");
                self.directory.write().insert(instrument_id, symbol.clone());
                if let Some(close) = previous_close {
                    self.store.set_yesterday_close(&symbol, close);
                }
                None
            }
            FeedMessage::Trade {
                instrument_id,
                ts_event,
                price,
                size,
            } => {
                self.on_price_event(instrument_id, ts_event, price, size, None, None, TickKind::Trade);
                None
            }
            FeedMessage::Quote {
                instrument_id,
                ts_event,
                bid,
                ask,
            } => {
                let mid = (bid + ask) / 2.0;
                self.on_price_event(
                    instrument_id,
                    ts_event,
                    mid,
                    0.0,
                    Some(bid),
                    Some(ask),
                    TickKind::Quote,
                );
                None
            }
            FeedMessage::Status { code, message } => match code.as_str() {
                "auth_invalid" => Some(FeedError::AuthInvalid),
                "quota_exceeded" => Some(FeedError::QuotaExceeded),
                _ => {
                    debug!(code = %code, message = %message, "feed status");
                    None
                }
            },
        }
    }

    /// Normalize and forward one price event.
    fn on_price_event(
        &self,
        instrument_id: u64,
        ts_event: i64,
        price: f64,
        size: f64,
        bid: Option<f64>,
        ask: Option<f64>,
        kind: TickKind,
    ) {
        let symbol = match self.directory.read().get(&instrument_id) {
            Some(s) => s.clone(),
            None => {
                self.stats.dropped_unmapped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Only screen symbols with a known reference close; a state row is
        // created by set_yesterday_close, so absence means no mapping carried
        // reference data yet.
        let known_close = self
            .store
            .get(&symbol)
            .and_then(|s| s.yesterday_close)
            .is_some();
        if !known_close {
            self.stats.dropped_unmapped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Noise filter: a spread over 2% of mid is not tradeable context.
        if let (Some(b), Some(a)) = (bid, ask) {
            if is_noisy_spread(b, a) {
                self.stats
                    .dropped_wide_spread
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if price <= 0.0 {
            return;
        }

        let tick = Tick {
            symbol: symbol.clone(),
            event_time: ts_event,
            price,
            size,
            bid,
            ask,
            kind,
        };

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let state = self.store.on_event(&symbol, ts_event, price, bid, ask);
        self.screener.on_state_update(&state);
        self.aggregator.on_tick(&tick);
    }

    /// Number of installed instrument mappings.
    pub fn directory_len(&self) -> usize {
        self.directory.read().len()
    }

    /// Test/replay hook: install a mapping without a live connection.
    pub fn install_mapping(&self, instrument_id: u64, symbol: &str, previous_close: Option<f64>) {
        self.handle_message(FeedMessage::Mapping {
            instrument_id,
            symbol: symbol.to_string(),
            previous_close,
        });
    }
}

/// Spread-noise predicate: `(ask - bid) / mid > 2%`.
pub fn is_noisy_spread(bid: f64, ask: f64) -> bool {
    let mid = (bid + ask) / 2.0;
    if mid <= 0.0 || ask < bid {
        return true;
    }
    (ask - bid) / mid > MAX_SPREAD_PCT
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::types::BarSource;

    fn gateway() -> FeedGateway {
        let bus = Arc::new(EventBus::new(16));
        let store = Arc::new(SymbolStateStore::new());
        let aggregator = Arc::new(BarAggregator::new(BarSource::Live, bus.clone()));
        let screener = Arc::new(AlertScreener::new(0.03, 900, 0.5, bus, None));
        FeedGateway::new(
            "wss://example".into(),
            "key".into(),
            "secret".into(),
            FeedSchema::Trades,
            "ALL_US_EQUITIES".into(),
            store,
            aggregator,
            screener,
        )
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = BACKOFF_INITIAL_SECS;
        let mut seen = vec![b];
        for _ in 0..8 {
            b = next_backoff(b);
            seen.push(b);
        }
        assert_eq!(seen[..7], [1, 2, 4, 8, 16, 32, 60]);
        assert_eq!(*seen.last().unwrap(), 60);
    }

    #[test]
    fn noisy_spread_predicate() {
        // 1% spread: fine.
        assert!(!is_noisy_spread(0.995, 1.005));
        // 4% spread: noise.
        assert!(is_noisy_spread(0.98, 1.02));
        // Crossed market: noise.
        assert!(is_noisy_spread(1.01, 0.99));
    }

    #[test]
    fn mapping_then_trade_flows_to_state() {
        let gw = gateway();
        gw.install_mapping(421, "BYND", Some(0.50));
        assert_eq!(gw.directory_len(), 1);

        gw.handle_message(FeedMessage::Trade {
            instrument_id: 421,
            ts_event: 1_000,
            price: 0.55,
            size: 100.0,
        });

        let state = gw.store.get("BYND").unwrap();
        assert_eq!(state.last_price, 0.55);
        assert!((state.pct_from_yesterday.unwrap() - 0.10).abs() < 1e-9);
        assert_eq!(gw.stats.ticks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unmapped_instrument_is_dropped() {
        let gw = gateway();
        gw.handle_message(FeedMessage::Trade {
            instrument_id: 999,
            ts_event: 1_000,
            price: 1.0,
            size: 1.0,
        });
        assert_eq!(gw.stats.ticks.load(Ordering::Relaxed), 0);
        assert_eq!(gw.stats.dropped_unmapped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_previous_close_is_dropped() {
        let gw = gateway();
        gw.install_mapping(7, "NEWIPO", None);
        gw.handle_message(FeedMessage::Trade {
            instrument_id: 7,
            ts_event: 1_000,
            price: 10.0,
            size: 1.0,
        });
        assert_eq!(gw.stats.ticks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn wide_spread_quote_is_dropped() {
        let gw = gateway();
        gw.install_mapping(1, "AAPL", Some(100.0));
        gw.handle_message(FeedMessage::Quote {
            instrument_id: 1,
            ts_event: 1_000,
            bid: 95.0,
            ask: 105.0,
        });
        assert_eq!(gw.stats.dropped_wide_spread.load(Ordering::Relaxed), 1);
        assert_eq!(gw.stats.ticks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fatal_status_stops_gateway() {
        let gw = gateway();
        let fatal = gw.handle_message(FeedMessage::Status {
            code: "auth_invalid".into(),
            message: "bad key".into(),
        });
        assert!(matches!(fatal, Some(FeedError::AuthInvalid)));

        let ok = gw.handle_message(FeedMessage::Status {
            code: "ok".into(),
            message: String::new(),
        });
        assert!(ok.is_none());
    }
}
