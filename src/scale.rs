// =============================================================================
// Scale Workers — chunked scaleout/scalein background tasks
// =============================================================================
//
// A scaleout decomposes a close into N chunks over a duration D (FAST 9/2min,
// MEDIUM 6/12min, SLOW 4/60min).  Each chunk executes a partial close at the
// current last price, accumulates realized P&L on the position, and emits a
// `scale.progress.<position_id>` event.  The final chunk routes through the
// ledger's close path so status flips to closed atomically with the last
// fill.  Scalein mirrors this for entries.
//
// Cancellation is honored at the next chunk boundary; the remaining quantity
// stays open.  One worker per symbol at a time.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{topics, BusEvent, EventBus};
use crate::config::ScaleSpeed;
use crate::ledger::{EntryOutcome, PositionLedger};
use crate::market_data::SymbolStateStore;
use crate::types::Side;

// =============================================================================
// Progress events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleKind {
    Out,
    In,
}

/// Emitted after every executed chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleProgress {
    pub position_id: String,
    pub symbol: String,
    pub kind: ScaleKind,
    /// 1-based chunk ordinal.
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub executed_qty: f64,
    pub price: f64,
    pub realized_delta: f64,
    pub realized_cum: f64,
    /// Set on the final chunk (or on cancellation).
    pub done: bool,
    pub cancelled: bool,
}

// =============================================================================
// Chunk planning
// =============================================================================

/// Split `qty` into `n` chunks: `floor(qty/n)` each, remainder absorbed by
/// the last chunk. Fewer chunks when the quantity cannot fill them.
pub fn plan_chunks(qty: f64, n: u32) -> Vec<f64> {
    if qty <= 0.0 || n == 0 {
        return Vec::new();
    }
    let n = n as f64;
    let base = (qty / n).floor();
    if base < 1.0 {
        return vec![qty];
    }
    let mut chunks = vec![base; n as usize];
    let remainder = qty - base * n;
    if let Some(last) = chunks.last_mut() {
        *last += remainder;
    }
    chunks
}

// =============================================================================
// Manager
// =============================================================================

struct ActiveScale {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns all running scale workers, at most one per symbol.
pub struct ScaleManager {
    ledger: Arc<PositionLedger>,
    store: Arc<SymbolStateStore>,
    bus: Arc<EventBus>,
    active: Mutex<HashMap<String, ActiveScale>>,
}

impl ScaleManager {
    pub fn new(
        ledger: Arc<PositionLedger>,
        store: Arc<SymbolStateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            ledger,
            store,
            bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, symbol: &str, cancel: Arc<AtomicBool>, handle: JoinHandle<()>) -> bool {
        let mut active = self.active.lock();
        // Drop finished workers lazily.
        if let Some(existing) = active.get(symbol) {
            if existing.handle.is_finished() {
                active.remove(symbol);
            } else {
                return false;
            }
        }
        active.insert(symbol.to_string(), ActiveScale { cancel, handle });
        true
    }

    /// Whether a worker is currently running for `symbol`.
    pub fn is_active(&self, symbol: &str) -> bool {
        self.active
            .lock()
            .get(symbol)
            .map_or(false, |a| !a.handle.is_finished())
    }

    /// Request cancellation; the worker halts after the current chunk.
    pub fn cancel(&self, symbol: &str) -> bool {
        match self.active.lock().get(symbol) {
            Some(active) if !active.handle.is_finished() => {
                active.cancel.store(true, Ordering::SeqCst);
                info!(symbol, "scale worker cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Start a chunked scaleout of the entire open position.
    pub fn start_scaleout(&self, symbol: &str, speed: ScaleSpeed) -> Result<String, String> {
        let pos = self
            .ledger
            .get_open(symbol)
            .ok_or_else(|| format!("no open position in {symbol}"))?;
        if self.is_active(symbol) {
            return Err(format!("a scale worker is already running for {symbol}"));
        }

        let chunks = plan_chunks(pos.quantity, speed.chunks);
        if chunks.is_empty() {
            return Err(format!("nothing to scale out of in {symbol}"));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = ScaleWorker {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
            symbol: symbol.to_string(),
            position_id: pos.id.clone(),
        };
        let interval = speed.interval_seconds();
        let total = chunks.len() as u32;
        let handle = tokio::spawn(async move {
            worker.run_scaleout(chunks, interval).await;
        });
        self.register(symbol, cancel, handle);

        info!(
            symbol,
            position_id = %pos.id,
            chunks = total,
            interval_secs = interval,
            "scaleout started"
        );
        Ok(format!(
            "scaling out of {} over {} chunks ({}s apart)",
            symbol, total, interval
        ))
    }

    /// Start a chunked scalein: accumulate `total_qty` on `side`.
    pub fn start_scalein(
        &self,
        symbol: &str,
        side: Side,
        total_qty: f64,
        speed: ScaleSpeed,
    ) -> Result<String, String> {
        if self.is_active(symbol) {
            return Err(format!("a scale worker is already running for {symbol}"));
        }
        if self.store.last_price(symbol) <= 0.0 {
            return Err(format!("no market data for {symbol}"));
        }

        let chunks = plan_chunks(total_qty, speed.chunks);
        if chunks.is_empty() {
            return Err("nothing to scale into".to_string());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = ScaleWorker {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
            symbol: symbol.to_string(),
            position_id: String::new(), // assigned after the first chunk
        };
        let interval = speed.interval_seconds();
        let total = chunks.len() as u32;
        let handle = tokio::spawn(async move {
            worker.run_scalein(side, chunks, interval).await;
        });
        self.register(symbol, cancel, handle);

        info!(symbol, side = %side, qty = total_qty, chunks = total, "scalein started");
        Ok(format!(
            "scaling into {} {} over {} chunks ({}s apart)",
            symbol, total_qty, total, interval
        ))
    }
}

// =============================================================================
// Worker
// =============================================================================

struct ScaleWorker {
    ledger: Arc<PositionLedger>,
    store: Arc<SymbolStateStore>,
    bus: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
    symbol: String,
    position_id: String,
}

impl ScaleWorker {
    fn publish(&self, progress: ScaleProgress) {
        self.bus.publish(
            &topics::scale_progress(&progress.position_id),
            BusEvent::ScaleProgress(progress.clone()),
        );
        self.bus.publish(
            &topics::scale_progress_all(),
            BusEvent::ScaleProgress(progress),
        );
    }

    async fn run_scaleout(&self, chunks: Vec<f64>, interval_secs: u64) {
        let total = chunks.len() as u32;

        for (i, chunk_qty) in chunks.iter().enumerate() {
            if i > 0 && interval_secs > 0 {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)).await;
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!(symbol = %self.symbol, chunk = i, "scaleout cancelled — remaining quantity stays open");
                self.publish(ScaleProgress {
                    position_id: self.position_id.clone(),
                    symbol: self.symbol.clone(),
                    kind: ScaleKind::Out,
                    chunk_index: i as u32,
                    total_chunks: total,
                    executed_qty: 0.0,
                    price: 0.0,
                    realized_delta: 0.0,
                    realized_cum: self
                        .ledger
                        .get_open(&self.symbol)
                        .map(|p| p.realized_pnl_cum)
                        .unwrap_or(0.0),
                    done: true,
                    cancelled: true,
                });
                return;
            }

            let price = self.store.last_price(&self.symbol);
            if price <= 0.0 {
                warn!(symbol = %self.symbol, chunk = i, "no market price — scaleout aborted");
                return;
            }

            // The ledger routes the last share through the close path, so
            // the final chunk seals the position with its P&L.
            let Some((delta, pos)) = self.ledger.partial_close(&self.symbol, *chunk_qty, price)
            else {
                warn!(symbol = %self.symbol, chunk = i, "position vanished — scaleout aborted");
                return;
            };

            let is_last = i + 1 == chunks.len();
            self.publish(ScaleProgress {
                position_id: self.position_id.clone(),
                symbol: self.symbol.clone(),
                kind: ScaleKind::Out,
                chunk_index: (i + 1) as u32,
                total_chunks: total,
                executed_qty: *chunk_qty,
                price,
                realized_delta: delta,
                realized_cum: pos.realized_pnl_cum,
                done: is_last,
                cancelled: false,
            });
        }
    }

    async fn run_scalein(&self, side: Side, chunks: Vec<f64>, interval_secs: u64) {
        let total = chunks.len() as u32;
        let mut position_id = self.position_id.clone();

        for (i, chunk_qty) in chunks.iter().enumerate() {
            if i > 0 && interval_secs > 0 {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval_secs)).await;
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!(symbol = %self.symbol, chunk = i, "scalein cancelled");
                self.publish(ScaleProgress {
                    position_id: position_id.clone(),
                    symbol: self.symbol.clone(),
                    kind: ScaleKind::In,
                    chunk_index: i as u32,
                    total_chunks: total,
                    executed_qty: 0.0,
                    price: 0.0,
                    realized_delta: 0.0,
                    realized_cum: 0.0,
                    done: true,
                    cancelled: true,
                });
                return;
            }

            let price = self.store.last_price(&self.symbol);
            if price <= 0.0 {
                warn!(symbol = %self.symbol, chunk = i, "no market price — scalein aborted");
                return;
            }

            let outcome = self.ledger.enter(&self.symbol, side, *chunk_qty, price);
            let pos = match &outcome {
                EntryOutcome::Opened(p) | EntryOutcome::Averaged(p) => p.clone(),
                EntryOutcome::Reversed { opened, .. } => opened.clone(),
            };
            if position_id.is_empty() {
                position_id = pos.id.clone();
            }

            let is_last = i + 1 == chunks.len();
            self.publish(ScaleProgress {
                position_id: position_id.clone(),
                symbol: self.symbol.clone(),
                kind: ScaleKind::In,
                chunk_index: (i + 1) as u32,
                total_chunks: total,
                executed_qty: *chunk_qty,
                price,
                realized_delta: 0.0,
                realized_cum: pos.realized_pnl_cum,
                done: is_last,
                cancelled: false,
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
