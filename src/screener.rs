// =============================================================================
// Alert Screener — threshold-crossing alerts with cooldown de-duplication
// =============================================================================
//
// Evaluated on every symbol-state update.  An alert fires the first time
// |pct| crosses the configured threshold for a (symbol, kind) pair, then that
// pair is disarmed until either |pct| falls back below the re-arm band (half
// the trigger by default) or the cooldown elapses.  Alert records are
// append-only.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{topics, BusEvent, EventBus};
use crate::market_data::SymbolState;
use crate::storage::db::Database;

// =============================================================================
// Alert model
// =============================================================================

/// Which baseline the alert measures against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    #[default]
    PctFromYesterday,
    PctFromOpen,
    PctFrom15m,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PctFromYesterday => "pct_from_yesterday",
            Self::PctFromOpen => "pct_from_open",
            Self::PctFrom15m => "pct_from_15m",
        }
    }

    fn value(&self, state: &SymbolState) -> Option<f64> {
        match self {
            Self::PctFromYesterday => state.pct_from_yesterday,
            Self::PctFromOpen => Some(state.pct_from_open),
            Self::PctFrom15m => Some(state.pct_from_15m),
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pct_from_yesterday" => Ok(Self::PctFromYesterday),
            "pct_from_open" => Ok(Self::PctFromOpen),
            "pct_from_15m" => Ok(Self::PctFrom15m),
            other => Err(format!("unknown alert kind: {other}")),
        }
    }
}

/// An append-only alert record.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub trigger_price: f64,
    /// Epoch milliseconds.
    pub trigger_time: i64,
    pub conditions: serde_json::Value,
    pub metadata: serde_json::Value,
}

// =============================================================================
// Screener
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ArmState {
    armed: bool,
    last_fired: i64,
}

pub struct AlertScreener {
    /// Trigger threshold as a fraction (0.03 = 3%).
    threshold: f64,
    /// Cooldown in milliseconds before a disarmed pair may re-fire.
    cooldown_ms: i64,
    /// Re-arm once |pct| falls below `threshold * reset_band`.
    reset_band: f64,
    /// Baselines under watch.
    kinds: Vec<AlertKind>,
    arm: Mutex<HashMap<(String, AlertKind), ArmState>>,
    bus: Arc<EventBus>,
    db: Option<Arc<Database>>,
}

impl AlertScreener {
    pub fn new(
        threshold: f64,
        cooldown_seconds: u64,
        reset_band: f64,
        bus: Arc<EventBus>,
        db: Option<Arc<Database>>,
    ) -> Self {
        Self {
            threshold,
            cooldown_ms: cooldown_seconds as i64 * 1000,
            reset_band,
            kinds: vec![AlertKind::PctFromYesterday],
            arm: Mutex::new(HashMap::new()),
            bus,
            db,
        }
    }

    /// Watch additional baselines.
    pub fn with_kinds(mut self, kinds: Vec<AlertKind>) -> Self {
        if !kinds.is_empty() {
            self.kinds = kinds;
        }
        self
    }

    /// Evaluate all watched baselines against an updated state row. Returns
    /// the alerts fired by this update.
    pub fn on_state_update(&self, state: &SymbolState) -> Vec<Alert> {
        let mut fired = Vec::new();

        for kind in &self.kinds {
            let Some(pct) = kind.value(state) else {
                continue;
            };

            let key = (state.symbol.clone(), *kind);
            let now = state.last_update;
            let mut arm = self.arm.lock();
            let entry = arm.entry(key).or_insert(ArmState {
                armed: true,
                last_fired: 0,
            });

            if !entry.armed {
                let cooled = now.saturating_sub(entry.last_fired) >= self.cooldown_ms;
                let back_in_band = pct.abs() < self.threshold * self.reset_band;
                if cooled || back_in_band {
                    entry.armed = true;
                }
            }

            if entry.armed && pct.abs() >= self.threshold {
                entry.armed = false;
                entry.last_fired = now;
                drop(arm);

                let alert = self.build_alert(state, *kind, pct);
                info!(
                    symbol = %alert.symbol,
                    kind = alert.kind.as_str(),
                    pct = format!("{:.2}%", pct * 100.0),
                    price = alert.trigger_price,
                    "screener alert fired"
                );
                if let Some(db) = &self.db {
                    if let Err(e) = db.insert_alert(&alert) {
                        warn!(error = %e, "alert persistence failed");
                    }
                }
                self.bus.publish(&topics::alert(), BusEvent::Alert(alert.clone()));
                fired.push(alert);
            }
        }

        fired
    }

    fn build_alert(&self, state: &SymbolState, kind: AlertKind, pct: f64) -> Alert {
        Alert {
            id: Uuid::new_v4().to_string(),
            symbol: state.symbol.clone(),
            kind,
            trigger_price: state.last_price,
            trigger_time: state.last_update,
            conditions: serde_json::json!({
                "baseline": kind.as_str(),
                "threshold": self.threshold,
                "pct": pct,
            }),
            metadata: serde_json::json!({
                "tier": state.tier,
                "hod": state.hod_price,
                "lod": state.lod_price,
                "spread_pct": state.spread_pct,
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::SymbolStateStore;

    fn screener() -> AlertScreener {
        AlertScreener::new(0.03, 900, 0.5, Arc::new(EventBus::new(16)), None)
    }

    fn state_with_move(store: &SymbolStateStore, ts: i64, price: f64) -> SymbolState {
        store.on_event("BYND", ts, price, None, None)
    }

    fn seeded_store() -> SymbolStateStore {
        let store = SymbolStateStore::new();
        store.on_event("BYND", 0, 1.00, None, None);
        store.set_yesterday_close("BYND", 1.00);
        store
    }

    #[test]
    fn first_crossing_fires_once() {
        let store = seeded_store();
        let scr = screener();

        // +4% crosses the 3% trigger.
        let fired = scr.on_state_update(&state_with_move(&store, 1_000, 1.04));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, AlertKind::PctFromYesterday);

        // Still above threshold: suppressed.
        let fired = scr.on_state_update(&state_with_move(&store, 2_000, 1.05));
        assert!(fired.is_empty());
    }

    #[test]
    fn rearms_below_reset_band() {
        let store = seeded_store();
        let scr = screener();

        assert_eq!(scr.on_state_update(&state_with_move(&store, 1_000, 1.04)).len(), 1);
        // Fall back to +1% (< 1.5% band): re-arms but does not fire.
        assert!(scr.on_state_update(&state_with_move(&store, 2_000, 1.01)).is_empty());
        // Cross again: fires.
        assert_eq!(scr.on_state_update(&state_with_move(&store, 3_000, 1.04)).len(), 1);
    }

    #[test]
    fn rearms_after_cooldown() {
        let store = seeded_store();
        let scr = screener();

        assert_eq!(scr.on_state_update(&state_with_move(&store, 1_000, 1.05)).len(), 1);
        // Still extended, but 15 minutes later: cooldown re-arms and |pct|
        // is still above threshold, so it fires again.
        let later = 1_000 + 900_000;
        assert_eq!(scr.on_state_update(&state_with_move(&store, later, 1.05)).len(), 1);
    }

    #[test]
    fn downside_moves_fire_too() {
        let store = seeded_store();
        let scr = screener();
        let fired = scr.on_state_update(&state_with_move(&store, 1_000, 0.96));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn no_yesterday_close_no_alert() {
        let store = SymbolStateStore::new();
        store.on_event("NEWIPO", 0, 10.0, None, None);
        let scr = screener();
        let fired = scr.on_state_update(&store.on_event("NEWIPO", 1_000, 12.0, None, None));
        assert!(fired.is_empty());
    }

    #[test]
    fn multiple_kinds_are_independent() {
        let store = seeded_store();
        let scr = AlertScreener::new(0.03, 900, 0.5, Arc::new(EventBus::new(16)), None)
            .with_kinds(vec![AlertKind::PctFromYesterday, AlertKind::PctFromOpen]);

        // +5% off both yesterday close and today open.
        let fired = scr.on_state_update(&state_with_move(&store, 1_000, 1.05));
        assert_eq!(fired.len(), 2);
    }
}
