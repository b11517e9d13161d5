// =============================================================================
// Command Executor — turns a user message into at most one position mutation
// =============================================================================
//
// Dispatch is registry-driven: the matching pipeline resolves a handler key,
// and the handler runs against in-memory state only (ledger, symbol store,
// scale manager).  Every handler produces a deterministic text-only fast
// response; the optional trailing LLM analysis is an external concern and is
// never required for correctness.
//
// Commands serialize through a per-executor lock and run to completion before
// the next is dispatched, so a (user, symbol) position is never mutated
// concurrently.
//
// User-visible failures are text, never errors:
//   unknown input            -> "command not recognized"
//   is_implemented = false   -> "not yet implemented"
//   no current price         -> "no market data for <symbol>"
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::bus::{topics, BusEvent, EventBus};
use crate::commands::matcher::{ParsedCommand, QtySpec, SpeedSpec};
use crate::commands::registry::{CommandMatch, CommandRegistry};
use crate::config::ScaleSpeeds;
use crate::ledger::{EntryOutcome, PositionEvent, PositionLedger};
use crate::market_data::SymbolStateStore;
use crate::scale::ScaleManager;
use crate::types::Side;

/// Default quantity when an entry command names none.
const DEFAULT_ENTRY_QTY: f64 = 100.0;

/// Smart-reverse refuses when the unrealized loss exceeds this fraction of
/// entry value.
const SMART_REVERSE_MAX_LOSS: f64 = 0.10;

/// Deterministic fast response to one command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub text: String,
    pub ok: bool,
}

impl CommandResponse {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: true,
        }
    }

    fn fail(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: false,
        }
    }
}

pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    ledger: Arc<PositionLedger>,
    store: Arc<SymbolStateStore>,
    scale: Arc<ScaleManager>,
    bus: Arc<EventBus>,
    speeds: ScaleSpeeds,
    /// Commands run to completion one at a time.
    serial: Mutex<()>,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<CommandRegistry>,
        ledger: Arc<PositionLedger>,
        store: Arc<SymbolStateStore>,
        scale: Arc<ScaleManager>,
        bus: Arc<EventBus>,
        speeds: ScaleSpeeds,
    ) -> Self {
        Self {
            registry,
            ledger,
            store,
            scale,
            bus,
            speeds,
            serial: Mutex::new(()),
        }
    }

    /// Classify and dispatch one user message in the context of `symbol`.
    pub fn execute(&self, symbol: &str, message: &str) -> CommandResponse {
        let _guard = self.serial.lock();

        let Some(matched) = self.registry.match_input(message) else {
            return CommandResponse::fail("command not recognized");
        };
        if !matched.is_implemented {
            return CommandResponse::fail(format!(
                "'{}' is not yet implemented",
                matched.command_name
            ));
        }

        info!(
            symbol,
            command = %matched.command_name,
            handler = %matched.handler_key,
            kind = ?matched.kind,
            "command dispatched"
        );

        self.dispatch(symbol, &matched)
    }

    fn dispatch(&self, symbol: &str, matched: &CommandMatch) -> CommandResponse {
        match matched.handler_key.as_str() {
            "enter_long" => self.handle_entry(symbol, Side::Long, matched.parsed.as_ref()),
            "enter_short" => self.handle_entry(symbol, Side::Short, matched.parsed.as_ref()),
            "close_position" => self.handle_close(symbol),
            "sell_quantity" => self.handle_sell(symbol, matched.parsed.as_ref()),
            "scaleout" => self.handle_scaleout(symbol, matched.parsed.as_ref()),
            "scalein" => self.handle_scalein(symbol, matched.parsed.as_ref()),
            "accumulate" => self.handle_accumulate(symbol, matched.parsed.as_ref()),
            "reverse" => self.handle_reverse(symbol, false),
            "reverse_smart" => self.handle_reverse(symbol, true),
            "set_stop" => self.handle_risk(symbol, false),
            "set_bracket" => self.handle_risk(symbol, true),
            "pnl_query" => self.handle_pnl(symbol),
            "reset_session" => self.handle_reset(),
            "cancel_scale" => self.handle_cancel(symbol),
            other => CommandResponse::fail(format!("'{other}' is not yet implemented")),
        }
    }

    /// Position snapshot broadcast after every mutation.
    fn publish_position(&self, symbol: &str) {
        let event = PositionEvent {
            symbol: symbol.to_string(),
            position: self.ledger.get_open(symbol),
            master_pnl: self.ledger.master_pnl(),
        };
        self.bus
            .publish(&topics::position(symbol), BusEvent::Position(event));
    }

    fn market_price(&self, symbol: &str) -> Result<f64, CommandResponse> {
        let price = self.store.last_price(symbol);
        if price <= 0.0 {
            Err(CommandResponse::fail(format!(
                "no market data for {symbol}"
            )))
        } else {
            Ok(price)
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_entry(
        &self,
        context_symbol: &str,
        side: Side,
        parsed: Option<&ParsedCommand>,
    ) -> CommandResponse {
        let (qty, symbol, limit) = match parsed {
            Some(ParsedCommand::Entry {
                qty,
                symbol,
                price,
                ..
            }) => (
                qty.unwrap_or(DEFAULT_ENTRY_QTY),
                symbol.clone().unwrap_or_else(|| context_symbol.to_string()),
                *price,
            ),
            _ => (DEFAULT_ENTRY_QTY, context_symbol.to_string(), None),
        };

        let price = match limit {
            Some(p) => p,
            None => match self.market_price(&symbol) {
                Ok(p) => p,
                Err(resp) => return resp,
            },
        };

        let outcome = self.ledger.enter(&symbol, side, qty, price);
        self.publish_position(&symbol);

        match outcome {
            EntryOutcome::Opened(pos) => CommandResponse::ok(format!(
                "opened {} {} {} @ {:.4}",
                pos.side, pos.quantity, symbol, pos.entry_price
            )),
            EntryOutcome::Averaged(pos) => CommandResponse::ok(format!(
                "added {} {} @ {:.4} — now {} @ avg {:.4}",
                qty, symbol, price, pos.quantity, pos.entry_price
            )),
            EntryOutcome::Reversed {
                realized_delta,
                opened,
                ..
            } => CommandResponse::ok(format!(
                "reversed {}: realized {:+.2}, now {} {} @ {:.4}",
                symbol, realized_delta, opened.side, opened.quantity, opened.entry_price
            )),
        }
    }

    fn handle_close(&self, symbol: &str) -> CommandResponse {
        let price = match self.market_price(symbol) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        // A running scale worker on this symbol is superseded by a manual
        // close.
        self.scale.cancel(symbol);

        match self.ledger.close(symbol, price) {
            Some(closed) => {
                self.publish_position(symbol);
                CommandResponse::ok(format!(
                    "closed {} @ {:.4} — realized {:+.2}, master P&L {:+.2}",
                    symbol, price, closed.realized_pnl_cum, self.ledger.master_pnl()
                ))
            }
            None => CommandResponse::fail(format!("no open position in {symbol}")),
        }
    }

    fn handle_sell(&self, symbol: &str, parsed: Option<&ParsedCommand>) -> CommandResponse {
        let Some(ParsedCommand::Sell { qty }) = parsed else {
            return CommandResponse::fail("command not recognized");
        };
        let Some(pos) = self.ledger.get_open(symbol) else {
            return CommandResponse::fail(format!("no open position in {symbol}"));
        };

        let sell_qty = match qty {
            QtySpec::All => return self.handle_close(symbol),
            QtySpec::Half => pos.quantity / 2.0,
            QtySpec::Percent(p) => pos.quantity * p / 100.0,
            QtySpec::Shares(n) => *n,
        };

        let price = match self.market_price(symbol) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match self.ledger.partial_close(symbol, sell_qty, price) {
            Some((delta, after)) => {
                self.publish_position(symbol);
                if after.quantity > 0.0 {
                    CommandResponse::ok(format!(
                        "sold {} {} @ {:.4} — realized {:+.2}, {} remaining",
                        sell_qty, symbol, price, delta, after.quantity
                    ))
                } else {
                    CommandResponse::ok(format!(
                        "sold final {} {} @ {:.4} — position closed, master P&L {:+.2}",
                        sell_qty, symbol, price, self.ledger.master_pnl()
                    ))
                }
            }
            None => CommandResponse::fail(format!("no open position in {symbol}")),
        }
    }

    fn resolve_speed(&self, speed: Option<SpeedSpec>) -> crate::config::ScaleSpeed {
        match speed {
            Some(SpeedSpec::Fast) => self.speeds.fast,
            Some(SpeedSpec::Slow) => self.speeds.slow,
            Some(SpeedSpec::Medium) | None => self.speeds.medium,
        }
    }

    fn handle_scaleout(&self, symbol: &str, parsed: Option<&ParsedCommand>) -> CommandResponse {
        let speed = match parsed {
            Some(ParsedCommand::Scaleout { speed }) => self.resolve_speed(*speed),
            _ => self.speeds.medium,
        };
        if let Err(resp) = self.market_price(symbol) {
            return resp;
        }
        match self.scale.start_scaleout(symbol, speed) {
            Ok(text) => CommandResponse::ok(text),
            Err(text) => CommandResponse::fail(text),
        }
    }

    fn handle_scalein(&self, symbol: &str, parsed: Option<&ParsedCommand>) -> CommandResponse {
        let (qty, speed) = match parsed {
            Some(ParsedCommand::Scalein { qty, speed }) => (*qty, self.resolve_speed(*speed)),
            _ => (DEFAULT_ENTRY_QTY, self.speeds.medium),
        };
        // Accumulate on the open side, default long on a flat book.
        let side = self
            .ledger
            .get_open(symbol)
            .map(|p| p.side)
            .unwrap_or(Side::Long);
        match self.scale.start_scalein(symbol, side, qty, speed) {
            Ok(text) => CommandResponse::ok(text),
            Err(text) => CommandResponse::fail(text),
        }
    }

    fn handle_accumulate(&self, symbol: &str, parsed: Option<&ParsedCommand>) -> CommandResponse {
        let Some(pos) = self.ledger.get_open(symbol) else {
            return CommandResponse::fail(format!("no open position in {symbol} to add to"));
        };
        let qty = match parsed {
            Some(ParsedCommand::Add { qty }) => *qty,
            _ => DEFAULT_ENTRY_QTY,
        };
        let price = match self.market_price(symbol) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match self.ledger.enter(symbol, pos.side, qty, price) {
            EntryOutcome::Averaged(after) => {
                self.publish_position(symbol);
                CommandResponse::ok(format!(
                    "added {} {} @ {:.4} — now {} @ avg {:.4}",
                    qty, symbol, price, after.quantity, after.entry_price
                ))
            }
            // Same-side add on an open position always averages.
            _ => CommandResponse::fail("position changed mid-command"),
        }
    }

    fn handle_reverse(&self, symbol: &str, smart: bool) -> CommandResponse {
        let Some(pos) = self.ledger.get_open(symbol) else {
            return CommandResponse::fail(format!("no open position in {symbol}"));
        };
        let price = match self.market_price(symbol) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        if smart {
            let unrealized = (price - pos.entry_price) * pos.quantity * pos.side.sign();
            let loss_pct = if pos.entry_value > 0.0 {
                -unrealized / pos.entry_value
            } else {
                0.0
            };
            if loss_pct > SMART_REVERSE_MAX_LOSS {
                return CommandResponse::fail(format!(
                    "smart reverse blocked: unrealized loss {:.1}% exceeds {:.0}%",
                    loss_pct * 100.0,
                    SMART_REVERSE_MAX_LOSS * 100.0
                ));
            }
        }

        match self
            .ledger
            .enter(symbol, pos.side.flipped(), pos.quantity, price)
        {
            EntryOutcome::Reversed {
                realized_delta,
                opened,
                ..
            } => {
                self.publish_position(symbol);
                CommandResponse::ok(format!(
                    "reversed {}: realized {:+.2}, now {} {} @ {:.4}",
                    symbol, realized_delta, opened.side, opened.quantity, opened.entry_price
                ))
            }
            _ => CommandResponse::fail("position changed mid-command"),
        }
    }

    fn handle_risk(&self, symbol: &str, bracket: bool) -> CommandResponse {
        let Some(pos) = self.ledger.get_open(symbol) else {
            return CommandResponse::fail(format!("no open position in {symbol}"));
        };

        // Default stop 2% against the entry; bracket target at 3x the risk.
        let stop = match pos.side {
            Side::Long => pos.entry_price * 0.98,
            Side::Short => pos.entry_price * 1.02,
        };
        let target = if bracket {
            let risk = (pos.entry_price - stop).abs();
            Some(match pos.side {
                Side::Long => pos.entry_price + 3.0 * risk,
                Side::Short => pos.entry_price - 3.0 * risk,
            })
        } else {
            pos.target
        };

        match self.ledger.set_risk_levels(symbol, Some(stop), target) {
            Some(after) => {
                self.publish_position(symbol);
                let target_text = after
                    .target
                    .map(|t| format!(", target {t:.4}"))
                    .unwrap_or_default();
                CommandResponse::ok(format!(
                    "risk levels set on {}: stop {:.4}{} (advisory)",
                    symbol, stop, target_text
                ))
            }
            None => CommandResponse::fail(format!("no open position in {symbol}")),
        }
    }

    fn handle_pnl(&self, symbol: &str) -> CommandResponse {
        match self.ledger.get_open(symbol) {
            Some(pos) => {
                let current = self.store.last_price(symbol);
                if current > 0.0 {
                    self.ledger.update_price(symbol, current);
                }
                let pos = self.ledger.get_open(symbol).unwrap_or(pos);
                CommandResponse::ok(format!(
                    "{} {} {} @ {:.4}, now {:.4} — unrealized {:+.2}, realized {:+.2}, master P&L {:+.2}",
                    pos.side,
                    pos.quantity,
                    symbol,
                    pos.entry_price,
                    pos.current_price,
                    pos.unrealized_pnl,
                    pos.realized_pnl_cum,
                    self.ledger.master_pnl()
                ))
            }
            // Flat book still reports the session's realized P&L.
            None => CommandResponse::ok(format!(
                "flat in {} — master P&L {:+.2}",
                symbol,
                self.ledger.master_pnl()
            )),
        }
    }

    fn handle_reset(&self) -> CommandResponse {
        let session = self.ledger.reset_session();
        CommandResponse::ok(format!(
            "session reset — new session {} (prior P&L excluded from master)",
            &session[..8.min(session.len())]
        ))
    }

    fn handle_cancel(&self, symbol: &str) -> CommandResponse {
        if self.scale.cancel(symbol) {
            CommandResponse::ok(format!(
                "scale worker for {symbol} will halt after the current chunk"
            ))
        } else {
            CommandResponse::fail(format!("no scale worker running for {symbol}"))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        executor: CommandExecutor,
        ledger: Arc<PositionLedger>,
        store: Arc<SymbolStateStore>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(PositionLedger::new());
        let store = Arc::new(SymbolStateStore::new());
        let bus = Arc::new(EventBus::new(64));
        let scale = Arc::new(ScaleManager::new(
            ledger.clone(),
            store.clone(),
            bus.clone(),
        ));
        let executor = CommandExecutor::new(
            Arc::new(CommandRegistry::in_memory()),
            ledger.clone(),
            store.clone(),
            scale,
            bus,
            ScaleSpeeds::default(),
        );
        Harness {
            executor,
            ledger,
            store,
        }
    }

    fn set_price(h: &Harness, symbol: &str, ts: i64, price: f64) {
        h.store.on_event(symbol, ts, price, None, None);
    }

    #[test]
    fn reversal_with_realized_pnl_scenario_s1() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 0.55);

        let resp = h.executor.execute("BYND", "long 50000 BYND @ 0.55");
        assert!(resp.ok, "{}", resp.text);

        // Price moves to 0.60, then reverse via an opposite-side entry.
        set_price(&h, "BYND", 2_000, 0.60);
        let resp = h.executor.execute("BYND", "short 10000 @ 0.60");
        assert!(resp.ok);
        assert!(resp.text.contains("+2500.00"), "{}", resp.text);

        let pos = h.ledger.get_open("BYND").unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, 10_000.0);

        // `pos` query: unrealized 0, master +2500.
        let resp = h.executor.execute("BYND", "pos");
        assert!(resp.text.contains("unrealized +0.00"), "{}", resp.text);
        assert!(resp.text.contains("master P&L +2500.00"), "{}", resp.text);
    }

    #[test]
    fn pnl_visible_after_full_close_scenario_s3() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 1.00);
        h.executor.execute("BYND", "long 9000 @ 1.00");
        set_price(&h, "BYND", 2_000, 1.05);
        let resp = h.executor.execute("BYND", "close");
        assert!(resp.ok, "{}", resp.text);

        let resp = h.executor.execute("BYND", "profit");
        assert!(resp.ok);
        assert!(resp.text.contains("master P&L +450.00"), "{}", resp.text);
    }

    #[test]
    fn smart_reverse_blocked_scenario_s6() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 1.00);
        h.executor.execute("BYND", "long 1000 @ 1.00");

        // -12%: smart reverse refuses, no mutation.
        set_price(&h, "BYND", 2_000, 0.88);
        let resp = h.executor.execute("BYND", "reverse-smart");
        assert!(!resp.ok);
        assert!(resp.text.contains("blocked"), "{}", resp.text);

        let pos = h.ledger.get_open("BYND").unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.quantity, 1000.0);

        // Plain reverse is not gated.
        let resp = h.executor.execute("BYND", "reverse");
        assert!(resp.ok, "{}", resp.text);
        assert_eq!(h.ledger.get_open("BYND").unwrap().side, Side::Short);
    }

    #[test]
    fn averaging_via_accumulate() {
        let h = harness();
        set_price(&h, "AAPL", 1_000, 10.0);
        h.executor.execute("AAPL", "long 100 @ 10.00");
        set_price(&h, "AAPL", 2_000, 13.0);
        let resp = h.executor.execute("AAPL", "add 50");
        assert!(resp.ok, "{}", resp.text);

        let pos = h.ledger.get_open("AAPL").unwrap();
        assert_eq!(pos.quantity, 150.0);
        assert!((pos.entry_price - 11.0).abs() < 1e-9);
    }

    #[test]
    fn sell_variants_partial_close() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 1.00);
        h.executor.execute("BYND", "long 1000 @ 1.00");
        set_price(&h, "BYND", 2_000, 1.10);

        let resp = h.executor.execute("BYND", "sell half");
        assert!(resp.ok, "{}", resp.text);
        assert_eq!(h.ledger.get_open("BYND").unwrap().quantity, 500.0);

        let resp = h.executor.execute("BYND", "sell 20%");
        assert!(resp.ok);
        assert_eq!(h.ledger.get_open("BYND").unwrap().quantity, 400.0);

        let resp = h.executor.execute("BYND", "sell all");
        assert!(resp.ok, "{}", resp.text);
        assert!(h.ledger.get_open("BYND").is_none());
    }

    #[test]
    fn unknown_and_unimplemented_and_no_data() {
        let h = harness();

        let resp = h.executor.execute("BYND", "make me rich");
        assert!(!resp.ok);
        assert_eq!(resp.text, "command not recognized");

        let resp = h.executor.execute("BYND", "hedge");
        assert!(!resp.ok);
        assert!(resp.text.contains("not yet implemented"));

        // No ticks yet for this symbol: market entry refuses.
        let resp = h.executor.execute("GHOST", "long");
        assert!(!resp.ok);
        assert_eq!(resp.text, "no market data for GHOST");
    }

    #[test]
    fn risk_levels_default_stop_and_bracket() {
        let h = harness();
        set_price(&h, "AAPL", 1_000, 100.0);
        h.executor.execute("AAPL", "long 10 @ 100.00");

        let resp = h.executor.execute("AAPL", "stop");
        assert!(resp.ok, "{}", resp.text);
        let pos = h.ledger.get_open("AAPL").unwrap();
        assert!((pos.stop_loss.unwrap() - 98.0).abs() < 1e-9);
        assert!(pos.target.is_none());

        let resp = h.executor.execute("AAPL", "bracket");
        assert!(resp.ok);
        let pos = h.ledger.get_open("AAPL").unwrap();
        // Target at 3x the 2% risk: 100 + 6 = 106.
        assert!((pos.target.unwrap() - 106.0).abs() < 1e-9);
    }

    #[test]
    fn session_reset_zeroes_master() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 1.00);
        h.executor.execute("BYND", "long 100 @ 1.00");
        set_price(&h, "BYND", 2_000, 2.00);
        h.executor.execute("BYND", "close");
        assert!((h.ledger.master_pnl() - 100.0).abs() < 1e-9);

        let resp = h.executor.execute("BYND", "reset");
        assert!(resp.ok);
        let resp = h.executor.execute("BYND", "pl");
        assert!(resp.text.contains("master P&L +0.00"), "{}", resp.text);
    }

    #[test]
    fn phrase_and_fuzzy_route_to_handlers() {
        let h = harness();
        set_price(&h, "BYND", 1_000, 1.00);
        h.executor.execute("BYND", "long 100 @ 1.00");

        // Exact phrase.
        let resp = h.executor.execute("BYND", "get me out");
        assert!(resp.ok, "{}", resp.text);
        assert!(h.ledger.get_open("BYND").is_none());
    }
}
