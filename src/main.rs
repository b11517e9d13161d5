// =============================================================================
// Pulse Intraday Desk — Main Entry Point
// =============================================================================
//
// Subsystem wiring, leaves first: feed gateway feeds the symbol store and
// bar aggregator; the screener rides every state update; sealed bars fan out
// on the event bus to classifier workers and the WebSocket feeds; the
// command executor mutates the position ledger; background tasks handle
// tier-priority persistence, stale-bar flushing, and signal evaluation.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod classifiers;
mod commands;
mod config;
mod evaluation;
mod feed;
mod ledger;
mod market_data;
mod replay;
mod scale;
mod screener;
mod storage;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{RuntimeConfig, Universe};
use crate::feed::{FeedGateway, RefDataClient};

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Pulse Intraday Desk — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        universe = %config.universe.selector(),
        feed_schema = %config.feed_schema,
        db = %config.db_path,
        "Engine configuration"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config)?);

    // ── 3. Previous-close bootstrap for explicit symbol lists ────────────
    let api_key = std::env::var("PULSE_FEED_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("PULSE_FEED_API_SECRET").unwrap_or_default();

    let bootstrap = {
        let cfg = state.config.read();
        match &cfg.universe {
            Universe::Symbols(symbols) => Some((cfg.feed_rest_url.clone(), symbols.clone())),
            Universe::AllUsEquities => None,
        }
    };
    if let Some((rest_url, symbols)) = bootstrap {
        let client = RefDataClient::new(rest_url, api_key.clone());
        let store = state.store.clone();
        tokio::spawn(async move {
            match client.previous_closes(&symbols).await {
                Ok(closes) => {
                    for (symbol, close) in closes {
                        store.set_yesterday_close(&symbol, close);
                    }
                    info!("previous-close bootstrap complete");
                }
                Err(e) => warn!(error = %e, "previous-close bootstrap failed — mappings will fill in"),
            }
        });
    }

    // ── 4. Feed gateway ──────────────────────────────────────────────────
    let gateway = {
        let cfg = state.config.read();
        Arc::new(FeedGateway::new(
            cfg.feed_ws_url.clone(),
            api_key,
            api_secret,
            cfg.feed_schema,
            cfg.universe.selector(),
            state.store.clone(),
            state.aggregator.clone(),
            state.screener.clone(),
        ))
    };
    *state.feed.write() = Some(gateway.clone());
    {
        let gateway = gateway.clone();
        let gw_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.run().await {
                error!(error = %e, "feed gateway stopped on fatal error");
                *gw_state.no_go_reason.write() = Some(format!("feed: {e}"));
                gw_state.push_error(format!("feed gateway stopped: {e}"));
            }
        });
    }

    // ── 5. Persistence flushers ──────────────────────────────────────────
    {
        let cfg = state.config.read();
        tokio::spawn(storage::flusher::run_state_flusher(
            state.store.clone(),
            state.db.clone(),
            cfg.tier_flush_seconds,
        ));
        tokio::spawn(storage::flusher::run_bar_flusher(
            state.aggregator.clone(),
            state.db.clone(),
            cfg.bar_flush_interval_seconds,
        ));
    }

    // ── 6. Signal evaluator ──────────────────────────────────────────────
    tokio::spawn(evaluation::run_evaluator(state.evaluation.clone()));

    // ── 7. Open-position price refresh ───────────────────────────────────
    {
        let price_state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                for pos in price_state.ledger.open_positions() {
                    let price = price_state.store.last_price(&pos.symbol);
                    if price > 0.0 {
                        price_state.ledger.update_price(&pos.symbol, price);
                    }
                }
            }
        });
    }

    // ── 8. State-version heartbeat for the push feeds ────────────────────
    {
        let version_state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(2));
            loop {
                ticker.tick().await;
                version_state.increment_version();
            }
        });
    }

    // ── 9. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("PULSE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let api_state = state.clone();
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    storage::flusher::flush_all_now(&state.store, &state.aggregator, &state.db);

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Pulse Intraday Desk shut down complete.");
    Ok(())
}
