// =============================================================================
// WebSocket Handlers — bar firehose, per-symbol event feed, replay control
// =============================================================================
//
//   /bars/stream?token=…     every sealed bar as {"type":"bar.sealed", …}
//   /events/:symbol?token=…  typed envelopes {type, payload} where type is
//                            bar | signal.murphy | signal.momo |
//                            scale.progress | alert | position
//   /replay?token=…          control protocol:
//                            {command: subscribe|play|pause|reset|set_speed,
//                             symbol, speed?}
//
// Connecting to /events/:symbol is the engine's "first subscription" moment:
// it spawns the symbol's classifier workers; the last disconnect tears them
// down.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::bus::{topics, BusEvent};
use crate::replay::{ReplayCommand, ReplayProgress};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

fn reject_invalid(token: &Option<String>) -> Option<axum::response::Response> {
    let token = token.clone().unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return Some(
            (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response(),
        );
    }
    None
}

// =============================================================================
// Envelope building
// =============================================================================

/// Typed envelope for the per-symbol event feed.
fn envelope(event: &BusEvent) -> serde_json::Value {
    match event {
        BusEvent::Bar(bar) => serde_json::json!({ "type": "bar", "payload": bar }),
        BusEvent::Signal(signal) => serde_json::json!({
            "type": format!("signal.{}", signal.classifier),
            "payload": signal,
        }),
        BusEvent::Alert(alert) => serde_json::json!({ "type": "alert", "payload": alert }),
        BusEvent::ScaleProgress(progress) => {
            serde_json::json!({ "type": "scale.progress", "payload": progress })
        }
        BusEvent::Position(position) => {
            serde_json::json!({ "type": "position", "payload": position })
        }
    }
}

/// Symbol an event belongs to, for feed filtering.
fn event_symbol(event: &BusEvent) -> &str {
    match event {
        BusEvent::Bar(bar) => &bar.symbol,
        BusEvent::Signal(signal) => &signal.symbol,
        BusEvent::Alert(alert) => &alert.symbol,
        BusEvent::ScaleProgress(progress) => &progress.symbol,
        BusEvent::Position(position) => &position.symbol,
    }
}

// =============================================================================
// /bars/stream — sealed-bar firehose
// =============================================================================

pub async fn bars_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Some(reject) = reject_invalid(&query.token) {
        return reject;
    }
    ws.on_upgrade(move |socket| handle_bars_stream(socket, state))
        .into_response()
}

async fn handle_bars_stream(socket: WebSocket, state: Arc<AppState>) {
    info!("bar stream client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.bus.subscribe(&topics::bar_all());

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(BusEvent::Bar(bar)) = event else { break };
                let payload = serde_json::json!({ "type": "bar.sealed", "payload": bar });
                if sender.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    info!("bar stream client disconnected");
}

// =============================================================================
// /events/:symbol — focused per-symbol feed
// =============================================================================

/// Live /events connection count per symbol. The first connection spawns the
/// symbol's classifier workers; the last disconnect tears them down.
fn event_clients() -> &'static Mutex<HashMap<String, usize>> {
    static CLIENTS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    CLIENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Some(reject) = reject_invalid(&query.token) {
        return reject;
    }
    let symbol = symbol.to_uppercase();
    ws.on_upgrade(move |socket| handle_events(socket, state, symbol))
        .into_response()
}

async fn handle_events(socket: WebSocket, state: Arc<AppState>, symbol: String) {
    info!(symbol = %symbol, "event feed client connected");
    {
        let mut clients = event_clients().lock();
        let count = clients.entry(symbol.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            state.classifiers.subscribe_symbol(&symbol);
        }
    }

    let (mut sender, mut receiver) = socket.split();
    let mut bars = state.bus.subscribe(&topics::bar(&symbol));
    let mut murphy = state
        .bus
        .subscribe(&topics::signal(crate::types::ClassifierKind::Murphy, &symbol));
    let mut momo = state
        .bus
        .subscribe(&topics::signal(crate::types::ClassifierKind::Momo, &symbol));
    let mut positions = state.bus.subscribe(&topics::position(&symbol));
    let mut alerts = state.bus.subscribe(&topics::alert());
    let mut scale = state.bus.subscribe(&topics::scale_progress_all());

    loop {
        let event = tokio::select! {
            e = bars.recv() => e,
            e = murphy.recv() => e,
            e = momo.recv() => e,
            e = positions.recv() => e,
            e = alerts.recv() => e,
            e = scale.recv() => e,
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(_)) => continue,
                }
            }
        };

        let Some(event) = event else { break };
        // Global topics (alert, scale.progress) carry other symbols too.
        if event_symbol(&event) != symbol {
            continue;
        }
        if sender
            .send(Message::Text(envelope(&event).to_string()))
            .await
            .is_err()
        {
            break;
        }
    }

    {
        let mut clients = event_clients().lock();
        if let Some(count) = clients.get_mut(&symbol) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                clients.remove(&symbol);
                state.classifiers.unsubscribe_symbol(&symbol);
            }
        }
    }
    info!(symbol = %symbol, "event feed client disconnected");
}

// =============================================================================
// /replay — control protocol
// =============================================================================

#[derive(Debug, Deserialize)]
struct ReplayControlMsg {
    command: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    speed: Option<f64>,
}

pub async fn replay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Some(reject) = reject_invalid(&query.token) {
        return reject;
    }
    ws.on_upgrade(move |socket| handle_replay(socket, state))
        .into_response()
}

async fn handle_replay(socket: WebSocket, state: Arc<AppState>) {
    info!("replay client connected");
    let (mut sender, mut receiver) = socket.split();

    let mut control: Option<tokio::sync::mpsc::Sender<ReplayCommand>> = None;
    let mut progress: Option<broadcast::Receiver<ReplayProgress>> = None;

    loop {
        tokio::select! {
            p = async {
                match progress.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match p {
                    Ok(progress_event) => {
                        let payload = serde_json::json!({
                            "type": "replay.progress",
                            "payload": progress_event,
                        });
                        if sender.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(lost = n, "replay client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        progress = None;
                    }
                }
            }
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                let Ok(ctl) = serde_json::from_str::<ReplayControlMsg>(&text) else {
                    let err = serde_json::json!({ "type": "error", "payload": "bad control message" });
                    if sender.send(Message::Text(err.to_string())).await.is_err() {
                        break;
                    }
                    continue;
                };

                match ctl.command.as_str() {
                    "subscribe" => {
                        let Some(symbol) = ctl.symbol.as_deref() else {
                            continue;
                        };
                        let symbol = symbol.to_uppercase();
                        let (tx, rx) = state.replay.subscribe(&symbol);
                        control = Some(tx);
                        progress = Some(rx);
                        let ack = serde_json::json!({ "type": "subscribed", "payload": symbol });
                        if sender.send(Message::Text(ack.to_string())).await.is_err() {
                            break;
                        }
                    }
                    other => {
                        let cmd = match other {
                            "play" => Some(ReplayCommand::Play),
                            "pause" => Some(ReplayCommand::Pause),
                            "reset" => Some(ReplayCommand::Reset),
                            "set_speed" => ctl.speed.map(ReplayCommand::SetSpeed),
                            _ => None,
                        };
                        match (cmd, control.as_ref()) {
                            (Some(cmd), Some(tx)) => {
                                if tx.send(cmd).await.is_err() {
                                    warn!("replay session gone");
                                    control = None;
                                    progress = None;
                                }
                            }
                            _ => {
                                let err = serde_json::json!({
                                    "type": "error",
                                    "payload": "subscribe first / unknown command",
                                });
                                if sender.send(Message::Text(err.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    info!("replay client disconnected");
}
