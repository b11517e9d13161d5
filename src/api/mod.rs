// =============================================================================
// API Module
// =============================================================================
//
// HTTP/WebSocket surface for the engine:
// - REST endpoints (bars, alerts, positions, chat, registry, test sessions)
// - WebSocket feeds (bar firehose, per-symbol events, replay control)
// - Bearer token authentication

pub mod auth;
pub mod rest;
pub mod ws;
