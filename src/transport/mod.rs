//! HTTP/WebSocket front door: the only piece of the crate that terminates
//! real network connections. Everything past the upgrade handshake speaks
//! through [`crate::broadcaster::ClientConn`].

pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::registry::ServerState;

/// Builds the Axum router: a health probe and the per-device WebSocket
/// upgrade endpoint.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:device_id", get(ws::upgrade))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
