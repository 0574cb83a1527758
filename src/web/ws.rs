//! WebSocket entry points
//!
//! Clients may connect on `/ws` or on the bare root URL; both hand the
//! upgraded socket to the relay's connection handler.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::relay;
use crate::state::AppState;

/// WebSocket upgrade handler for `/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    upgrade(ws, state)
}

/// Root path: WebSocket upgrade when requested, plain banner otherwise
pub async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, state),
        None => "Relay server running.".into_response(),
    }
}

fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>) -> Response {
    let config = state.config.relay.clone();
    let router = state.router.clone();

    ws.max_message_size(config.max_frame_bytes)
        .max_frame_size(config.max_frame_bytes)
        .on_upgrade(move |socket| relay::serve(socket, router, config))
}
