use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use uatz_gateway::connection;

use crate::state::AppState;

/// Upgrades to the message stream. The API key was already checked by the
/// middleware, so the socket starts subscribed to nothing.
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let sink = state.sink.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, sink, env!("CARGO_PKG_VERSION").to_string())
    })
}
