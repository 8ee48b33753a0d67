use axum::{
    Json, Router, middleware,
    routing::{get, post},
};

use uatz_types::api::StatusResponse;

use crate::middleware::require_api_key;
use crate::state::AppState;
use crate::{devices, gateway, send, webhooks};

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

/// Builds the HTTP surface. Everything but `/health` needs `X-Api-Key`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/connect", get(devices::connect))
        .route("/devices", get(devices::list_devices))
        .route("/devices/{device_id}", get(devices::get_device))
        .route("/start_listener", get(devices::start_listener))
        .route("/send-message", post(send::send_message))
        .route("/send-sticker", post(send::send_sticker))
        .route("/webhooks", post(webhooks::create).get(webhooks::list))
        .route(
            "/webhooks/device/{device_id}",
            get(webhooks::list_by_device).delete(webhooks::remove_by_device),
        )
        .route("/webhooks/device/{device_id}/active", get(webhooks::active_by_device))
        .route("/gateway", get(gateway::ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
