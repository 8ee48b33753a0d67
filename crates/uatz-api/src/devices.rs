use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use uatz_gateway::client::{Pairing, ProtocolClient};
use uatz_gateway::listener::AttachOutcome;
use uatz_types::api::{ConnectResponse, DeviceResponse, StartListenerQuery, StatusResponse};
use uatz_types::events::PairingEvent;
use uatz_types::models::Device;

use crate::error::{ApiError, parse_device_id};
use crate::state::{AppState, AppStateInner};

fn to_response(state: &AppStateInner, device: Device) -> DeviceResponse {
    DeviceResponse {
        id: device.id,
        number: device.number().to_string(),
        listening: state.listeners.is_listening(&device.jid),
        jid: device.jid,
        push_name: device.push_name,
        business_name: device.business_name.unwrap_or_default(),
        timestamp: device.created_at,
    }
}

/// Starts pairing a new session and returns its first QR code. The device
/// is registered and attached once the phone completes the link.
pub async fn connect(State(state): State<AppState>) -> Result<Json<ConnectResponse>, ApiError> {
    let Pairing { client, mut events } = state.listeners.provider().pair().await?;
    client.add_event_handler(state.listeners.session_handler(&client))?;

    let first = tokio::time::timeout(state.pairing_timeout, events.recv())
        .await
        .map_err(|_| ApiError::Upstream("timed out waiting for a pairing code".into()))?;

    let code = match first {
        Some(PairingEvent::Code { code }) => code,
        Some(PairingEvent::Error { message }) => return Err(ApiError::Upstream(message)),
        Some(PairingEvent::Success { jid }) => {
            return Err(ApiError::Conflict(format!("session already paired as {}", jid)));
        }
        Some(PairingEvent::Timeout) | None => {
            return Err(ApiError::Upstream("pairing ended before a code was issued".into()));
        }
    };

    tokio::spawn(follow_pairing(client, events));
    Ok(Json(ConnectResponse { qr_code: code }))
}

/// Keeps the pairing client alive until pairing settles.
async fn follow_pairing(client: Arc<dyn ProtocolClient>, mut events: mpsc::Receiver<PairingEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PairingEvent::Code { .. } => {}
            PairingEvent::Success { jid } => {
                info!("Pairing succeeded for {}", jid);
                break;
            }
            PairingEvent::Timeout => {
                warn!("Pairing timed out before the code was scanned");
                break;
            }
            PairingEvent::Error { message } => {
                warn!("Pairing failed: {}", message);
                break;
            }
        }
    }
    drop(client);
}

pub async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceResponse>>, ApiError> {
    let devices = state.registry().list_devices().await?;
    Ok(Json(devices.into_iter().map(|d| to_response(&state, d)).collect()))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device_id = parse_device_id(&device_id)?;
    let device = state.registry().device_by_id(device_id).await?;
    Ok(Json(to_response(&state, device)))
}

/// Attaches a listener to a registered session (`client_id` is its JID).
pub async fn start_listener(
    State(state): State<AppState>,
    query: Result<Query<StartListenerQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Query(query) = query?;
    let jid = query.client_id.trim();
    if jid.is_empty() {
        return Err(ApiError::bad_request("client_id is required"));
    }

    match state.listeners.attach(jid).await? {
        AttachOutcome::Started(handler) => {
            info!("Listener started for {} (handler {})", jid, handler.id);
            Ok(Json(StatusResponse::ok()))
        }
        AttachOutcome::AlreadyListening => Ok(Json(StatusResponse {
            status: "already listening".into(),
        })),
    }
}
