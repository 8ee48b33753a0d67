use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Multipart, Query, State,
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
    },
};
use tracing::info;

use uatz_gateway::client::{ProtocolClient, resolve_number};
use uatz_gateway::error::ProtocolError;
use uatz_types::api::{SendMessageRequest, SendMessageResponse, SendStickerQuery};
use uatz_types::events::{MediaKind, OutgoingContent};

use crate::error::ApiError;
use crate::state::AppState;

const STICKER_FIELD: &str = "sticker";
const DEFAULT_STICKER_MIME: &str = "image/webp";

fn validate_target(device_id: i64, recipient_number: &str) -> Result<(), ApiError> {
    if device_id <= 0 {
        return Err(ApiError::bad_request("device_id is required"));
    }
    if recipient_number.trim().is_empty() {
        return Err(ApiError::bad_request("recipient_number is required"));
    }
    Ok(())
}

/// Looks up the recipient's JID; an unregistered number is the caller's
/// mistake, anything else is upstream trouble.
async fn recipient_jid(client: &dyn ProtocolClient, number: &str) -> Result<String, ApiError> {
    resolve_number(client, number.trim()).await.map_err(|e| match e {
        ProtocolError::Rejected(msg) => ApiError::BadRequest(msg),
        other => other.into(),
    })
}

/// Resolves the sending device's client and the recipient's JID.
async fn prepare(
    state: &AppState,
    device_id: i64,
    recipient_number: &str,
) -> Result<(Arc<dyn ProtocolClient>, String), ApiError> {
    let device = state.registry().device_by_id(device_id).await?;
    let client = state.listeners.provider().client_for(&device.jid).await?;
    let to = recipient_jid(client.as_ref(), recipient_number).await?;
    Ok((client, to))
}

async fn deliver(
    client: &dyn ProtocolClient,
    device_id: i64,
    to: &str,
    recipient_number: String,
    content: OutgoingContent,
) -> Result<SendMessageResponse, ApiError> {
    let receipt = client.send_message(to, content).await?;
    info!("Device {} sent message {} to {}", device_id, receipt.id, to);

    Ok(SendMessageResponse {
        status: "Ok".into(),
        timestamp: receipt.timestamp,
        id: receipt.id,
        device_id,
        recipient_number,
    })
}

pub async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Json(req) = body?;
    validate_target(req.device_id, &req.recipient_number)?;
    if req.message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let (client, to) = prepare(&state, req.device_id, &req.recipient_number).await?;
    let content = OutgoingContent::Text(req.message);
    let resp = deliver(client.as_ref(), req.device_id, &to, req.recipient_number, content).await?;
    Ok(Json(resp))
}

/// Sends the uploaded `sticker` multipart field as a sticker message.
pub async fn send_sticker(
    State(state): State<AppState>,
    query: Result<Query<SendStickerQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Query(query) = query?;
    validate_target(query.device_id, &query.recipient_number)?;

    let mut multipart = multipart?;
    let mut sticker = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(STICKER_FIELD) {
            continue;
        }
        let mimetype = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_STICKER_MIME.to_string());
        let data = field.bytes().await?;
        sticker = Some((data, mimetype));
        break;
    }
    let Some((data, mimetype)) = sticker else {
        return Err(ApiError::bad_request("sticker file is required"));
    };
    if data.is_empty() {
        return Err(ApiError::bad_request("sticker file is empty"));
    }

    let (client, to) = prepare(&state, query.device_id, &query.recipient_number).await?;
    let upload = client.upload(data.to_vec(), MediaKind::Sticker).await?;
    let content = OutgoingContent::Sticker { upload, mimetype };
    let resp = deliver(client.as_ref(), query.device_id, &to, query.recipient_number, content).await?;
    Ok(Json(resp))
}
