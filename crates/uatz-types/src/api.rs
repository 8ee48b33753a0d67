use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { status: "ok".into() }
    }
}

// -- Devices --

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(rename = "qrCode")]
    pub qr_code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub id: i64,
    pub jid: String,
    pub number: String,
    pub push_name: String,
    pub business_name: String,
    pub listening: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct StartListenerQuery {
    pub client_id: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub device_id: i64,
    #[serde(default)]
    pub recipient_number: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendStickerQuery {
    #[serde(default)]
    pub device_id: i64,
    #[serde(default)]
    pub recipient_number: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub device_id: i64,
    pub recipient_number: String,
}

// -- Webhooks --

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub device_id: i64,
    #[serde(default)]
    pub webhook_url: String,
}

/// Body a webhook subscriber answers with. A non-empty `response_text` is
/// sent back to the original sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookReply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub response_text: String,
}
