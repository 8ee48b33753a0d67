use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::StoredMessage;

// -- Protocol client events --

/// Events a protocol client delivers to its registered handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// An inbound (or echoed outbound) chat message
    Message(Box<MessageEvent>),

    /// The session finished connecting (first pairing or reconnect)
    Connected,

    /// The session was unlinked from the phone
    LoggedOut { reason: Option<String> },

    /// Transport dropped; the client reconnects on its own
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub info: MessageInfo,
    /// `None` when the protocol handed over an event without any payload.
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    /// User part of the chat the message belongs to.
    pub chat: String,
    pub sender: String,
    pub is_from_me: bool,
    pub is_group: bool,
    #[serde(default)]
    pub push_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Message content. At most one of the typed variants is populated; anything
/// the gateway does not model lands in `other`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_message: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_message: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_message: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_message: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_message: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Enough of an encrypted media attachment for the protocol client to fetch
/// and decrypt it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    #[serde(default)]
    pub direct_path: String,
    #[serde(default)]
    pub media_key: String,
    #[serde(default)]
    pub file_enc_sha256: String,
    #[serde(default)]
    pub file_sha256: String,
    #[serde(default)]
    pub file_length: u64,
    pub mimetype: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedText {
    pub text: Option<String>,
}

/// Who a paired session is, as reported by the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub jid: String,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub business_name: Option<String>,
}

/// Media class used when uploading outbound attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

/// Handle returned by an upload, referenced by the outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRef {
    pub url: String,
    pub direct_path: String,
    pub media_key: String,
    pub file_enc_sha256: String,
    pub file_sha256: String,
    pub file_length: u64,
}

/// Outbound message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutgoingContent {
    Text(String),
    Sticker { upload: UploadRef, mimetype: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// One row of an `IsOnWhatsApp` lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberLookup {
    pub query: String,
    pub is_in: bool,
    pub jid: Option<String>,
}

/// Pairing progress for a client that has no session yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PairingEvent {
    Code { code: String },
    Success { jid: String },
    Timeout,
    Error { message: String },
}

// -- Gateway stream --

/// Events pushed to WebSocket consumers of the message sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection accepted
    Ready { version: String },

    /// A device received a message
    MessageReceived {
        device_id: i64,
        message: StoredMessage,
    },
}

impl GatewayEvent {
    /// Returns the device this event is scoped to, if any.
    pub fn device_id(&self) -> Option<i64> {
        match self {
            Self::MessageReceived { device_id, .. } => Some(*device_id),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM a consumer TO the gateway over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Only forward messages for these devices.
    Subscribe { device_ids: Vec<i64> },
}
