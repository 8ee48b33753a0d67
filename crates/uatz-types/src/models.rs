use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One linked WhatsApp session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub jid: String,
    pub push_name: String,
    pub business_name: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// The phone-number part of the session identifier (`5511999999999` in
    /// `5511999999999.0:12@s.whatsapp.net`).
    pub fn number(&self) -> &str {
        let user = self.jid.split('@').next().unwrap_or_default();
        let user = user.split(':').next().unwrap_or_default();
        user.split('.').next().unwrap_or_default()
    }
}

/// One listener-attachment interval for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandler {
    pub id: i64,
    pub device_id: i64,
    pub active: bool,
    pub active_at: DateTime<Utc>,
    pub inactive_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceWebhook {
    pub id: i64,
    pub device_id: i64,
    pub webhook_url: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one webhook delivery attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub id: i64,
    pub device_id: i64,
    pub webhook_url: String,
    pub message: String,
    pub response: String,
    pub code_response: u16,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaType {
    Text,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    Unknown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::Sticker => "STICKER",
            Self::Document => "DOCUMENT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized inbound message. Built per event, handed to the webhook
/// dispatcher and the sink, never persisted itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    /// Session identifier of the receiving device, filled in right before
    /// webhook delivery.
    #[serde(default)]
    pub jid: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub is_from_me: bool,
    pub is_from_group: bool,
    pub media_type: MediaType,
    pub text: String,
    #[serde(with = "base64_bytes", default)]
    pub content: Vec<u8>,
    pub content_mime_type: String,
    #[serde(rename = "push_name")]
    pub recipient_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Binary payloads travel as standard base64 inside JSON.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            Some(s) if !s.is_empty() => B64.decode(s).map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(jid: &str) -> Device {
        Device {
            id: 1,
            jid: jid.to_string(),
            push_name: "Shop".into(),
            business_name: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn number_strips_agent_and_server() {
        assert_eq!(device("5511999999999.0:12@s.whatsapp.net").number(), "5511999999999");
        assert_eq!(device("5511888888888:3@s.whatsapp.net").number(), "5511888888888");
        assert_eq!(device("5511777777777@s.whatsapp.net").number(), "5511777777777");
    }

    #[test]
    fn stored_message_json_shape() {
        let msg = StoredMessage {
            message_id: "ABC".into(),
            jid: String::new(),
            sender_id: "5511".into(),
            recipient_id: "5511".into(),
            is_from_me: false,
            is_from_group: false,
            media_type: MediaType::Image,
            text: "caption".into(),
            content: vec![1, 2, 3],
            content_mime_type: "image/jpeg".into(),
            recipient_name: "Ana".into(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["media_type"], "IMAGE");
        assert_eq!(json["content"], "AQID");
        assert_eq!(json["push_name"], "Ana");

        let back: StoredMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, vec![1, 2, 3]);
    }
}
