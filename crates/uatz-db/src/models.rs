//! Database row types. These map directly to SQLite rows and convert into the
//! `uatz-types` models at the crate boundary.

use chrono::{DateTime, Utc};
use uatz_types::models::{Device, DeviceHandler, DeviceWebhook, WebhookMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    pub id: i64,
    pub jid: String,
    pub push_name: String,
    pub business_name: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeviceHandlerRow {
    pub id: i64,
    pub device_id: i64,
    pub active: bool,
    pub active_at: DateTime<Utc>,
    pub inactive_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DeviceWebhookRow {
    pub id: i64,
    pub device_id: i64,
    pub webhook_url: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WebhookMessageRow {
    pub id: i64,
    pub device_id: i64,
    pub webhook_url: String,
    pub message: String,
    pub response: String,
    pub code_response: u16,
    pub timestamp: DateTime<Utc>,
}

/// Fields of a device about to be registered.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub jid: String,
    pub push_name: String,
    pub business_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One delivery attempt about to be appended to the audit trail.
#[derive(Debug, Clone)]
pub struct NewWebhookMessage {
    pub device_id: i64,
    pub webhook_url: String,
    pub message: String,
    pub response: String,
    pub code_response: u16,
    pub timestamp: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            jid: row.jid,
            push_name: row.push_name,
            business_name: row.business_name,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

impl From<DeviceHandlerRow> for DeviceHandler {
    fn from(row: DeviceHandlerRow) -> Self {
        DeviceHandler {
            id: row.id,
            device_id: row.device_id,
            active: row.active,
            active_at: row.active_at,
            inactive_at: row.inactive_at,
        }
    }
}

impl From<DeviceWebhookRow> for DeviceWebhook {
    fn from(row: DeviceWebhookRow) -> Self {
        DeviceWebhook {
            id: row.id,
            device_id: row.device_id,
            webhook_url: row.webhook_url,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

impl From<WebhookMessageRow> for WebhookMessage {
    fn from(row: WebhookMessageRow) -> Self {
        WebhookMessage {
            id: row.id,
            device_id: row.device_id,
            webhook_url: row.webhook_url,
            message: row.message,
            response: row.response,
            code_response: row.code_response,
            timestamp: row.timestamp,
        }
    }
}
