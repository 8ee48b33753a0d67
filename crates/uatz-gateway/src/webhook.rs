//! Outbound webhook delivery.
//!
//! POSTs a stored message to the device's webhook, audits the response
//! through the health tracker and relays any `response_text` back to the
//! sender. Delivery is at-most-once; nothing here retries.

use std::time::Duration;

use tracing::{debug, warn};

use uatz_types::api::WebhookReply;
use uatz_types::events::OutgoingContent;
use uatz_types::models::{Device, StoredMessage};

use crate::client::{ProtocolClient, chat_jid};
use crate::error::{GatewayError, Result};
use crate::health::{DeliveryRecord, HealthTracker, HealthVerdict};

/// Where a device's messages go, captured when its listener attaches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub active: bool,
}

impl WebhookTarget {
    pub fn is_deliverable(&self) -> bool {
        self.active && !self.url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No active webhook; nothing was sent or recorded.
    Skipped,
    Delivered {
        status: u16,
        replied: bool,
        verdict: HealthVerdict,
    },
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    http: reqwest::Client,
    health: HealthTracker,
    timeout: Option<Duration>,
}

impl WebhookDispatcher {
    pub fn new(http: reqwest::Client, health: HealthTracker, timeout: Option<Duration>) -> Self {
        Self { http, health, timeout }
    }

    pub async fn send(
        &self,
        mut message: StoredMessage,
        device: &Device,
        target: &WebhookTarget,
        client: &dyn ProtocolClient,
    ) -> Result<DeliveryOutcome> {
        if !target.is_deliverable() {
            return Ok(DeliveryOutcome::Skipped);
        }

        message.jid = device.jid.clone();
        let request_body = serde_json::to_string(&message).map_err(|e| GatewayError::Webhook {
            url: target.url.clone(),
            reason: format!("failed to serialize payload: {}", e),
        })?;

        let mut req = self
            .http
            .post(&target.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request_body.clone());
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|e| {
            warn!("Webhook POST to {} failed for device {}: {}", target.url, device.id, e);
            GatewayError::Webhook {
                url: target.url.clone(),
                reason: format!("request failed: {}", e),
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| {
            warn!("Failed to read webhook response from {}: {}", target.url, e);
            GatewayError::Webhook {
                url: target.url.clone(),
                reason: format!("failed to read response body: {}", e),
            }
        })?;

        let reply: WebhookReply = serde_json::from_str(&body).map_err(|e| {
            warn!(
                "Unparseable webhook response from {} (HTTP {}): {} -- raw: {}",
                target.url,
                status,
                e,
                crate::excerpt(&body, 200)
            );
            GatewayError::Webhook {
                url: target.url.clone(),
                reason: format!("unparseable response: {}", e),
            }
        })?;

        let verdict = self
            .health
            .record(DeliveryRecord {
                device_id: device.id,
                webhook_url: target.url.clone(),
                request_body,
                response_body: body.replace('\n', ""),
                status_code: status,
            })
            .await?;

        debug!(
            "Webhook {} answered HTTP {} ({}) for message {}",
            target.url, status, reply.status, message.message_id
        );

        if reply.response_text.is_empty() {
            return Ok(DeliveryOutcome::Delivered { status, replied: false, verdict });
        }

        let to = chat_jid(&message.recipient_id, message.is_from_group);
        client
            .send_message(&to, OutgoingContent::Text(reply.response_text))
            .await
            .map_err(|e| {
                warn!("Failed to relay webhook reply to {}: {}", to, e);
                GatewayError::Protocol(e)
            })?;

        Ok(DeliveryOutcome::Delivered { status, replied: true, verdict })
    }
}
