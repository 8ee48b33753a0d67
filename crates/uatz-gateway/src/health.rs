//! Webhook health tracking. Every delivery is audited; on four minutes out
//! of five the device's recent history is checked and a webhook whose last
//! deliveries all failed is switched off.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tracing::{error, warn};

use uatz_db::models::NewWebhookMessage;
use uatz_types::models::WebhookMessage;

use crate::error::Result;
use crate::registry::DeviceRegistry;

/// How many recent deliveries are inspected.
pub const HEALTH_WINDOW: u32 = 20;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// One finished delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub device_id: i64,
    pub webhook_url: String,
    pub request_body: String,
    pub response_body: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Evaluation throttled for this minute.
    Skipped,
    Healthy,
    Deactivated,
}

#[derive(Clone)]
pub struct HealthTracker {
    registry: DeviceRegistry,
    clock: Clock,
}

impl HealthTracker {
    pub fn new(registry: DeviceRegistry, clock: Clock) -> Self {
        Self { registry, clock }
    }

    /// Appends the attempt to the audit trail, then evaluates the device's
    /// health if this minute is sampled. A failed audit write is logged and
    /// does not stop the evaluation.
    pub async fn record(&self, record: DeliveryRecord) -> Result<HealthVerdict> {
        let now = (self.clock)();
        let device_id = record.device_id;
        let webhook_url = record.webhook_url.clone();

        let audit = NewWebhookMessage {
            device_id: record.device_id,
            webhook_url: record.webhook_url,
            message: record.request_body,
            response: record.response_body,
            code_response: record.status_code,
            timestamp: now,
        };
        if let Err(e) = self.registry.record_webhook_message(audit).await {
            error!("Failed to record webhook delivery for device {}: {}", device_id, e);
        }

        if !should_evaluate(now) {
            return Ok(HealthVerdict::Skipped);
        }

        self.evaluate(device_id, &webhook_url).await
    }

    pub async fn evaluate(&self, device_id: i64, webhook_url: &str) -> Result<HealthVerdict> {
        let recent = self
            .registry
            .recent_webhook_messages(device_id, HEALTH_WINDOW)
            .await?;

        if !all_failing(&recent) {
            return Ok(HealthVerdict::Healthy);
        }

        self.registry.deactivate_webhooks(device_id).await?;
        warn!(
            "Webhook {} deactivated for device {} after {} failed deliveries",
            webhook_url,
            device_id,
            recent.len()
        );
        Ok(HealthVerdict::Deactivated)
    }
}

/// Health checks run whenever the minute is not a multiple of five.
pub fn should_evaluate(now: DateTime<Utc>) -> bool {
    now.minute() % 5 != 0
}

/// True when there is history and none of it is a 200.
pub fn all_failing(messages: &[WebhookMessage]) -> bool {
    !messages.is_empty() && messages.iter().all(|m| m.code_response != 200)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clock_at_minute, registry};
    use uatz_types::events::DeviceIdentity;

    fn record(device_id: i64, status: u16) -> DeliveryRecord {
        DeliveryRecord {
            device_id,
            webhook_url: "http://hook.local".into(),
            request_body: "{}".into(),
            response_body: "{\"status\":\"ok\"}".into(),
            status_code: status,
        }
    }

    async fn device_with_webhook(reg: &DeviceRegistry) -> i64 {
        let device = reg
            .insert_device_if_not_exists(&DeviceIdentity {
                jid: "5511@s.whatsapp.net".into(),
                push_name: "Shop".into(),
                business_name: None,
            })
            .await
            .unwrap();
        reg.create_webhook(device.id, "http://hook.local").await.unwrap();
        device.id
    }

    #[test]
    fn sampling_skips_multiples_of_five() {
        use chrono::TimeZone;
        let at = |m| Utc.with_ymd_and_hms(2024, 1, 1, 12, m, 30).unwrap();
        assert!(!should_evaluate(at(0)));
        assert!(should_evaluate(at(1)));
        assert!(should_evaluate(at(4)));
        assert!(!should_evaluate(at(55)));
        assert!(should_evaluate(at(59)));
    }

    #[test]
    fn empty_history_is_not_failing() {
        assert!(!all_failing(&[]));
    }

    #[tokio::test]
    async fn twenty_failures_deactivate_webhook() {
        let reg = registry();
        let device_id = device_with_webhook(&reg).await;
        let tracker = HealthTracker::new(reg.clone(), clock_at_minute(7));

        let mut verdict = HealthVerdict::Healthy;
        for _ in 0..20 {
            verdict = tracker.record(record(device_id, 500)).await.unwrap();
        }

        assert_eq!(verdict, HealthVerdict::Deactivated);
        assert!(reg.active_webhook(device_id).await.unwrap().is_none());
        assert_eq!(reg.recent_webhook_messages(device_id, 50).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn few_failures_are_already_eligible() {
        let reg = registry();
        let device_id = device_with_webhook(&reg).await;
        let tracker = HealthTracker::new(reg.clone(), clock_at_minute(3));

        let verdict = tracker.record(record(device_id, 404)).await.unwrap();
        assert_eq!(verdict, HealthVerdict::Deactivated);
    }

    #[tokio::test]
    async fn one_success_keeps_webhook_alive() {
        let reg = registry();
        let device_id = device_with_webhook(&reg).await;
        let tracker = HealthTracker::new(reg.clone(), clock_at_minute(8));

        tracker.record(record(device_id, 200)).await.unwrap();
        for _ in 0..19 {
            assert_eq!(
                tracker.record(record(device_id, 502)).await.unwrap(),
                HealthVerdict::Healthy
            );
        }

        // The 200 falls out of the window on the next failure.
        assert_eq!(
            tracker.record(record(device_id, 502)).await.unwrap(),
            HealthVerdict::Deactivated
        );
    }

    #[tokio::test]
    async fn throttled_minute_still_audits() {
        let reg = registry();
        let device_id = device_with_webhook(&reg).await;
        let tracker = HealthTracker::new(reg.clone(), clock_at_minute(10));

        for _ in 0..25 {
            assert_eq!(
                tracker.record(record(device_id, 500)).await.unwrap(),
                HealthVerdict::Skipped
            );
        }

        assert!(reg.active_webhook(device_id).await.unwrap().is_some());
        assert_eq!(reg.recent_webhook_messages(device_id, 50).await.unwrap().len(), 25);
    }
}
