use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use uatz_db::Database;
use uatz_db::InsertOutcome;
use uatz_db::models::{NewDevice, NewWebhookMessage};
use uatz_types::events::DeviceIdentity;
use uatz_types::models::{Device, DeviceHandler, DeviceWebhook, WebhookMessage};

use crate::error::{GatewayError, Result};
use crate::webhook::WebhookTarget;

/// Async facade over the device registry tables. Every call runs the
/// blocking SQLite work off the runtime.
#[derive(Clone)]
pub struct DeviceRegistry {
    db: Arc<Database>,
}

impl DeviceRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(db.as_ref())).await??)
    }

    // -- Devices --

    pub async fn find_device_by_jid(&self, jid: &str) -> Result<Option<Device>> {
        let jid = jid.to_string();
        let row = self.blocking(move |db| db.get_device_by_jid(&jid)).await?;
        Ok(row.map(Device::from))
    }

    pub async fn device_by_jid(&self, jid: &str) -> Result<Device> {
        self.find_device_by_jid(jid)
            .await?
            .ok_or_else(|| GatewayError::DeviceNotFound(jid.to_string()))
    }

    pub async fn device_by_id(&self, id: i64) -> Result<Device> {
        self.blocking(move |db| db.get_device_by_id(id))
            .await?
            .map(Device::from)
            .ok_or_else(|| GatewayError::DeviceNotFound(id.to_string()))
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = self.blocking(|db| db.list_devices()).await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn device_jids(&self) -> Result<Vec<String>> {
        self.blocking(|db| db.list_device_jids()).await
    }

    /// Registers a freshly paired session. A second call for the same
    /// session identifier inserts nothing and yields `DeviceExists`.
    pub async fn insert_device_if_not_exists(&self, identity: &DeviceIdentity) -> Result<Device> {
        let new = NewDevice {
            jid: identity.jid.clone(),
            push_name: identity.push_name.clone(),
            business_name: identity.business_name.clone().filter(|b| !b.is_empty()),
            created_at: Utc::now(),
        };

        match self.blocking(move |db| db.insert_device_if_not_exists(&new)).await? {
            InsertOutcome::Inserted(row) => {
                debug!("Device {} registered with id {}", row.jid, row.id);
                Ok(row.into())
            }
            InsertOutcome::AlreadyExists => Err(GatewayError::DeviceExists(identity.jid.clone())),
        }
    }

    pub async fn remove_device(&self, id: i64) -> Result<bool> {
        self.blocking(move |db| db.remove_device(id)).await
    }

    // -- Handler intervals --

    pub async fn open_handler(&self, device_id: i64) -> Result<DeviceHandler> {
        let row = self.blocking(move |db| db.open_handler(device_id, Utc::now())).await?;
        Ok(row.into())
    }

    pub async fn close_handlers(&self, device_id: i64) -> Result<usize> {
        self.blocking(move |db| db.close_handlers_for_device(device_id, Utc::now())).await
    }

    pub async fn deactivate_all_handlers(&self) -> Result<usize> {
        self.blocking(|db| db.deactivate_all_handlers(Utc::now())).await
    }

    pub async fn finalize_orphaned_handlers(&self, live_device_ids: Vec<i64>) -> Result<usize> {
        self.blocking(move |db| db.finalize_orphaned_handlers(&live_device_ids, Utc::now()))
            .await
    }

    pub async fn active_handlers(&self) -> Result<Vec<DeviceHandler>> {
        let rows = self.blocking(|db| db.active_handlers()).await?;
        Ok(rows.into_iter().map(DeviceHandler::from).collect())
    }

    // -- Webhooks --

    /// Supersedes whatever webhook the device had with `webhook_url`.
    pub async fn create_webhook(&self, device_id: i64, webhook_url: &str) -> Result<DeviceWebhook> {
        let url = webhook_url.to_string();
        self.blocking(move |db| db.create_webhook(device_id, &url, Utc::now()))
            .await?
            .map(DeviceWebhook::from)
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))
    }

    pub async fn deactivate_webhooks(&self, device_id: i64) -> Result<usize> {
        self.blocking(move |db| db.deactivate_webhooks(device_id)).await
    }

    pub async fn active_webhook(&self, device_id: i64) -> Result<Option<DeviceWebhook>> {
        let row = self.blocking(move |db| db.get_active_webhook(device_id)).await?;
        Ok(row.map(DeviceWebhook::from))
    }

    /// The device's current webhook as a delivery target; empty and inactive
    /// when it has none.
    pub async fn webhook_target(&self, device_id: i64) -> Result<WebhookTarget> {
        Ok(self
            .active_webhook(device_id)
            .await?
            .map(|w| WebhookTarget {
                url: w.webhook_url,
                active: w.active,
            })
            .unwrap_or_default())
    }

    pub async fn list_active_webhooks(&self) -> Result<Vec<DeviceWebhook>> {
        let rows = self.blocking(|db| db.list_active_webhooks()).await?;
        Ok(rows.into_iter().map(DeviceWebhook::from).collect())
    }

    pub async fn list_webhooks_by_device(&self, device_id: i64) -> Result<Vec<DeviceWebhook>> {
        let rows = self.blocking(move |db| db.list_webhooks_by_device(device_id)).await?;
        Ok(rows.into_iter().map(DeviceWebhook::from).collect())
    }

    // -- Delivery audit --

    pub async fn record_webhook_message(&self, msg: NewWebhookMessage) -> Result<i64> {
        self.blocking(move |db| db.insert_webhook_message(&msg)).await
    }

    pub async fn recent_webhook_messages(&self, device_id: i64, limit: u32) -> Result<Vec<WebhookMessage>> {
        let rows = self
            .blocking(move |db| db.recent_webhook_messages(device_id, limit))
            .await?;
        Ok(rows.into_iter().map(WebhookMessage::from).collect())
    }
}
