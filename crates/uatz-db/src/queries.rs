use crate::Database;
use crate::models::{
    DeviceHandlerRow, DeviceRow, DeviceWebhookRow, NewDevice, NewWebhookMessage,
    WebhookMessageRow,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Row;

/// Result of a conflict-aware insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    AlreadyExists,
}

const DEVICE_COLUMNS: &str = "id, jid, push_name, business_name, active, created_at";
const HANDLER_COLUMNS: &str = "id, device_id, active, active_at, inactive_at";
const WEBHOOK_COLUMNS: &str = "id, device_id, webhook_url, active, created_at";

impl Database {
    // -- Devices --

    /// Registers a device unless one with the same session identifier exists.
    /// Relies on the UNIQUE constraint on `jid`, so concurrent pairings for
    /// one session cannot both insert.
    pub fn insert_device_if_not_exists(&self, device: &NewDevice) -> Result<InsertOutcome<DeviceRow>> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO devices (jid, push_name, business_name, active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(jid) DO NOTHING",
                rusqlite::params![
                    &device.jid,
                    &device.push_name,
                    &device.business_name,
                    device.created_at,
                ],
            )?;

            if inserted == 0 {
                return Ok(InsertOutcome::AlreadyExists);
            }

            Ok(InsertOutcome::Inserted(DeviceRow {
                id: conn.last_insert_rowid(),
                jid: device.jid.clone(),
                push_name: device.push_name.clone(),
                business_name: device.business_name.clone(),
                active: true,
                created_at: device.created_at,
            }))
        })
    }

    pub fn get_device_by_jid(&self, jid: &str) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM devices WHERE jid = ?1 AND active = 1", DEVICE_COLUMNS);
            conn.query_row(&sql, [jid], device_from_row).optional()
        })
    }

    pub fn get_device_by_id(&self, id: i64) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM devices WHERE id = ?1 AND active = 1", DEVICE_COLUMNS);
            conn.query_row(&sql, [id], device_from_row).optional()
        })
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM devices WHERE active = 1 ORDER BY id", DEVICE_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], device_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_device_jids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT jid FROM devices WHERE active = 1 ORDER BY id")?;
            let jids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jids)
        })
    }

    /// Physically deletes the device. Handler and webhook rows go with it.
    /// Returns false when there was nothing to delete.
    pub fn remove_device(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM devices WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }

    // -- Device handlers --

    /// Opens a new listener interval for the device, closing its previous
    /// active interval in the same transaction.
    pub fn open_handler(&self, device_id: i64, now: DateTime<Utc>) -> Result<DeviceHandlerRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE device_handlers SET active = 0, inactive_at = ?2
                 WHERE device_id = ?1 AND active = 1",
                rusqlite::params![device_id, now],
            )?;
            tx.execute(
                "INSERT INTO device_handlers (device_id, active, active_at) VALUES (?1, 1, ?2)",
                rusqlite::params![device_id, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(DeviceHandlerRow {
                id,
                device_id,
                active: true,
                active_at: now,
                inactive_at: None,
            })
        })
    }

    pub fn close_handlers_for_device(&self, device_id: i64, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let closed = conn.execute(
                "UPDATE device_handlers SET active = 0, inactive_at = ?2
                 WHERE device_id = ?1 AND active = 1",
                rusqlite::params![device_id, now],
            )?;
            Ok(closed)
        })
    }

    /// Closes every active interval regardless of device.
    pub fn deactivate_all_handlers(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let closed = conn.execute(
                "UPDATE device_handlers SET active = 0, inactive_at = ?1 WHERE active = 1",
                [now],
            )?;
            Ok(closed)
        })
    }

    /// Closes active intervals whose device is not in `live_device_ids`.
    /// These are left over from a previous process that died without
    /// detaching.
    pub fn finalize_orphaned_handlers(&self, live_device_ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        if live_device_ids.is_empty() {
            return self.deactivate_all_handlers(now);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (2..=live_device_ids.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE device_handlers SET active = 0, inactive_at = ?1
                 WHERE active = 1 AND device_id NOT IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::with_capacity(live_device_ids.len() + 1);
            params.push(&now);
            for id in live_device_ids {
                params.push(id as &dyn rusqlite::types::ToSql);
            }

            let closed = conn.execute(&sql, params.as_slice())?;
            Ok(closed)
        })
    }

    pub fn active_handlers(&self) -> Result<Vec<DeviceHandlerRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM device_handlers WHERE active = 1 ORDER BY device_id",
                HANDLER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], handler_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn handlers_for_device(&self, device_id: i64) -> Result<Vec<DeviceHandlerRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM device_handlers WHERE device_id = ?1 ORDER BY id",
                HANDLER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([device_id], handler_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Webhooks --

    /// Supersedes the device's webhook: every active row is deactivated, then
    /// a fresh active row is inserted. Returns `None` if the device is unknown.
    pub fn create_webhook(
        &self,
        device_id: i64,
        webhook_url: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceWebhookRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1 AND active = 1)",
                [device_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(None);
            }

            tx.execute(
                "UPDATE device_webhooks SET active = 0 WHERE device_id = ?1 AND active = 1",
                [device_id],
            )?;
            tx.execute(
                "INSERT INTO device_webhooks (device_id, webhook_url, active, created_at)
                 VALUES (?1, ?2, 1, ?3)",
                rusqlite::params![device_id, webhook_url, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(Some(DeviceWebhookRow {
                id,
                device_id,
                webhook_url: webhook_url.to_string(),
                active: true,
                created_at: now,
            }))
        })
    }

    /// Returns how many rows were switched off.
    pub fn deactivate_webhooks(&self, device_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE device_webhooks SET active = 0 WHERE device_id = ?1 AND active = 1",
                [device_id],
            )?;
            Ok(changed)
        })
    }

    pub fn get_active_webhook(&self, device_id: i64) -> Result<Option<DeviceWebhookRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM device_webhooks WHERE device_id = ?1 AND active = 1",
                WEBHOOK_COLUMNS
            );
            conn.query_row(&sql, [device_id], webhook_from_row).optional()
        })
    }

    pub fn list_active_webhooks(&self) -> Result<Vec<DeviceWebhookRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM device_webhooks WHERE active = 1 ORDER BY device_id",
                WEBHOOK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], webhook_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_webhooks_by_device(&self, device_id: i64) -> Result<Vec<DeviceWebhookRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM device_webhooks WHERE device_id = ?1 ORDER BY id",
                WEBHOOK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([device_id], webhook_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Webhook delivery audit --

    pub fn insert_webhook_message(&self, msg: &NewWebhookMessage) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO webhook_messages
                    (device_id, webhook_url, message, response, code_response, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.device_id,
                    &msg.webhook_url,
                    &msg.message,
                    &msg.response,
                    msg.code_response,
                    msg.timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Newest first.
    pub fn recent_webhook_messages(&self, device_id: i64, limit: u32) -> Result<Vec<WebhookMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, webhook_url, message, response, code_response, timestamp
                 FROM webhook_messages
                 WHERE device_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![device_id, limit], |row| {
                    Ok(WebhookMessageRow {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        webhook_url: row.get(2)?,
                        message: row.get(3)?,
                        response: row.get(4)?,
                        code_response: row.get(5)?,
                        timestamp: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRow> {
    Ok(DeviceRow {
        id: row.get(0)?,
        jid: row.get(1)?,
        push_name: row.get(2)?,
        business_name: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn handler_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceHandlerRow> {
    Ok(DeviceHandlerRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        active: row.get(2)?,
        active_at: row.get(3)?,
        inactive_at: row.get(4)?,
    })
}

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceWebhookRow> {
    Ok(DeviceWebhookRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        webhook_url: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
