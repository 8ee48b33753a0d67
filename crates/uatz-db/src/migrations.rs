use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (devices, handlers, webhooks)");
        conn.execute_batch(
            "
            CREATE TABLE devices (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                jid             TEXT NOT NULL UNIQUE,
                push_name       TEXT NOT NULL,
                business_name   TEXT,
                active          INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE device_handlers (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id       INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                active          INTEGER NOT NULL,
                active_at       TEXT NOT NULL,
                inactive_at     TEXT
            );

            -- At most one live listener interval per device
            CREATE UNIQUE INDEX idx_device_handlers_active
                ON device_handlers(device_id) WHERE active = 1;

            CREATE TABLE device_webhooks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id       INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                webhook_url     TEXT NOT NULL,
                active          INTEGER NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE UNIQUE INDEX idx_device_webhooks_active
                ON device_webhooks(device_id) WHERE active = 1;

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (webhook delivery audit)");
        conn.execute_batch(
            "
            -- No FK: the audit trail outlives a logged-out device
            CREATE TABLE webhook_messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id       INTEGER NOT NULL,
                webhook_url     TEXT NOT NULL,
                message         TEXT NOT NULL,
                response        TEXT NOT NULL,
                code_response   INTEGER NOT NULL,
                timestamp       TEXT NOT NULL
            );

            CREATE INDEX idx_webhook_messages_device
                ON webhook_messages(device_id, timestamp DESC);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
