//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the gateway starts with zero configuration
//! against a sidecar on localhost.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `UATZ_HOST` / `UATZ_PORT`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `UATZ_DB_PATH`
    /// Default: `uatz.db`
    pub db_path: PathBuf,

    /// Base URL of the protocol sidecar.
    /// Env: `UATZ_BRIDGE_URL`
    /// Default: `http://127.0.0.1:4000`
    pub bridge_url: String,

    /// Env: `UATZ_SEND_TIMEOUT_SECS`
    /// Default: 5 seconds.
    pub send_timeout: Duration,

    /// Webhook POST timeout; `None` waits indefinitely.
    /// Env: `UATZ_WEBHOOK_TIMEOUT_SECS`
    pub webhook_timeout: Option<Duration>,

    /// Per-device cap on concurrent webhook deliveries.
    /// Env: `UATZ_WEBHOOK_INFLIGHT`
    /// Default: 8
    pub webhook_inflight: usize,

    /// Env: `UATZ_PAIRING_TIMEOUT_SECS`
    /// Default: 30 seconds.
    pub pairing_timeout: Duration,

    /// Shared secret for `X-Api-Key`.
    /// Env: `API_KEY_TOKEN`
    /// Default: a random UUIDv4, logged at startup.
    pub api_key: String,

    /// Set when `api_key` was generated rather than configured.
    pub api_key_generated: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: PathBuf::from("uatz.db"),
            bridge_url: "http://127.0.0.1:4000".to_string(),
            send_timeout: Duration::from_secs(5),
            webhook_timeout: None,
            webhook_inflight: 8,
            pairing_timeout: Duration::from_secs(30),
            api_key: Uuid::new_v4().to_string(),
            api_key_generated: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let host = var("UATZ_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = var("UATZ_PORT").unwrap_or_else(|| "8080".into());
        match format!("{}:{}", host, port).parse::<SocketAddr>() {
            Ok(addr) => config.http_addr = addr,
            Err(_) => {
                tracing::warn!(host = %host, port = %port, "Invalid UATZ_HOST/UATZ_PORT, using default");
            }
        }

        if let Some(path) = var("UATZ_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(url) = var("UATZ_BRIDGE_URL") {
            config.bridge_url = url.trim_end_matches('/').to_string();
        }

        if let Some(secs) = parse_secs(&var, "UATZ_SEND_TIMEOUT_SECS") {
            config.send_timeout = secs;
        }

        config.webhook_timeout = parse_secs(&var, "UATZ_WEBHOOK_TIMEOUT_SECS");

        if let Some(val) = var("UATZ_WEBHOOK_INFLIGHT") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.webhook_inflight = n,
                _ => tracing::warn!(value = %val, "Invalid UATZ_WEBHOOK_INFLIGHT, using default"),
            }
        }

        if let Some(secs) = parse_secs(&var, "UATZ_PAIRING_TIMEOUT_SECS") {
            config.pairing_timeout = secs;
        }

        if let Some(key) = var("API_KEY_TOKEN").filter(|k| !k.is_empty()) {
            config.api_key = key;
            config.api_key_generated = false;
        }

        config
    }
}

fn parse_secs(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = var(key)?;
    match val.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(value = %val, "Invalid {}, using default", key);
            None
        }
    }
}
