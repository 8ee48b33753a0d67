mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use uatz_api::{AppState, AppStateInner};
use uatz_db::Database;
use uatz_gateway::bridge::BridgeProvider;
use uatz_gateway::client::ClientProvider;
use uatz_gateway::health::{HealthTracker, system_clock};
use uatz_gateway::listener::{ListenerManager, log_delivery_failures};
use uatz_gateway::registry::DeviceRegistry;
use uatz_gateway::sink::{BroadcastSink, MessageSink};
use uatz_gateway::webhook::WebhookDispatcher;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uatz=debug,uatz_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    if config.api_key_generated {
        warn!("API_KEY_TOKEN not set, generated key for this run: {}", config.api_key);
    }

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    let registry = DeviceRegistry::new(db);

    // Gateway core
    let http = reqwest::Client::new();
    let provider = BridgeProvider::new(http.clone(), &config.bridge_url, config.send_timeout);
    let health = HealthTracker::new(registry.clone(), system_clock());
    let webhooks = WebhookDispatcher::new(http, health, config.webhook_timeout);
    let sink = BroadcastSink::default();

    let listeners = ListenerManager::new(
        registry,
        Arc::new(provider) as Arc<dyn ClientProvider>,
        webhooks,
        Arc::new(sink.clone()) as Arc<dyn MessageSink>,
        config.webhook_inflight,
    );

    tokio::spawn(log_delivery_failures(listeners.reports()));

    // Re-attach every registered device without holding up the HTTP server.
    let boot = listeners.clone();
    tokio::spawn(async move {
        match boot.bootstrap().await {
            Ok(summary) => {
                for (jid, reason) in &summary.failed {
                    warn!("Device {} not listening after bootstrap: {}", jid, reason);
                }
            }
            Err(e) => error!("Bootstrap failed: {}", e),
        }
    });

    let state: AppState = Arc::new(AppStateInner {
        listeners: listeners.clone(),
        sink,
        api_key: config.api_key.clone(),
        pairing_timeout: config.pairing_timeout,
    });

    let app = uatz_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("uatz gateway listening on {}", config.http_addr);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    listeners.shutdown().await?;
    info!("uatz gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
