use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use uatz_gateway::client::ClientProvider;
use uatz_gateway::health::HealthTracker;
use uatz_gateway::listener::ListenerManager;
use uatz_gateway::sink::{BroadcastSink, MessageSink};
use uatz_gateway::test_support::{FakeProvider, clock_at_minute, registry};
use uatz_gateway::webhook::WebhookDispatcher;

use crate::routes::router;
use crate::state::{AppState, AppStateInner};

pub const KEY: &str = "test-key";

pub struct Harness {
    pub app: Router,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
}

pub fn harness() -> Harness {
    let registry = registry();
    let provider = FakeProvider::new();
    let health = HealthTracker::new(registry.clone(), clock_at_minute(5));
    let webhooks = WebhookDispatcher::new(reqwest::Client::new(), health, None);
    let sink = BroadcastSink::default();

    let listeners = ListenerManager::new(
        registry,
        provider.clone() as Arc<dyn ClientProvider>,
        webhooks,
        Arc::new(sink.clone()) as Arc<dyn MessageSink>,
        4,
    );

    let state: AppState = Arc::new(AppStateInner {
        listeners,
        sink,
        api_key: KEY.into(),
        pairing_timeout: Duration::from_secs(2),
    });

    Harness {
        app: router(state.clone()),
        state,
        provider,
    }
}

impl Harness {
    /// Sends an authenticated request and returns status plus JSON body
    /// (`Null` when the body is empty).
    pub async fn call(&self, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", KEY);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(req.body(body).unwrap()).await
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
