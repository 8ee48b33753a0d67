use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use uatz_types::api::{StatusResponse, WebhookRequest};
use uatz_types::models::DeviceWebhook;

use crate::error::{ApiError, parse_device_id};
use crate::state::AppState;

/// Registers a webhook for a device, superseding its current one.
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(req) = body?;

    if req.device_id <= 0 {
        return Err(ApiError::bad_request("device_id is required"));
    }
    let url = req.webhook_url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("webhook_url is required"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::bad_request("webhook_url must be an http(s) URL"));
    }

    let webhook = state.registry().create_webhook(req.device_id, url).await?;
    info!("Device {} now delivers to {}", webhook.device_id, webhook.webhook_url);

    Ok(Json(StatusResponse::ok()))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<DeviceWebhook>>, ApiError> {
    Ok(Json(state.registry().list_active_webhooks().await?))
}

pub async fn list_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<DeviceWebhook>>, ApiError> {
    let device_id = parse_device_id(&device_id)?;
    Ok(Json(state.registry().list_webhooks_by_device(device_id).await?))
}

/// The device's active webhook, or `204 No Content` when it has none.
pub async fn active_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Response, ApiError> {
    let device_id = parse_device_id(&device_id)?;
    Ok(match state.registry().active_webhook(device_id).await? {
        Some(webhook) => Json(webhook).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn remove_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let device_id = parse_device_id(&device_id)?;
    let removed = state.registry().deactivate_webhooks(device_id).await?;
    info!("Deactivated {} webhook(s) of device {}", removed, device_id);
    Ok(Json(StatusResponse::ok()))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use uatz_types::events::DeviceIdentity;

    use crate::testing::harness;

    async fn register(h: &crate::testing::Harness, jid: &str) -> i64 {
        h.state
            .registry()
            .insert_device_if_not_exists(&DeviceIdentity {
                jid: jid.into(),
                push_name: "Loja".into(),
                business_name: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn webhook_lifecycle() {
        let h = harness();
        let id = register(&h, "5511999@s.whatsapp.net").await;

        let (status, _) = h.call("GET", &format!("/webhooks/device/{id}/active"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = h
            .call("GET", &format!("/webhooks/device/{id}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = h
            .call(
                "POST",
                "/webhooks",
                Some(json!({"device_id": id, "webhook_url": "https://hooks.example/a"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        h.call(
            "POST",
            "/webhooks",
            Some(json!({"device_id": id, "webhook_url": "https://hooks.example/b"})),
        )
        .await;

        let (status, body) = h.call("GET", &format!("/webhooks/device/{id}/active"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["webhook_url"], "https://hooks.example/b");

        let (_, body) = h.call("GET", "/webhooks", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = h.call("DELETE", &format!("/webhooks/device/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h.call("GET", &format!("/webhooks/device/{id}/active"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn create_validates_input() {
        let h = harness();

        let (status, body) = h
            .call("POST", "/webhooks", Some(json!({"webhook_url": "https://x"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "device_id is required");

        let (status, _) = h
            .call("POST", "/webhooks", Some(json!({"device_id": 1, "webhook_url": "ftp://x"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .call("POST", "/webhooks", Some(json!({"device_id": 42, "webhook_url": "https://x"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_device_id_in_path() {
        let h = harness();
        let (status, body) = h.call("GET", "/webhooks/device/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid device_id");
    }
}
