use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use uatz_gateway::GatewayError;
use uatz_gateway::error::ProtocolError;
use uatz_types::api::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ApiError::Internal(detail) => {
                error!("Request failed: {}", detail);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::DeviceNotFound(_) => ApiError::NotFound(e.to_string()),
            GatewayError::DeviceExists(_) => ApiError::Conflict(e.to_string()),
            GatewayError::ClientResolution { .. }
            | GatewayError::Listener { .. }
            | GatewayError::Protocol(_)
            | GatewayError::Download(_)
            | GatewayError::Webhook { .. } => ApiError::Upstream(e.to_string()),
            GatewayError::UnrecognizedMessage
            | GatewayError::Storage(_)
            | GatewayError::Join(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(format!("Invalid request body: {}", e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(format!("Invalid query: {}", e.body_text()))
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// Parses a numeric device id taken from the path or query.
pub fn parse_device_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::bad_request("invalid device_id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_statuses() {
        let status = |e: GatewayError| ApiError::from(e).into_response().status();

        assert_eq!(status(GatewayError::DeviceNotFound("7".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(GatewayError::DeviceExists("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status(GatewayError::Protocol(ProtocolError::NotConnected)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(GatewayError::Storage(anyhow::anyhow!("disk full"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_hide_detail() {
        let resp = ApiError::Internal("disk full".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn device_id_must_be_positive() {
        assert_eq!(parse_device_id("12").unwrap(), 12);
        assert!(parse_device_id("0").is_err());
        assert!(parse_device_id("abc").is_err());
    }
}
