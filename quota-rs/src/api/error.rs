use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::QuotaError;

/// Error body returned by the API
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<i64>,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            error: msg.to_string(),
            available_bytes: None,
            required_bytes: None,
        }
    }
}

/// `QuotaExceeded` is the only error whose details reach clients.
impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        match self {
            QuotaError::QuotaExceeded {
                available_bytes,
                required_bytes,
                ..
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(ApiError {
                    error: "Storage quota exceeded".to_string(),
                    available_bytes: Some(available_bytes),
                    required_bytes: Some(required_bytes),
                }),
            )
                .into_response(),
            other => {
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiError::new("Internal server error")),
                )
                    .into_response()
            }
        }
    }
}
