use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::notifier::NotifyError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookFailureResponse {
    pub error: String,
    pub webhook_status: u16,
    pub webhook_message: String,
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            FlagError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            FlagError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            FlagError::Storage(err) => {
                tracing::error!("storage failure: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to access flag storage.".to_string(),
                )
            }
            FlagError::Notify(NotifyError::Status { status, body }) => {
                tracing::error!(status, "webhook rejected change notification: {}", body);
                let code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let response = WebhookFailureResponse {
                    error: "Failed to notify webhook".to_string(),
                    webhook_status: status,
                    webhook_message: body,
                };
                return (code, Json(response)).into_response();
            }
            FlagError::Notify(err) => {
                tracing::error!("change notification failed: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
