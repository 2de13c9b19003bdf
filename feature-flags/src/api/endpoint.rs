use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use common_types::{
    Actor, ChangeAction, FlagMap, MessageResponse, OverrideNotification, UpdateSummary,
};
use serde_json::Value;

use crate::notifier::ChangeNotifier;
use crate::store::DefaultStore;
use crate::{api::errors::FlagError, router};

const INVALID_BULK_BODY: &str = "Invalid request body: Expected an object of flags.";
const INVALID_SINGLE_BODY: &str = "Invalid request body: Expected { value: boolean }.";
const MISSING_NOTIFICATION_FIELDS: &str = "Missing required fields for override notification";

pub async fn index() -> &'static str {
    "feature flags service"
}

/// Current defaults of every flag.
pub async fn list_flags(state: State<router::State>) -> Result<Json<FlagMap>, FlagError> {
    let flags = state.store.list().await.map_err(|e| {
        tracing::error!("Failed to retrieve flags: {}", e);
        FlagError::Storage(e)
    })?;
    Ok(Json(flags))
}

pub async fn update_defaults(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<UpdateSummary>, FlagError> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|_| FlagError::Validation(INVALID_BULK_BODY.to_string()))?;

    let outcome = state.admin.update_defaults(&body).await?;
    Ok(Json(outcome.summary()))
}

pub async fn update_default(
    state: State<router::State>,
    Path(flag_name): Path<String>,
    body: Bytes,
) -> Result<Json<MessageResponse>, FlagError> {
    let value = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|body| body.get("value").and_then(Value::as_bool))
        .ok_or_else(|| FlagError::Validation(INVALID_SINGLE_BODY.to_string()))?;

    let outcome = state.admin.update_default(&flag_name, value).await?;
    Ok(Json(MessageResponse::new(outcome.message(&flag_name))))
}

fn required(field: Option<String>) -> Result<String, FlagError> {
    field
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| FlagError::Validation(MISSING_NOTIFICATION_FIELDS.to_string()))
}

/// Forwards a session-local override to the observability webhook, synchronously.
pub async fn notify_flag_change(
    state: State<router::State>,
    body: Bytes,
) -> Result<(StatusCode, Json<MessageResponse>), FlagError> {
    let request: OverrideNotification = serde_json::from_slice(&body)
        .map_err(|_| FlagError::Validation(MISSING_NOTIFICATION_FIELDS.to_string()))?;

    let flag_name = required(request.flag_name)?;
    let action = required(request.action)?;
    let user_id = required(request.user_id)?;
    let user_type = required(request.user_type)?;

    let action: ChangeAction = action
        .parse()
        .map_err(|e: common_types::ParseChangeActionError| FlagError::Validation(e.to_string()))?;
    let actor = Actor::new(user_id, user_type);

    tracing::info!(
        flag = %flag_name,
        %action,
        user_id = %actor.id,
        "forwarding override notification"
    );

    let record = state.notifier.record(&flag_name, action, &actor);
    state.notifier.send(&record).await?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("Notification sent successfully")),
    ))
}
