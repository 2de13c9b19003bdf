use common_types::{
    DefaultValueUpdate, ErrorResponse, FlagMap, MessageResponse, OverrideNotification,
    UpdateSummary,
};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::config::{endpoint, ClientConfig};
use crate::error::ClientError;

/// Client for the write endpoints of the flags service.
#[derive(Clone)]
pub struct AdminClient {
    client: reqwest::Client,
    base: Url,
}

impl AdminClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base: config.api_base()?,
        })
    }

    #[instrument(skip(self))]
    pub async fn update_default(
        &self,
        name: &str,
        value: bool,
    ) -> Result<MessageResponse, ClientError> {
        let url = endpoint(&self.base, &["api", "flags", "defaults", name]);
        let response = self
            .client
            .patch(url)
            .json(&DefaultValueUpdate { value })
            .send()
            .await?;
        parse(response).await
    }

    #[instrument(skip_all, fields(flags = flags.len()))]
    pub async fn update_defaults(&self, flags: &FlagMap) -> Result<UpdateSummary, ClientError> {
        let url = endpoint(&self.base, &["api", "flags", "defaults"]);
        let response = self.client.post(url).json(flags).send().await?;
        parse(response).await
    }

    /// Forwards an override audit record. Any non-2xx answer is a `Notify` error.
    #[instrument(skip_all)]
    pub async fn notify_override(
        &self,
        notification: &OverrideNotification,
    ) -> Result<(), ClientError> {
        let url = endpoint(&self.base, &["api", "notify-flag-change"]);
        let response = self.client.post(url).json(notification).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = error_message(response).await;
        Err(ClientError::Notify(format!("{status}: {message}")))
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        let body = response.bytes().await?;
        return serde_json::from_slice(&body)
            .map_err(|e| ClientError::Network(format!("invalid response body: {e}")));
    }

    let message = error_message(response).await;
    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::BAD_REQUEST => ClientError::Validation(message),
        _ => ClientError::Network(format!("{status}: {message}")),
    })
}

/// The `error` field of a JSON error body, or the raw body.
async fn error_message(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body,
    }
}
