use std::sync::Arc;
use std::time::Duration;

use common_types::Actor;
use envconfig::Envconfig;
use reqwest::Url;

use crate::error::ClientError;
use crate::storage::StorageArea;

#[derive(Envconfig, Clone, Debug)]
pub struct ClientConfig {
    #[envconfig(from = "FLAGS_API_URL", default = "http://localhost:3001")]
    pub api_url: String,

    /// JSON file backing the shared storage area. In memory when unset.
    #[envconfig(from = "OVERRIDES_STORAGE_PATH")]
    pub storage_path: Option<String>,

    #[envconfig(default = "5000")]
    pub request_timeout_ms: u64,

    /// Who override audit notifications are attributed to. None disables them.
    #[envconfig(from = "FLAGS_ACTOR_ID")]
    pub actor_id: Option<String>,

    #[envconfig(from = "FLAGS_ACTOR_TYPE", default = "id")]
    pub actor_type: String,

    #[envconfig(default = "256")]
    pub bus_capacity: usize,
}

impl ClientConfig {
    pub fn for_api(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            storage_path: None,
            request_timeout_ms: 2000,
            actor_id: None,
            actor_type: "id".to_string(),
            bus_capacity: 64,
        }
    }

    pub fn with_actor(mut self, id: impl Into<String>, kind: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self.actor_type = kind.into();
        self
    }

    pub fn actor(&self) -> Option<Actor> {
        self.actor_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Actor::new(id, self.actor_type.as_str()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn api_base(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.api_url)
            .map_err(|e| ClientError::Validation(format!("invalid FLAGS_API_URL: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(ClientError::Validation(format!(
                "FLAGS_API_URL cannot be a base url: {}",
                self.api_url
            )));
        }
        Ok(url)
    }

    pub fn open_storage(&self) -> Arc<StorageArea> {
        match &self.storage_path {
            Some(path) => StorageArea::open(path),
            None => StorageArea::in_memory(),
        }
    }
}

/// `base` with `segments` appended as path segments, each one percent-encoded.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
