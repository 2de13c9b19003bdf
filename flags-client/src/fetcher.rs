use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common_types::DefaultMap;
use reqwest::Url;

use crate::bus::PropagationBus;
use crate::config::{endpoint, ClientConfig};
use crate::error::ClientError;

#[derive(Default)]
struct CacheState {
    defaults: Option<Arc<DefaultMap>>,
    installed: u64,
}

/// The session's copy of the server defaults. Only a clear or an explicit
/// refetch replaces it.
#[derive(Default)]
pub struct DefaultsCache {
    state: Mutex<CacheState>,
}

impl DefaultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<Arc<DefaultMap>> {
        self.lock().defaults.clone()
    }

    pub fn clear(&self) {
        self.lock().defaults = None;
    }

    /// Installs the result of fetch `ticket` unless a newer fetch already did.
    /// Returns whichever map is current afterwards, and whether this call
    /// replaced the cached one.
    fn install(&self, ticket: u64, defaults: DefaultMap) -> (Arc<DefaultMap>, bool) {
        let mut state = self.lock();
        if ticket > state.installed {
            let defaults = Arc::new(defaults);
            let replaced = state.defaults.as_deref() != Some(&*defaults);
            state.defaults = Some(defaults.clone());
            state.installed = ticket;
            return (defaults, replaced);
        }

        tracing::debug!(ticket, installed = state.installed, "dropping stale defaults");
        match &state.defaults {
            Some(current) => (current.clone(), false),
            None => (Arc::new(defaults), false),
        }
    }

    /// Replaces one cached default, e.g. after a confirmed or reverted admin write.
    /// Returns the previous cached value.
    pub fn set_flag(&self, name: &str, value: bool) -> Option<bool> {
        let mut state = self.lock();
        let defaults = state.defaults.as_mut()?;
        Arc::make_mut(defaults).insert(name.to_owned(), value)
    }
}

/// Cache-first reader of `GET /api/flags`. Newly installed defaults are
/// published on the bus when one is attached.
pub struct DefaultsFetcher {
    client: reqwest::Client,
    url: Url,
    cache: Arc<DefaultsCache>,
    tickets: AtomicU64,
    bus: Option<PropagationBus>,
}

impl DefaultsFetcher {
    pub fn new(config: &ClientConfig, cache: Arc<DefaultsCache>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            url: endpoint(&config.api_base()?, &["api", "flags"]),
            cache,
            tickets: AtomicU64::new(0),
            bus: None,
        })
    }

    pub fn with_bus(mut self, bus: PropagationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn cache(&self) -> &Arc<DefaultsCache> {
        &self.cache
    }

    /// The cached defaults, fetching them first if nothing is cached.
    pub async fn fetch_defaults(&self) -> Result<Arc<DefaultMap>, ClientError> {
        if let Some(defaults) = self.cache.get() {
            return Ok(defaults);
        }
        self.load().await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Fetches again. The current map stays cached until the new one lands.
    pub async fn refetch(&self) -> Result<Arc<DefaultMap>, ClientError> {
        self.load().await
    }

    async fn load(&self) -> Result<Arc<DefaultMap>, ClientError> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let defaults = self.request().await.map_err(|e| {
            tracing::error!(url = %self.url, "failed to fetch flag defaults: {}", e);
            e
        })?;

        let (defaults, replaced) = self.cache.install(ticket, defaults);
        if replaced {
            if let Some(bus) = &self.bus {
                bus.publish_defaults(defaults.clone());
            }
        }
        Ok(defaults)
    }

    async fn request(&self) -> Result<DefaultMap, ClientError> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Network(format!(
                "GET {} returned {}",
                self.url, status
            )));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            ClientError::Network(format!("GET {} returned an invalid flag map: {}", self.url, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusEvent;
    use httpmock::prelude::*;
    use serde_json::json;

    fn fetcher_for(server: &MockServer) -> DefaultsFetcher {
        let config = ClientConfig::for_api(server.base_url());
        DefaultsFetcher::new(&config, Arc::new(DefaultsCache::new())).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_is_cache_first() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/flags");
            then.status(200)
                .json_body(json!({"SITE_RELAUNCH": false, "STORE_CHECKOUT_ENABLED": true}));
        });
        let fetcher = fetcher_for(&server);

        let first = fetcher.fetch_defaults().await.unwrap();
        let second = fetcher.fetch_defaults().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get("STORE_CHECKOUT_ENABLED"), Some(&true));
        mock.assert_hits(1);

        fetcher.refetch().await.unwrap();
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_bad_responses_are_network_errors() {
        let server = MockServer::start();
        let mut failing = server.mock(|when, then| {
            when.method(GET).path("/api/flags");
            then.status(500).json_body(json!({"error": "Failed to retrieve flags"}));
        });
        let fetcher = fetcher_for(&server);
        assert!(matches!(
            fetcher.fetch_defaults().await,
            Err(ClientError::Network(_))
        ));
        failing.delete();

        let _malformed = server.mock(|when, then| {
            when.method(GET).path("/api/flags");
            then.status(200).json_body(json!({"SITE_RELAUNCH": "on"}));
        });
        assert!(matches!(
            fetcher.fetch_defaults().await,
            Err(ClientError::Network(_))
        ));
        assert!(fetcher.cache().get().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_network_error() {
        let fetcher = DefaultsFetcher::new(
            &ClientConfig::for_api("http://127.0.0.1:1"),
            Arc::new(DefaultsCache::new()),
        )
        .unwrap();
        assert!(matches!(
            fetcher.fetch_defaults().await,
            Err(ClientError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_installed_defaults_are_published_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/flags");
            then.status(200).json_body(json!({"A": false, "B": true}));
        });
        let bus = PropagationBus::new(1, 16);
        let mut sub = bus.subscribe();
        let fetcher = fetcher_for(&server).with_bus(bus);

        let defaults = fetcher.fetch_defaults().await.unwrap();
        fetcher.fetch_defaults().await.unwrap();
        // Same content again, nothing new to announce
        fetcher.refetch().await.unwrap();
        mock.assert_hits(2);

        assert_eq!(sub.recv().await, Some(BusEvent::Defaults(defaults)));
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv()).await;
        assert!(next.is_err(), "unexpected event {:?}", next);
    }

    #[test]
    fn test_stale_results_do_not_replace_newer_ones() {
        let cache = DefaultsCache::new();
        let newer: DefaultMap = [("A".to_string(), true)].into_iter().collect();
        let older: DefaultMap = [("A".to_string(), false)].into_iter().collect();

        assert_eq!(cache.install(2, newer.clone()), (Arc::new(newer.clone()), true));
        assert_eq!(cache.install(1, older.clone()), (Arc::new(newer.clone()), false));
        assert_eq!(*cache.get().unwrap(), newer);
        assert_eq!(cache.install(3, newer.clone()), (Arc::new(newer.clone()), false));

        // A stale result still answers its own caller after a clear
        cache.clear();
        assert_eq!(cache.install(1, older.clone()), (Arc::new(older), false));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_set_flag_only_touches_a_loaded_cache() {
        let cache = DefaultsCache::new();
        assert_eq!(cache.set_flag("A", true), None);
        assert!(cache.get().is_none());

        cache.install(1, [("A".to_string(), false)].into_iter().collect());
        assert_eq!(cache.set_flag("A", true), Some(false));
        assert_eq!(cache.get().unwrap().get("A"), Some(&true));
    }
}
