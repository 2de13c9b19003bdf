use std::sync::Arc;

use common_types::{
    Actor, ChangeAction, EffectiveFlagMap, FlagMap, OverrideNotification, UpdateSummary,
};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::admin::AdminClient;
use crate::bus::{FlagChanged, PropagationBus};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::fetcher::{DefaultsCache, DefaultsFetcher};
use crate::overrides::{OverrideStore, OVERRIDES_KEY};
use crate::resolver::{FlagResolver, FlagWatcher};
use crate::storage::StorageArea;

/// One client context: its own defaults cache and bus, attached to a storage
/// area that may be shared with other sessions of the same profile.
pub struct Session {
    bus: PropagationBus,
    fetcher: Arc<DefaultsFetcher>,
    overrides: OverrideStore,
    resolver: FlagResolver,
    admin: AdminClient,
    actor: Option<Actor>,
    forwarder: JoinHandle<()>,
}

impl Session {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &ClientConfig, area: Arc<StorageArea>) -> Result<Self, ClientError> {
        let bus = PropagationBus::new(area.attach(), config.bus_capacity);
        let fetcher = Arc::new(
            DefaultsFetcher::new(config, Arc::new(DefaultsCache::new()))?.with_bus(bus.clone()),
        );
        let admin = AdminClient::new(config)?;
        let forwarder = bus.forward_from(&area, OVERRIDES_KEY);
        let overrides = OverrideStore::new(area, bus.clone());
        let resolver = FlagResolver::new(fetcher.clone(), overrides.clone());

        Ok(Self {
            bus,
            fetcher,
            overrides,
            resolver,
            admin,
            actor: config.actor(),
            forwarder,
        })
    }

    pub fn bus(&self) -> &PropagationBus {
        &self.bus
    }

    pub fn resolver(&self) -> &FlagResolver {
        &self.resolver
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub fn fetcher(&self) -> &Arc<DefaultsFetcher> {
        &self.fetcher
    }

    pub fn watch(&self) -> FlagWatcher {
        FlagWatcher::spawn(self.resolver.clone(), &self.bus)
    }

    /// Fetches the defaults if they are not cached yet and resolves.
    pub async fn load(&self) -> Result<EffectiveFlagMap, ClientError> {
        self.resolver.refresh().await
    }

    pub fn flags(&self) -> EffectiveFlagMap {
        self.resolver.resolve()
    }

    pub async fn set_override(&self, name: &str, value: bool) {
        let action = match self.overrides.set_override(name, value) {
            None => ChangeAction::Created,
            Some(previous) if previous == value => return,
            Some(_) => ChangeAction::Updated,
        };
        self.audit(name, action).await;
    }

    pub async fn remove_override(&self, name: &str) {
        if self.overrides.remove_override(name).is_some() {
            self.audit(name, ChangeAction::Updated).await;
        }
    }

    pub async fn clear_overrides(&self) {
        for name in self.overrides.clear().keys() {
            self.audit(name, ChangeAction::Updated).await;
        }
    }

    async fn audit(&self, name: &str, action: ChangeAction) {
        let Some(actor) = &self.actor else {
            return;
        };
        let notification = OverrideNotification::new(name, action, actor);
        if let Err(e) = self.admin.notify_override(&notification).await {
            tracing::warn!(flag = name, %action, "override notification failed: {}", e);
        }
    }

    /// Flips the default of `name`. See [`Session::set_default`].
    pub async fn toggle_default(&self, name: &str) -> Result<bool, ClientError> {
        let defaults = self.fetcher.fetch_defaults().await?;
        let current = defaults
            .get(name)
            .copied()
            .ok_or_else(|| ClientError::NotFound(format!("Flag '{name}' not found.")))?;
        self.set_default(name, !current).await?;
        Ok(!current)
    }

    /// Applies the new default locally right away, then confirms it with the
    /// server. A failed confirmation restores the old value, publishes the
    /// reverse change and returns the error.
    #[instrument(skip(self))]
    pub async fn set_default(&self, name: &str, value: bool) -> Result<(), ClientError> {
        let defaults = self.fetcher.fetch_defaults().await?;
        let old = defaults
            .get(name)
            .copied()
            .ok_or_else(|| ClientError::NotFound(format!("Flag '{name}' not found.")))?;
        if old == value {
            return Ok(());
        }

        if let Some(previous) = self.fetcher.cache().set_flag(name, value) {
            self.bus.publish_flag(FlagChanged {
                flag: name.to_owned(),
                old: previous,
                new: value,
            });
        }

        match self.admin.update_default(name, value).await {
            Ok(response) => {
                tracing::info!(flag = name, value, "{}", response.message);
                Ok(())
            }
            Err(e) => {
                tracing::error!(flag = name, value, "default update failed, reverting: {}", e);
                // Events describe the cache as it is now, which an overlapping
                // call may have moved since
                if let Some(current) = self.fetcher.cache().set_flag(name, old) {
                    self.bus.publish_flag(FlagChanged {
                        flag: name.to_owned(),
                        old: current,
                        new: old,
                    });
                }
                Err(e)
            }
        }
    }

    /// Saves several defaults at once. The cache only takes the values the
    /// server reports as updated.
    pub async fn save_defaults(&self, flags: &FlagMap) -> Result<UpdateSummary, ClientError> {
        let summary = self.admin.update_defaults(flags).await?;
        let cache = self.fetcher.cache();

        for name in &summary.updated {
            let Some(&value) = flags.get(name) else {
                continue;
            };
            if let Some(old) = cache.set_flag(name, value) {
                self.bus.publish_flag(FlagChanged {
                    flag: name.clone(),
                    old,
                    new: value,
                });
            }
        }
        Ok(summary)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
