use std::sync::Arc;

use common_types::{DefaultMap, EffectiveFlagMap, OverrideMap};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::PropagationBus;
use crate::error::ClientError;
use crate::fetcher::DefaultsFetcher;
use crate::overrides::OverrideStore;

/// `{...defaults, ...overrides}`: an override wins over the default of the same name.
pub fn merge(defaults: &DefaultMap, overrides: &OverrideMap) -> EffectiveFlagMap {
    let mut effective = defaults.clone();
    effective.extend(overrides.iter().map(|(name, value)| (name.clone(), *value)));
    effective
}

#[derive(Clone)]
pub struct FlagResolver {
    fetcher: Arc<DefaultsFetcher>,
    overrides: OverrideStore,
}

impl FlagResolver {
    pub fn new(fetcher: Arc<DefaultsFetcher>, overrides: OverrideStore) -> Self {
        Self { fetcher, overrides }
    }

    /// Effective flags from the cached defaults and the current overrides.
    /// Before the first fetch this is just the overrides.
    pub fn resolve(&self) -> EffectiveFlagMap {
        let overrides = self.overrides.get();
        match self.fetcher.cache().get() {
            Some(defaults) => merge(&defaults, &overrides),
            None => overrides,
        }
    }

    pub fn resolve_flag(&self, name: &str) -> Option<bool> {
        if let Some(value) = self.overrides.get().get(name) {
            return Some(*value);
        }
        self.fetcher
            .cache()
            .get()
            .and_then(|defaults| defaults.get(name).copied())
    }

    /// Loads the defaults if needed, then resolves.
    pub async fn refresh(&self) -> Result<EffectiveFlagMap, ClientError> {
        let defaults = self.fetcher.fetch_defaults().await?;
        Ok(merge(&defaults, &self.overrides.get()))
    }
}

/// Keeps the latest effective map, re-resolving on every bus event.
pub struct FlagWatcher {
    rx: watch::Receiver<EffectiveFlagMap>,
    task: JoinHandle<()>,
}

impl FlagWatcher {
    pub fn spawn(resolver: FlagResolver, bus: &PropagationBus) -> Self {
        let mut subscription = bus.subscribe();
        let (tx, rx) = watch::channel(resolver.resolve());

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                tracing::debug!(?event, "re-resolving flags");
                let effective = resolver.resolve();
                tx.send_if_modified(|current| {
                    if *current == effective {
                        return false;
                    }
                    *current = effective;
                    true
                });
            }
        });

        Self { rx, task }
    }

    pub fn current(&self) -> EffectiveFlagMap {
        self.rx.borrow().clone()
    }

    /// Waits for the effective map to differ from the last one seen.
    pub async fn changed(&mut self) -> Option<EffectiveFlagMap> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<EffectiveFlagMap> {
        self.rx.clone()
    }
}

impl Drop for FlagWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, bool)]) -> common_types::FlagMap {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn test_overrides_win_and_defaults_fill_in() {
        let defaults = map(&[("A", false), ("B", true)]);
        let overrides = map(&[("A", true)]);

        assert_eq!(merge(&defaults, &overrides), map(&[("A", true), ("B", true)]));
        assert_eq!(merge(&defaults, &map(&[])), defaults);
        assert_eq!(merge(&map(&[]), &overrides), overrides);
    }

    #[test]
    fn test_merge_keeps_every_key_of_both_sides() {
        let defaults = map(&[("A", false), ("B", true), ("C", false)]);
        let overrides = map(&[("C", true), ("D", false)]);
        let effective = merge(&defaults, &overrides);

        for (name, value) in &overrides {
            assert_eq!(effective.get(name), Some(value));
        }
        for (name, value) in &defaults {
            if !overrides.contains_key(name) {
                assert_eq!(effective.get(name), Some(value));
            }
        }
        assert_eq!(effective.len(), 4);
    }
}
