use std::sync::Arc;

use common_types::OverrideMap;

use crate::bus::PropagationBus;
use crate::storage::StorageArea;

pub const OVERRIDES_KEY: &str = "feature-flag-overrides";

/// Session-local flag overrides kept under one key of the shared storage area.
///
/// Reads never fail: a missing, corrupt or non-boolean value reads as no
/// overrides. Every write is published on this context's bus right away.
#[derive(Clone)]
pub struct OverrideStore {
    area: Arc<StorageArea>,
    bus: PropagationBus,
}

impl OverrideStore {
    pub fn new(area: Arc<StorageArea>, bus: PropagationBus) -> Self {
        Self { area, bus }
    }

    pub fn get(&self) -> OverrideMap {
        let Some(raw) = self.area.get_item(OVERRIDES_KEY) else {
            return OverrideMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("ignoring unreadable overrides: {}", e);
            OverrideMap::new()
        })
    }

    pub fn set(&self, overrides: &OverrideMap) {
        let raw = match serde_json::to_string(overrides) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("failed to serialize overrides: {}", e);
                return;
            }
        };
        let event = self.area.set_item(self.bus.context(), OVERRIDES_KEY, raw);
        self.bus.publish_storage(event);
    }

    /// Returns the override this replaced, if any.
    pub fn set_override(&self, name: &str, value: bool) -> Option<bool> {
        let mut overrides = self.get();
        let previous = overrides.insert(name.to_owned(), value);
        self.set(&overrides);
        previous
    }

    pub fn remove_override(&self, name: &str) -> Option<bool> {
        let mut overrides = self.get();
        let previous = overrides.remove(name);
        if previous.is_some() {
            self.set(&overrides);
        }
        previous
    }

    /// Drops every override. Returns what was cleared.
    pub fn clear(&self) -> OverrideMap {
        let previous = self.get();
        self.set(&OverrideMap::new());
        previous
    }
}
