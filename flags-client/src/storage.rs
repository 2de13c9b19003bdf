use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// Identifies one client context attached to a storage area.
pub type ContextId = u64;

const EVENT_CAPACITY: usize = 256;

/// A write to the shared area, as seen by every attached context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

impl StorageEvent {
    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
    }
}

/// String key/value area shared by every context of one profile, optionally
/// persisted as a JSON object on disk.
///
/// Persistence is best-effort. A failed write is logged and the in-memory
/// value stays authoritative, an unreadable file loads as an empty area.
pub struct StorageArea {
    entries: Mutex<BTreeMap<String, String>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
    next_context: AtomicU64,
}

impl StorageArea {
    fn with_entries(entries: BTreeMap<String, String>, path: Option<PathBuf>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            entries: Mutex::new(entries),
            path,
            events,
            next_context: AtomicU64::new(1),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::with_entries(BTreeMap::new(), None)
    }

    pub fn open(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring unreadable storage file: {}", e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read storage file: {}", e);
                BTreeMap::new()
            }
        };
        Self::with_entries(entries, Some(path))
    }

    /// Registers a new context and returns its id.
    pub fn attach(&self) -> ContextId {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set_item(&self, origin: ContextId, key: &str, value: String) -> StorageEvent {
        let mut entries = self.lock();
        let old_value = entries.insert(key.to_owned(), value.clone());
        self.persist(&entries);
        drop(entries);

        self.broadcast(StorageEvent {
            key: key.to_owned(),
            old_value,
            new_value: Some(value),
            origin,
        })
    }

    pub fn remove_item(&self, origin: ContextId, key: &str) -> StorageEvent {
        let mut entries = self.lock();
        let old_value = entries.remove(key);
        self.persist(&entries);
        drop(entries);

        self.broadcast(StorageEvent {
            key: key.to_owned(),
            old_value,
            new_value: None,
            origin,
        })
    }

    fn broadcast(&self, event: StorageEvent) -> StorageEvent {
        // No attached listener is not an error
        if self.events.send(event.clone()).is_err() {
            tracing::trace!(key = %event.key, "storage event had no listeners");
        }
        event
    }

    fn persist(&self, entries: &BTreeMap<String, String>) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_vec_pretty(entries)
            .map_err(std::io::Error::from)
            .and_then(|bytes| std::fs::write(path, bytes));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), "failed to persist storage area: {}", e);
        }
    }
}
