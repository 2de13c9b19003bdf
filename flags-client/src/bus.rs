use std::sync::Arc;

use common_types::DefaultMap;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::storage::{ContextId, StorageArea, StorageEvent};

/// A single flag moved from `old` to `new` in this context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChanged {
    pub flag: String,
    pub old: bool,
    pub new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Storage(StorageEvent),
    Flag(FlagChanged),
    /// A fetch installed a new defaults map.
    Defaults(Arc<DefaultMap>),
}

/// Per-context fan-out of change events over two independent channels.
///
/// The storage channel carries writes to one storage key: this context's own
/// writes are published directly, writes from other contexts arrive through
/// the shared area. The page channel carries in-context changes: single-flag
/// changes and newly installed defaults. Events that change nothing are
/// dropped before delivery.
#[derive(Clone)]
pub struct PropagationBus {
    context: ContextId,
    storage: broadcast::Sender<StorageEvent>,
    page: broadcast::Sender<BusEvent>,
}

impl PropagationBus {
    pub fn new(context: ContextId, capacity: usize) -> Self {
        let (storage, _) = broadcast::channel(capacity.max(1));
        let (page, _) = broadcast::channel(capacity.max(1));
        Self {
            context,
            storage,
            page,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Returns whether the event was handed to the channel.
    pub fn publish_storage(&self, event: StorageEvent) -> bool {
        if event.is_noop() {
            return false;
        }
        self.storage.send(event).is_ok()
    }

    pub fn publish_flag(&self, change: FlagChanged) -> bool {
        if change.old == change.new {
            return false;
        }
        self.page.send(BusEvent::Flag(change)).is_ok()
    }

    pub fn publish_defaults(&self, defaults: Arc<DefaultMap>) -> bool {
        self.page.send(BusEvent::Defaults(defaults)).is_ok()
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            storage: Some(self.storage.subscribe()),
            page: Some(self.page.subscribe()),
        }
    }

    /// Relays writes to `key` made by other contexts on `area` into the storage channel.
    pub fn forward_from(&self, area: &Arc<StorageArea>, key: &str) -> JoinHandle<()> {
        let mut events = area.subscribe();
        let bus = self.clone();
        let key = key.to_owned();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    // Own writes were already published directly
                    Ok(event) if event.origin == bus.context || event.key != key => {}
                    Ok(event) => {
                        bus.publish_storage(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "storage forwarder lagged, events were lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

pub struct BusSubscription {
    storage: Option<broadcast::Receiver<StorageEvent>>,
    page: Option<broadcast::Receiver<BusEvent>>,
}

async fn recv_from<T: Clone>(receiver: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let rx = receiver.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "bus subscriber lagged, skipping lost events");
            }
            Err(RecvError::Closed) => {
                *receiver = None;
                return None;
            }
        }
    }
}

impl BusSubscription {
    /// Next event from either channel. `None` once both channels are closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        tokio::select! {
            Some(event) = recv_from(&mut self.storage) => Some(BusEvent::Storage(event)),
            Some(event) = recv_from(&mut self.page) => Some(event),
            else => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn storage_event(origin: ContextId, old: Option<&str>, new: Option<&str>) -> StorageEvent {
        StorageEvent {
            key: "feature-flag-overrides".to_string(),
            old_value: old.map(str::to_owned),
            new_value: new.map(str::to_owned),
            origin,
        }
    }

    #[tokio::test]
    async fn test_noop_events_are_dropped() {
        let bus = PropagationBus::new(1, 16);
        let mut sub = bus.subscribe();

        assert!(!bus.publish_flag(FlagChanged {
            flag: "A".to_string(),
            old: true,
            new: true,
        }));
        assert!(!bus.publish_storage(storage_event(1, Some("{}"), Some("{}"))));
        assert!(bus.publish_flag(FlagChanged {
            flag: "A".to_string(),
            old: true,
            new: false,
        }));

        assert_eq!(
            sub.recv().await,
            Some(BusEvent::Flag(FlagChanged {
                flag: "A".to_string(),
                old: true,
                new: false,
            }))
        );
    }

    #[tokio::test]
    async fn test_each_channel_keeps_issue_order() {
        let bus = PropagationBus::new(1, 16);
        let mut sub = bus.subscribe();

        for (old, new) in [(false, true), (true, false), (false, true)] {
            bus.publish_flag(FlagChanged {
                flag: "A".to_string(),
                old,
                new,
            });
        }

        for expected in [true, false, true] {
            match sub.recv().await {
                Some(BusEvent::Flag(change)) => assert_eq!(change.new, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_defaults_share_the_page_channel_order() {
        let bus = PropagationBus::new(1, 16);
        let mut sub = bus.subscribe();
        let defaults: Arc<DefaultMap> = Arc::new([("A".to_string(), false)].into_iter().collect());

        assert!(bus.publish_defaults(defaults.clone()));
        bus.publish_flag(FlagChanged {
            flag: "A".to_string(),
            old: false,
            new: true,
        });

        assert_eq!(sub.recv().await, Some(BusEvent::Defaults(defaults)));
        assert!(matches!(sub.recv().await, Some(BusEvent::Flag(_))));
    }

    #[tokio::test]
    async fn test_forwarder_skips_own_and_foreign_key_writes() {
        let area = StorageArea::in_memory();
        let own = area.attach();
        let other = area.attach();
        let bus = PropagationBus::new(own, 16);
        let mut sub = bus.subscribe();
        let _forwarder = bus.forward_from(&area, "feature-flag-overrides");

        area.set_item(own, "feature-flag-overrides", "{\"A\":true}".to_string());
        area.set_item(other, "unrelated", "x".to_string());
        area.set_item(other, "feature-flag-overrides", "{\"A\":false}".to_string());

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("no event forwarded");
        match event {
            Some(BusEvent::Storage(event)) => {
                assert_eq!(event.origin, other);
                assert_eq!(event.new_value.as_deref(), Some("{\"A\":false}"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = PropagationBus::new(1, 2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish_flag(FlagChanged {
                flag: format!("F{i}"),
                old: false,
                new: true,
            });
        }

        match sub.recv().await {
            Some(BusEvent::Flag(change)) => assert_eq!(change.flag, "F3"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
