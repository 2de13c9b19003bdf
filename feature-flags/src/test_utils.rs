use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common_types::{Actor, ChangeAction, FlagMap};

use crate::notifier::{ChangeIdGenerator, ChangeNotifier, ChangeRecord, NotifyError};
use crate::store::{DefaultStore, SqliteFlagStore, StoreError, WriteResult};

/// A fresh in-memory store holding the initial flags.
pub async fn setup_store() -> SqliteFlagStore {
    let store = SqliteFlagStore::connect("sqlite::memory:", 1, Duration::from_secs(5))
        .await
        .expect("failed to open in-memory store");
    store.seed().await.expect("failed to seed store");
    store
}

pub fn test_actor() -> Actor {
    Actor::new("admin-menu@hoopshop.app", "email")
}

/// Reads through to the wrapped store, fails every write.
pub struct FailingStore<S> {
    inner: S,
}

impl<S> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn injected_failure() -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(
        "injected write failure".to_string(),
    ))
}

#[async_trait]
impl<S: DefaultStore + Send + Sync> DefaultStore for FailingStore<S> {
    async fn list(&self) -> Result<FlagMap, StoreError> {
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> Result<Option<bool>, StoreError> {
        self.inner.get(name).await
    }

    async fn compare_and_set(&self, _name: &str, _value: bool) -> Result<WriteResult, StoreError> {
        Err(injected_failure())
    }

    async fn compare_and_set_all(
        &self,
        _updates: &[(String, bool)],
    ) -> Result<Vec<(String, WriteResult)>, StoreError> {
        Err(injected_failure())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Keeps every record it is asked to send. Optionally rejects them all.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<ChangeRecord>>>,
    reject_with: Option<u16>,
    ids: Arc<ChangeIdGenerator>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<ChangeRecord> {
        self.sent.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl ChangeNotifier for RecordingNotifier {
    fn record(&self, flag: &str, action: ChangeAction, actor: &Actor) -> ChangeRecord {
        let created_at = Utc::now();
        ChangeRecord {
            action,
            change_id: self.ids.next_at(created_at),
            created_at,
            created_by: actor.clone(),
            flag: flag.to_owned(),
        }
    }

    async fn send(&self, record: &ChangeRecord) -> Result<(), NotifyError> {
        self.sent.lock().expect("poisoned").push(record.clone());
        match self.reject_with {
            Some(status) => Err(NotifyError::Status {
                status,
                body: "rejected".to_string(),
            }),
            None => Ok(()),
        }
    }
}
