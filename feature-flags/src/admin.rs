use std::sync::Arc;

use common_types::{Actor, ChangeAction, SkipReason, SkippedFlag, UpdateSummary};
use serde_json::Value;
use tracing::instrument;

use crate::api::FlagError;
use crate::dispatch::{Dispatcher, NotificationTicket};
use crate::metrics_consts::{
    FLAG_BULK_SKIPPED_COUNTER, FLAG_DEFAULT_UPDATES_COUNTER, FLAG_STORE_ERRORS_COUNTER,
};
use crate::store::{DefaultStore, StoreError, WriteResult};

pub const NO_FLAGS_PROVIDED: &str = "No flags provided to update.";
pub const BULK_UPDATED: &str = "Default flags updated successfully.";
pub const ALREADY_UP_TO_DATE: &str = "Flag default value already up-to-date.";

#[derive(Debug)]
pub enum UpdateOutcome {
    Unchanged,
    Updated {
        previous: bool,
        ticket: NotificationTicket,
    },
}

impl UpdateOutcome {
    pub fn message(&self, name: &str) -> String {
        match self {
            UpdateOutcome::Unchanged => ALREADY_UP_TO_DATE.to_string(),
            UpdateOutcome::Updated { .. } => {
                format!("Default flag '{}' updated successfully.", name)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub provided: usize,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedFlag>,
    pub tickets: Vec<NotificationTicket>,
}

impl BulkOutcome {
    pub fn summary(&self) -> UpdateSummary {
        let message = if self.provided == 0 {
            NO_FLAGS_PROVIDED
        } else {
            BULK_UPDATED
        };
        UpdateSummary {
            message: message.to_string(),
            updated: self.updated.clone(),
            unchanged: self.unchanged.clone(),
            skipped: self.skipped.clone(),
        }
    }
}

fn storage_failure(err: StoreError) -> FlagError {
    metrics::counter!(FLAG_STORE_ERRORS_COUNTER).increment(1);
    FlagError::Storage(err)
}

fn skip(outcome: &mut BulkOutcome, name: &str, reason: SkipReason) {
    match reason {
        SkipReason::InvalidValue => tracing::warn!("Skipping flag '{}': invalid value type", name),
        SkipReason::UnknownFlag => tracing::warn!("Skipping flag '{}': not found", name),
    }
    metrics::counter!(FLAG_BULK_SKIPPED_COUNTER).increment(1);
    outcome.skipped.push(SkippedFlag {
        name: name.to_owned(),
        reason,
    });
}

/// The only writer of flag defaults. Every committed change is queued for notification.
#[derive(Clone)]
pub struct AdminService {
    store: Arc<dyn DefaultStore>,
    dispatcher: Dispatcher,
    actor: Actor,
}

impl AdminService {
    pub fn new(store: Arc<dyn DefaultStore>, dispatcher: Dispatcher, actor: Actor) -> Self {
        Self {
            store,
            dispatcher,
            actor,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    #[instrument(skip(self))]
    pub async fn update_default(&self, name: &str, value: bool) -> Result<UpdateOutcome, FlagError> {
        let (delivery, ticket) = NotificationTicket::pending();

        match self
            .store
            .compare_and_set(name, value)
            .await
            .map_err(storage_failure)?
        {
            WriteResult::NotFound => Err(FlagError::NotFound(format!("Flag '{}' not found.", name))),
            WriteResult::Unchanged => {
                tracing::info!("Default value for '{}' is already {}", name, value);
                Ok(UpdateOutcome::Unchanged)
            }
            WriteResult::Changed { previous } => {
                tracing::info!("Default value for '{}' changed from {} to {}", name, previous, value);
                metrics::counter!(FLAG_DEFAULT_UPDATES_COUNTER).increment(1);
                self.dispatcher.enqueue(name, ChangeAction::Updated, &self.actor, delivery);
                Ok(UpdateOutcome::Updated { previous, ticket })
            }
        }
    }

    /// Applies a `{name: bool}` object in one transaction, skipping malformed or unknown entries.
    #[instrument(skip_all)]
    pub async fn update_defaults(&self, body: &Value) -> Result<BulkOutcome, FlagError> {
        let Some(entries) = body.as_object() else {
            return Err(FlagError::Validation(
                "Invalid request body: Expected an object of flags.".to_string(),
            ));
        };

        let mut outcome = BulkOutcome {
            provided: entries.len(),
            ..BulkOutcome::default()
        };
        if entries.is_empty() {
            tracing::info!("No flags provided in request body to update");
            return Ok(outcome);
        }

        let mut updates = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            match value.as_bool() {
                Some(value) => updates.push((name.clone(), value)),
                None => skip(&mut outcome, name, SkipReason::InvalidValue),
            }
        }
        if updates.is_empty() {
            return Ok(outcome);
        }

        let results = self
            .store
            .compare_and_set_all(&updates)
            .await
            .map_err(storage_failure)?;

        // Notifications go out only after the whole batch committed
        for (name, result) in results {
            match result {
                WriteResult::NotFound => skip(&mut outcome, &name, SkipReason::UnknownFlag),
                WriteResult::Unchanged => outcome.unchanged.push(name),
                WriteResult::Changed { previous } => {
                    tracing::info!("Default value for '{}' changed from {} to {}", name, previous, !previous);
                    metrics::counter!(FLAG_DEFAULT_UPDATES_COUNTER).increment(1);
                    let (delivery, ticket) = NotificationTicket::pending();
                    self.dispatcher.enqueue(&name, ChangeAction::Updated, &self.actor, delivery);
                    outcome.tickets.push(ticket);
                    outcome.updated.push(name);
                }
            }
        }

        tracing::info!(
            updated = outcome.updated.len(),
            unchanged = outcome.unchanged.len(),
            skipped = outcome.skipped.len(),
            "default flags committed"
        );
        Ok(outcome)
    }
}
