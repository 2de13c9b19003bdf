use std::sync::Arc;

use common_types::{Actor, ChangeAction};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::metrics_consts::{FLAG_NOTIFICATIONS_COUNTER, FLAG_NOTIFICATION_QUEUE_DEPTH_GAUGE};
use crate::notifier::ChangeNotifier;

/// Where a change notification is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Written,
    Notifying,
    Notified,
    NotifyFailed,
}

impl DeliveryState {
    pub fn is_settled(&self) -> bool {
        matches!(self, DeliveryState::Notified | DeliveryState::NotifyFailed)
    }
}

/// Write side of a ticket, owned by whoever drives the change.
#[derive(Debug)]
pub struct DeliveryHandle {
    tx: watch::Sender<DeliveryState>,
}

impl DeliveryHandle {
    pub fn set(&self, state: DeliveryState) {
        self.tx.send_replace(state);
    }
}

/// Observes the notification of one committed change.
#[derive(Debug, Clone)]
pub struct NotificationTicket {
    rx: watch::Receiver<DeliveryState>,
}

impl NotificationTicket {
    pub fn pending() -> (DeliveryHandle, NotificationTicket) {
        let (tx, rx) = watch::channel(DeliveryState::Pending);
        (DeliveryHandle { tx }, NotificationTicket { rx })
    }

    pub fn state(&self) -> DeliveryState {
        *self.rx.borrow()
    }

    /// Waits until the notification was delivered or given up on.
    pub async fn settled(mut self) -> DeliveryState {
        let outcome = self
            .rx
            .wait_for(DeliveryState::is_settled)
            .await
            .map(|state| *state);
        outcome.unwrap_or_else(|_| *self.rx.borrow())
    }
}

struct Job {
    flag: String,
    action: ChangeAction,
    actor: Actor,
    delivery: DeliveryHandle,
}

/// Feeds committed changes to a single background worker, preserving commit order.
/// Enqueueing never blocks the request that made the change.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    pub fn spawn(notifier: Arc<dyn ChangeNotifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run(notifier, rx));
        (Self { tx }, worker)
    }

    /// Queues a notification for a change that is already committed.
    /// Never waits: a full or closed queue settles the ticket as `NotifyFailed`.
    pub fn enqueue(
        &self,
        flag: &str,
        action: ChangeAction,
        actor: &Actor,
        delivery: DeliveryHandle,
    ) {
        delivery.set(DeliveryState::Written);

        let job = Job {
            flag: flag.to_owned(),
            action,
            actor: actor.clone(),
            delivery,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                let depth = self.tx.max_capacity() - self.tx.capacity();
                metrics::gauge!(FLAG_NOTIFICATION_QUEUE_DEPTH_GAUGE).set(depth as f64);
            }
            Err(TrySendError::Full(job)) => {
                tracing::warn!(
                    flag = %job.flag,
                    "notification queue is full, change will not be reported"
                );
                metrics::counter!(FLAG_NOTIFICATIONS_COUNTER, "outcome" => "dropped").increment(1);
                job.delivery.set(DeliveryState::NotifyFailed);
            }
            Err(TrySendError::Closed(job)) => {
                tracing::error!(
                    flag = %job.flag,
                    "notification queue is closed, change will not be reported"
                );
                job.delivery.set(DeliveryState::NotifyFailed);
            }
        }
    }
}

async fn run(notifier: Arc<dyn ChangeNotifier>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        job.delivery.set(DeliveryState::Notifying);
        let delivered = notifier.notify(&job.flag, job.action, &job.actor).await;
        job.delivery.set(if delivered {
            DeliveryState::Notified
        } else {
            DeliveryState::NotifyFailed
        });
    }
    tracing::info!("notification queue drained, dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{ChangeRecord, NotifyError};
    use crate::test_utils::{test_actor, RecordingNotifier};

    #[tokio::test]
    async fn test_ticket_moves_through_states() {
        let notifier = RecordingNotifier::new();
        let (dispatcher, _worker) = Dispatcher::spawn(Arc::new(notifier.clone()), 8);

        let (delivery, ticket) = NotificationTicket::pending();
        assert_eq!(ticket.state(), DeliveryState::Pending);

        dispatcher.enqueue("MAIN_STORE", ChangeAction::Updated, &test_actor(), delivery);
        assert_eq!(ticket.clone().settled().await, DeliveryState::Notified);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flag, "MAIN_STORE");
    }

    #[tokio::test]
    async fn test_rejected_notification_settles_as_failed() {
        let notifier = RecordingNotifier::rejecting(500);
        let (dispatcher, _worker) = Dispatcher::spawn(Arc::new(notifier), 8);

        let (delivery, ticket) = NotificationTicket::pending();
        dispatcher.enqueue("MAIN_STORE", ChangeAction::Updated, &test_actor(), delivery);

        assert_eq!(ticket.settled().await, DeliveryState::NotifyFailed);
    }

    #[tokio::test]
    async fn test_notifications_keep_commit_order() {
        let notifier = RecordingNotifier::new();
        let (dispatcher, worker) = Dispatcher::spawn(Arc::new(notifier.clone()), 4);

        for flag in ["A", "B", "C", "D"] {
            let (delivery, _ticket) = NotificationTicket::pending();
            dispatcher.enqueue(flag, ChangeAction::Updated, &test_actor(), delivery);
        }
        drop(dispatcher);
        worker.await.unwrap();

        let flags: Vec<String> = notifier.sent().into_iter().map(|r| r.flag).collect();
        assert_eq!(flags, vec!["A", "B", "C", "D"]);

        let ids: Vec<i64> = notifier.sent().into_iter().map(|r| r.change_id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    /// Never answers, so every job it takes stays in flight.
    struct StalledNotifier;

    #[async_trait::async_trait]
    impl ChangeNotifier for StalledNotifier {
        fn record(&self, flag: &str, action: ChangeAction, actor: &Actor) -> ChangeRecord {
            RecordingNotifier::new().record(flag, action, actor)
        }

        async fn send(&self, _record: &ChangeRecord) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_the_ticket_without_waiting() {
        let (dispatcher, _worker) = Dispatcher::spawn(Arc::new(StalledNotifier), 1);

        let (queued, queued_ticket) = NotificationTicket::pending();
        let (dropped, dropped_ticket) = NotificationTicket::pending();
        dispatcher.enqueue("MAIN_STORE", ChangeAction::Updated, &test_actor(), queued);
        dispatcher.enqueue("SITE_RELAUNCH", ChangeAction::Updated, &test_actor(), dropped);

        assert_eq!(queued_ticket.state(), DeliveryState::Written);
        assert_eq!(dropped_ticket.state(), DeliveryState::NotifyFailed);
    }

    #[tokio::test]
    async fn test_closed_queue_marks_failed() {
        let notifier = RecordingNotifier::new();
        let (dispatcher, worker) = Dispatcher::spawn(Arc::new(notifier), 1);
        worker.abort();
        assert!(worker.await.is_err());

        let (delivery, ticket) = NotificationTicket::pending();
        dispatcher.enqueue("MAIN_STORE", ChangeAction::Updated, &test_actor(), delivery);

        assert_eq!(ticket.state(), DeliveryState::NotifyFailed);
    }
}
