use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use common_types::{Actor, ChangeAction};
use hmac::{Hmac, Mac};
use reqwest::header;
use serde::{Serialize, Serializer};
use sha2::Sha256;
use thiserror::Error;
use tracing::instrument;

use crate::metrics_consts::{FLAG_NOTIFICATIONS_COUNTER, FLAG_NOTIFICATION_DURATION_HISTOGRAM};

/// Header carrying the hex HMAC-SHA256 of the exact request body.
pub const SIGNATURE_HEADER: &str = "X-Sentry-Signature";

pub const PAYLOAD_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to serialize change record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid signing secret")]
    InvalidSecret,
    #[error("invalid webhook url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("webhook request could not be sent: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook responded with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// One flag mutation as the observability service expects it.
///
/// Field order is the serialized order, and `change_id` stays a JSON integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub change_id: i64,
    #[serde(serialize_with = "serialize_created_at")]
    pub created_at: DateTime<Utc>,
    pub created_by: Actor,
    pub flag: String,
}

fn serialize_created_at<S>(created_at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    // e.g. 2025-04-01T12:00:00+00:00, the receiver rejects a `Z` suffix
    serializer.serialize_str(&created_at.to_rfc3339_opts(SecondsFormat::Secs, false))
}

#[derive(Debug, Serialize)]
struct PayloadMeta {
    version: u32,
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    meta: PayloadMeta,
    data: [&'a ChangeRecord; 1],
}

impl<'a> WebhookPayload<'a> {
    pub fn new(record: &'a ChangeRecord) -> Self {
        Self {
            meta: PayloadMeta {
                version: PAYLOAD_VERSION,
            },
            data: [record],
        }
    }

    /// The exact bytes that get signed and sent.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NotifyError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Hex encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| NotifyError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Hands out change ids from the millisecond clock, strictly increasing within a process.
#[derive(Debug, Default)]
pub struct ChangeIdGenerator {
    last: AtomicI64,
}

impl ChangeIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_at(&self, now: DateTime<Utc>) -> i64 {
        let candidate = now.timestamp_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Something that forwards change records to the observability service.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Builds a record stamped with the current time and a fresh change id.
    fn record(&self, flag: &str, action: ChangeAction, actor: &Actor) -> ChangeRecord;

    async fn send(&self, record: &ChangeRecord) -> Result<(), NotifyError>;

    /// Fire-and-forget delivery. Failures are logged and reported as `false`.
    async fn notify(&self, flag: &str, action: ChangeAction, actor: &Actor) -> bool {
        let record = self.record(flag, action, actor);
        match self.send(&record).await {
            Ok(()) => {
                tracing::info!(flag, %action, change_id = record.change_id, "change notification sent");
                true
            }
            Err(e) => {
                tracing::error!(flag, %action, change_id = record.change_id, "change notification failed: {}", e);
                false
            }
        }
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
    secret: String,
    ids: ChangeIdGenerator,
}

impl WebhookNotifier {
    pub fn new(url: &str, secret: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("feature-flags webhook notifier")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: reqwest::Url::parse(url)?,
            secret: secret.to_owned(),
            ids: ChangeIdGenerator::new(),
        })
    }
}

#[async_trait]
impl ChangeNotifier for WebhookNotifier {
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

    #[instrument(skip_all, fields(flag = %record.flag, action = %record.action))]
    async fn send(&self, record: &ChangeRecord) -> Result<(), NotifyError> {
        let body = WebhookPayload::new(record).to_bytes()?;
        let signature = sign_body(&self.secret, &body)?;

        let start = tokio::time::Instant::now();
        let result = self
            .client
            .post(self.url.clone())
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;
        metrics::histogram!(FLAG_NOTIFICATION_DURATION_HISTOGRAM)
            .record(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!(FLAG_NOTIFICATIONS_COUNTER, "outcome" => "transport_error")
                    .increment(1);
                return Err(NotifyError::Transport(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::counter!(FLAG_NOTIFICATIONS_COUNTER, "outcome" => "rejected").increment(1);
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        metrics::counter!(FLAG_NOTIFICATIONS_COUNTER, "outcome" => "delivered").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use serde_json::{json, Value};

    fn fixed_record(change_id: i64) -> ChangeRecord {
        ChangeRecord {
            action: ChangeAction::Updated,
            change_id,
            created_at: Utc.with_ymd_and_hms(2025, 4, 1, 12, 30, 5).unwrap(),
            created_by: Actor::new("admin-menu@hoopshop.app", "email"),
            flag: "SITE_RELAUNCH".to_string(),
        }
    }

    #[test]
    fn test_payload_shape_and_integer_change_id() {
        let record = fixed_record(1743510605000);
        let body = WebhookPayload::new(&record).to_bytes().unwrap();

        assert_eq!(
            String::from_utf8(body.clone()).unwrap(),
            r#"{"meta":{"version":1},"data":[{"action":"updated","change_id":1743510605000,"created_at":"2025-04-01T12:30:05+00:00","created_by":{"id":"admin-menu@hoopshop.app","type":"email"},"flag":"SITE_RELAUNCH"}]}"#
        );

        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["data"][0]["change_id"].is_i64());
    }

    #[test]
    fn test_signature_is_deterministic_and_byte_sensitive() {
        let body = WebhookPayload::new(&fixed_record(42)).to_bytes().unwrap();
        let same = WebhookPayload::new(&fixed_record(42)).to_bytes().unwrap();
        let other = WebhookPayload::new(&fixed_record(43)).to_bytes().unwrap();

        let signature = sign_body("secret", &body).unwrap();
        assert_eq!(signature, sign_body("secret", &same).unwrap());
        assert_ne!(signature, sign_body("secret", &other).unwrap());
        assert_ne!(signature, sign_body("another-secret", &body).unwrap());
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_signature_matches_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign_body("Jefe", b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_change_ids_strictly_increase() {
        let ids = ChangeIdGenerator::new();
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();

        let first = ids.next_at(now);
        let second = ids.next_at(now);
        let earlier = ids.next_at(now - chrono::Duration::seconds(10));

        assert_eq!(first, now.timestamp_millis());
        assert_eq!(second, first + 1);
        assert_eq!(earlier, second + 1);
    }

    #[tokio::test]
    async fn test_send_signs_the_transmitted_body() {
        let server = MockServer::start();
        let record = fixed_record(7);
        let body = WebhookPayload::new(&record).to_bytes().unwrap();
        let signature = sign_body("secret", &body).unwrap();

        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/webhook")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature.as_str())
                .json_body(json!({
                    "meta": {"version": 1},
                    "data": [{
                        "action": "updated",
                        "change_id": 7,
                        "created_at": "2025-04-01T12:30:05+00:00",
                        "created_by": {"id": "admin-menu@hoopshop.app", "type": "email"},
                        "flag": "SITE_RELAUNCH",
                    }],
                }));
            then.status(200);
        });

        let notifier =
            WebhookNotifier::new(&server.url("/webhook"), "secret", Duration::from_secs(2))
                .unwrap();
        notifier.send(&record).await.expect("send failed");

        mock.assert();
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/webhook");
            then.status(401).body("bad signature");
        });

        let notifier =
            WebhookNotifier::new(&server.url("/webhook"), "secret", Duration::from_secs(2))
                .unwrap();

        match notifier.send(&fixed_record(1)).await {
            Err(NotifyError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad signature");
            }
            other => panic!("expected status error, got {:?}", other),
        }

        let actor = Actor::new("admin-menu@hoopshop.app", "email");
        assert!(
            !notifier
                .notify("SITE_RELAUNCH", ChangeAction::Updated, &actor)
                .await
        );
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_reported_not_raised() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:1/webhook",
            "secret",
            Duration::from_millis(500),
        )
        .unwrap();
        let actor = Actor::new("admin-menu@hoopshop.app", "email");

        assert!(
            !notifier
                .notify("MAIN_STORE", ChangeAction::Updated, &actor)
                .await
        );
    }
}
