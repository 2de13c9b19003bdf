use std::sync::Arc;
use std::time::Duration;

use flags_client::bus::{BusEvent, BusSubscription};
use flags_client::{ClientConfig, Session, StorageArea};
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::Value;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Serves `defaults` from `GET /api/flags`.
pub fn serve_defaults(server: &MockServer, defaults: Value) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/api/flags");
        then.status(200).json_body(defaults);
    })
}

pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig::for_api(server.base_url())
}

pub fn session_for(server: &MockServer, area: &Arc<StorageArea>) -> Session {
    Session::new(&config_for(server), area.clone()).expect("failed to build session")
}

pub async fn next_event(subscription: &mut BusSubscription) -> BusEvent {
    tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for a bus event")
        .expect("bus closed")
}

/// Asserts nothing arrives on the subscription for a short while.
pub async fn assert_quiet(subscription: &mut BusSubscription) {
    let next = tokio::time::timeout(Duration::from_millis(100), subscription.recv()).await;
    assert!(next.is_err(), "unexpected bus event: {:?}", next);
}
