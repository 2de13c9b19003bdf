pub mod admin;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod metrics_utils;
pub mod metrics_consts;
pub mod notifier;
pub mod router;
pub mod server;
pub mod store;

// Shared with the integration tests under tests/
pub mod test_utils;
