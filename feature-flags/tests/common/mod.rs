use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use httpmock::Mock;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use feature_flags::config::Config;
use feature_flags::server::serve;

pub fn config_for_webhook(webhook_url: String) -> Config {
    let mut config = Config::default_test_config();
    config.webhook_url = webhook_url;
    config
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    client: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get_flags(&self) -> Value {
        self.get("/api/flags")
            .await
            .json()
            .await
            .expect("failed to decode flags")
    }

    pub async fn post_defaults<T: Into<reqwest::Body>>(&self, body: T) -> reqwest::Response {
        self.client
            .post(self.url("/api/flags/defaults"))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn patch_default<T: Into<reqwest::Body>>(
        &self,
        flag_name: &str,
        body: T,
    ) -> reqwest::Response {
        self.client
            .patch(self.url(&format!("/api/flags/defaults/{}", flag_name)))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn notify_flag_change<T: Into<reqwest::Body>>(&self, body: T) -> reqwest::Response {
        self.client
            .post(self.url("/api/notify-flag-change"))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

/// Notifications leave the request path, so poll until the receiver saw them.
pub async fn wait_for_hits(mock: &Mock<'_>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mock.hits() < expected {
        if tokio::time::Instant::now() > deadline {
            panic!("expected {} webhook hits, saw {}", expected, mock.hits());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
