use std::net::SocketAddr;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use common_types::Actor;
use envconfig::Envconfig;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl From<FlexBool> for bool {
    fn from(flex: FlexBool) -> Self {
        flex.0
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Origins allowed to call the API from a browser, as a comma separated list.
/// `*` allows any origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl FromStr for AllowedOrigins {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(AllowedOrigins::Any);
        }
        let origins: Vec<String> = s
            .split(',')
            .map(|part| part.trim().trim_end_matches('/'))
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect();
        if origins.is_empty() {
            return Err("at least one allowed origin is required".to_string());
        }
        Ok(AllowedOrigins::List(origins))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("WEBHOOK_SECRET is not set, refusing to start without a signing secret")]
    MissingWebhookSecret,
    #[error("WEBHOOK_URL is not a valid url: {0}")]
    InvalidWebhookUrl(String),
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3001")]
    pub address: SocketAddr,

    #[envconfig(default = "sqlite://flags.db?mode=rwc")]
    pub database_url: String,

    #[envconfig(default = "5")]
    pub max_db_connections: u32,

    #[envconfig(default = "1")]
    pub acquire_timeout_secs: u64,

    #[envconfig(from = "WEBHOOK_URL")]
    pub webhook_url: String,

    #[envconfig(from = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    #[envconfig(default = "5000")]
    pub webhook_timeout_ms: u64,

    #[envconfig(default = "1024")]
    pub notification_queue_size: usize,

    #[envconfig(from = "ALLOWED_ORIGINS", default = "http://localhost:5173")]
    pub allowed_origins: AllowedOrigins,

    #[envconfig(default = "admin-menu@hoopshop.app")]
    pub admin_actor_id: String,

    #[envconfig(default = "email")]
    pub admin_actor_type: String,

    #[envconfig(default = "1000")]
    pub max_concurrency: usize,

    #[envconfig(default = "false")]
    pub enable_metrics: FlexBool,

    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: FlexBool,
}

impl Config {
    pub fn default_test_config() -> Self {
        Self {
            address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
            database_url: "sqlite::memory:".to_string(),
            max_db_connections: 1,
            acquire_timeout_secs: 5,
            webhook_url: "http://localhost:18081/webhook".to_string(),
            webhook_secret: Some("test-webhook-secret".to_string()),
            webhook_timeout_ms: 2000,
            notification_queue_size: 64,
            allowed_origins: AllowedOrigins::List(vec!["http://localhost:5173".to_string()]),
            admin_actor_id: "admin-menu@hoopshop.app".to_string(),
            admin_actor_type: "email".to_string(),
            max_concurrency: 1000,
            enable_metrics: FlexBool(false),
            debug: FlexBool(false),
        }
    }

    /// The webhook signing secret. Startup fails without one.
    pub fn webhook_secret(&self) -> Result<&str, ConfigError> {
        match self.webhook_secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(ConfigError::MissingWebhookSecret),
        }
    }

    /// Checks everything `serve` needs before any port is bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.webhook_secret()?;
        url::Url::parse(&self.webhook_url)
            .map_err(|e| ConfigError::InvalidWebhookUrl(format!("{}: {}", self.webhook_url, e)))?;
        Ok(())
    }

    pub fn admin_actor(&self) -> Actor {
        Actor::new(&self.admin_actor_id, &self.admin_actor_type)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}
