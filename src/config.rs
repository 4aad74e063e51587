use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::ws::{HubConfig, RetryPolicy};

/// Which document store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_store_backend")]
    pub store_backend: StoreBackend,

    /// Database URL, required for the postgres backend
    pub db_url: Option<String>,

    /// Identifies this replica in published snapshots. Random when unset.
    pub instance_id: Option<String>,

    /// Document used when a socket does not name one
    #[serde(default = "default_doc_id")]
    pub default_doc_id: String,

    #[serde(default = "default_presence_grace_secs")]
    pub presence_grace_secs: u64,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Hubs without clients are shut down after this long
    #[serde(default = "default_hub_idle_secs")]
    pub hub_idle_secs: u64,

    /// Per-socket outbound queue length
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default = "default_save_retry_attempts")]
    pub save_retry_attempts: u32,

    #[serde(default = "default_save_retry_base_ms")]
    pub save_retry_base_ms: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn hub_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.hub_idle_secs)
    }

    /// Hub settings derived from this configuration.
    pub fn hub_config(&self, instance_id: String) -> HubConfig {
        HubConfig {
            instance_id,
            presence_grace: Duration::from_secs(self.presence_grace_secs),
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            outbound_capacity: self.outbound_queue.max(1),
            save_retry: RetryPolicy {
                attempts: self.save_retry_attempts.max(1),
                base_delay: Duration::from_millis(self.save_retry_base_ms),
            },
        }
    }

    /// Allowed CORS origins; empty means any.
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            store_backend: default_store_backend(),
            db_url: None,
            instance_id: None,
            default_doc_id: default_doc_id(),
            presence_grace_secs: default_presence_grace_secs(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            hub_idle_secs: default_hub_idle_secs(),
            outbound_queue: default_outbound_queue(),
            save_retry_attempts: default_save_retry_attempts(),
            save_retry_base_ms: default_save_retry_base_ms(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Postgres
}

fn default_doc_id() -> String {
    "default".to_string()
}

fn default_presence_grace_secs() -> u64 {
    120
}

fn default_recovery_timeout_ms() -> u64 {
    5000
}

fn default_hub_idle_secs() -> u64 {
    900
}

fn default_outbound_queue() -> usize {
    256
}

fn default_save_retry_attempts() -> u32 {
    3
}

fn default_save_retry_base_ms() -> u64 {
    200
}
