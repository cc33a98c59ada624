//! Configuration for the community access core

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OasisConfig {
    /// SQLite URL (default: sqlite://data/oasis.db)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Upper bound for a single store call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Attempts for read-only queries hitting transient failures (1 = no retry)
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: u32,

    /// Linear backoff step between read retries
    #[serde(default = "default_read_retry_backoff_ms")]
    pub read_retry_backoff_ms: u64,

    /// Regeneration attempts when a fresh invite code collides in a community
    #[serde(default = "default_code_collision_retries")]
    pub code_collision_retries: u32,

    /// Whether a token creator may consume their own token
    #[serde(default)]
    pub allow_self_invite: bool,

    /// Write an invite_accepted notification record on consumption
    #[serde(default = "default_true")]
    pub emit_join_notifications: bool,
}

fn default_database_url() -> String {
    "sqlite://data/oasis.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_read_retry_attempts() -> u32 {
    3
}

fn default_read_retry_backoff_ms() -> u64 {
    50
}

fn default_code_collision_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for OasisConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            read_retry_attempts: default_read_retry_attempts(),
            read_retry_backoff_ms: default_read_retry_backoff_ms(),
            code_collision_retries: default_code_collision_retries(),
            allow_self_invite: false,
            emit_join_notifications: true,
        }
    }
}

impl OasisConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config pointing at the given database URL
    pub fn with_database_url(url: impl Into<String>) -> Self {
        Self {
            database_url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `OASIS_*` environment variables
    pub fn from_env() -> Result<Self> {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
        }

        let config = Self {
            database_url: std::env::var("OASIS_DATABASE_URL")
                .unwrap_or_else(|_| default_database_url()),
            max_connections: parsed("OASIS_MAX_CONNECTIONS")
                .unwrap_or_else(default_max_connections),
            busy_timeout_ms: parsed("OASIS_BUSY_TIMEOUT_MS").unwrap_or_else(default_busy_timeout_ms),
            operation_timeout_ms: parsed("OASIS_OPERATION_TIMEOUT_MS")
                .unwrap_or_else(default_operation_timeout_ms),
            read_retry_attempts: parsed("OASIS_READ_RETRY_ATTEMPTS")
                .unwrap_or_else(default_read_retry_attempts),
            read_retry_backoff_ms: parsed("OASIS_READ_RETRY_BACKOFF_MS")
                .unwrap_or_else(default_read_retry_backoff_ms),
            code_collision_retries: parsed("OASIS_CODE_COLLISION_RETRIES")
                .unwrap_or_else(default_code_collision_retries),
            allow_self_invite: std::env::var("OASIS_ALLOW_SELF_INVITE")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            emit_join_notifications: std::env::var("OASIS_EMIT_JOIN_NOTIFICATIONS")
                .map(|s| !s.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OasisConfig =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.database_url.trim().is_empty() {
            anyhow::bail!("database_url must not be empty");
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }
}
