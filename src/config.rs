//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub poller: PollerConfig,
    pub jobs: JobsConfig,
    pub keys: KeysConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "events.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://events.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Immediate retry attempts per inbox before a delivery is dead-lettered
    pub max_retries: u32,
    /// Base delay between immediate retries; attempt n waits 2^n times this
    pub retry_base_delay_ms: u64,
    /// Interval between dead-letter queue sweeps
    pub dlq_sweep_interval_seconds: u64,
    /// Pending rows selected per sweep
    pub dlq_select_limit: u32,
    /// Rows actually processed per sweep (outbound burst cap)
    pub dlq_process_limit: usize,
    /// Concurrent in-flight deliveries during fan-out
    pub max_concurrent_deliveries: usize,
    /// Outbound HTTP request timeout
    pub request_timeout_seconds: u64,
}

/// Remote instance poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Minimum age before an instance is polled again
    pub interval_seconds: u64,
    /// Instances selected per cycle
    pub batch_size: u32,
    /// Instances polled concurrently within a cycle
    pub sub_batch_size: usize,
}

/// Background job dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub reminder_interval_seconds: u64,
    pub popularity_interval_seconds: u64,
    /// Events rescored per batch
    pub popularity_batch_size: u32,
    pub export_interval_seconds: u64,
    /// In-progress exports older than this are treated as abandoned
    pub export_timeout_seconds: u64,
    /// Directory where data exports are written
    pub export_dir: PathBuf,
    /// Items claimed per dispatcher cycle
    pub claim_batch_size: u32,
    /// Bound on waiting for in-flight batches during shutdown
    pub shutdown_timeout_seconds: u64,
}

impl JobsConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// Key store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Master secret; actor private keys are encrypted at rest with a
    /// key derived from this value
    pub secret: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format ("pretty" or "json")
    pub format: String,
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// # Sources (later overrides earlier)
    /// 1. Built-in defaults
    /// 2. config/default.toml
    /// 3. config/local.toml
    /// 4. Environment variables (RALLYPOINT__*)
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.max_retries", 3)?
            .set_default("federation.retry_base_delay_ms", 1000)?
            .set_default("federation.dlq_sweep_interval_seconds", 60)?
            .set_default("federation.dlq_select_limit", 100)?
            .set_default("federation.dlq_process_limit", 50)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("poller.interval_seconds", 600)?
            .set_default("poller.batch_size", 20)?
            .set_default("poller.sub_batch_size", 5)?
            .set_default("jobs.reminder_interval_seconds", 60)?
            .set_default("jobs.popularity_interval_seconds", 900)?
            .set_default("jobs.popularity_batch_size", 100)?
            .set_default("jobs.export_interval_seconds", 300)?
            .set_default("jobs.export_timeout_seconds", 600)?
            .set_default("jobs.export_dir", "./exports")?
            .set_default("jobs.claim_batch_size", 25)?
            .set_default("jobs.shutdown_timeout_seconds", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (RALLYPOINT_*)
            .add_source(
                Environment::with_prefix("RALLYPOINT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must be set".to_string(),
            ));
        }
        if self.server.protocol != "http" && self.server.protocol != "https" {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got: {}",
                self.server.protocol
            )));
        }
        if self.keys.secret.len() < 16 {
            return Err(crate::error::AppError::Config(
                "keys.secret must be at least 16 characters".to_string(),
            ));
        }
        if self.federation.max_retries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_retries must be at least 1".to_string(),
            ));
        }
        if self.federation.retry_base_delay_ms == 0 {
            return Err(crate::error::AppError::Config(
                "federation.retry_base_delay_ms must be at least 1".to_string(),
            ));
        }
        if self.federation.dlq_process_limit == 0 || self.jobs.claim_batch_size == 0 {
            return Err(crate::error::AppError::Config(
                "batch limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
