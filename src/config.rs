//! Configuration loading and validation.
//!
//! Layered the way `knhk-workflow-engine::config::ConfigLoader` does:
//! defaults, overlaid by a file, overlaid by environment variables.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub kv: KvConfig,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.service.validate()?;
        self.logging.validate()?;
        self.kv.validate()?;
        self.bus.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    /// Load configuration from an optional TOML/YAML file path, then
    /// apply environment variable overrides on top (`REDIS_URL`,
    /// `NAMESPACE`, `LOG_LEVEL` per spec.md §6, plus the crate's own
    /// `CONDUCTOR_*` knobs).
    pub fn load(file: Option<&str>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let raw = builder
            .build()
            .map_err(|e| CoreError::ValidationFailure {
                message: format!("failed to build config: {e}"),
            })?;

        let mut cfg: RuntimeConfig = raw
            .try_deserialize()
            .unwrap_or_else(|_| RuntimeConfig::default());

        if let Ok(val) = std::env::var("LOG_LEVEL") {
            cfg.logging.level = val;
        }
        if let Ok(val) = std::env::var("NAMESPACE") {
            cfg.kv.namespace = val;
        }
        if let Ok(val) = std::env::var("REDIS_URL") {
            cfg.kv.data_dir = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_SERVICE_NAME") {
            cfg.service.name = val;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            kv: KvConfig::default(),
            bus: BusConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
}

impl ServiceConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::ValidationFailure {
                message: "service name cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "conductor-core".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    fn validate(&self) -> CoreResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(CoreError::ValidationFailure {
                message: format!("invalid log level: {}", self.level),
            });
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// KV store configuration: namespace prefix and sled data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub namespace: String,
    pub data_dir: String,
    pub default_op_timeout_ms: u64,
}

impl KvConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.namespace.is_empty() {
            return Err(CoreError::ValidationFailure {
                message: "namespace cannot be empty".to_string(),
            });
        }
        if self.default_op_timeout_ms == 0 {
            return Err(CoreError::ValidationFailure {
                message: "default_op_timeout_ms must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            namespace: "conductor".to_string(),
            data_dir: "./data/kv".to_string(),
            default_op_timeout_ms: 2_000,
        }
    }
}

/// Bus configuration: batch/visibility/redelivery defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub max_in_flight: usize,
    pub max_delivery_attempts: u32,
}

impl BusConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 || self.max_in_flight == 0 {
            return Err(CoreError::ValidationFailure {
                message: "batch_size and max_in_flight must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            block_timeout_ms: 5_000,
            visibility_timeout_ms: 30_000,
            max_in_flight: 16,
            max_delivery_attempts: 5,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_backoff_ceiling_ms: u64,
    pub cas_retry_attempts: u32,
}

impl SchedulerConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.cas_retry_attempts == 0 {
            return Err(CoreError::ValidationFailure {
                message: "cas_retry_attempts must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_backoff_ceiling_ms: 30_000,
            cas_retry_attempts: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_namespace_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.kv.namespace = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.logging.level = "verbose".to_string();
        assert!(cfg.validate().is_err());
    }
}
