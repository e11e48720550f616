//! Configuration for the delay cascade.
//!
//! Supports YAML files and environment variable overrides.

use serde::{Deserialize, Serialize};

use crate::startup::StartupSettings;
use crate::topology::{QueueKind, TopologyGeneration};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "delay-cascade.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DELAY_CASCADE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DELAY_CASCADE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DELAY_CASCADE_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayCascadeConfig {
    pub amqp: AmqpConfig,
    pub generation: GenerationConfig,
    pub startup: StartupSettings,
}

/// Broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 4,
        }
    }
}

/// Queue durability class as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKindConfig {
    Classic,
    #[default]
    Quorum,
}

/// Which cascade generation to build and publish into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Prepended to every exchange and queue name.
    pub name_prefix: String,
    pub queue_kind: QueueKindConfig,
    /// Lazy mode for classic queues; ignored for quorum queues.
    pub lazy: bool,
}

impl GenerationConfig {
    pub fn topology(&self) -> TopologyGeneration {
        let queue_kind = match self.queue_kind {
            QueueKindConfig::Classic => QueueKind::Classic { lazy: self.lazy },
            QueueKindConfig::Quorum => QueueKind::Quorum,
        };
        TopologyGeneration::new(self.name_prefix.clone(), queue_kind)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl DelayCascadeConfig {
    /// Load configuration from files and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`DELAY_CASCADE__AMQP__URL`, ...)
    /// 2. File named by `DELAY_CASCADE_CONFIG`
    /// 3. File given as `path`
    /// 4. `delay-cascade.yaml` in the working directory
    /// 5. Defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
