//! Configuration management for the document layer.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Legacy `REDIS_*` environment variables
//! - Configuration file support
//! - `DAL__` prefixed environment overrides
//! - Component-wise validation
mod connection;
mod lock;
mod retry;
mod schema;
pub use connection::*;
pub use lock::*;
pub use retry::*;
pub use schema::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

pub(crate) const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub(crate) const ENV_PREFIX: &str = "DAL";

/// Main configuration container for the document layer
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Legacy `REDIS_{MASTER,SLAVE,LOCAL}_{HOST,PORT}` variables
/// 3. Configuration file specified by `CONFIG_PATH`
/// 4. Environment variables with `DAL__` prefix (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DalConfig {
    /// Endpoints and pool sizing for the three logical connections
    #[serde(default)]
    pub connections: ConnectionsConfig,
    /// Schema version and template location
    #[serde(default)]
    pub schema: SchemaConfig,
    /// Distributed lock timing
    #[serde(default)]
    pub lock: LockConfig,
    /// Retry policies for store reads
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl DalConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/dal.toml");
    /// std::env::set_var("DAL__LOCK__ALIVE_TIMEOUT_MS", "8000");
    /// let cfg = DalConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut base = Self::default();
        base.connections.apply_legacy_env()?;

        let mut builder = Config::builder().add_source(Config::try_from(&base)?);

        if let Ok(config_path) = env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every subsystem and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.connections.validate()?;
        self.schema.validate()?;
        self.lock.validate()?;
        self.retry.validate()?;
        Ok(self)
    }
}
