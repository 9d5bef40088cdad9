use std::env;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::ConnectionRole;
use crate::Error;
use crate::Result;

/// A single Redis-protocol endpoint
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    #[serde(default = "default_master_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Disabled endpoints fail every operation with `StoreError::Disabled`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl EndpointConfig {
    fn with_host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_port(),
            enabled: default_enabled(),
        }
    }

    /// Connection URL understood by the `redis` crate
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    fn validate(
        &self,
        role: ConnectionRole,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(format!(
                "connections.{role}.host cannot be empty"
            ))));
        }
        if self.port == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "connections.{role}.port cannot be 0"
            ))));
        }
        Ok(())
    }
}

/// Bounded pools shared by every store handle of one context
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Command connections per logical connection
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Concurrent pub/sub connections per logical connection
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Time allowed to open a connection or wait for a pooled one (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions: default_max_subscriptions(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectionsConfig {
    /// Per-host instance used by the `Local` scope
    #[serde(default = "default_local")]
    pub local: EndpointConfig,

    /// Read side of the `Global` scope
    #[serde(default = "default_master")]
    pub replica: EndpointConfig,

    /// Write side of the `Global` scope
    #[serde(default = "default_master")]
    pub master: EndpointConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            local: default_local(),
            replica: default_master(),
            master: default_master(),
            pool: PoolConfig::default(),
        }
    }
}

impl ConnectionsConfig {
    pub fn endpoint(
        &self,
        role: ConnectionRole,
    ) -> &EndpointConfig {
        match role {
            ConnectionRole::Local => &self.local,
            ConnectionRole::Replica => &self.replica,
            ConnectionRole::Master => &self.master,
        }
    }

    /// Reads `REDIS_{MASTER,SLAVE,LOCAL}_{HOST,PORT}`.
    ///
    /// The replica falls back to the master values when its own variables are
    /// unset.
    pub(crate) fn apply_legacy_env(&mut self) -> Result<()> {
        if let Some(host) = legacy_var("REDIS_MASTER_HOST") {
            self.master.host = host;
        }
        if let Some(port) = legacy_port("REDIS_MASTER_PORT")? {
            self.master.port = port;
        }

        self.replica.host = legacy_var("REDIS_SLAVE_HOST").unwrap_or_else(|| self.master.host.clone());
        self.replica.port = legacy_port("REDIS_SLAVE_PORT")?.unwrap_or(self.master.port);

        if let Some(host) = legacy_var("REDIS_LOCAL_HOST") {
            self.local.host = host;
        }
        if let Some(port) = legacy_port("REDIS_LOCAL_PORT")? {
            self.local.port = port;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.local.validate(ConnectionRole::Local)?;
        self.replica.validate(ConnectionRole::Replica)?;
        self.master.validate(ConnectionRole::Master)?;

        if self.pool.max_connections == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connections.pool.max_connections must be > 0".into(),
            )));
        }
        if self.pool.max_subscriptions == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connections.pool.max_subscriptions must be > 0".into(),
            )));
        }
        if self.pool.connect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connections.pool.connect_timeout_ms cannot be 0".into(),
            )));
        }
        Ok(())
    }
}

fn legacy_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn legacy_port(name: &str) -> Result<Option<u16>> {
    match legacy_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|e| Error::Config(ConfigError::Message(format!("{name}={raw} is not a valid port: {e}")))),
    }
}

fn default_master_host() -> String {
    "redis-master".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_enabled() -> bool {
    true
}
fn default_master() -> EndpointConfig {
    EndpointConfig::with_host(&default_master_host())
}
fn default_local() -> EndpointConfig {
    EndpointConfig::with_host("redis-local")
}
fn default_max_connections() -> usize {
    3
}
fn default_max_subscriptions() -> usize {
    3
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
