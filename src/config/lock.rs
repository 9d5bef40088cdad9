use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Timing parameters shared by every `DistributedLock` of a context
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LockConfig {
    /// Lease used when a lock is created with `timeout = 0` (seconds)
    #[serde(default = "default_lock_timeout_secs")]
    pub default_timeout_secs: u64,

    /// A queued contender whose Alive entry is older than this is evicted (ms)
    #[serde(default = "default_alive_timeout_ms")]
    pub alive_timeout_ms: u64,

    /// Delay between two acquisition attempts while queued (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Heartbeat period as a fraction of the lease
    #[serde(default = "default_heartbeat_factor")]
    pub heartbeat_factor: f64,

    /// Consecutive heartbeat connectivity failures tolerated
    #[serde(default = "default_heartbeat_max_retries")]
    pub heartbeat_max_retries: usize,

    /// Leases at or below this never get a heartbeat (seconds)
    #[serde(default = "default_heartbeat_min_timeout_secs")]
    pub heartbeat_min_timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_lock_timeout_secs(),
            alive_timeout_ms: default_alive_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_factor: default_heartbeat_factor(),
            heartbeat_max_retries: default_heartbeat_max_retries(),
            heartbeat_min_timeout_secs: default_heartbeat_min_timeout_secs(),
        }
    }
}

impl LockConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn alive_timeout(&self) -> Duration {
        Duration::from_millis(self.alive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_min_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_min_timeout_secs)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lock.default_timeout_secs cannot be 0".into(),
            )));
        }
        if self.alive_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lock.alive_timeout_ms cannot be 0".into(),
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lock.poll_interval_ms cannot be 0".into(),
            )));
        }
        if self.poll_interval_ms >= self.alive_timeout_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "lock.poll_interval_ms {}ms must be less than lock.alive_timeout_ms {}ms",
                self.poll_interval_ms, self.alive_timeout_ms
            ))));
        }
        if !(self.heartbeat_factor > 0.0 && self.heartbeat_factor < 1.0) {
            return Err(Error::Config(ConfigError::Message(format!(
                "lock.heartbeat_factor must be in (0, 1), got {}",
                self.heartbeat_factor
            ))));
        }
        Ok(())
    }
}

fn default_lock_timeout_secs() -> u64 {
    90
}
fn default_alive_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_heartbeat_factor() -> f64 {
    0.25
}
fn default_heartbeat_max_retries() -> usize {
    3
}
fn default_heartbeat_min_timeout_secs() -> u64 {
    1
}
