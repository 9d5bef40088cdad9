use std::time::Duration;

use nanoid::nanoid;

use crate::constants::FIELD_SEPARATOR;
use crate::constants::ID_SEPARATOR;
use crate::store::Scope;
use crate::LockError;
use crate::Result;

pub(crate) const MIN_QUEUE_LEVEL: u32 = 1;
pub(crate) const MAX_QUEUE_LEVEL: u32 = 9;

/// Parameters of one named lock handle.
///
/// `timeout` of zero selects the configured default lease and turns
/// reacquire on, so the heartbeat keeps the lease alive.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    pub name: String,
    pub scope: Scope,
    /// Lease of the Value key
    pub timeout: Duration,
    /// Priority queue level, lower is served first. `None` skips the queue.
    pub queue_level: Option<u32>,
    /// Acquisition budget. Blocking acquires wait forever when unset.
    pub blocking_timeout: Option<Duration>,
    /// Overrides the configured liveness window for queued contenders
    pub alive_timeout: Option<Duration>,
    /// Token written into the Value key and used as queue member
    pub owner: String,
    /// Left to expire instead of being released on context shutdown
    pub persistent: bool,
    /// Allows `reacquire` and therefore the heartbeat
    pub reacquire: bool,
}

impl LockOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Global,
            timeout: Duration::ZERO,
            queue_level: None,
            blocking_timeout: None,
            alive_timeout: None,
            owner: nanoid!(),
            persistent: false,
            reacquire: false,
        }
    }

    pub fn scope(
        mut self,
        scope: Scope,
    ) -> Self {
        self.scope = scope;
        self
    }

    pub fn timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue_level(
        mut self,
        level: u32,
    ) -> Self {
        self.queue_level = Some(level);
        self
    }

    pub fn blocking_timeout(
        mut self,
        budget: Duration,
    ) -> Self {
        self.blocking_timeout = Some(budget);
        self
    }

    pub fn alive_timeout(
        mut self,
        window: Duration,
    ) -> Self {
        self.alive_timeout = Some(window);
        self
    }

    pub fn owner(
        mut self,
        owner: impl Into<String>,
    ) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn persistent(
        mut self,
        persistent: bool,
    ) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn reacquire(
        mut self,
        reacquire: bool,
    ) -> Self {
        self.reacquire = reacquire;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(level) = self.queue_level {
            if !(MIN_QUEUE_LEVEL..=MAX_QUEUE_LEVEL).contains(&level) {
                return Err(LockError::InvalidQueueLevel(level).into());
            }
        }
        if self.name.is_empty() || self.name.contains([FIELD_SEPARATOR, ID_SEPARATOR]) {
            return Err(LockError::InvalidName(self.name.clone()).into());
        }
        if self.owner.is_empty() {
            return Err(LockError::EmptyOwner.into());
        }
        Ok(())
    }
}
