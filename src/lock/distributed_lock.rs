//! Named, priority-ordered, liveness-checked mutual exclusion.
//!
//! A lock is three keys produced by the codec from the `Lock` scope:
//!
//! ```text
//! Lock:<name>,Value:   owner token, expires after the lease
//! Lock:<name>,Queue:   sorted set, member = owner, score = level * 10^13 + arrival ms
//! Lock:<name>,Alive:   sorted set, member = owner, score = last liveness stamp (ms)
//! ```
//!
//! Acquisition loop, once per poll tick:
//!
//! ```text
//! refresh own Queue/Alive ─► evict stale contenders ahead of us
//!        ─► queue empty or head is us? ─► SET NX PX ─► owned
//!        ─► deadline passed? ─► false (still queued)
//! ```
//!
//! Contention is never an error: `acquire`, `release`, `extend` and
//! `reacquire` report it as `false`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::interval;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::HeartbeatRegistry;
use super::HeartbeatSettings;
use super::Lease;
use super::LockOptions;
use crate::codec::Document;
use crate::codec::PathCodec;
use crate::codec::Value;
use crate::constants::LOCK_ALIVE_FIELD;
use crate::constants::LOCK_QUEUE_FIELD;
use crate::constants::LOCK_SCOPE;
use crate::constants::LOCK_VALUE_FIELD;
use crate::constants::QUEUE_LEVEL_FACTOR;
use crate::store::KvBackend;
use crate::store::StoreClient;
use crate::store::WriteBatch;
use crate::utils::time::now_ms;
use crate::LockConfig;
use crate::Result;
use crate::SchemaError;

/// Store keys of one named lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    pub value: String,
    pub queue: String,
    pub alive: String,
}

impl LockKeys {
    pub fn resolve(
        codec: &PathCodec,
        name: &str,
    ) -> Result<Self> {
        Ok(Self {
            value: field_key(codec, name, LOCK_VALUE_FIELD)?,
            queue: field_key(codec, name, LOCK_QUEUE_FIELD)?,
            alive: field_key(codec, name, LOCK_ALIVE_FIELD)?,
        })
    }
}

fn field_key(
    codec: &PathCodec,
    name: &str,
    field: &str,
) -> Result<String> {
    let mut document = Document::new();
    document.insert_path(&[LOCK_SCOPE, name, field], Value::Str(String::new()));
    let triple = codec.encode(&document, false)?.into_iter().next();
    match triple {
        Some(triple) => Ok(triple.key),
        None => Err(SchemaError::EmptyDocument(document.to_string()).into()),
    }
}

/// Queue score: lower is served first
pub(crate) fn queue_score(
    level: u32,
    arrival_ms: u64,
) -> u64 {
    u64::from(level) * QUEUE_LEVEL_FACTOR + arrival_ms
}

/// Snapshot of a lock's holder and waiting contenders
#[derive(Debug, Clone, PartialEq)]
pub struct LockInspection {
    pub owner: Option<String>,
    /// Remaining lease of the current owner
    pub remaining: Option<Duration>,
    /// Queued contenders, first served first
    pub queue: Vec<String>,
}

#[derive(Clone)]
pub struct DistributedLock {
    options: LockOptions,
    keys: LockKeys,
    backend: Arc<dyn KvBackend>,
    lease: Duration,
    should_reacquire: bool,
    alive_timeout: Duration,
    poll_interval: Duration,
    heartbeat: Option<HeartbeatSettings>,
    registry: Arc<HeartbeatRegistry>,
}

impl fmt::Debug for DistributedLock {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.options.name)
            .field("owner", &self.options.owner)
            .field("connection", &self.backend.role())
            .field("lease", &self.lease)
            .field("queue_level", &self.options.queue_level)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Binds `options` to the write connection of `client`.
    ///
    /// Every lock operation, reads included, runs on that connection so a
    /// contender never acts on a lagging replica.
    pub fn new(
        client: &StoreClient,
        options: LockOptions,
        config: &LockConfig,
        registry: Arc<HeartbeatRegistry>,
    ) -> Result<Self> {
        options.validate()?;
        let keys = LockKeys::resolve(client.codec(), &options.name)?;

        let (lease, should_reacquire) = if options.timeout.is_zero() {
            (config.default_timeout(), true)
        } else {
            (options.timeout, options.reacquire)
        };
        let heartbeat = (should_reacquire && lease > config.heartbeat_min_timeout()).then(|| HeartbeatSettings {
            period: lease.mul_f64(config.heartbeat_factor),
            max_failures: config.heartbeat_max_retries,
        });

        Ok(Self {
            alive_timeout: options.alive_timeout.unwrap_or_else(|| config.alive_timeout()),
            poll_interval: config.poll_interval(),
            backend: client.backends().write.clone(),
            options,
            keys,
            lease,
            should_reacquire,
            heartbeat,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn owner(&self) -> &str {
        &self.options.owner
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    /// Effective lease of the Value key
    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        self.heartbeat.map(|h| h.period)
    }

    /// Acquires with the configured blocking budget
    pub async fn acquire(
        &self,
        blocking: bool,
    ) -> Result<bool> {
        self.acquire_timeout(blocking, self.options.blocking_timeout).await
    }

    /// Acquires the lock, reentrant for the same owner.
    ///
    /// A blocking call waits for `budget`, or forever when unset. A
    /// non-blocking call gives up after `budget` or on the first failed
    /// attempt. On timeout the contender stays queued; call `abandon` to
    /// leave the queue. Dropping the future while it waits leaves the
    /// queue as well.
    pub async fn acquire_timeout(
        &self,
        blocking: bool,
        budget: Option<Duration>,
    ) -> Result<bool> {
        if self.is_owned().await? {
            debug!(lock = %self.options.name, owner = %self.options.owner, "already owned");
            return Ok(true);
        }

        let started = Instant::now();
        let deadline = match (blocking, budget) {
            (true, None) => None,
            (true, Some(budget)) => Some(started + budget),
            (false, budget) => Some(started + budget.unwrap_or_default()),
        };
        let score = self
            .options
            .queue_level
            .map(|level| queue_score(level, now_ms()) as f64);

        let mut guard = QueueGuard {
            backend: self.backend.clone(),
            keys: self.keys.clone(),
            owner: self.options.owner.clone(),
            armed: score.is_some(),
        };
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Some(score) = score {
                self.refresh_alive(score).await?;
            }
            self.evict_frontline(score.map(|s| s - 1.0).unwrap_or(f64::INFINITY))
                .await?;

            if self.is_my_turn().await?
                && self
                    .backend
                    .lock_acquire(&self.keys.value, &self.options.owner, self.lease)
                    .await?
            {
                guard.armed = false;
                if score.is_some() {
                    leave_queue(self.backend.as_ref(), &self.keys, &self.options.owner).await?;
                }
                self.registry.register(self.lease_record(), self.heartbeat);
                info!(
                    lock = %self.options.name,
                    owner = %self.options.owner,
                    waited = ?started.elapsed(),
                    "lock acquired"
                );
                return Ok(true);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                guard.armed = false;
                debug!(
                    lock = %self.options.name,
                    owner = %self.options.owner,
                    "acquire budget exhausted"
                );
                return Ok(false);
            }
        }
    }

    /// `false` when the lock is not owned by this handle's owner
    pub async fn release(&self) -> Result<bool> {
        self.registry.unregister(&self.lease_record());
        let released = self
            .backend
            .lock_release(&self.keys.value, &self.options.owner)
            .await?;
        if released {
            info!(lock = %self.options.name, owner = %self.options.owner, "lock released");
        } else {
            warn!(lock = %self.options.name, owner = %self.options.owner, "release of a lock not owned");
        }
        Ok(released)
    }

    /// Adds `additional` to the remaining lease
    pub async fn extend(
        &self,
        additional: Duration,
    ) -> Result<bool> {
        let extended = self
            .backend
            .lock_extend(&self.keys.value, &self.options.owner, additional, false)
            .await?;
        trace!(lock = %self.options.name, extended, "extend");
        Ok(extended)
    }

    /// Resets the remaining lease to the full lease. Always `false` when
    /// reacquire is disabled.
    pub async fn reacquire(&self) -> Result<bool> {
        if !self.should_reacquire {
            return Ok(false);
        }
        let renewed = self
            .backend
            .lock_extend(&self.keys.value, &self.options.owner, self.lease, true)
            .await?;
        trace!(lock = %self.options.name, renewed, "reacquire");
        Ok(renewed)
    }

    pub async fn inspect(&self) -> Result<LockInspection> {
        let holder = self.backend.lock_owner(&self.keys.value).await?;
        let queue = self.backend.zrange(&self.keys.queue, 0, -1).await?;
        let (owner, remaining) = match holder {
            Some((owner, remaining)) => (Some(owner), remaining),
            None => (None, None),
        };
        Ok(LockInspection {
            owner,
            remaining,
            queue: queue.into_iter().map(|(member, _)| member).collect(),
        })
    }

    pub async fn is_owned(&self) -> Result<bool> {
        let holder = self.backend.get(&self.keys.value).await?;
        Ok(holder.is_some_and(|token| token == self.options.owner.as_bytes()))
    }

    /// Whether this process still tracks the lock as held
    pub fn is_active(&self) -> bool {
        self.registry.is_active(&self.lease_record())
    }

    /// Leaves the waiting queue
    pub async fn abandon(&self) -> Result<()> {
        leave_queue(self.backend.as_ref(), &self.keys, &self.options.owner).await?;
        debug!(lock = %self.options.name, owner = %self.options.owner, "left the queue");
        Ok(())
    }

    pub(crate) fn lease_record(&self) -> Lease {
        Lease {
            backend: self.backend.clone(),
            key: self.keys.value.clone(),
            owner: self.options.owner.clone(),
            ttl: self.lease,
            persistent: self.options.persistent,
        }
    }

    /// Re-enqueues with the original score if evicted and stamps liveness
    async fn refresh_alive(
        &self,
        score: f64,
    ) -> Result<()> {
        let mut batch = WriteBatch::atomic();
        batch
            .zadd(&self.keys.queue, &self.options.owner, score, true)
            .zadd(&self.keys.alive, &self.options.owner, now_ms() as f64, false);
        self.backend.execute(batch).await?;
        Ok(())
    }

    /// Removes contenders scored at or below `max_score` whose liveness
    /// stamp is missing or older than the alive timeout
    async fn evict_frontline(
        &self,
        max_score: f64,
    ) -> Result<()> {
        let frontline = self
            .backend
            .zrangebyscore(&self.keys.queue, f64::NEG_INFINITY, max_score)
            .await?;
        if frontline.is_empty() {
            return Ok(());
        }

        let now = now_ms();
        let window = self.alive_timeout.as_millis() as u64;
        let mut stale = Vec::new();
        for (member, _) in frontline {
            let alive = self.backend.zscore(&self.keys.alive, &member).await?;
            let expired = match alive {
                Some(stamp) => now.saturating_sub(stamp as u64) > window,
                None => true,
            };
            if expired {
                stale.push(member);
            }
        }
        if stale.is_empty() {
            return Ok(());
        }

        info!(lock = %self.options.name, evicted = ?stale, "evicting inactive contenders");
        let mut batch = WriteBatch::atomic();
        batch
            .zrem(&self.keys.queue, stale.clone())
            .zrem(&self.keys.alive, stale);
        self.backend.execute(batch).await?;
        Ok(())
    }

    async fn is_my_turn(&self) -> Result<bool> {
        let head = self.backend.zrange(&self.keys.queue, 0, 0).await?;
        Ok(match head.first() {
            None => true,
            Some((member, _)) => *member == self.options.owner,
        })
    }
}

async fn leave_queue(
    backend: &dyn KvBackend,
    keys: &LockKeys,
    owner: &str,
) -> Result<()> {
    let mut batch = WriteBatch::atomic();
    batch
        .zrem(&keys.queue, vec![owner.to_string()])
        .zrem(&keys.alive, vec![owner.to_string()]);
    backend.execute(batch).await?;
    Ok(())
}

/// Removes the contender's Queue/Alive entries when an acquire is dropped
/// or fails while waiting
struct QueueGuard {
    backend: Arc<dyn KvBackend>,
    keys: LockKeys,
    owner: String,
    armed: bool,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(queue = %self.keys.queue, owner = %self.owner, "no runtime to leave the queue");
            return;
        };
        let backend = self.backend.clone();
        let keys = self.keys.clone();
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            match leave_queue(backend.as_ref(), &keys, &owner).await {
                Ok(()) => debug!(queue = %keys.queue, %owner, "abandoned acquire left the queue"),
                Err(e) => warn!(queue = %keys.queue, %owner, "failed to leave the queue: {}", e),
            }
        });
    }
}
