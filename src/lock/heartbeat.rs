//! Active-lock registry and lease heartbeats.
//!
//! Every lock owned by this process is registered here until it is
//! released. Locks with reacquire enabled also get a background task that
//! resets the lease on a fixed period:
//!
//! ```text
//! tick ─► lock_extend(replace) ─┬─ true  ─► reset failure count
//!                               ├─ false ─► not owned, stop
//!                               └─ error ─► retry up to max_failures, then stop
//! ```
//!
//! A stopped heartbeat removes its lock from the registry. On shutdown the
//! registry cancels every heartbeat and releases the non-persistent locks.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::store::KvBackend;
use crate::utils::async_task::spawn_task;
use crate::Result;

/// An owned lease on a lock's Value key
#[derive(Clone)]
pub(crate) struct Lease {
    pub(crate) backend: Arc<dyn KvBackend>,
    pub(crate) key: String,
    pub(crate) owner: String,
    pub(crate) ttl: Duration,
    pub(crate) persistent: bool,
}

impl Lease {
    /// Registry identity: one entry per owner per key per connection
    fn id(&self) -> String {
        format!("{}@{}/{}", self.owner, self.backend.role(), self.key)
    }
}

impl fmt::Debug for Lease {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.backend.role())
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .field("persistent", &self.persistent)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HeartbeatSettings {
    pub(crate) period: Duration,
    /// Consecutive connectivity failures before giving up
    pub(crate) max_failures: usize,
}

#[derive(Debug)]
struct ActiveLock {
    generation: u64,
    lease: Lease,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Locks currently owned by this process
#[derive(Debug, Default)]
pub struct HeartbeatRegistry {
    active: DashMap<String, ActiveLock>,
    next_generation: AtomicU64,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks registered as owned
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn is_active(
        &self,
        lease: &Lease,
    ) -> bool {
        self.active.contains_key(&lease.id())
    }

    /// Whether a heartbeat task is still running for the lease
    pub(crate) fn is_beating(
        &self,
        lease: &Lease,
    ) -> bool {
        self.active
            .get(&lease.id())
            .and_then(|entry| entry.handle.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Records an owned lease, replacing any previous entry for it, and
    /// starts its heartbeat when `heartbeat` is set.
    pub(crate) fn register(
        self: &Arc<Self>,
        lease: Lease,
        heartbeat: Option<HeartbeatSettings>,
    ) {
        let id = lease.id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let handle = heartbeat.map(|settings| {
            let registry = Arc::clone(self);
            let lease = lease.clone();
            let token = token.clone();
            let id = id.clone();
            spawn_task("lock_heartbeat", move || async move {
                beat(&lease, settings, token).await;
                registry.remove_generation(&id, generation);
                Ok(())
            })
        });

        debug!(%id, generation, heartbeat = handle.is_some(), "lock registered");
        let previous = self.active.insert(
            id,
            ActiveLock {
                generation,
                lease,
                token,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    /// Forgets the lease and stops its heartbeat. Returns whether it was
    /// registered.
    pub(crate) fn unregister(
        &self,
        lease: &Lease,
    ) -> bool {
        match self.active.remove(&lease.id()) {
            Some((id, entry)) => {
                entry.token.cancel();
                debug!(%id, "lock unregistered");
                true
            }
            None => false,
        }
    }

    fn remove_generation(
        &self,
        id: &str,
        generation: u64,
    ) {
        if self.active.remove_if(id, |_, entry| entry.generation == generation).is_some() {
            info!(%id, "lock dropped from the active set");
        }
    }

    /// Stops every heartbeat and releases the non-persistent locks
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        let mut released = 0;
        for id in ids {
            let Some((_, entry)) = self.active.remove(&id) else {
                continue;
            };
            entry.token.cancel();
            if let Some(handle) = entry.handle {
                if let Err(e) = handle.await {
                    warn!(%id, "heartbeat task ended abnormally: {:?}", e);
                }
            }
            if entry.lease.persistent {
                debug!(%id, "persistent lock left to expire");
                continue;
            }
            match entry.lease.backend.lock_release(&entry.lease.key, &entry.lease.owner).await {
                Ok(true) => released += 1,
                Ok(false) => debug!(%id, "lock already gone at shutdown"),
                Err(e) => warn!(%id, "failed to release lock at shutdown: {}", e),
            }
        }
        info!(released, "heartbeat registry shut down");
        Ok(())
    }
}

async fn beat(
    lease: &Lease,
    settings: HeartbeatSettings,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + settings.period, settings.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0;

    loop {
        select! {
            _ = token.cancelled() => {
                trace!(key = %lease.key, owner = %lease.owner, "heartbeat cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        match lease.backend.lock_extend(&lease.key, &lease.owner, lease.ttl, true).await {
            Ok(true) => {
                trace!(key = %lease.key, owner = %lease.owner, "lease renewed");
                failures = 0;
            }
            Ok(false) => {
                warn!(key = %lease.key, owner = %lease.owner, "lock no longer owned, heartbeat stopped");
                return;
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                warn!(key = %lease.key, owner = %lease.owner, failures, "lease renewal failed: {}", e);
                if failures >= settings.max_failures {
                    error!(key = %lease.key, owner = %lease.owner, "heartbeat gave up after {} failures", failures);
                    return;
                }
            }
            Err(e) => {
                error!(key = %lease.key, owner = %lease.owner, "lease renewal rejected: {}", e);
                return;
            }
        }
    }
}
