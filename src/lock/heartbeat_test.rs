use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::*;
use crate::store::InMemoryBackend;
use crate::store::KvBackend;
use crate::store::MockKvBackend;
use crate::ConnectionRole;
use crate::StoreError;

const SETTINGS: HeartbeatSettings = HeartbeatSettings {
    period: Duration::from_secs(1),
    max_failures: 3,
};

fn lease(
    backend: Arc<dyn KvBackend>,
    owner: &str,
    persistent: bool,
) -> Lease {
    Lease {
        backend,
        key: "Lock:L,Value:".to_string(),
        owner: owner.to_string(),
        ttl: Duration::from_secs(4),
        persistent,
    }
}

fn reset_by_peer() -> StoreError {
    StoreError::connectivity(ConnectionRole::Master, "EVALSHA", "connection reset by peer")
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_renews_the_lease() {
    let store = InMemoryBackend::new();
    let backend: Arc<dyn KvBackend> = Arc::new(store.clone());
    assert!(backend.lock_acquire("Lock:L,Value:", "A", Duration::from_secs(4)).await.unwrap());

    let registry = Arc::new(HeartbeatRegistry::new());
    let lease = lease(backend.clone(), "A", false);
    registry.register(lease.clone(), Some(SETTINGS));

    sleep(Duration::from_secs(30)).await;
    assert!(registry.is_beating(&lease));
    let (owner, remaining) = backend.lock_owner("Lock:L,Value:").await.unwrap().unwrap();
    assert_eq!(owner, "A");
    assert!(remaining.is_some_and(|r| r > Duration::from_secs(2)));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_gives_up_after_consecutive_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut mock = MockKvBackend::new();
    mock.expect_role().return_const(ConnectionRole::Master);
    let counter = calls.clone();
    mock.expect_lock_extend().returning(move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(reset_by_peer())
    });

    let registry = Arc::new(HeartbeatRegistry::new());
    let lease = lease(Arc::new(mock), "A", false);
    registry.register(lease.clone(), Some(SETTINGS));

    sleep(Duration::from_millis(5500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!registry.is_active(&lease));
}

#[tokio::test(start_paused = true)]
async fn test_successful_renewal_resets_the_failure_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut mock = MockKvBackend::new();
    mock.expect_role().return_const(ConnectionRole::Master);
    let counter = calls.clone();
    mock.expect_lock_extend().returning(move |_, _, _, _| {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 | 1 | 3 | 4 => Err(reset_by_peer()),
            2 => Ok(true),
            _ => Ok(false),
        }
    });

    let registry = Arc::new(HeartbeatRegistry::new());
    let lease = lease(Arc::new(mock), "A", false);
    registry.register(lease.clone(), Some(SETTINGS));

    sleep(Duration::from_millis(8500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_errors_stop_the_heartbeat() {
    let mut mock = MockKvBackend::new();
    mock.expect_role().return_const(ConnectionRole::Master);
    mock.expect_lock_extend().times(1).returning(|_, _, _, _| {
        Err(StoreError::Command {
            connection: ConnectionRole::Master,
            operation: "EVALSHA",
            reason: "NOSCRIPT".to_string(),
        })
    });

    let registry = Arc::new(HeartbeatRegistry::new());
    registry.register(lease(Arc::new(mock), "A", false), Some(SETTINGS));

    sleep(Duration::from_millis(3500)).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_registering_again_replaces_the_entry() {
    let backend: Arc<dyn KvBackend> = Arc::new(InMemoryBackend::new());
    let registry = Arc::new(HeartbeatRegistry::new());

    registry.register(lease(backend.clone(), "A", false), Some(SETTINGS));
    registry.register(lease(backend.clone(), "A", false), None);
    registry.register(lease(backend.clone(), "B", false), None);
    assert_eq!(registry.len(), 2);

    assert!(registry.unregister(&lease(backend.clone(), "A", false)));
    assert!(!registry.unregister(&lease(backend, "A", false)));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_only_non_persistent_locks() {
    let store = InMemoryBackend::new();
    let backend: Arc<dyn KvBackend> = Arc::new(store.clone());
    let ttl = Duration::from_secs(30);

    let mut transient = lease(backend.clone(), "A", false);
    transient.key = "Lock:transient,Value:".to_string();
    let mut kept = lease(backend.clone(), "B", true);
    kept.key = "Lock:kept,Value:".to_string();
    assert!(backend.lock_acquire(&transient.key, "A", ttl).await.unwrap());
    assert!(backend.lock_acquire(&kept.key, "B", ttl).await.unwrap());

    let registry = Arc::new(HeartbeatRegistry::new());
    registry.register(transient.clone(), Some(SETTINGS));
    registry.register(kept.clone(), None);

    registry.shutdown().await.unwrap();

    assert!(registry.is_empty());
    assert_eq!(backend.lock_owner(&transient.key).await.unwrap(), None);
    assert_eq!(
        backend.lock_owner(&kept.key).await.unwrap().map(|(owner, _)| owner),
        Some("B".to_string())
    );
}
