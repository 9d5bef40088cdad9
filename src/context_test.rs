use std::time::Duration;

use serde_json::json;

use super::*;
use crate::lock::LockOptions;
use crate::store::Scope;
use crate::store::SetOptions;
use crate::test_utils::doc;

fn context() -> DalContext {
    DalContext::in_memory(DalConfig::default()).unwrap()
}

#[tokio::test]
async fn test_global_and_local_scopes_are_separate_stores() {
    let ctx = context();
    let global = ctx.store(Scope::Global).unwrap();
    let local = ctx.store(Scope::Local).unwrap();

    let robot = doc(json!({"Robot": {"r1": {"IP": "10.0.0.7"}}}));
    assert!(global.set(&robot, SetOptions::default(), None).await.unwrap());

    assert!(global.exists(&robot).await.unwrap());
    assert!(!local.exists(&robot).await.unwrap());
}

#[tokio::test]
async fn test_global_writes_are_visible_to_global_reads() {
    let ctx = context();
    let writer = ctx.store(Scope::Global).unwrap();
    let reader = ctx.store(Scope::Global).unwrap();

    let label = doc(json!({"Node": {"n1": {"Label": "camera"}}}));
    writer.set(&label, SetOptions::default(), None).await.unwrap();

    assert_eq!(reader.get(&label).await.unwrap(), label);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let mut config = DalConfig::default();
    config.lock.poll_interval_ms = config.lock.alive_timeout_ms;

    assert!(DalContext::in_memory(config).is_err());
}

#[test]
fn test_locks_use_the_configured_timing() {
    let mut config = DalConfig::default();
    config.lock.default_timeout_secs = 20;
    let ctx = DalContext::in_memory(config).unwrap();

    let lock = ctx.lock(LockOptions::new("L")).unwrap();
    assert_eq!(lock.lease(), Duration::from_secs(20));
    assert_eq!(lock.heartbeat_period(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_shutdown_releases_non_persistent_locks() {
    let ctx = context();
    let transient = ctx.lock(LockOptions::new("transient").owner("A")).unwrap();
    let persistent = ctx.lock(LockOptions::new("kept").owner("A").persistent(true)).unwrap();

    assert!(transient.acquire(false).await.unwrap());
    assert!(persistent.acquire(false).await.unwrap());
    assert_eq!(ctx.heartbeats().len(), 2);

    ctx.shutdown().await.unwrap();

    assert!(ctx.heartbeats().is_empty());
    assert!(!transient.is_owned().await.unwrap());
    assert!(persistent.is_owned().await.unwrap());
}

#[tokio::test]
async fn test_local_locks_do_not_contend_with_global_ones() {
    let ctx = context();
    let global = ctx.lock(LockOptions::new("L").owner("A")).unwrap();
    let local = ctx
        .lock(LockOptions::new("L").owner("B").scope(Scope::Local))
        .unwrap();

    assert!(global.acquire(false).await.unwrap());
    assert!(local.acquire(false).await.unwrap());
}
