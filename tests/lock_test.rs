mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::context;
use d_keyspace::lock::LockOptions;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_owned_intervals_never_overlap() {
    let ctx = Arc::new(context());
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let mut options = LockOptions::new("shared")
            .owner(format!("worker-{i}"))
            .timeout(Duration::from_secs(5));
        if i % 2 == 0 {
            options = options.queue_level(1 + i % 3);
        }
        let lock = ctx.lock(options).unwrap();
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        let entries = entries.clone();

        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                assert!(lock.acquire(true).await.unwrap());
                if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                entries.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                assert!(lock.release().await.unwrap());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(entries.load(Ordering::SeqCst), 24);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_are_served_by_priority() {
    let ctx = Arc::new(context());
    let holder = ctx
        .lock(LockOptions::new("printer").owner("holder").queue_level(1))
        .unwrap();
    assert!(holder.acquire(false).await.unwrap());

    let served = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    // Enqueued worst level first so arrival order disagrees with priority
    for (owner, level) in [("low", 3), ("mid", 2), ("high", 1)] {
        let lock = ctx
            .lock(LockOptions::new("printer").owner(owner).queue_level(level))
            .unwrap();
        let served = served.clone();
        handles.push(tokio::spawn(async move {
            assert!(lock.acquire(true).await.unwrap());
            served.lock().push(owner);
            sleep(Duration::from_millis(20)).await;
            assert!(lock.release().await.unwrap());
        }));
        sleep(Duration::from_millis(30)).await;
    }

    let queue = holder.inspect().await.unwrap().queue;
    assert_eq!(queue, vec!["high", "mid", "low"]);

    assert!(holder.release().await.unwrap());
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*served.lock(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn test_second_contender_fails_immediately_without_blocking() {
    let ctx = context();
    let a = ctx
        .lock(
            LockOptions::new("L")
                .owner("A")
                .queue_level(1)
                .timeout(Duration::from_secs(5)),
        )
        .unwrap();
    let b = ctx
        .lock(
            LockOptions::new("L")
                .owner("B")
                .queue_level(1)
                .timeout(Duration::from_secs(5)),
        )
        .unwrap();

    assert!(a.acquire(true).await.unwrap());

    let started = Instant::now();
    assert!(!b.acquire(false).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));

    let inspection = b.inspect().await.unwrap();
    assert_eq!(inspection.owner.as_deref(), Some("A"));
    b.abandon().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_owner_gives_way_to_a_waiting_contender() {
    let ctx = context();
    let a = ctx
        .lock(LockOptions::new("L").owner("A").timeout(Duration::from_secs(2)))
        .unwrap();
    let b = ctx
        .lock(
            LockOptions::new("L")
                .owner("B")
                .timeout(Duration::from_secs(2))
                .blocking_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    assert!(a.acquire(false).await.unwrap());
    // A never renews: no reacquire, so no heartbeat
    assert_eq!(a.heartbeat_period(), None);

    let started = Instant::now();
    assert!(b.acquire(true).await.unwrap());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(!a.is_owned().await.unwrap());
    assert!(!a.release().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_outlives_the_lease() {
    let ctx = context();
    let a = ctx
        .lock(
            LockOptions::new("L")
                .owner("A")
                .timeout(Duration::from_secs(4))
                .reacquire(true),
        )
        .unwrap();
    let b = ctx
        .lock(
            LockOptions::new("L")
                .owner("B")
                .blocking_timeout(Duration::from_secs(20)),
        )
        .unwrap();

    assert!(a.acquire(false).await.unwrap());
    assert!(!b.acquire(true).await.unwrap());
    assert!(a.is_owned().await.unwrap());
    assert!(a.is_active());

    ctx.shutdown().await.unwrap();
    assert!(!a.is_owned().await.unwrap());
}
