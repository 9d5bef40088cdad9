use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::codec::Value;
use crate::store::SetOptions;
use crate::test_utils::doc;
use crate::test_utils::memory_client;
use crate::BoxError;

const WAIT: Duration = Duration::from_secs(2);

fn forward(tx: mpsc::UnboundedSender<ChangeEvent>) -> impl ChangeHandler {
    move |event: ChangeEvent| -> std::result::Result<(), BoxError> {
        let _ = tx.send(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_set_is_delivered_as_a_document() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = feed
        .subscribe(&doc(json!({"Node": {"n1": "*"}})), forward(tx))
        .await
        .unwrap();
    assert_eq!(subscription.patterns(), ["__keyspace@*__:Node:n1,*".to_string()]);

    let label = doc(json!({"Node": {"n1": {"Label": "camera"}}}));
    client.set(&label, SetOptions::default(), None).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.operation, KeyspaceOp::Set);
    assert_eq!(event.key, "Node:n1,Label:");
    assert_eq!(event.document, label);
    assert_eq!(event.patterns, subscription.patterns());
}

#[tokio::test]
async fn test_keyspace_hash_events_carry_the_whole_hash() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = feed
        .subscribe(&doc(json!({"Robot": {"r1": {"Status": "*"}}})), forward(tx))
        .await
        .unwrap();

    let status = doc(json!({"Robot": {"r1": {"Status": {"battery": "80", "mode": "auto"}}}}));
    client.hset(&status, None).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.operation, KeyspaceOp::HSet);
    assert!(event.changed_fields.is_empty());
    assert_eq!(event.document, status);

    let target = doc(json!({"Robot": {"r1": {"Status": ""}}}));
    client.hdel(&target, &["mode".to_string()], None).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.operation, KeyspaceOp::HDel);
    assert!(event.changed_fields.is_empty());
    assert_eq!(event.document, doc(json!({"Robot": {"r1": {"Status": {"battery": "80"}}}})));
}

#[tokio::test]
async fn test_deletes_carry_a_null_leaf() {
    let (client, _) = memory_client();
    let label = doc(json!({"Node": {"n1": {"Label": "camera"}}}));
    client.set(&label, SetOptions::default(), None).await.unwrap();

    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = feed.subscribe(&label, forward(tx)).await.unwrap();

    client.delete(&label, None).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.operation, KeyspaceOp::Del);
    assert_eq!(
        event.document.get_path(&["Node", "n1", "Label"]),
        Some(&Value::Null)
    );
}

#[tokio::test]
async fn test_channel_subscription_receives_hset_pub() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let target = doc(json!({"Robot": {"r1": {"Status": ""}}}));
    let _subscription = feed.subscribe_channel(&target, forward(tx)).await.unwrap();

    let update = doc(json!({"Robot": {"r1": {"Status": {"battery": "75"}}}}));
    client.hset_pub(&update).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.operation, KeyspaceOp::Publish);
    assert_eq!(event.key, "Robot:r1,Status:");
    assert_eq!(event.changed_fields, vec!["battery"]);
    assert_eq!(event.document, update);
}

#[tokio::test]
async fn test_subscribe_by_args_matches_the_instance() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = feed
        .subscribe_by_args("Var", &[("Name", "global")], forward(tx))
        .await
        .unwrap();

    let other = doc(json!({"Var": {"local": {"ID": {"speed": {"Value": 1}}}}}));
    client.set(&other, SetOptions::default(), None).await.unwrap();
    let mine = doc(json!({"Var": {"global": {"ID": {"speed": {"Value": 2}}}}}));
    client.set(&mine, SetOptions::default(), None).await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.document, mine);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_failing_handlers_do_not_end_the_subscription() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    let handler = move |event: ChangeEvent| -> std::result::Result<(), BoxError> {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Err("first call fails".into()),
            1 => panic!("second call panics"),
            _ => {
                let _ = tx.send(event);
                Ok(())
            }
        }
    };
    let subscription = feed
        .subscribe(&doc(json!({"Node": {"n1": "*"}})), handler)
        .await
        .unwrap();

    for label in ["a", "b", "c"] {
        let node = doc(json!({"Node": {"n1": {"Label": label}}}));
        client.set(&node, SetOptions::default(), None).await.unwrap();
    }

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(event.document, doc(json!({"Node": {"n1": {"Label": "c"}}})));
    assert!(!subscription.is_finished());
    assert!(logs_contain("change handler failed"));
    assert!(logs_contain("change handler panicked"));
}

#[tokio::test]
async fn test_cancelled_subscriptions_stop_delivering() {
    let (client, _) = memory_client();
    let feed = ChangeFeed::new(client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = feed
        .subscribe(&doc(json!({"Node": {"n1": "*"}})), forward(tx))
        .await
        .unwrap();
    subscription.shutdown().await;

    let label = doc(json!({"Node": {"n1": {"Label": "camera"}}}));
    client.set(&label, SetOptions::default(), None).await.unwrap();

    // Handler (and its sender) went away with the task
    assert!(rx.recv().await.is_none());
}
