use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use super::*;
use crate::codec::Document;
use crate::codec::Value;
use crate::test_utils::doc;
use crate::test_utils::fast_retry;
use crate::test_utils::memory_client;
use crate::test_utils::query_builder;
use crate::ConnectionRole;
use crate::Error;
use crate::SchemaError;
use crate::StoreError;

fn refused(role: ConnectionRole) -> StoreError {
    StoreError::connectivity(
        role,
        "EXISTS",
        std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
    )
}

fn mock_client(
    read: MockKvBackend,
    write: MockKvBackend,
) -> StoreClient {
    let write: Arc<dyn KvBackend> = Arc::new(write);
    let backends = ScopedBackends {
        read: Arc::new(read),
        write: write.clone(),
        subscribe: write,
    };
    StoreClient::new(backends, query_builder(), fast_retry())
}

#[tokio::test]
async fn test_set_then_get_restores_typed_values() {
    let (client, _) = memory_client();
    let robot = doc(json!({
        "Robot": {"r1": {
            "RobotName": "atlas",
            "Online": true,
            "Status": {"battery": 80, "mode": "auto"},
            "Actions": ["move", "stop"]
        }}
    }));

    assert!(client.set(&robot, SetOptions::default(), None).await.unwrap());

    let stored = client.get(&doc(json!({"Robot": {"r1": "*"}}))).await.unwrap();
    assert_eq!(stored, robot);
}

#[tokio::test]
async fn test_any_leaves_keep_empty_and_nested_containers() {
    let (client, store) = memory_client();
    let vars = doc(json!({"Var": {"v": {"ID": {
        "a": {"Value": []},
        "b": {"Value": {}},
        "c": {"Value": "x"},
        "d": {"Value": {"limits": [1, 2.5, {"unit": "m"}], "on": true}}
    }}}}));

    client.set(&vars, SetOptions::default(), None).await.unwrap();
    assert_eq!(store.len(), 4);

    let stored = client.get(&doc(json!({"Var": {"v": "*"}}))).await.unwrap();
    assert_eq!(stored, vars);
}

#[tokio::test]
async fn test_search_is_sorted_case_insensitively() {
    let (client, _) = memory_client();
    for id in ["b", "A", "c"] {
        let node = doc(json!({"Node": {id: {"Label": id}}}));
        client.set(&node, SetOptions::default(), None).await.unwrap();
    }

    let keys = client.search(&doc(json!({"Node": {"*": {"Label": "*"}}}))).await.unwrap();
    assert_eq!(keys, vec!["Node:A,Label:", "Node:b,Label:", "Node:c,Label:"]);
}

#[tokio::test]
async fn test_exact_search_checks_existence() {
    let (client, _) = memory_client();
    let label = doc(json!({"Node": {"n1": {"Label": "x"}}}));
    assert!(client.search(&label).await.unwrap().is_empty());

    client.set(&label, SetOptions::default(), None).await.unwrap();
    assert_eq!(client.search(&label).await.unwrap(), vec!["Node:n1,Label:"]);
}

#[tokio::test]
async fn test_find_returns_structure_only() {
    let (client, _) = memory_client();
    let node = doc(json!({"Node": {"n1": {"Label": "x", "Info": "y"}}}));
    client.set(&node, SetOptions::default(), None).await.unwrap();

    let found = client.find(&doc(json!({"Node": {"n1": "*"}}))).await.unwrap();
    assert_eq!(found, doc(json!({"Node": {"n1": {"Label": "", "Info": ""}}})));
}

#[tokio::test]
async fn test_value_in_key_is_renamed_not_duplicated() {
    let (client, store) = memory_client();
    let north = doc(json!({"Robot": {"r1": {"Fleet": "north"}}}));
    let south = doc(json!({"Robot": {"r1": {"Fleet": "south"}}}));

    client.set(&north, SetOptions::default(), None).await.unwrap();
    client.set(&south, SetOptions::default(), None).await.unwrap();

    let keys = client.search(&doc(json!({"Robot": {"r1": {"Fleet": "*"}}}))).await.unwrap();
    assert_eq!(keys, vec!["Robot:r1,Fleet:south"]);
    assert_eq!(store.len(), 1);

    let value = client.get_value(&doc(json!({"Robot": {"r1": {"Fleet": "*"}}}))).await.unwrap();
    assert_eq!(value, Some(Value::from("south")));
}

#[tokio::test]
async fn test_ambiguous_value_in_key_is_refused() {
    let (client, store) = memory_client();
    store.set("Robot:r1,Fleet:a", Vec::new(), SetOptions::default()).await.unwrap();
    store.set("Robot:r1,Fleet:b", Vec::new(), SetOptions::default()).await.unwrap();

    let err = client
        .set(&doc(json!({"Robot": {"r1": {"Fleet": "c"}}})), SetOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Schema(SchemaError::AmbiguousValueKey { .. })));
}

#[tokio::test]
async fn test_set_nx_reports_skipped_writes() {
    let (client, _) = memory_client();
    let label = doc(json!({"Node": {"n1": {"Label": "first"}}}));
    assert!(client.set(&label, SetOptions::nx(), None).await.unwrap());

    let again = doc(json!({"Node": {"n1": {"Label": "second"}}}));
    assert!(!client.set(&again, SetOptions::nx(), None).await.unwrap());

    let value = client.get_value(&label).await.unwrap();
    assert_eq!(value, Some(Value::from("first")));
}

#[tokio::test]
async fn test_hash_set_replaces_previous_fields() {
    let (client, _) = memory_client();
    let first = doc(json!({"Robot": {"r1": {"Status": {"a": "1", "b": "2"}}}}));
    let second = doc(json!({"Robot": {"r1": {"Status": {"c": "3"}}}}));
    client.set(&first, SetOptions::default(), None).await.unwrap();
    client.set(&second, SetOptions::default(), None).await.unwrap();

    let hash = client.get_hash(&doc(json!({"Robot": {"r1": {"Status": ""}}}))).await.unwrap();
    assert_eq!(hash.len(), 1);
    assert_eq!(hash.get("c"), Some(&Value::from("3")));
}

#[tokio::test]
async fn test_hash_helpers() {
    let (client, _) = memory_client();
    let status = doc(json!({"Robot": {"r1": {"Status": {"battery": 80}}}}));
    assert_eq!(client.hset(&status, None).await.unwrap(), 1);

    let target = doc(json!({"Robot": {"r1": {"Status": ""}}}));
    assert_eq!(client.hget(&target, "battery").await.unwrap(), Some(Value::Int(80)));
    assert_eq!(client.hdel(&target, &["battery".to_string()], None).await.unwrap(), 1);
    assert_eq!(client.hget(&target, "battery").await.unwrap(), None);
}

#[tokio::test]
async fn test_list_push_and_pop() {
    let (client, _) = memory_client();
    let actions = doc(json!({"Robot": {"r1": {"Actions": "move"}}}));
    assert_eq!(client.push(&actions, None).await.unwrap(), 1);
    let more = doc(json!({"Robot": {"r1": {"Actions": ["turn", 3]}}}));
    assert_eq!(client.push(&more, None).await.unwrap(), 3);

    let target = doc(json!({"Robot": {"r1": {"Actions": ""}}}));
    assert_eq!(
        client.get_list(&target).await.unwrap(),
        vec![Value::from("move"), Value::from("turn"), Value::Int(3)]
    );
    assert_eq!(client.pop(&target).await.unwrap(), Some(Value::from("move")));
}

#[tokio::test]
async fn test_delete_uses_exact_keys_and_unsafe_delete_searches() {
    let (client, store) = memory_client();
    let node = doc(json!({"Node": {"n1": {"Label": "x", "Info": "y"}}}));
    client.set(&node, SetOptions::default(), None).await.unwrap();

    // A wildcard is taken literally by delete
    let pattern = doc(json!({"Node": {"n1": "*"}}));
    assert_eq!(client.delete(&pattern, None).await.unwrap(), 0);
    assert_eq!(store.len(), 2);

    assert_eq!(client.unsafe_delete(&pattern, None).await.unwrap(), 2);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_exists_requires_every_key() {
    let (client, _) = memory_client();
    let label = doc(json!({"Node": {"n1": {"Label": "x"}}}));
    client.set(&label, SetOptions::default(), None).await.unwrap();

    assert!(client.exists(&label).await.unwrap());
    let both = doc(json!({"Node": {"n1": {"Label": "", "Info": ""}}}));
    assert!(!client.exists(&both).await.unwrap());

    let err = client.exists(&doc(json!({}))).await.unwrap_err();
    assert!(matches!(err, Error::Schema(SchemaError::EmptyDocument(_))));
}

#[tokio::test]
async fn test_rename_moves_every_key() {
    let (client, _) = memory_client();
    let old = doc(json!({"Node": {"n1": {"Label": "x"}}}));
    client.set(&old, SetOptions::default(), None).await.unwrap();

    let new = doc(json!({"Node": {"n2": {"Label": "x"}}}));
    assert!(client.rename(&old, &new, None).await.unwrap());
    assert!(!client.exists(&old).await.unwrap());
    assert!(client.exists(&new).await.unwrap());

    // Source is gone now
    assert!(!client.rename(&old, &new, None).await.unwrap());
}

#[tokio::test]
async fn test_rename_shapes_must_match() {
    let (client, _) = memory_client();
    let old = doc(json!({"Node": {"n1": {"Label": "x"}}}));
    let new = doc(json!({"Node": {"n2": {"Label": "x", "Info": "y"}}}));

    let err = client.rename(&old, &new, None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Schema(SchemaError::RenameMismatch { old_keys: 1, new_keys: 2 })
    ));
}

#[tokio::test]
async fn test_batched_writes_apply_on_execute() {
    let (client, store) = memory_client();
    let mut batch = client.create_batch(true);
    let node = doc(json!({"Node": {"n1": {"Label": "x"}}}));

    client.set(&node, SetOptions::default(), Some(&mut batch)).await.unwrap();
    client.delete(&doc(json!({"Node": {"n9": {"Label": ""}}})), Some(&mut batch)).await.unwrap();
    assert!(store.is_empty());

    let replies = client.execute_batch(batch).await.unwrap();
    assert_eq!(replies, vec![Reply::Ok, Reply::Int(0)]);
    assert!(client.exists(&node).await.unwrap());
}

#[tokio::test]
async fn test_by_args_operations() {
    let (client, _) = memory_client();
    for (name, id) in [("global", "speed"), ("global", "mode"), ("local", "speed")] {
        let var = doc(json!({"Var": {name: {"ID": {id: {"Value": 1}}}}}));
        client.set(&var, SetOptions::default(), None).await.unwrap();
    }

    let (found, count) = client.search_by_args("Var", &[("Name", "global")]).await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        found,
        doc(json!({"Var": {"global": {"ID": {"mode": {"Value": ""}, "speed": {"Value": ""}}}}}))
    );
    assert!(client.exists_by_args("Var", &[("ID", "speed")]).await.unwrap());

    let fetched = client.get_by_args("Var", &[("Name", "local")]).await.unwrap();
    assert_eq!(fetched, doc(json!({"Var": {"local": {"ID": {"speed": {"Value": 1}}}}})));

    assert_eq!(client.delete_by_args("Var", &[("Name", "global")], None).await.unwrap(), 2);
    assert!(!client.exists_by_args("Var", &[("Name", "global")]).await.unwrap());
}

#[tokio::test]
async fn test_search_wild_appends_a_trailing_star() {
    let (client, _) = memory_client();
    client
        .set(&doc(json!({"Node": {"n1": {"Label": "x"}}})), SetOptions::default(), None)
        .await
        .unwrap();
    client
        .set(&doc(json!({"Node": {"n10": {"Label": "y"}}})), SetOptions::default(), None)
        .await
        .unwrap();

    let keys = client.search_wild(&doc(json!({"Node": {"n1": "*"}}))).await.unwrap();
    assert_eq!(keys, vec!["Node:n1,Label:"]);
}

#[tokio::test]
async fn test_unknown_fields_never_reach_the_store() {
    let (client, store) = memory_client();
    let err = client
        .set(&doc(json!({"Node": {"n1": {"Bogus": 1}}})), SetOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Schema(SchemaError::UnknownField { .. })));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_reads_are_retried_on_connectivity_errors() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let mut read = MockKvBackend::new();
    read.expect_role().return_const(ConnectionRole::Replica);
    read.expect_exists().times(2).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(refused(ConnectionRole::Replica))
        } else {
            Ok(1)
        }
    });
    let mut write = MockKvBackend::new();
    write.expect_role().return_const(ConnectionRole::Master);

    let client = mock_client(read, write);
    let label = doc(json!({"Node": {"n1": {"Label": ""}}}));
    assert!(client.exists(&label).await.unwrap());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_writes_are_not_retried() {
    let mut read = MockKvBackend::new();
    read.expect_role().return_const(ConnectionRole::Replica);
    let mut write = MockKvBackend::new();
    write.expect_role().return_const(ConnectionRole::Master);
    write
        .expect_execute()
        .times(1)
        .returning(|_| Err(refused(ConnectionRole::Master)));

    let client = mock_client(read, write);
    let err = client
        .set(&doc(json!({"Node": {"n1": {"Label": "x"}}})), SetOptions::default(), None)
        .await
        .unwrap_err();

    match err {
        Error::Store(e) => assert_eq!(e.connection(), Some(ConnectionRole::Master)),
        other => panic!("expected a store error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_key_helpers_resolve_wildcards() {
    let (client, _) = memory_client();
    let status = doc(json!({"Robot": {"r1": {"Status": {"battery": "80"}}}}));
    client.hset(&status, None).await.unwrap();
    let actions = doc(json!({"Robot": {"r1": {"Actions": ["dock", "undock"]}}}));
    client.push(&actions, None).await.unwrap();

    let any_status = doc(json!({"Robot": {"*": {"Status": ""}}}));
    assert_eq!(client.hget(&any_status, "battery").await.unwrap(), Some(Value::from("80")));
    assert_eq!(client.get_hash(&any_status).await.unwrap().len(), 1);

    let any_actions = doc(json!({"Robot": {"*": {"Actions": ""}}}));
    assert_eq!(client.get_list(&any_actions).await.unwrap().len(), 2);
    assert_eq!(client.pop(&any_actions).await.unwrap(), Some(Value::from("dock")));

    assert_eq!(client.hdel(&any_status, &["battery".to_string()], None).await.unwrap(), 1);
    // Nothing left to match
    assert_eq!(client.hget(&any_status, "battery").await.unwrap(), None);
    assert_eq!(client.hdel(&any_status, &["battery".to_string()], None).await.unwrap(), 0);
}

//-----------------------------------------------------------
// Store round trip

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,6}"
}

fn any_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        ".{0,8}".prop_map(Value::Str),
        any::<i64>().prop_map(Value::Int),
        (-1.0e6..1.0e6f64).prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

fn parameters() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(identifier(), any_value(), 1..4).prop_map(|values| {
        Value::Map(
            values
                .into_iter()
                .map(|(id, value)| {
                    let mut entry = BTreeMap::new();
                    entry.insert("Value".to_string(), value);
                    (id, Value::Map(entry))
                })
                .collect(),
        )
    })
}

fn robot_instance() -> impl Strategy<Value = Value> {
    (
        any::<bool>(),
        prop::collection::btree_map(
            "[a-z]{1,6}",
            prop_oneof![
                "[a-z0-9]{0,6}".prop_map(Value::Str),
                any::<i64>().prop_map(Value::Int),
            ],
            1..4,
        ),
        parameters(),
    )
        .prop_map(|(online, status, parameters)| {
            let mut robot = BTreeMap::new();
            robot.insert("Online".to_string(), Value::Bool(online));
            robot.insert("Status".to_string(), Value::Map(status));
            robot.insert("Parameter".to_string(), parameters);
            Value::Map(robot)
        })
}

fn var_instance() -> impl Strategy<Value = Value> {
    parameters().prop_map(|ids| {
        let mut var = BTreeMap::new();
        var.insert("ID".to_string(), ids);
        Value::Map(var)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_get_returns_what_set_wrote(
        robots in prop::collection::btree_map(identifier(), robot_instance(), 1..3),
        vars in prop::collection::btree_map(identifier(), var_instance(), 1..3),
    ) {
        let mut document = Document::new();
        document.insert("Robot", Value::Map(robots));
        document.insert("Var", Value::Map(vars));

        let (robots_back, vars_back) = block_on(async {
            let (client, _) = memory_client();
            client.set(&document, SetOptions::default(), None).await.unwrap();
            (
                client.get(&doc(json!({"Robot": "*"}))).await.unwrap(),
                client.get(&doc(json!({"Var": "*"}))).await.unwrap(),
            )
        });

        prop_assert_eq!(robots_back.get("Robot"), document.get("Robot"));
        prop_assert_eq!(vars_back.get("Var"), document.get("Var"));
    }
}
