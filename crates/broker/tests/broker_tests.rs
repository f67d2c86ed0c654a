//! Broker operations against in-memory backends.

mod common;

use async_trait::async_trait;
use cask_broker::{BuildState, DatabaseRequest, HookRunner, NoHook};
use cask_core::plain::not_serializable;
use cask_core::{ConnectionDetails, ContextId, ErrorKind, Fingerprint, WireError};
use cask_provision::DatabaseAdmin;
use common::*;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A hook that counts its runs and answers with a fixed outcome.
struct TestHook {
    calls: AtomicUsize,
    outcome: Result<Value, WireError>,
    delay: Duration,
}

impl TestHook {
    fn ok(result: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome: Ok(result),
            delay: Duration::ZERO,
        })
    }

    fn failing(error: WireError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome: Err(error),
            delay: Duration::from_millis(20),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HookRunner for TestHook {
    async fn run_hook(&self, _connection: ConnectionDetails) -> Result<Value, WireError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

fn request(params: Value) -> DatabaseRequest {
    DatabaseRequest {
        params: Some(params),
        ..Default::default()
    }
}

fn keyed(params: Value, key: &str) -> DatabaseRequest {
    DatabaseRequest {
        params: Some(params),
        key: Some(key.to_string()),
        depth: 0,
    }
}

#[tokio::test]
async fn deep_equal_params_build_once() {
    let test = TestBroker::new();
    let hook = TestHook::ok(json!({"seeded": true}));
    let context = ContextId::new();

    let a = test
        .broker
        .get_test_database(
            context,
            request(json!({"schema": "app", "tables": ["foo"]})),
            hook.clone(),
        )
        .await
        .unwrap();
    let b = test
        .broker
        .get_test_database(
            context,
            request(json!({"tables": ["foo"], "schema": "app"})),
            hook.clone(),
        )
        .await
        .unwrap();

    assert_eq!(hook.calls(), 1);
    assert_ne!(a.connection.database, b.connection.database);
    assert_eq!(a.hook_result, json!({"seeded": true}));
    assert_eq!(b.hook_result, a.hook_result);
    assert_eq!(test.templates().await.len(), 1);
}

#[tokio::test]
async fn different_params_build_separate_templates() {
    let test = TestBroker::new();
    let hook = TestHook::ok(Value::Null);
    let context = ContextId::new();

    test.broker
        .get_test_database(context, request(json!({"table": "foo"})), hook.clone())
        .await
        .unwrap();
    test.broker
        .get_test_database(context, request(json!({"table": "bar"})), hook.clone())
        .await
        .unwrap();

    assert_eq!(hook.calls(), 2);
    assert_eq!(test.templates().await.len(), 2);
}

#[tokio::test]
async fn absent_params_differ_from_null() {
    let test = TestBroker::new();
    let hook = TestHook::ok(Value::Null);
    let context = ContextId::new();

    test.broker
        .get_test_database(context, DatabaseRequest::default(), hook.clone())
        .await
        .unwrap();
    test.broker
        .get_test_database(context, request(Value::Null), hook.clone())
        .await
        .unwrap();
    assert_eq!(hook.calls(), 2);
}

#[tokio::test]
async fn concurrent_keyed_requests_clone_once() {
    let test = TestBroker::new();
    test.admin.set_clone_delay(Duration::from_millis(20)).await;
    let hook = TestHook::ok(Value::Null);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let broker = test.broker.clone();
        let hook = hook.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .get_test_database(ContextId::new(), keyed(json!({"a": 1}), "k"), hook)
                .await
                .unwrap()
        }));
    }

    let mut databases = HashSet::new();
    for task in tasks {
        databases.insert(task.await.unwrap().connection.database);
    }
    assert_eq!(databases.len(), 1);
    assert_eq!(test.admin.clone_count().await, 1);
    assert_eq!(hook.calls(), 1);
}

#[tokio::test]
async fn different_keys_get_different_databases() {
    let test = TestBroker::new();
    let hook = TestHook::ok(Value::Null);
    let context = ContextId::new();

    let k1 = test
        .broker
        .get_test_database(context, keyed(json!({"a": 1}), "k1"), hook.clone())
        .await
        .unwrap();
    let k2 = test
        .broker
        .get_test_database(context, keyed(json!({"a": 1}), "k2"), hook.clone())
        .await
        .unwrap();
    let k1_again = test
        .broker
        .get_test_database(ContextId::new(), keyed(json!({"a": 1}), "k1"), hook.clone())
        .await
        .unwrap();

    assert_ne!(k1.connection.database, k2.connection.database);
    assert_eq!(k1.connection.database, k1_again.connection.database);
}

#[tokio::test]
async fn unkeyed_requests_get_fresh_databases() {
    let test = TestBroker::new();
    let context = ContextId::new();

    let mut databases = HashSet::new();
    for _ in 0..3 {
        let grant = test
            .broker
            .get_test_database(context, DatabaseRequest::default(), Arc::new(NoHook))
            .await
            .unwrap();
        databases.insert(grant.connection.database);
    }
    assert_eq!(databases.len(), 3);
}

#[tokio::test]
async fn ending_context_drops_owned_but_keeps_keyed() {
    let test = TestBroker::new();
    let hook = TestHook::ok(Value::Null);
    let context = ContextId::new();

    let owned = test
        .broker
        .get_test_database(context, request(json!({})), hook.clone())
        .await
        .unwrap()
        .connection
        .database;
    let shared = test
        .broker
        .get_test_database(context, keyed(json!({}), "k"), hook.clone())
        .await
        .unwrap()
        .connection
        .database;

    let report = test.broker.end_context(context).await;
    assert_eq!(report.dropped, vec![owned.clone()]);
    assert!(report.is_clean());

    assert!(!test.admin.database_exists(&owned).await.unwrap());
    assert!(test.admin.database_exists(&shared).await.unwrap());
    // Templates survive teardown.
    assert_eq!(test.templates().await.len(), 1);
}

#[tokio::test]
async fn teardown_failure_is_reported_not_raised() {
    let test = TestBroker::new();
    let context = ContextId::new();

    let database = test
        .broker
        .get_test_database(context, DatabaseRequest::default(), Arc::new(NoHook))
        .await
        .unwrap()
        .connection
        .database;
    test.admin.fail_drops_of(&database).await;

    let report = test.broker.end_context(context).await;
    assert!(!report.is_clean());
    assert_eq!(report.failures[0].0, database);
}

#[tokio::test]
async fn hook_failure_is_replayed_to_every_requester() {
    let test = TestBroker::new();
    let hook = TestHook::failing(WireError::new(ErrorKind::TemplateBuild, "x"));
    let params = json!({"broken": true});

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let broker = test.broker.clone();
        let hook = hook.clone();
        let params = params.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .get_test_database(ContextId::new(), request(params), hook)
                .await
        }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateBuild);
        assert!(err.message.contains('x'));
    }

    let later = test
        .broker
        .get_test_database(ContextId::new(), request(params.clone()), hook.clone())
        .await
        .unwrap_err();
    assert!(later.message.contains('x'));
    assert_eq!(hook.calls(), 1);
    assert!(matches!(
        test.broker
            .templates()
            .state(&Fingerprint::of(Some(&params)))
            .await,
        Some(BuildState::Failed(_))
    ));

    // Other fingerprints are unaffected.
    test.broker
        .get_test_database(ContextId::new(), request(json!({"fine": true})), Arc::new(NoHook))
        .await
        .unwrap();
    // The failed scratch database was dropped.
    assert_eq!(test.scratch_databases().await.len(), 1);
}

#[tokio::test]
async fn non_serializable_result_leaves_nothing_behind() {
    let test = TestBroker::new();
    let hook = TestHook::failing(not_serializable("key must be a string"));

    let err = test
        .broker
        .get_test_database(ContextId::new(), request(json!({"n": 1})), hook)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NonSerializableResult);
    assert!(err.message.contains("could not be serialized"));
    assert!(test.scratch_databases().await.is_empty());
    assert!(test.templates().await.is_empty());
}

#[tokio::test]
async fn too_deep_hook_result_is_rejected() {
    let test = TestBroker::new();
    let mut deep = json!(1);
    for _ in 0..70 {
        deep = json!([deep]);
    }
    let hook = TestHook::ok(deep);

    let err = test
        .broker
        .get_test_database(ContextId::new(), DatabaseRequest::default(), hook)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NonSerializableResult);
    assert!(test.scratch_databases().await.is_empty());
}

#[tokio::test]
async fn startup_failure_is_cached() {
    let test = TestBroker::new();
    test.runtime.fail_start("docker daemon unavailable").await;

    for _ in 0..2 {
        let err = test
            .broker
            .get_test_database(ContextId::new(), DatabaseRequest::default(), Arc::new(NoHook))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerStartup);
        assert!(err.message.contains("docker daemon unavailable"));
    }
    assert_eq!(test.runtime.networks().await.len(), 1);
}

#[tokio::test]
async fn request_after_context_ended_is_dropped() {
    let test = TestBroker::new();
    let context = ContextId::new();
    test.broker
        .get_test_database(context, DatabaseRequest::default(), Arc::new(NoHook))
        .await
        .unwrap();
    test.broker.end_context(context).await;

    let err = test
        .broker
        .get_test_database(context, DatabaseRequest::default(), Arc::new(NoHook))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ContextVanished);
    assert!(test.scratch_databases().await.is_empty());
}

#[tokio::test]
async fn create_from_template_clones_named_template() {
    let test = TestBroker::new();
    let context = ContextId::new();

    let (name, _connection) = test.broker.start_additional_template().await.unwrap();
    let template = test.broker.finish_additional_template(&name).await.unwrap();
    assert!(test.admin.is_template(&template).await);

    let grant = test
        .broker
        .create_from_template(context, &template)
        .await
        .unwrap();
    assert_eq!(grant.hook_result, Value::Null);
    assert!(test.admin.database_exists(&grant.connection.database).await.unwrap());

    let err = test
        .broker
        .create_from_template(context, "test_missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Provision);

    let err = test
        .broker
        .create_from_template(context, "Robert'); DROP")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Provision);

    let report = test.broker.end_context(context).await;
    assert_eq!(report.dropped, vec![grant.connection.database]);
    assert!(test.admin.is_template(&template).await);
}

#[tokio::test]
async fn exec_runs_in_server_container() {
    let test = TestBroker::new();
    let command = vec!["psql".to_string(), "-c".to_string(), "select 1".to_string()];

    let output = test.broker.exec_in_server(&command).await.unwrap();
    assert!(output.success());
    assert_eq!(output.output, "psql -c select 1");

    let err = test.broker.exec_in_server(&[]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Exec);
}

#[tokio::test]
async fn connection_details_point_at_server() {
    let test = TestBroker::new();
    let grant = test
        .broker
        .get_test_database(ContextId::new(), DatabaseRequest::default(), Arc::new(NoHook))
        .await
        .unwrap();

    let connection = grant.connection;
    assert!(connection.database.starts_with("test_"));
    assert_eq!(connection.username, "postgres");
    assert!(
        connection
            .connection_string
            .ends_with(&format!("/{}", connection.database))
    );
    assert!(connection.proxy_connection_string.is_none());
}
