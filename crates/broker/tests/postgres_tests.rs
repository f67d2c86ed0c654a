//! End-to-end tests against PostgreSQL in Docker.

mod common;

use cask_core::config::AppConfig;
use cask_core::{BrokerMessage, ClientMessage};
use common::*;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

#[tokio::test]
async fn hook_schema_is_visible_in_clones() {
    let Some(broker) = docker_broker_or_skip(AppConfig::default()).await else {
        return;
    };
    let (mut client, _) = WireClient::open(&broker).await;

    let request = client
        .send(ClientMessage::GetTestDatabase {
            params: Some(json!({"fixture": "foo"})),
            key: None,
            depth: 0,
        })
        .await;
    let run_hook = client.recv().await;
    let scratch = match run_hook.body {
        BrokerMessage::RunHook { connection } => connection,
        other => panic!("expected run_hook, got {other:?}"),
    };

    {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&scratch.connection_string)
            .await
            .expect("connect to scratch database");
        sqlx::query("CREATE TABLE foo (id INT PRIMARY KEY)")
            .execute(&pool)
            .await
            .expect("create table");
        pool.close().await;
    }
    client
        .reply(
            run_hook.id,
            ClientMessage::HookFinished {
                outcome: hook_ok(json!({"tables": ["foo"]})),
            },
        )
        .await;

    let ready = client.recv().await;
    assert_eq!(ready.reply_to, Some(request));
    let connection = match ready.body {
        BrokerMessage::DatabaseReady { connection, .. } => connection,
        other => panic!("expected database_ready, got {other:?}"),
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&connection.connection_string)
        .await
        .expect("connect to cloned database");
    sqlx::query("SELECT * FROM foo")
        .execute(&pool)
        .await
        .expect("foo exists in the clone");
    let err = sqlx::query("SELECT * FROM bar")
        .execute(&pool)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    pool.close().await;

    drop(client);
    broker.shutdown().await;
}
