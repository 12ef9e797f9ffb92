//! Clients and a server talking over real websockets.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use replicants::{
    ReplicantOptions,
    client::{ClientEvent, ClientReplicant, Status, ws::WsClient},
    config::{Config, MetricsConfig},
    http::HttpConfig,
    protocol::DeclareOptions,
    schema::Schema,
    server::Server,
    store::MemoryStore,
};
use serde_json::{Value, json};
use testresult::TestResult;
use tracing_test::traced_test;
use url::Url;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> TestResult<(Server, Url)> {
    let mut config = Config::dev();
    config.http = HttpConfig {
        port: 0,
        bind_addr: Some([127, 0, 0, 1].into()),
    };
    config.metrics = Some(MetricsConfig::disabled());
    let server = Server::spawn(config, Arc::new(MemoryStore::new())).await?;
    let url = format!("ws://{}/replicants/ws", server.http_addr()).parse()?;
    Ok((server, url))
}

async fn eventually(mut check: impl FnMut() -> bool) -> TestResult {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

async fn declared(rep: &ClientReplicant) -> TestResult {
    eventually(|| rep.status() == Status::Declared).await
}

fn with_default(value: Value) -> DeclareOptions {
    DeclareOptions {
        default_value: Some(value),
        persistent: Some(false),
        persistence_interval: None,
    }
}

#[tokio::test]
#[traced_test]
async fn changes_reach_other_clients() -> TestResult {
    let (server, url) = spawn_server().await?;
    let alice = WsClient::connect(url.clone()).await?;
    let bob = WsClient::connect(url).await?;

    let a = alice.declare("scoreboard", "score", with_default(json!({ "home": 0, "away": 0 })));
    declared(&a).await?;
    let b = bob.declare("scoreboard", "score", with_default(json!({ "ignored": true })));
    declared(&b).await?;
    assert_eq!(b.value(), Some(json!({ "home": 0, "away": 0 })));

    a.mutate(|mut root| root.set("home", json!(1)))?;
    eventually(|| b.value() == Some(json!({ "home": 1, "away": 0 }))).await?;
    assert_eq!(b.revision(), 1);

    b.mutate(|mut root| {
        root.set("away", json!(2))?;
        root.delete("home")
    })?;
    eventually(|| a.value() == Some(json!({ "away": 2 }))).await?;
    assert_eq!(a.revision(), 2);

    let rep = server
        .replicator()
        .find("scoreboard", "score")
        .ok_or("not declared on the server")?;
    assert_eq!(rep.value(), Some(json!({ "away": 2 })));
    assert_eq!(rep.revision(), 2);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn counter_incremented_from_two_connections() -> TestResult {
    let (server, url) = spawn_server().await?;
    let alice = WsClient::connect(url.clone()).await?;
    let bob = WsClient::connect(url).await?;

    let a = alice.declare("ns", "counter", with_default(json!(0)));
    declared(&a).await?;
    let b = bob.declare("ns", "counter", with_default(json!(99)));
    declared(&b).await?;
    assert_eq!(b.value(), Some(json!(0)));
    let rep = server.replicator().declare(
        "ns",
        "counter",
        ReplicantOptions::default()
            .with_persistent(false)
            .with_default_value(json!(99)),
    )?;
    assert_eq!(rep.value(), Some(json!(0)));

    let increment = |counter: &ClientReplicant| -> TestResult {
        let n = counter.value().and_then(|v| v.as_i64()).ok_or("not a number")?;
        counter.assign(json!(n + 1))?;
        Ok(())
    };
    increment(&a)?;
    eventually(|| b.value() == Some(json!(1))).await?;
    increment(&b)?;
    eventually(|| a.value() == Some(json!(2))).await?;
    increment(&a)?;
    eventually(|| b.value() == Some(json!(3))).await?;

    assert_eq!(rep.value(), Some(json!(3)));
    assert_eq!(rep.revision(), 3);
    assert_eq!((a.revision(), b.revision()), (3, 3));

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn server_changes_reach_clients() -> TestResult {
    let (server, url) = spawn_server().await?;
    let rep = server.replicator().declare(
        "lobby",
        "players",
        ReplicantOptions::default()
            .with_persistent(false)
            .with_default_value(json!([])),
    )?;
    let client = WsClient::connect(url).await?;
    let players = client.declare("lobby", "players", DeclareOptions::default());
    declared(&players).await?;

    rep.mutate(|mut root| root.push([json!("ada"), json!("grace")]))?;
    eventually(|| players.value() == Some(json!(["ada", "grace"]))).await?;

    rep.assign(json!(["linus"]))?;
    eventually(|| players.value() == Some(json!(["linus"]))).await?;
    assert_eq!(players.revision(), rep.revision());

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn invalid_changes_are_rolled_back() -> TestResult {
    let (server, url) = spawn_server().await?;
    let schema = Schema::compile(json!({
        "type": "object",
        "properties": { "count": { "type": "integer", "minimum": 0 } }
    }))?;
    let rep = server.replicator().declare(
        "ns",
        "counter",
        ReplicantOptions::default()
            .with_persistent(false)
            .with_schema(schema)
            .with_default_value(json!({ "count": 3 })),
    )?;

    let client = WsClient::connect(url).await?;
    let counter = client.declare("ns", "counter", DeclareOptions::default());
    declared(&counter).await?;
    assert_eq!(counter.schema_sum(), rep.schema_sum());

    let mut events = counter.events();
    counter.mutate(|mut root| root.set("count", json!(-1)))?;
    assert_eq!(counter.value(), Some(json!({ "count": -1 })));

    let event = tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event @ ClientEvent::OperationsRejected { .. }) => return Ok(event),
                Ok(_) => continue,
                Err(err) => return Err(err),
            }
        }
    })
    .await??;
    assert!(matches!(event, ClientEvent::OperationsRejected { .. }));
    eventually(|| counter.value() == Some(json!({ "count": 3 }))).await?;
    assert_eq!(rep.value(), Some(json!({ "count": 3 })));
    assert_eq!(rep.revision(), 0);

    counter.mutate(|mut root| root.set("count", json!(4)))?;
    eventually(|| rep.value() == Some(json!({ "count": 4 }))).await?;
    assert_eq!(server.replicator().metrics().validation_rejections.get(), 1);

    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn declare_without_name_is_rejected() -> TestResult {
    let (server, url) = spawn_server().await?;
    let client = WsClient::connect(url).await?;
    let nameless = client.declare("ns", "", DeclareOptions::default());
    eventually(|| nameless.status() == Status::Undeclared).await?;
    assert_eq!(nameless.value(), None);
    assert!(server.replicator().find_all(Some("ns")).is_empty());

    server.shutdown().await?;
    Ok(())
}
