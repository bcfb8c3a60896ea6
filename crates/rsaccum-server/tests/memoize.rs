//! Memoize handler tests against a stub external API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rsaccum_server::{composite_key, MemoizeConfig, MemoizeHandler, ServerError};
use rsaccum_storage::{MemoStore, MemoryStore};

fn dados(fields: Value) -> Map<String, Value> {
    fields.as_object().cloned().unwrap()
}

fn handler(
    store: &Arc<MemoryStore>,
    default_ttl: Duration,
) -> MemoizeHandler<MemoryStore> {
    MemoizeHandler::new(
        Arc::clone(store),
        MemoizeConfig {
            default_ttl,
            upstream_timeout: Duration::from_secs(5),
        },
    )
}

async fn upstream_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|req| req.body_json::<Value>().unwrap())
        .collect()
}

#[tokio::test]
async fn successive_partial_writes_converge_on_the_composite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(2)
        .mount(&server)
        .await;

    let url = format!("{}/api", server.uri());
    let store = Arc::new(MemoryStore::new());
    let handler = handler(&store, Duration::from_secs(60));

    let first = handler
        .process("u1", &url, dados(json!({"a": 1})), None)
        .await
        .unwrap();
    assert_eq!(&first[..], b"ok");

    handler
        .process("u1", &url, dados(json!({"b": 2})), None)
        .await
        .unwrap();

    let bodies = upstream_bodies(&server).await;
    assert_eq!(bodies[0], json!({"a": 1}));
    assert_eq!(bodies[1], json!({"a": 1, "b": 2}));
}

#[tokio::test]
async fn new_fields_override_old_ones() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/api", server.uri());
    let store = Arc::new(MemoryStore::new());
    let handler = handler(&store, Duration::from_secs(60));

    handler
        .process("u1", &url, dados(json!({"a": 1, "b": 1})), None)
        .await
        .unwrap();
    handler
        .process("u1", &url, dados(json!({"b": 2})), None)
        .await
        .unwrap();

    let bodies = upstream_bodies(&server).await;
    assert_eq!(bodies[1], json!({"a": 1, "b": 2}));
}

#[tokio::test]
async fn stale_entries_reset_instead_of_merging() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/api", server.uri());
    let store = Arc::new(MemoryStore::new());
    // Staleness horizon well under the stored TTL, so the entry is still in
    // the store when the second call finds it too old to merge.
    let handler = handler(&store, Duration::from_millis(300));

    handler
        .process("u1", &url, dados(json!({"a": 1})), Some(60))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    handler
        .process("u1", &url, dados(json!({"b": 2})), Some(60))
        .await
        .unwrap();

    let bodies = upstream_bodies(&server).await;
    assert_eq!(bodies[1], json!({"b": 2}), "expired state must not merge");
}

#[tokio::test]
async fn id_field_rides_outbound_but_is_never_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/api", server.uri());
    let store = Arc::new(MemoryStore::new());
    let handler = handler(&store, Duration::from_secs(60));

    handler
        .process("u1", &url, dados(json!({"id": "abc", "a": 1})), None)
        .await
        .unwrap();

    let bodies = upstream_bodies(&server).await;
    assert_eq!(bodies[0], json!({"id": "abc", "a": 1}));

    let stored = store
        .load(&composite_key("u1", &url))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Value::Object(stored.dados), json!({"a": 1}));
}

#[tokio::test]
async fn entries_are_isolated_per_namespace_and_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url_a = format!("{}/a", server.uri());
    let url_b = format!("{}/b", server.uri());
    let store = Arc::new(MemoryStore::new());
    let handler = handler(&store, Duration::from_secs(60));

    handler
        .process("u1", &url_a, dados(json!({"a": 1})), None)
        .await
        .unwrap();
    handler
        .process("u1", &url_b, dados(json!({"b": 2})), None)
        .await
        .unwrap();

    let bodies = upstream_bodies(&server).await;
    assert_eq!(bodies[1], json!({"b": 2}), "different URL, different key");
}

#[tokio::test]
async fn upstream_rejection_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let url = format!("{}/api", server.uri());
    let store = Arc::new(MemoryStore::new());
    let handler = handler(&store, Duration::from_secs(60));

    let err = handler
        .process("u1", &url, dados(json!({"a": 1})), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::UpstreamRejected { status: 503 }
    ));
}
