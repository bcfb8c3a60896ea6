//! Flow serializer tests: lease exclusivity, retry and failure logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rsaccum_server::{FlowConfig, FlowProcessor, ServerError};
use rsaccum_storage::{LockStore, MemoryStore};

fn body(fields: Value) -> Map<String, Value> {
    fields.as_object().cloned().unwrap()
}

fn fast_config() -> FlowConfig {
    FlowConfig {
        wait_budget: Duration::from_secs(10),
        lock_ttl: Duration::from_secs(10),
        poll_interval: Duration::from_millis(100),
    }
}

fn processor(
    store: &Arc<MemoryStore>,
    config: FlowConfig,
) -> FlowProcessor<MemoryStore, MemoryStore> {
    FlowProcessor::new(Arc::clone(store), Arc::clone(store), config)
}

#[tokio::test]
async fn returns_the_decoded_upstream_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = processor(&store, fast_config());

    let response = processor
        .run("u1", body(json!({"question": "?"})), &format!("{}/flow", server.uri()))
        .await
        .unwrap();
    assert_eq!(response, json!({"answer": 42}));

    // Lease is released on the way out.
    assert!(store
        .try_lock("u1", Duration::from_secs(1))
        .await
        .unwrap());
}

#[tokio::test]
async fn concurrent_runs_for_one_namespace_never_overlap() {
    let server = MockServer::start().await;
    let delay = Duration::from_millis(500);
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(delay),
        )
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(processor(&store, fast_config()));
    let url = format!("{}/flow", server.uri());

    let started = Instant::now();
    let first = {
        let processor = Arc::clone(&processor);
        let url = url.clone();
        tokio::spawn(async move { processor.run("u1", body(json!({"n": 1})), &url).await })
    };
    let second = {
        let processor = Arc::clone(&processor);
        let url = url.clone();
        tokio::spawn(async move { processor.run("u1", body(json!({"n": 2})), &url).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Two serialized calls take at least twice the downstream latency; an
    // overlap would finish in about one.
    assert!(
        started.elapsed() >= delay * 2,
        "calls overlapped: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn different_namespaces_run_in_parallel() {
    let server = MockServer::start().await;
    let delay = Duration::from_millis(500);
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(delay),
        )
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(processor(&store, fast_config()));
    let url = format!("{}/flow", server.uri());

    let started = Instant::now();
    let first = {
        let processor = Arc::clone(&processor);
        let url = url.clone();
        tokio::spawn(async move { processor.run("u1", body(json!({})), &url).await })
    };
    let second = {
        let processor = Arc::clone(&processor);
        let url = url.clone();
        tokio::spawn(async move { processor.run("u2", body(json!({})), &url).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(
        started.elapsed() < delay * 2,
        "independent namespaces were serialized: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn one_retry_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = processor(&store, fast_config());

    let response = processor
        .run("u1", body(json!({})), &format!("{}/flow", server.uri()))
        .await
        .unwrap();
    assert_eq!(response, json!({"ok": true}));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert!(store.failed_requests().is_empty());
}

#[tokio::test]
async fn second_failure_lands_in_the_failure_log() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = processor(&store, fast_config());

    let err = processor
        .run(
            "u1",
            body(json!({"question": "?"})),
            &format!("{}/flow", server.uri()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::UpstreamRejected { status: 500 }));

    let logs = store.failed_requests();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].user_ns, "u1");
    assert_eq!(logs[0].request["question"], json!("?"));

    // The lease is free again despite the failure.
    assert!(store
        .try_lock("u1", Duration::from_secs(1))
        .await
        .unwrap());
}

#[tokio::test]
async fn gives_up_when_the_lease_never_frees() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    // Another holder keeps the lease for longer than the wait budget.
    assert!(store
        .try_lock("u1", Duration::from_secs(60))
        .await
        .unwrap());

    let processor = processor(
        &store,
        FlowConfig {
            wait_budget: Duration::from_millis(350),
            lock_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        },
    );

    let err = processor
        .run("u1", body(json!({})), &format!("{}/flow", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::LockTimeout { .. }));
}

#[tokio::test]
async fn transform_is_applied_before_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let processor = processor(&store, fast_config()).with_transform(Box::new(|mut body| {
        body.insert("stamped".to_string(), json!(true));
        body
    }));

    processor
        .run("u1", body(json!({"n": 1})), &format!("{}/flow", server.uri()))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent: Value = requests[0].body_json().unwrap();
    assert_eq!(sent, json!({"n": 1, "stamped": true}));
}
