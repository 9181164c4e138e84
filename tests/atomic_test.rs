//! Atomic Group Tests
//!
//! Group registration, pooled item uploads, manifests and finalization
//! against a mock node and an in-memory object store.

mod common;

use common::{test_config, MemoryStore};
use preweave_uploadr::atomic::{
    AtomicError, AtomicItem, GroupState, ATOMIC_NAME_METADATA, ATOMIC_UPLOAD_ID_METADATA,
    MANIFEST_CONTENT_TYPE,
};
use preweave_uploadr::node::NodeError;
use preweave_uploadr::s3::ObjectBody;
use preweave_uploadr::{ClientError, Config, Preweave};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn atomic_config(server: &MockServer) -> Config {
    let mut config = test_config(&server.uri());
    // Manifests go through a single request
    config.upload.direct_threshold = 1024 * 1024;
    config
}

fn client(server: &MockServer, store: Arc<MemoryStore>) -> Preweave {
    Preweave::with_object_store(atomic_config(server), store).unwrap()
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

async fn mount_create(server: &MockServer, names: &[&str], key_body: &str) {
    Mock::given(method("POST"))
        .and(path("/atomic/create"))
        .and(body_json(names))
        .respond_with(ResponseTemplate::new(200).set_body_string(key_body))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_finish(server: &MockServer, key: &str, status: u16, body: &str) {
    Mock::given(method("POST"))
        .and(path("/atomic/finish"))
        .and(body_json(serde_json::json!({ "key": key })))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_upload_atomic_dir_with_manifest() {
    let server = MockServer::start().await;
    mount_create(&server, &["index.html", "css/site.css"], "group-key").await;

    Mock::given(method("POST"))
        .and(path("/data"))
        .and(header("content-type", MANIFEST_CONTENT_TYPE))
        .and(body_json(serde_json::json!({
            "manifest": "arweave/paths",
            "version": "0.1.0",
            "paths": {
                "index.html": { "id": "\"etag-index.html\"" },
                "css/site.css": { "id": "\"etag-css/site.css\"" }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "txId": "manifest-tx" })))
        .expect(1)
        .mount(&server)
        .await;

    mount_finish(&server, "group-key", 200, "").await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("css")).unwrap();
    std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
    std::fs::write(dir.path().join("css/site.css"), "body {}").unwrap();

    let store = Arc::new(MemoryStore::default());
    let pool = client(&server, store.clone())
        .upload_atomic_dir(dir.path(), true)
        .await
        .unwrap();

    assert_eq!(pool.results.len(), 2);
    assert!(pool.errors.is_empty());
    assert_eq!(pool.manifest.as_deref(), Some("manifest-tx"));

    let index = store.object("index.html").unwrap();
    assert_eq!(index.data, b"<html></html>");
    assert_eq!(index.metadata[ATOMIC_NAME_METADATA], "index.html");
    assert_eq!(index.metadata[ATOMIC_UPLOAD_ID_METADATA], "group-key");
    assert_eq!(index.metadata["content-type"], "text/html");

    let script = store.object("css/site.css").unwrap();
    assert_eq!(script.metadata["content-type"], "text/css");
}

#[tokio::test]
async fn test_quoted_group_key_is_unwrapped() {
    let server = MockServer::start().await;
    mount_create(&server, &["a"], "\"quoted-key\"").await;
    mount_finish(&server, "quoted-key", 200, "").await;

    let client = client(&server, Arc::new(MemoryStore::default()));
    let mut group = client.initialise_atomic_upload(&strings(&["a"])).await.unwrap();
    assert_eq!(group.key(), "quoted-key");

    client
        .atomic_upload(vec![AtomicItem::new("a", "data")], &mut group, false)
        .await
        .unwrap();
    client.finish_atomic_upload(&mut group).await.unwrap();
    assert_eq!(group.state(), GroupState::Finalized);
}

#[tokio::test]
async fn test_two_item_group_finalizes() {
    let server = MockServer::start().await;
    mount_create(&server, &["x", "y"], "k-xy").await;
    mount_finish(&server, "k-xy", 200, "").await;

    let store = Arc::new(MemoryStore::default());
    let client = client(&server, store.clone());

    let mut group = client
        .initialise_atomic_upload(&strings(&["x", "y"]))
        .await
        .unwrap();
    assert_eq!(group.state(), GroupState::Registered);

    let pool = client
        .atomic_upload(
            vec![AtomicItem::new("x", "x body"), AtomicItem::new("y", "y body")],
            &mut group,
            false,
        )
        .await
        .unwrap();

    assert_eq!(pool.results.len(), 2);
    assert!(pool.errors.is_empty());
    assert!(group.missing().is_empty());
    assert_eq!(group.state(), GroupState::AllItemsAcknowledged);
    assert_eq!(store.object("y").unwrap().metadata[ATOMIC_UPLOAD_ID_METADATA], "k-xy");

    client.finish_atomic_upload(&mut group).await.unwrap();
    assert_eq!(group.state(), GroupState::Finalized);
}

#[tokio::test]
async fn test_finish_rejected_when_item_missing() {
    let server = MockServer::start().await;
    mount_create(&server, &["x", "y"], "k-xy").await;
    mount_finish(&server, "k-xy", 400, "missing items: y").await;

    let store = Arc::new(MemoryStore::failing(&["y"]));
    let client = client(&server, store.clone());

    let mut group = client
        .initialise_atomic_upload(&strings(&["x", "y"]))
        .await
        .unwrap();
    let pool = client
        .atomic_upload(
            vec![AtomicItem::new("x", "x body"), AtomicItem::new("y", "y body")],
            &mut group,
            false,
        )
        .await
        .unwrap();

    assert_eq!(pool.results.len(), 1);
    assert_eq!(pool.errors.len(), 1);
    assert_eq!(pool.errors[0].name, "y");
    assert_eq!(store.attempts("y"), 4);
    assert_eq!(group.missing(), strings(&["y"]));

    let err = client.finish_atomic_upload(&mut group).await.unwrap_err();
    match err {
        ClientError::Atomic(AtomicError::Node(NodeError::Status { status, detail, .. })) => {
            assert_eq!(status, 400);
            assert_eq!(detail, "missing items: y");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(group.state(), GroupState::FinalizeRejected);
}

#[tokio::test]
async fn test_pool_keeps_width_in_flight() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(10)));
    let client = client(&server, store.clone());

    let items: Vec<AtomicItem> = (0..30)
        .map(|i| AtomicItem::new(format!("file-{:02}", i), vec![i as u8; 16]))
        .collect();
    let names: Vec<String> = items.iter().map(|item| item.name.clone()).collect();
    let mut group = preweave_uploadr::atomic::AtomicGroup::new("local", &names);

    let pool = client.atomic_upload(items, &mut group, false).await.unwrap();

    assert_eq!(pool.results.len(), 30);
    assert_eq!(store.max_in_flight(), 10);
    assert_eq!(group.state(), GroupState::AllItemsAcknowledged);
}

#[tokio::test]
async fn test_configured_pool_width() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(10)));
    let mut config = atomic_config(&server);
    config.atomic.concurrency = 3;
    let client = Preweave::with_object_store(config, store.clone()).unwrap();

    let items: Vec<AtomicItem> = (0..9)
        .map(|i| AtomicItem::new(format!("f{}", i), ObjectBody::from(format!("body {}", i))))
        .collect();
    let mut group = preweave_uploadr::atomic::AtomicGroup::from_key("local");

    client.atomic_upload(items, &mut group, false).await.unwrap();
    assert_eq!(store.max_in_flight(), 3);
}

#[tokio::test]
async fn test_manifest_failure_keeps_item_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(MemoryStore::default()));
    let mut group = preweave_uploadr::atomic::AtomicGroup::from_key("k");

    let err = client
        .atomic_upload(vec![AtomicItem::new("only", "data")], &mut group, true)
        .await
        .unwrap_err();

    match err {
        ClientError::Atomic(AtomicError::Manifest { results, .. }) => {
            assert_eq!(results.results.len(), 1);
            assert!(results.manifest.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_registration_rejection_uploads_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/atomic/create"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad api key"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();

    let store = Arc::new(MemoryStore::default());
    let err = client(&server, store.clone())
        .upload_atomic_dir(dir.path(), false)
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "HTTP Error: Initialising atomic upload: 401 bad api key"
    );
    assert_eq!(store.attempts("a.txt"), 0);
}
