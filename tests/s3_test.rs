//! Object Store Tests
//!
//! `S3ObjectStore` against a mock S3-compatible endpoint: single PutObject,
//! multipart uploads and aborts, and the endpoint the client derives from the
//! node URL.

mod common;

use common::test_config;
use preweave_uploadr::atomic::{AtomicGroup, AtomicItem};
use preweave_uploadr::config::{AtomicConfig, S3Config};
use preweave_uploadr::s3::{ObjectStore, ObjectStoreError, S3ClientConfig, S3ObjectStore};
use preweave_uploadr::Preweave;
use std::collections::HashMap;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUCKET_PATH: &str = "/S3/preweave-txs";

fn store(server: &MockServer, part_size: usize) -> S3ObjectStore {
    let s3 = S3Config {
        max_attempts: 1,
        ..S3Config::default()
    };
    let mut config = S3ClientConfig::new(format!("{}/S3", server.uri()), &s3, &AtomicConfig::default());
    config.part_size = part_size;
    S3ObjectStore::new(config).unwrap()
}

fn group_metadata(name: &str) -> HashMap<String, String> {
    HashMap::from([
        ("atomic-name".to_string(), name.to_string()),
        ("atomic-upload-id".to_string(), "group-key".to_string()),
    ])
}

async fn mount_create(server: &MockServer, key: &str, upload_id: &str) {
    Mock::given(method("POST"))
        .and(path(format!("{}/{}", BUCKET_PATH, key)))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <InitiateMultipartUploadResult>
                <Bucket>preweave-txs</Bucket>
                <Key>{}</Key>
                <UploadId>{}</UploadId>
            </InitiateMultipartUploadResult>"#,
            key, upload_id
        )))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_part(server: &MockServer, key: &str, upload_id: &str, part: u32, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).insert_header("ETag", format!("\"etag-part-{}\"", part).as_str())
    } else {
        ResponseTemplate::new(status).set_body_string(
            "<Error><Code>InvalidRequest</Code><Message>part rejected</Message></Error>",
        )
    };
    Mock::given(method("PUT"))
        .and(path(format!("{}/{}", BUCKET_PATH, key)))
        .and(query_param("uploadId", upload_id))
        .and(query_param("partNumber", part.to_string().as_str()))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_small_body_uses_single_put_under_bucket_path() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("{}/index.html", BUCKET_PATH)))
        .and(header("x-amz-meta-atomic-name", "index.html"))
        .and(header("x-amz-meta-atomic-upload-id", "group-key"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"small-etag\""))
        .expect(1)
        .mount(&server)
        .await;

    let id = store(&server, 1024)
        .upload("index.html", "<html></html>".into(), group_metadata("index.html"))
        .await
        .unwrap();

    assert_eq!(id, "\"small-etag\"");
}

#[tokio::test]
async fn test_large_body_uses_multipart_upload() {
    let server = MockServer::start().await;
    mount_create(&server, "big.bin", "up-1").await;
    for part in 1..=3 {
        mount_part(&server, "big.bin", "up-1", part, 200).await;
    }

    Mock::given(method("POST"))
        .and(path(format!("{}/big.bin", BUCKET_PATH)))
        .and(query_param("uploadId", "up-1"))
        .and(body_string_contains("<PartNumber>3</PartNumber>"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <CompleteMultipartUploadResult>
                <Bucket>preweave-txs</Bucket>
                <Key>big.bin</Key>
                <ETag>"final-etag"</ETag>
            </CompleteMultipartUploadResult>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    // 10 bytes in 4-byte parts: 4 + 4 + 2
    let id = store(&server, 4)
        .upload("big.bin", "0123456789".into(), group_metadata("big.bin"))
        .await
        .unwrap();
    assert_eq!(id, "\"final-etag\"");

    let mut parts: Vec<(String, Vec<u8>)> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() == "PUT")
        .filter_map(|request| {
            let part = request
                .url
                .query_pairs()
                .find(|(name, _)| name == "partNumber")?
                .1
                .into_owned();
            Some((part, request.body))
        })
        .collect();
    parts.sort();

    let numbers: Vec<&str> = parts.iter().map(|(part, _)| part.as_str()).collect();
    assert_eq!(numbers, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_failed_part_aborts_multipart_upload() {
    let server = MockServer::start().await;
    mount_create(&server, "broken.bin", "up-2").await;
    mount_part(&server, "broken.bin", "up-2", 1, 200).await;
    mount_part(&server, "broken.bin", "up-2", 2, 400).await;
    mount_part(&server, "broken.bin", "up-2", 3, 200).await;

    Mock::given(method("DELETE"))
        .and(path(format!("{}/broken.bin", BUCKET_PATH)))
        .and(query_param("uploadId", "up-2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{}/broken.bin", BUCKET_PATH)))
        .and(query_param("uploadId", "up-2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = store(&server, 4)
        .upload("broken.bin", "0123456789".into(), group_metadata("broken.bin"))
        .await
        .unwrap_err();

    match err {
        ObjectStoreError::RequestError { operation, .. } => assert_eq!(operation, "UploadPart"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_client_stores_items_under_node_s3_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("{}/a.txt", BUCKET_PATH)))
        .and(header("x-amz-meta-atomic-name", "a.txt"))
        .and(header("x-amz-meta-atomic-upload-id", "node-group"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-a\""))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&server.uri());
    config.s3.max_attempts = 1;
    let client = Preweave::new(config).unwrap();

    let mut group = AtomicGroup::from_key("node-group");
    let pool = client
        .atomic_upload(vec![AtomicItem::new("a.txt", "a")], &mut group, false)
        .await
        .unwrap();

    assert!(pool.errors.is_empty());
    assert_eq!(pool.results.len(), 1);
    assert_eq!(pool.results[0].id, "\"etag-a\"");
}
