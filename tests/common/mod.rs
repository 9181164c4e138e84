//! Shared test infrastructure
//!
//! - Configuration helpers with small sizes and millisecond backoff
//! - An in-memory object store that records what it receives

#![allow(dead_code)]

use async_trait::async_trait;
use preweave_uploadr::config::Config;
use preweave_uploadr::retry::RetryPolicy;
use preweave_uploadr::s3::{ObjectBody, ObjectStore, ObjectStoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const API_KEY: &str = "test-api-key";

/// Retry policy with the default attempt budget and millisecond delays
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        retries: 3,
        min_timeout_ms: 1,
        max_timeout_ms: 5,
        factor: 2.0,
    }
}

/// Configuration for a mock node with tiny chunks
pub fn test_config(url: &str) -> Config {
    let mut config = Config::new(url, Some(API_KEY.to_string()));
    config.retry = fast_retry();
    config.upload.direct_threshold = 8;
    config.upload.chunk_size = 4;
    config.upload.batch_size = 2;
    config
}

/// A stored object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryStore {
    pub objects: Mutex<HashMap<String, StoredObject>>,
    pub attempts: Mutex<HashMap<String, usize>>,
    /// Keys that always fail
    pub failing: BTreeSet<String>,
    pub delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn attempts(&self, key: &str) -> usize {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload(
        &self,
        key: &str,
        data: ObjectBody,
        metadata: HashMap<String, String>,
    ) -> Result<String, ObjectStoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;

        tokio::time::sleep(self.delay).await;
        let mut bytes = Vec::new();
        let read = match data.into_reader().await {
            Ok(mut reader) => reader.read_to_end(&mut bytes).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        read?;

        if self.failing.contains(key) {
            return Err(ObjectStoreError::ResponseError(format!(
                "{} rejected by store",
                key
            )));
        }

        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: bytes,
                metadata,
            },
        );
        Ok(format!("\"etag-{}\"", key))
    }
}
