//! Atomic group uploads
//!
//! A group is a fixed set of named items that becomes visible all at once.
//! The flow is:
//!
//! 1. [`AtomicOrchestrator::initialise_group`] registers the names with the
//!    node and receives the group key.
//! 2. [`AtomicOrchestrator::upload_group`] uploads every item to object
//!    storage through a bounded pool, tagging each object with the group key
//!    and its name. Failed items are collected, not fatal.
//! 3. [`AtomicOrchestrator::finish_group`] asks the node to finalize. The node
//!    rejects finalization while any registered name is missing.
//!
//! Sequencing between the three steps is up to the caller.

use crate::metrics;
use crate::node::{NodeClient, NodeError};
use crate::retry::{retry, RetryPolicy};
use crate::s3::{ObjectBody, ObjectStore, ObjectStoreError};
use crate::upload::{UploadError, UploadOptions, Uploader};
use futures::{stream, StreamExt};
use serde::{Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

pub mod manifest;

pub use manifest::{Manifest, MANIFEST_CONTENT_TYPE};

/// Metadata key carrying the item name
pub const ATOMIC_NAME_METADATA: &str = "atomic-name";

/// Metadata key carrying the group key
pub const ATOMIC_UPLOAD_ID_METADATA: &str = "atomic-upload-id";

/// Default number of simultaneous item uploads
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Atomic group errors
#[derive(Error, Debug)]
pub enum AtomicError {
    #[error("concurrency must be >=1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("Duplicate item name in atomic group: {0}")]
    DuplicateName(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Manifest upload failed: {source}")]
    Manifest {
        #[source]
        source: UploadError,
        /// Item outcomes gathered before the manifest failed
        results: Box<PoolResult>,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One named item of a group
#[derive(Debug)]
pub struct AtomicItem {
    pub name: String,
    pub data: ObjectBody,
    /// Extra object metadata; overrides the group tags on conflict
    pub metadata: HashMap<String, String>,
}

impl AtomicItem {
    pub fn new(name: impl Into<String>, data: impl Into<ObjectBody>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Client-observed lifecycle of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupState {
    Registered,
    /// Every required name has been uploaded at least once
    AllItemsAcknowledged,
    FinalizeRequested,
    Finalized,
    FinalizeRejected,
}

/// A registered atomic group
#[derive(Debug, Clone)]
pub struct AtomicGroup {
    key: String,
    required_names: BTreeSet<String>,
    uploaded_names: BTreeSet<String>,
    /// False for groups whose required names were never seen by this client
    names_known: bool,
    state: GroupState,
}

impl AtomicGroup {
    pub fn new(key: impl Into<String>, names: &[String]) -> Self {
        Self {
            key: key.into(),
            required_names: names.iter().cloned().collect(),
            uploaded_names: BTreeSet::new(),
            names_known: true,
            state: GroupState::Registered,
        }
    }

    /// A group registered elsewhere
    ///
    /// Its required names are unknown here, so uploads never move it past
    /// `Registered` and [`missing`](Self::missing) is always empty. Only the
    /// node can tell whether it is complete.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            names_known: false,
            ..Self::new(key, &[])
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn uploaded_names(&self) -> &BTreeSet<String> {
        &self.uploaded_names
    }

    /// Required names not uploaded yet
    pub fn missing(&self) -> Vec<String> {
        self.required_names
            .difference(&self.uploaded_names)
            .cloned()
            .collect()
    }

    fn record_uploaded(&mut self, name: &str) {
        self.uploaded_names.insert(name.to_string());
        if self.names_known && self.state == GroupState::Registered && self.missing().is_empty() {
            self.state = GroupState::AllItemsAcknowledged;
        }
    }
}

/// A successfully stored item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtomicItemReceipt {
    pub name: String,
    pub id: String,
}

/// An item that could not be stored
#[derive(Debug, Serialize)]
pub struct AtomicItemFailure {
    pub name: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: ObjectStoreError,
}

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Outcome of a group upload
#[derive(Debug, Default, Serialize)]
pub struct PoolResult {
    pub results: Vec<AtomicItemReceipt>,
    pub errors: Vec<AtomicItemFailure>,
    /// Transaction id of the generated manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// Uploads atomic groups
#[derive(Clone)]
pub struct AtomicOrchestrator {
    uploader: Uploader,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl std::fmt::Debug for AtomicOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOrchestrator")
            .field("node", &self.uploader.node().base_url())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl AtomicOrchestrator {
    /// Create an orchestrator; `concurrency` bounds simultaneous item uploads
    pub fn new(
        uploader: Uploader,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Result<Self, AtomicError> {
        if concurrency < 1 {
            return Err(AtomicError::InvalidConcurrency(concurrency));
        }
        Ok(Self {
            uploader,
            store,
            retry,
            concurrency,
        })
    }

    fn node(&self) -> &NodeClient {
        self.uploader.node()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Register `names` with the node and return the new group
    pub async fn initialise_group(&self, names: &[String]) -> Result<AtomicGroup, AtomicError> {
        check_unique(names.iter().map(String::as_str))?;

        let key = self.node().create_atomic(names).await?;
        tracing::info!(key = %key, names = names.len(), "Atomic group registered");
        Ok(AtomicGroup::new(key, names))
    }

    /// Upload `items` under `group`, optionally followed by a manifest
    ///
    /// Up to `concurrency` items are in flight at any time. Items whose upload
    /// fails after retries are returned in [`PoolResult::errors`]; the other
    /// items keep going.
    #[tracing::instrument(
        name = "atomic.upload_group",
        skip(self, items, group),
        fields(atomic.key = %group.key(), atomic.items = items.len()),
        err
    )]
    pub async fn upload_group(
        &self,
        items: Vec<AtomicItem>,
        group: &mut AtomicGroup,
        gen_manifest: bool,
    ) -> Result<PoolResult, AtomicError> {
        check_unique(items.iter().map(|item| item.name.as_str()))?;

        let key = group.key().to_string();
        let outcomes: Vec<(String, Result<String, ObjectStoreError>)> = stream::iter(items)
            .map(|item| self.upload_item(item, &key))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut pool = PoolResult::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(id) => {
                    group.record_uploaded(&name);
                    pool.results.push(AtomicItemReceipt { name, id });
                }
                Err(error) => pool.errors.push(AtomicItemFailure { name, error }),
            }
        }

        if pool.errors.is_empty() {
            tracing::info!(uploaded = pool.results.len(), "Atomic group items uploaded");
        } else {
            tracing::warn!(
                uploaded = pool.results.len(),
                failed = pool.errors.len(),
                "Some atomic group items failed"
            );
        }

        if !gen_manifest {
            return Ok(pool);
        }

        let document = Manifest::from_receipts(&pool.results).to_json()?;
        let options = UploadOptions::default().with_content_type(MANIFEST_CONTENT_TYPE);
        match self.uploader.upload_bytes(document, &options).await {
            Ok(response) => {
                tracing::info!(manifest = %response.tx_id, "Manifest uploaded");
                pool.manifest = Some(response.tx_id);
                Ok(pool)
            }
            Err(source) => Err(AtomicError::Manifest {
                source,
                results: Box::new(pool),
            }),
        }
    }

    /// Ask the node to finalize the group
    ///
    /// The request is always sent; the node decides whether the group is
    /// complete.
    pub async fn finish_group(&self, group: &mut AtomicGroup) -> Result<(), AtomicError> {
        let missing = group.missing();
        if !missing.is_empty() {
            tracing::warn!(
                key = %group.key(),
                missing = ?missing,
                "Finalizing atomic group with items not uploaded by this client"
            );
        }

        group.state = GroupState::FinalizeRequested;
        match self.node().finish_atomic(group.key()).await {
            Ok(()) => {
                group.state = GroupState::Finalized;
                tracing::info!(key = %group.key(), "Atomic group finalized");
                Ok(())
            }
            Err(e) => {
                group.state = GroupState::FinalizeRejected;
                tracing::error!(key = %group.key(), error = %e, "Atomic group finalization rejected");
                Err(e.into())
            }
        }
    }

    #[tracing::instrument(
        name = "atomic.upload_item",
        skip(self, item, key),
        fields(atomic.name = %item.name)
    )]
    async fn upload_item(
        &self,
        item: AtomicItem,
        key: &str,
    ) -> (String, Result<String, ObjectStoreError>) {
        let mut metadata = HashMap::from([
            (ATOMIC_NAME_METADATA.to_string(), item.name.clone()),
            (ATOMIC_UPLOAD_ID_METADATA.to_string(), key.to_string()),
        ]);
        metadata.extend(item.metadata);

        let store = self.store.as_ref();
        let name = item.name.as_str();
        let data = item.data;

        // One-shot readers get a single attempt
        let outcome = if data.is_replayable() {
            retry(&self.retry, "atomic_item", |_| {
                let body = data.replay();
                let metadata = metadata.clone();
                async move {
                    match body {
                        Some(body) => store.upload(name, body, metadata).await,
                        None => Err(ObjectStoreError::ConfigError(format!(
                            "body of {} cannot be replayed",
                            name
                        ))),
                    }
                }
            })
            .await
        } else {
            store.upload(name, data, metadata).await
        };

        metrics::record_atomic_item(outcome.is_ok());
        match &outcome {
            Ok(id) => tracing::debug!(id = %id, "Item stored"),
            Err(e) => tracing::error!(error = %e, "Item upload failed"),
        }
        (item.name, outcome)
    }
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), AtomicError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(AtomicError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}
