//! Preweave client
//!
//! [`Preweave`] ties the node client, the size-dispatching uploader and the
//! atomic orchestrator together behind one explicitly constructed value.
//!
//! # Example
//!
//! ```no_run
//! use preweave_uploadr::{Config, Preweave};
//! use preweave_uploadr::upload::UploadOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Preweave::new(Config::new("http://localhost:8080", Some("api-key".into())))?;
//!
//! let response = client.upload("Hello, World!", &UploadOptions::default()).await?;
//! client.make_txs_permanent(&[response.tx_id]).await?;
//!
//! let pool = client.upload_atomic_dir("./site", true).await?;
//! println!("manifest: {:?}", pool.manifest);
//! # Ok(())
//! # }
//! ```

use crate::atomic::{AtomicError, AtomicGroup, AtomicItem, AtomicOrchestrator, PoolResult};
use crate::config::{Config, ConfigError};
use crate::node::{NodeClient, NodeError, TxAction, TxStatus};
use crate::s3::{ObjectBody, ObjectStore, ObjectStoreError, S3ClientConfig, S3ObjectStore, CONTENT_TYPE_METADATA};
use crate::upload::{UploadError, UploadOptions, UploadResponse, Uploader};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use walkdir::WalkDir;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Atomic(#[from] AtomicError),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Directory contains no files: {}", .0.display())]
    EmptyDirectory(PathBuf),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Client for a Preweave node
#[derive(Debug, Clone)]
pub struct Preweave {
    config: Config,
    uploader: Uploader,
    atomic: AtomicOrchestrator,
}

impl Preweave {
    /// Create a client using the node's S3-compatible endpoint for atomic items
    pub fn new(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let uploader = Uploader::from_config(&config)?;
        let store = S3ObjectStore::new(S3ClientConfig::new(
            uploader.node().s3_endpoint(),
            &config.s3,
            &config.atomic,
        ))?;
        Self::build(config, uploader, Arc::new(store))
    }

    /// Create a client with a caller-provided object store
    pub fn with_object_store(
        config: Config,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let uploader = Uploader::from_config(&config)?;
        Self::build(config, uploader, store)
    }

    fn build(
        config: Config,
        uploader: Uploader,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ClientError> {
        let atomic = AtomicOrchestrator::new(
            uploader.clone(),
            store,
            config.retry.clone(),
            config.atomic.concurrency,
        )?;
        Ok(Self {
            config,
            uploader,
            atomic,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node(&self) -> &NodeClient {
        self.uploader.node()
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn atomic(&self) -> &AtomicOrchestrator {
        &self.atomic
    }

    /// Upload in-memory data; strings are sent as UTF-8
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        options: &UploadOptions,
    ) -> Result<UploadResponse, ClientError> {
        Ok(self.uploader.upload_bytes(data, options).await?)
    }

    /// Upload a file; the content type is detected unless given in `options`
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> Result<UploadResponse, ClientError> {
        Ok(self.uploader.upload_file(path, options).await?)
    }

    /// Upload `size` bytes from a reader
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResponse, ClientError>
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
    {
        Ok(self.uploader.upload_reader(reader, size, options).await?)
    }

    pub async fn make_txs_permanent(
        &self,
        tx_ids: &[String],
    ) -> Result<HashMap<String, TxStatus>, ClientError> {
        Ok(self.node().tx_action(TxAction::Confirm, tx_ids).await?)
    }

    pub async fn hide_txs(&self, tx_ids: &[String]) -> Result<HashMap<String, TxStatus>, ClientError> {
        Ok(self.node().tx_action(TxAction::Hide, tx_ids).await?)
    }

    pub async fn unhide_txs(
        &self,
        tx_ids: &[String],
    ) -> Result<HashMap<String, TxStatus>, ClientError> {
        Ok(self.node().tx_action(TxAction::Unhide, tx_ids).await?)
    }

    pub async fn remove_txs(
        &self,
        tx_ids: &[String],
    ) -> Result<HashMap<String, TxStatus>, ClientError> {
        Ok(self.node().tx_action(TxAction::Remove, tx_ids).await?)
    }

    /// Register a new atomic group for `names`
    pub async fn initialise_atomic_upload(&self, names: &[String]) -> Result<AtomicGroup, ClientError> {
        Ok(self.atomic.initialise_group(names).await?)
    }

    /// Upload items into a registered group
    pub async fn atomic_upload(
        &self,
        items: Vec<AtomicItem>,
        group: &mut AtomicGroup,
        gen_manifest: bool,
    ) -> Result<PoolResult, ClientError> {
        Ok(self.atomic.upload_group(items, group, gen_manifest).await?)
    }

    /// Finalize a group; fails if the node still misses items
    pub async fn finish_atomic_upload(&self, group: &mut AtomicGroup) -> Result<(), ClientError> {
        Ok(self.atomic.finish_group(group).await?)
    }

    /// Upload every file under `dir` as one atomic group
    ///
    /// Item names are paths relative to `dir` with `/` separators. The group
    /// is finalized after the upload even when some items failed, so the node
    /// reports the incomplete group.
    #[tracing::instrument(
        name = "client.upload_atomic_dir",
        skip(self, dir),
        fields(dir = %dir.as_ref().display()),
        err
    )]
    pub async fn upload_atomic_dir(
        &self,
        dir: impl AsRef<Path>,
        gen_manifest: bool,
    ) -> Result<PoolResult, ClientError> {
        let root = dir.as_ref().to_path_buf();
        let files = tokio::task::spawn_blocking({
            let root = root.clone();
            move || collect_files(&root)
        })
        .await
        .map_err(|e| ClientError::TaskFailed(e.to_string()))??;

        if files.is_empty() {
            return Err(ClientError::EmptyDirectory(root));
        }

        let items: Vec<AtomicItem> = files
            .into_iter()
            .map(|(name, path)| {
                let content_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
                AtomicItem::new(name, ObjectBody::File(path))
                    .with_metadata(CONTENT_TYPE_METADATA, content_type)
            })
            .collect();
        let names: Vec<String> = items.iter().map(|item| item.name.clone()).collect();

        let mut group = self.initialise_atomic_upload(&names).await?;
        let pool = self.atomic_upload(items, &mut group, gen_manifest).await?;
        self.finish_atomic_upload(&mut group).await?;
        Ok(pool)
    }
}

/// Regular files under `root`, as (relative name, path), sorted by name
fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>, ClientError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push((item_name(relative), entry.into_path()));
    }
    Ok(files)
}

fn item_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
