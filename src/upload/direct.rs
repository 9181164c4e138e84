//! Direct and size-dispatched uploads
//!
//! Payloads below the direct threshold are sent in one `POST /data`; larger
//! ones go through [`ChunkedUploader`].
//!
//! # Example
//!
//! ```no_run
//! use preweave_uploadr::config::Config;
//! use preweave_uploadr::upload::{Uploader, UploadOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("http://localhost:8080", Some("api-key".into()));
//! let uploader = Uploader::from_config(&config)?;
//!
//! let options = UploadOptions::default().with_content_type("text/plain");
//! let response = uploader.upload_bytes("Hello, World!", &options).await?;
//! println!("txId: {}", response.tx_id);
//! # Ok(())
//! # }
//! ```

use super::chunked::{ChunkedOptions, ChunkedUploader};
use super::chunker::Chunker;
use super::{UploadError, UploadOptions, UploadResponse, DEFAULT_CONTENT_TYPE};
use crate::config::{Config, UploadConfig};
use crate::metrics;
use crate::node::{NodeClient, NodeError};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use futures::TryStreamExt;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncRead;

/// Frame size used when streaming a direct upload body
const BODY_FRAME_SIZE: usize = 64 * 1024;

/// Size-dispatching uploader
#[derive(Debug, Clone)]
pub struct Uploader {
    node: NodeClient,
    settings: UploadConfig,
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(node: NodeClient, settings: UploadConfig, retry: RetryPolicy) -> Self {
        Self {
            node,
            settings,
            retry,
        }
    }

    /// Build an uploader with its own node client
    pub fn from_config(config: &Config) -> Result<Self, NodeError> {
        Ok(Self::new(
            NodeClient::new(config.node_client_config())?,
            config.upload.clone(),
            config.retry.clone(),
        ))
    }

    pub fn node(&self) -> &NodeClient {
        &self.node
    }

    pub fn settings(&self) -> &UploadConfig {
        &self.settings
    }

    /// Whether a payload of `size` bytes goes through a single request
    pub fn is_direct(&self, size: u64) -> bool {
        size < self.settings.direct_threshold
    }

    fn chunked_options(&self, content_type: &str, options: &UploadOptions) -> ChunkedOptions {
        ChunkedOptions {
            chunk_size: self.settings.chunk_size,
            batch_size: self.settings.batch_size,
            content_type: content_type.to_string(),
            soak_period: options.soak_period,
        }
    }

    /// Upload an in-memory payload; strings are sent as UTF-8
    pub async fn upload_bytes(
        &self,
        data: impl Into<Bytes>,
        options: &UploadOptions,
    ) -> Result<UploadResponse, UploadError> {
        let data: Bytes = data.into();
        let size = data.len() as u64;

        if self.is_direct(size) {
            self.post_direct(data, size, options.content_type_or(DEFAULT_CONTENT_TYPE), options)
                .await
        } else {
            let content_type = options.content_type_or(DEFAULT_CONTENT_TYPE);
            ChunkedUploader::new(self.node.clone(), self.retry.clone())
                .upload_large(
                    std::io::Cursor::new(data),
                    size,
                    &self.chunked_options(content_type, options),
                )
                .await
        }
    }

    /// Upload `size` bytes read from `reader`
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResponse, UploadError>
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
    {
        let content_type = options.content_type_or(DEFAULT_CONTENT_TYPE);
        if self.is_direct(size) {
            let body = reqwest::Body::wrap_stream(
                Chunker::new(reader, BODY_FRAME_SIZE)
                    .into_stream()
                    .map_ok(|chunk| chunk.data),
            );
            self.post_direct(body, size, content_type, options).await
        } else {
            ChunkedUploader::new(self.node.clone(), self.retry.clone())
                .upload_large(reader, size, &self.chunked_options(content_type, options))
                .await
        }
    }

    /// Upload a file, detecting its content type from the extension
    ///
    /// An explicit content type in `options` takes precedence.
    #[tracing::instrument(
        name = "upload.file",
        skip(self, path, options),
        fields(path = %path.as_ref().display()),
        err
    )]
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> Result<UploadResponse, UploadError> {
        let path = path.as_ref();
        let size = tokio::fs::metadata(path).await?.len();
        let detected = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let options = UploadOptions {
            content_type: Some(options.content_type.clone().unwrap_or(detected)),
            soak_period: options.soak_period,
        };

        let file = tokio::fs::File::open(path).await?;
        self.upload_reader(file, size, &options).await
    }

    async fn post_direct(
        &self,
        body: impl Into<reqwest::Body>,
        size: u64,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<UploadResponse, UploadError> {
        let start_time = Instant::now();
        let result = self
            .node
            .post_data(body, content_type, options.soak_period)
            .await;
        metrics::record_upload_duration("direct", start_time.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                metrics::record_upload_success("direct", size);
                tracing::info!(tx_id = %response.tx_id, bytes = size, "Direct upload completed");
                Ok(response)
            }
            Err(e) => {
                metrics::record_upload_failure("direct");
                Err(e.into())
            }
        }
    }
}
