//! Upload module
//!
//! Delivers byte streams to a node, either in one request (`POST /data`) or
//! through a chunked upload session for payloads at or above the direct
//! upload threshold.

use crate::node::NodeError;
use thiserror::Error;

pub mod chunked;
pub mod chunker;
pub mod direct;

pub use crate::node::UploadResponse;
pub use chunked::{ChunkEndpoint, ChunkedOptions, ChunkedUploader, UploadSession};
pub use chunker::{Chunk, Chunker};
pub use direct::Uploader;

/// Default content type for uploads without an explicit one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("batch size too small! must be >=1 (got {0})")]
    InvalidBatchSize(usize),

    #[error("chunk size must be >=1 byte")]
    InvalidChunkSize,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Chunk at offset {offset} failed after {attempts} attempt(s): {source}")]
    ChunkDelivery {
        offset: u64,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    #[error("Stream length mismatch: declared {expected} bytes, read {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Upload incomplete: {} chunk offset(s) not acknowledged (first: {:?})", .missing.len(), .missing.first())]
    Incomplete { missing: Vec<u64> },

    #[error("Chunk delivery task failed: {0}")]
    TaskFailed(String),
}

/// Caller options for a single upload
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Overrides the detected or default content type
    pub content_type: Option<String>,
    /// Server-side hold period, passed through untouched
    pub soak_period: Option<u64>,
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_soak_period(mut self, soak_period: u64) -> Self {
        self.soak_period = Some(soak_period);
        self
    }

    /// The content type to send, falling back to `fallback`
    pub fn content_type_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.content_type.as_deref().unwrap_or(fallback)
    }
}
