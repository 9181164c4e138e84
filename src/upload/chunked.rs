//! Chunked upload coordinator
//!
//! Delivers an object too large for a single request:
//!
//! 1. negotiate a session id with the node (`GET /chunk/{total_size}`)
//! 2. read the stream in `chunk_size` frames, each addressed by byte offset
//! 3. deliver frames in discrete batches of `batch_size` concurrent requests,
//!    waiting for every request of a batch to settle before starting the next
//! 4. verify every planned offset was acknowledged
//! 5. trigger server-side reconstruction (`POST /chunk/{session_id}/-1`)
//!
//! Batches never overlap, so at most `batch_size` chunk requests are in
//! flight at any instant. A chunk that still fails after retries fails the
//! whole upload once its batch has settled; finalize is never requested for
//! an upload with missing or failed chunks.

use super::chunker::{chunk_count, planned_offsets, Chunk, Chunker};
use super::{UploadError, DEFAULT_CONTENT_TYPE};
use crate::metrics;
use crate::node::{NodeClient, NodeError, UploadResponse};
use crate::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 10_000_000;

/// Default number of chunks delivered concurrently per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Node operations the coordinator needs
#[async_trait]
pub trait ChunkEndpoint: Clone + Send + Sync + 'static {
    /// Obtain a server-assigned session id for an upload of `total_size` bytes
    async fn create_session(&self, total_size: u64) -> Result<String, NodeError>;

    /// Deliver one chunk; must be idempotent for a given offset
    async fn put_chunk(&self, session_id: &str, offset: u64, data: Bytes)
        -> Result<(), NodeError>;

    /// Ask the node to reconstruct the object from its chunks
    async fn finalize(
        &self,
        session_id: &str,
        content_type: &str,
        soak_period: Option<u64>,
    ) -> Result<UploadResponse, NodeError>;
}

#[async_trait]
impl ChunkEndpoint for NodeClient {
    async fn create_session(&self, total_size: u64) -> Result<String, NodeError> {
        NodeClient::create_session(self, total_size).await
    }

    async fn put_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), NodeError> {
        NodeClient::put_chunk(self, session_id, offset, data).await
    }

    async fn finalize(
        &self,
        session_id: &str,
        content_type: &str,
        soak_period: Option<u64>,
    ) -> Result<UploadResponse, NodeError> {
        self.finalize_session(session_id, content_type, soak_period)
            .await
    }
}

/// Options for one chunked upload
#[derive(Debug, Clone)]
pub struct ChunkedOptions {
    pub chunk_size: usize,
    pub batch_size: usize,
    pub content_type: String,
    pub soak_period: Option<u64>,
}

impl Default for ChunkedOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            soak_period: None,
        }
    }
}

/// A negotiated upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub total_size: u64,
    pub chunk_size: usize,
}

impl UploadSession {
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    /// Planned offsets that were not acknowledged
    pub fn missing_offsets(&self, acknowledged: &BTreeSet<u64>) -> Vec<u64> {
        planned_offsets(self.total_size, self.chunk_size)
            .into_iter()
            .filter(|offset| !acknowledged.contains(offset))
            .collect()
    }

    /// Fail unless every planned offset was acknowledged
    pub fn verify(&self, acknowledged: &BTreeSet<u64>) -> Result<(), UploadError> {
        let missing = self.missing_offsets(acknowledged);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UploadError::Incomplete { missing })
        }
    }
}

/// Chunked upload coordinator
pub struct ChunkedUploader<E> {
    endpoint: E,
    retry: RetryPolicy,
}

impl<E: ChunkEndpoint> ChunkedUploader<E> {
    pub fn new(endpoint: E, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }

    /// Upload `total_size` bytes from `reader` through a chunked session
    ///
    /// `total_size` must be the exact length of the stream; a shorter or
    /// longer stream fails with [`UploadError::SizeMismatch`] before
    /// finalize is requested.
    #[tracing::instrument(
        name = "upload.chunked",
        skip(self, reader, options),
        fields(
            upload.total_size = total_size,
            upload.chunk_size = options.chunk_size,
            upload.batch_size = options.batch_size,
            upload.session_id = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload_large<R>(
        &self,
        reader: R,
        total_size: u64,
        options: &ChunkedOptions,
    ) -> Result<UploadResponse, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if options.batch_size < 1 {
            return Err(UploadError::InvalidBatchSize(options.batch_size));
        }
        if options.chunk_size < 1 {
            return Err(UploadError::InvalidChunkSize);
        }

        let start_time = Instant::now();
        let result = self.run(reader, total_size, options).await;
        let duration = start_time.elapsed();
        metrics::record_upload_duration("chunked", duration.as_secs_f64());

        match &result {
            Ok(response) => {
                metrics::record_upload_success("chunked", total_size);
                tracing::info!(
                    tx_id = %response.tx_id,
                    bytes = total_size,
                    duration_ms = duration.as_millis(),
                    "Chunked upload completed"
                );
            }
            Err(e) => {
                metrics::record_upload_failure("chunked");
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "Chunked upload failed"
                );
            }
        }

        result
    }

    async fn run<R>(
        &self,
        reader: R,
        total_size: u64,
        options: &ChunkedOptions,
    ) -> Result<UploadResponse, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session = UploadSession {
            session_id: self.endpoint.create_session(total_size).await?,
            total_size,
            chunk_size: options.chunk_size,
        };
        tracing::Span::current().record("upload.session_id", session.session_id.as_str());
        tracing::info!(
            session_id = %session.session_id,
            chunks = session.chunk_count(),
            "Negotiated upload session"
        );

        let acknowledged = self
            .deliver_chunks(&session, reader, options.batch_size)
            .await?;
        session.verify(&acknowledged)?;

        let response = self
            .endpoint
            .finalize(
                &session.session_id,
                &options.content_type,
                options.soak_period,
            )
            .await?;
        Ok(response)
    }

    async fn deliver_chunks<R>(
        &self,
        session: &UploadSession,
        reader: R,
        batch_size: usize,
    ) -> Result<BTreeSet<u64>, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let session_id: Arc<str> = Arc::from(session.session_id.as_str());
        let mut chunker = Chunker::new(reader, session.chunk_size);
        let mut batch = JoinSet::new();
        let mut acknowledged = BTreeSet::new();
        let mut batches = 0usize;

        loop {
            let chunk = match chunker.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drain(&mut batch, &mut acknowledged).await;
                    return Err(e.into());
                }
            };

            if chunk.end() > session.total_size {
                drain(&mut batch, &mut acknowledged).await;
                return Err(UploadError::SizeMismatch {
                    expected: session.total_size,
                    actual: chunk.end(),
                });
            }

            let span = tracing::debug_span!(
                "upload.chunk",
                upload.session_id = %session_id,
                chunk.offset = chunk.offset,
                chunk.bytes = chunk.len()
            );
            batch.spawn(self.deliver(session_id.clone(), chunk).instrument(span));

            if batch.len() == batch_size {
                batches += 1;
                settle(&mut batch, &mut acknowledged).await?;
                tracing::debug!(batch = batches, chunks = batch_size, "Batch settled");
            }
        }

        if !batch.is_empty() {
            batches += 1;
            let trailing = batch.len();
            settle(&mut batch, &mut acknowledged).await?;
            tracing::debug!(batch = batches, chunks = trailing, "Trailing batch settled");
        }

        if chunker.offset() != session.total_size {
            return Err(UploadError::SizeMismatch {
                expected: session.total_size,
                actual: chunker.offset(),
            });
        }

        Ok(acknowledged)
    }

    fn deliver(
        &self,
        session_id: Arc<str>,
        chunk: Chunk,
    ) -> impl Future<Output = Result<u64, UploadError>> + Send + 'static {
        let endpoint = self.endpoint.clone();
        let policy = self.retry.clone();

        async move {
            let offset = chunk.offset;
            let bytes = chunk.len() as u64;
            let data = chunk.data;

            retry(&policy, "chunk", |_| {
                endpoint.put_chunk(&session_id, offset, data.clone())
            })
            .await
            .map_err(|source| {
                metrics::record_chunk_failure();
                UploadError::ChunkDelivery {
                    offset,
                    attempts: policy.max_attempts(),
                    source,
                }
            })?;

            metrics::record_chunk_success(bytes);
            Ok(offset)
        }
    }
}

/// Settle the in-flight batch of an upload that already failed
async fn drain(
    batch: &mut JoinSet<Result<u64, UploadError>>,
    acknowledged: &mut BTreeSet<u64>,
) {
    if let Err(e) = settle(batch, acknowledged).await {
        tracing::warn!(error = %e, "In-flight chunk failed while abandoning upload");
    }
}

/// Wait for every task of a batch, recording acknowledged offsets
///
/// All tasks are allowed to finish; the first failure is returned afterwards.
async fn settle(
    batch: &mut JoinSet<Result<u64, UploadError>>,
    acknowledged: &mut BTreeSet<u64>,
) -> Result<(), UploadError> {
    let mut first_error = None;

    while let Some(joined) = batch.join_next().await {
        let outcome = joined
            .map_err(|e| UploadError::TaskFailed(e.to_string()))
            .and_then(|result| result);
        match outcome {
            Ok(offset) => {
                acknowledged.insert(offset);
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
