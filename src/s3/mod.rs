//! Object storage module
//!
//! The node exposes an S3-compatible endpoint at `{url}/S3/` that receives the
//! items of atomic groups. [`ObjectStore`] is the seam the atomic orchestrator
//! talks to; [`S3ObjectStore`] implements it with `aws-sdk-s3`.
//!
//! Bodies no longer than one part are sent with a single PutObject. Longer
//! bodies use CreateMultipartUpload, UploadPart (bounded concurrency) and
//! CompleteMultipartUpload; the multipart upload is aborted if any step fails.
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | PutObject | `s3.put_object` | bucket, key, bytes, etag |
//! | Multipart upload | `s3.multipart_upload` | bucket, key, upload_id, parts_count, etag |
//! | UploadPart | `s3.upload_part` | upload_id, part_number, bytes |

use crate::config::{AtomicConfig, S3Config};
use crate::upload::{Chunk, Chunker};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::RequestId;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Metadata key whose value is also sent as the object's Content-Type
pub const CONTENT_TYPE_METADATA: &str = "content-type";

/// Object storage errors
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {operation}: {message}")]
    RequestError {
        operation: &'static str,
        message: String,
    },

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn request_error<E>(operation: &'static str, err: aws_sdk_s3::error::SdkError<E>) -> ObjectStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ObjectStoreError::RequestError {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

/// Body of an object upload
pub enum ObjectBody {
    Bytes(Bytes),
    File(PathBuf),
    /// A one-shot stream; cannot be replayed for a retry
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl ObjectBody {
    /// Wrap any reader as a one-shot body
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    /// A fresh copy of this body, if it can be read again
    pub fn replay(&self) -> Option<ObjectBody> {
        match self {
            Self::Bytes(bytes) => Some(Self::Bytes(bytes.clone())),
            Self::File(path) => Some(Self::File(path.clone())),
            Self::Reader(_) => None,
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Reader(_))
    }

    /// Open the body for reading
    pub async fn into_reader(self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes))),
            Self::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            Self::Reader(reader) => Ok(reader),
        }
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ObjectBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<String> for ObjectBody {
    fn from(text: String) -> Self {
        Self::Bytes(text.into())
    }
}

impl From<&'static str> for ObjectBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<PathBuf> for ObjectBody {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

/// Destination for atomic group items
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` with the given object metadata
    ///
    /// Returns the storage identifier of the object.
    async fn upload(
        &self,
        key: &str,
        data: ObjectBody,
        metadata: HashMap<String, String>,
    ) -> Result<String, ObjectStoreError>;
}

/// Object store client configuration
#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub max_attempts: u32,
    pub part_size: usize,
    pub part_concurrency: usize,
}

impl S3ClientConfig {
    /// Build a client configuration for `endpoint`
    ///
    /// The endpoint always ends with `/`: the SDK appends path-style bucket
    /// names to the endpoint path without a separator.
    pub fn new(endpoint: impl Into<String>, s3: &S3Config, atomic: &AtomicConfig) -> Self {
        let mut endpoint = endpoint.into();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Self {
            endpoint,
            bucket: atomic.bucket.clone(),
            region: s3.region.clone(),
            access_key: s3.access_key.clone(),
            secret_key: s3.secret_key.clone(),
            max_attempts: s3.max_attempts,
            part_size: atomic.part_size,
            part_concurrency: atomic.part_concurrency,
        }
    }
}

/// S3-compatible object store backed by `aws-sdk-s3`
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: S3ClientConfig,
}

impl S3ObjectStore {
    /// Create a new client
    ///
    /// Addressing is path style against the configured endpoint, with static
    /// credentials.
    pub fn new(config: S3ClientConfig) -> Result<Self, ObjectStoreError> {
        if config.part_size == 0 || config.part_concurrency == 0 {
            return Err(ObjectStoreError::ConfigError(
                "part size and part concurrency must be at least 1".into(),
            ));
        }
        if config.max_attempts == 0 {
            return Err(ObjectStoreError::ConfigError(
                "max attempts must be at least 1".into(),
            ));
        }

        let credentials = aws_credential_types::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "preweave-static",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(config.endpoint.clone())
            .force_path_style(true)
            .retry_config(
                aws_config::retry::RetryConfig::standard().with_max_attempts(config.max_attempts),
            )
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, body, metadata),
        fields(
            s3.bucket = %self.config.bucket,
            s3.key = %key,
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<String, ObjectStoreError> {
        let content_type = metadata.get(CONTENT_TYPE_METADATA).cloned();
        let output = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| request_error("PutObject", e))?;

        let id = object_id(output.e_tag(), output.request_id())?;
        tracing::Span::current().record("s3.etag", id.as_str());
        Ok(id)
    }

    #[tracing::instrument(
        name = "s3.multipart_upload",
        skip(self, first, second, rest, metadata),
        fields(
            s3.bucket = %self.config.bucket,
            s3.key = %key,
            s3.upload_id = tracing::field::Empty,
            s3.parts_count = tracing::field::Empty,
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn multipart_upload<R>(
        &self,
        key: &str,
        first: Chunk,
        second: Chunk,
        rest: Chunker<R>,
        metadata: HashMap<String, String>,
    ) -> Result<String, ObjectStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let content_type = metadata.get(CONTENT_TYPE_METADATA).cloned();
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                ObjectStoreError::ResponseError("CreateMultipartUpload returned no upload id".into())
            })?
            .to_string();
        tracing::Span::current().record("s3.upload_id", upload_id.as_str());

        match self.upload_parts(key, &upload_id, first, second, rest).await {
            Ok(parts) => {
                tracing::Span::current().record("s3.parts_count", parts.len());
                let completed = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await;

                match completed {
                    Ok(output) => {
                        let id = object_id(output.e_tag(), output.request_id())?;
                        tracing::Span::current().record("s3.etag", id.as_str());
                        Ok(id)
                    }
                    Err(e) => {
                        let err = request_error("CompleteMultipartUpload", e);
                        self.abort(key, &upload_id).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.abort(key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        first: Chunk,
        second: Chunk,
        rest: Chunker<R>,
    ) -> Result<Vec<CompletedPart>, ObjectStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let chunks = stream::iter([Ok(first), Ok(second)]).chain(rest.into_stream());

        let mut parts: Vec<CompletedPart> = chunks
            .map_err(ObjectStoreError::from)
            .enumerate()
            .map(|(index, chunk)| async move {
                // Part numbers start at 1
                self.upload_part(key, upload_id, index as i32 + 1, chunk?.data)
                    .await
            })
            .buffer_unordered(self.config.part_concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(|part| part.part_number());
        Ok(parts)
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, key, body),
        fields(s3.upload_id = %upload_id, s3.part_number = part_number, upload.bytes = body.len()),
        err
    )]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, ObjectStoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| request_error("UploadPart", e))?;

        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(
                key = %key,
                upload_id = %upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        }
    }
}

/// The object's ETag, or the request id when the store returns none
fn object_id(etag: Option<&str>, request_id: Option<&str>) -> Result<String, ObjectStoreError> {
    etag.or(request_id)
        .map(str::to_string)
        .ok_or_else(|| ObjectStoreError::ResponseError("response carried no ETag or request id".into()))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(
        &self,
        key: &str,
        data: ObjectBody,
        metadata: HashMap<String, String>,
    ) -> Result<String, ObjectStoreError> {
        let reader = data.into_reader().await?;
        let mut chunker = Chunker::new(reader, self.config.part_size);

        let first = chunker.next_chunk().await?.unwrap_or(Chunk {
            offset: 0,
            data: Bytes::new(),
        });
        match chunker.next_chunk().await? {
            None => self.put_object(key, first.data, metadata).await,
            Some(second) => {
                self.multipart_upload(key, first, second, chunker, metadata)
                    .await
            }
        }
    }
}
