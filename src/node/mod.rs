//! Node HTTP client
//!
//! Thin transport over the Preweave node's HTTP API. Every structural call
//! (session negotiation, finalize, group registration/finish, tx actions) is
//! a single request whose non-200 response is turned into [`NodeError::Status`]
//! carrying the status and either the server's string body or the status text.
//!
//! # Endpoints
//!
//! | Operation | Method & Path |
//! |-----------|---------------|
//! | Small-object upload | `POST /data` |
//! | Session negotiation | `GET /chunk/{total_size}` |
//! | Chunk delivery | `POST /chunk/{session_id}/{offset}` |
//! | Chunked finalize | `POST /chunk/{session_id}/-1` |
//! | Tx actions | `POST /txs/{confirm,hide,unhide,remove}` |
//! | Group registration | `POST /atomic/create` |
//! | Group finalize | `POST /atomic/finish` |

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the static API credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the optional soak period
pub const SOAK_PERIOD_HEADER: &str = "X-Soak-Period";

/// Content type used for raw chunk bodies
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Offset that marks the finalize request of a chunked session
pub const FINALIZE_OFFSET: i64 = -1;

/// Characters escaped in an opaque path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Node client errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP Error: {context}: {status} {detail}")]
    Status {
        context: String,
        status: u16,
        detail: String,
    },

    #[error("Request error: {context}: {source}")]
    Request {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid response: {context}: {message}")]
    InvalidResponse { context: String, message: String },
}

impl NodeError {
    /// HTTP status of a rejected request, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            NodeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Response of a completed data upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "txId")]
    pub tx_id: String,
}

/// Per-transaction outcome of a tx action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Success,
    Fail,
}

/// Actions applicable to a list of transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// Make the transactions permanent
    Confirm,
    Hide,
    Unhide,
    /// Permanently remove the transactions
    Remove,
}

impl TxAction {
    fn path(self) -> &'static str {
        match self {
            TxAction::Confirm => "/txs/confirm",
            TxAction::Hide => "/txs/hide",
            TxAction::Unhide => "/txs/unhide",
            TxAction::Remove => "/txs/remove",
        }
    }

    fn context(self) -> &'static str {
        match self {
            TxAction::Confirm => "Confirming transactions",
            TxAction::Hide => "Hiding transactions",
            TxAction::Unhide => "Unhiding transactions",
            TxAction::Remove => "Removing transactions",
        }
    }
}

/// Session identifiers are opaque; some nodes send them as numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionIdValue {
    Text(String),
    Number(serde_json::Number),
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: SessionIdValue,
}

#[derive(Debug, Serialize)]
struct FinishAtomicRequest<'a> {
    key: &'a str,
}

/// Node client configuration
#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Timeout for ordinary requests
    pub request_timeout: Option<Duration>,
    /// Timeout for the chunked finalize request
    pub finalize_timeout: Duration,
}

/// HTTP client for a single Preweave node
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    base_url: String,
    finalize_timeout: Duration,
}

impl NodeClient {
    /// Create a new node client
    pub fn new(config: NodeClientConfig) -> Result<Self, NodeError> {
        let base_url = config.url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(NodeError::ConfigError(format!(
                "Invalid node URL '{}': must start with http:// or https://",
                config.url
            )));
        }

        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(config.api_key.as_deref().unwrap_or(""))
            .map_err(|e| NodeError::ConfigError(format!("Invalid API key: {}", e)))?;
        headers.insert(API_KEY_HEADER, api_key);

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| NodeError::ConfigError(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            finalize_timeout: config.finalize_timeout,
        })
    }

    /// Base URL of the node, without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Object-storage endpoint exposed by the node
    ///
    /// Ends with a slash so path-style bucket names land under `/S3/`.
    pub fn s3_endpoint(&self) -> String {
        format!("{}/S3/", self.base_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<Response, NodeError> {
        let response = request.send().await.map_err(|source| NodeError::Request {
            context: context.to_string(),
            source,
        })?;
        check_status(response, context, &[]).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: Response,
        context: &str,
    ) -> Result<T, NodeError> {
        let body = response.bytes().await.map_err(|source| NodeError::Request {
            context: context.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|e| NodeError::InvalidResponse {
            context: context.to_string(),
            message: e.to_string(),
        })
    }

    /// Upload a payload in a single request (`POST /data`)
    #[tracing::instrument(
        name = "node.post_data",
        skip(self, body),
        fields(http.method = "POST", http.content_type = %content_type),
        err
    )]
    pub async fn post_data(
        &self,
        body: impl Into<Body>,
        content_type: &str,
        soak_period: Option<u64>,
    ) -> Result<UploadResponse, NodeError> {
        let context = "Uploading data";
        let mut request = self
            .http
            .post(self.url("/data"))
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(soak) = soak_period {
            request = request.header(SOAK_PERIOD_HEADER, soak);
        }

        let response = self.send(request, context).await?;
        Self::read_json(response, context).await
    }

    /// Negotiate a chunked upload session (`GET /chunk/{total_size}`)
    #[tracing::instrument(
        name = "node.create_session",
        skip(self),
        fields(http.method = "GET", upload.total_size = total_size),
        err
    )]
    pub async fn create_session(&self, total_size: u64) -> Result<String, NodeError> {
        let context = "Negotiating upload session";
        let response = self
            .send(
                self.http.get(self.url(&format!("/chunk/{}", total_size))),
                context,
            )
            .await?;

        let session: SessionResponse = Self::read_json(response, context).await?;
        let id = match session.id {
            SessionIdValue::Text(id) => id,
            SessionIdValue::Number(id) => id.to_string(),
        };
        if id.is_empty() {
            return Err(NodeError::InvalidResponse {
                context: context.to_string(),
                message: "empty session id".into(),
            });
        }
        Ok(id)
    }

    /// Deliver one chunk (`POST /chunk/{session_id}/{offset}`)
    pub async fn put_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), NodeError> {
        let context = format!("Uploading chunk at offset {}", offset);
        let url = self.url(&format!(
            "/chunk/{}/{}",
            utf8_percent_encode(session_id, PATH_SEGMENT),
            offset
        ));
        self.send(
            self.http
                .post(url)
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(data),
            &context,
        )
        .await?;
        Ok(())
    }

    /// Trigger server-side reconstruction (`POST /chunk/{session_id}/-1`)
    ///
    /// Uses the extended finalize timeout.
    #[tracing::instrument(
        name = "node.finalize_session",
        skip(self),
        fields(http.method = "POST", upload.session_id = %session_id),
        err
    )]
    pub async fn finalize_session(
        &self,
        session_id: &str,
        content_type: &str,
        soak_period: Option<u64>,
    ) -> Result<UploadResponse, NodeError> {
        let context = "Finalising upload";
        let url = self.url(&format!(
            "/chunk/{}/{}",
            utf8_percent_encode(session_id, PATH_SEGMENT),
            FINALIZE_OFFSET
        ));
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .timeout(self.finalize_timeout)
            .body(Vec::new());
        if let Some(soak) = soak_period {
            request = request.header(SOAK_PERIOD_HEADER, soak);
        }

        let response = self.send(request, context).await?;
        Self::read_json(response, context).await
    }

    /// Apply an action to a list of transactions
    #[tracing::instrument(
        name = "node.tx_action",
        skip(self, tx_ids),
        fields(http.method = "POST", tx.action = ?action, tx.count = tx_ids.len()),
        err
    )]
    pub async fn tx_action(
        &self,
        action: TxAction,
        tx_ids: &[String],
    ) -> Result<HashMap<String, TxStatus>, NodeError> {
        let context = action.context();
        let response = self
            .send(self.http.post(self.url(action.path())).json(tx_ids), context)
            .await?;
        Self::read_json(response, context).await
    }

    /// Register an atomic group (`POST /atomic/create`), returning its key
    #[tracing::instrument(
        name = "node.create_atomic",
        skip(self, names),
        fields(http.method = "POST", atomic.names = names.len()),
        err
    )]
    pub async fn create_atomic(&self, names: &[String]) -> Result<String, NodeError> {
        let context = "Initialising atomic upload";
        let response = self
            .send(self.http.post(self.url("/atomic/create")).json(names), context)
            .await?;
        let body = response.text().await.map_err(|source| NodeError::Request {
            context: context.to_string(),
            source,
        })?;

        let key = parse_opaque_key(&body);
        if key.is_empty() {
            return Err(NodeError::InvalidResponse {
                context: context.to_string(),
                message: "empty group key".into(),
            });
        }
        Ok(key)
    }

    /// Request finalization of an atomic group (`POST /atomic/finish`)
    #[tracing::instrument(
        name = "node.finish_atomic",
        skip(self),
        fields(http.method = "POST", atomic.key = %key),
        err
    )]
    pub async fn finish_atomic(&self, key: &str) -> Result<(), NodeError> {
        let context = "Finalising atomic upload";
        self.send(
            self.http
                .post(self.url("/atomic/finish"))
                .json(&FinishAtomicRequest { key }),
            context,
        )
        .await?;
        Ok(())
    }
}

/// Keys may come back as a bare string or as a JSON string literal
fn parse_opaque_key(body: &str) -> String {
    match serde_json::from_str::<String>(body) {
        Ok(key) => key,
        Err(_) => body.trim().to_string(),
    }
}

/// Turn any status other than 200 (or an explicitly allowed one) into an error
///
/// The error detail is the response body when it is a plain string, otherwise
/// the status text.
pub async fn check_status(
    response: Response,
    context: &str,
    allowed: &[u16],
) -> Result<Response, NodeError> {
    let status = response.status();
    if status == StatusCode::OK || allowed.contains(&status.as_u16()) {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_detail(status, &body);

    tracing::error!(
        context = context,
        status = status.as_u16(),
        detail = %detail,
        "Node rejected request"
    );

    Err(NodeError::Status {
        context: context.to_string(),
        status: status.as_u16(),
        detail,
    })
}

fn error_detail(status: StatusCode, body: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("").to_string();
    if body.trim().is_empty() {
        return reason;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(_) => reason,
        Err(_) => body.to_string(),
    }
}
