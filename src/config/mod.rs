//! Configuration module for Preweave Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every section except
//! `node` is optional and falls back to the defaults below.
//!
//! # Example
//!
//! ```yaml
//! node:
//!   url: "${PREWEAVE_URL:-http://localhost:8080}"
//!   api_key: "${PREWEAVE_API_KEY}"
//! upload:
//!   chunk_size: 10000000
//!   batch_size: 10
//! retry:
//!   retries: 3
//! atomic:
//!   concurrency: 10
//! ```

use crate::node::NodeClientConfig;
use crate::retry::RetryPolicy;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("environment variable pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// assert_eq!(expand_env_vars("prefix-${MY_VAR}-suffix"), "prefix-value-suffix");
/// assert_eq!(expand_env_vars("${MISSING:-default}"), "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Smallest part size object storage accepts for non-final parts
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub atomic: AtomicConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Default configuration for a node at `url`
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            node: NodeConfig {
                url: url.into(),
                api_key,
                request_timeout_ms: None,
            },
            upload: UploadConfig::default(),
            retry: RetryPolicy::default(),
            atomic: AtomicConfig::default(),
            s3: S3Config::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Settings for the node HTTP client
    pub fn node_client_config(&self) -> NodeClientConfig {
        NodeClientConfig {
            url: self.node.url.clone(),
            api_key: self.node.api_key.clone(),
            request_timeout: self.node.request_timeout_ms.map(Duration::from_millis),
            finalize_timeout: Duration::from_millis(self.upload.finalize_timeout_ms),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.node.url) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid node url '{}': must start with http:// or https://",
                self.node.url
            )));
        }

        if self.upload.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.chunk_size must be at least 1 byte".into(),
            ));
        }

        if self.upload.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.batch_size must be at least 1".into(),
            ));
        }

        if self.retry.factor < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid retry factor {}: must be >= 1.0",
                self.retry.factor
            )));
        }

        if self.retry.min_timeout_ms > self.retry.max_timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.min_timeout_ms ({}) exceeds retry.max_timeout_ms ({})",
                self.retry.min_timeout_ms, self.retry.max_timeout_ms
            )));
        }

        if self.atomic.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "atomic.concurrency must be at least 1".into(),
            ));
        }

        if self.atomic.part_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "atomic.part_concurrency must be at least 1".into(),
            ));
        }

        if self.atomic.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "atomic.part_size {} is below the {} byte minimum",
                self.atomic.part_size, MIN_PART_SIZE
            )));
        }

        if self.atomic.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "atomic.bucket cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Node connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Timeout for ordinary requests. Default: none
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Payloads smaller than this go through a single request
    #[serde(default = "default_direct_threshold")]
    pub direct_threshold: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Timeout for the reconstruction request of a chunked upload
    #[serde(default = "default_finalize_timeout")]
    pub finalize_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            direct_threshold: default_direct_threshold(),
            chunk_size: default_chunk_size(),
            batch_size: default_batch_size(),
            finalize_timeout_ms: default_finalize_timeout(),
        }
    }
}

fn default_direct_threshold() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_chunk_size() -> usize {
    10_000_000
}

fn default_batch_size() -> usize {
    10
}

fn default_finalize_timeout() -> u64 {
    1_000_000
}

/// Atomic group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicConfig {
    /// Maximum simultaneous item uploads
    #[serde(default = "default_atomic_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_atomic_bucket")]
    pub bucket: String,
    /// Part size for multipart item uploads
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Parts of one item uploaded concurrently
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            concurrency: default_atomic_concurrency(),
            bucket: default_atomic_bucket(),
            part_size: default_part_size(),
            part_concurrency: default_part_concurrency(),
        }
    }
}

fn default_atomic_concurrency() -> usize {
    10
}

fn default_atomic_bucket() -> String {
    "preweave-txs".to_string()
}

fn default_part_size() -> usize {
    MIN_PART_SIZE
}

fn default_part_concurrency() -> usize {
    4
}

/// Object-storage client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_static_credential")]
    pub access_key: String,
    #[serde(default = "default_static_credential")]
    pub secret_key: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            access_key: default_static_credential(),
            secret_key: default_static_credential(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_static_credential() -> String {
    "Preweave".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
