//! Preweave Uploadr Library
//!
//! Upload client for Preweave storage nodes.
//!
//! # Features
//!
//! - **Direct uploads**: payloads under 10 MiB go out in one request
//! - **Chunked uploads**: larger payloads are split into fixed-size chunks,
//!   sent in concurrent batches with per-chunk retry, then reassembled by the node
//! - **Atomic groups**: named items uploaded through a bounded pool to the
//!   node's S3-compatible endpoint and finalized all at once
//! - **Transaction management**: confirm, hide, unhide and remove
//!
//! # Example
//!
//! ```no_run
//! use preweave_uploadr::{Config, Preweave};
//! use preweave_uploadr::upload::UploadOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = Preweave::new(config)?;
//!     let response = client.upload_file("video.mp4", &UploadOptions::default()).await?;
//!     println!("{}", response.tx_id);
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod client;
pub mod config;
pub mod metrics;
pub mod node;
pub mod retry;
pub mod s3;
pub mod telemetry;
pub mod upload;

// Re-export commonly used types
pub use client::{ClientError, Preweave};
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
