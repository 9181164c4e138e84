//! Path manifest for atomic groups
//!
//! A manifest maps each uploaded item name to its storage identifier:
//!
//! ```json
//! {"manifest":"arweave/paths","version":"0.1.0","paths":{"index.html":{"id":"..."}}}
//! ```

use super::AtomicItemReceipt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content type the manifest object is uploaded with
pub const MANIFEST_CONTENT_TYPE: &str = "application/x.arweave-manifest+json";

pub const MANIFEST_KIND: &str = "arweave/paths";
pub const MANIFEST_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPath {
    pub id: String,
}

/// Path manifest document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest: String,
    pub version: String,
    pub paths: BTreeMap<String, ManifestPath>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            manifest: MANIFEST_KIND.to_string(),
            version: MANIFEST_VERSION.to_string(),
            paths: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Build a fresh manifest from successful item uploads
    pub fn from_receipts(receipts: &[AtomicItemReceipt]) -> Self {
        let mut manifest = Self::default();
        for receipt in receipts {
            manifest.insert(&receipt.name, &receipt.id);
        }
        manifest
    }

    pub fn insert(&mut self, name: impl Into<String>, id: impl Into<String>) {
        self.paths
            .insert(name.into(), ManifestPath { id: id.into() });
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
