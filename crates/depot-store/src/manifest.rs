//! Parsed `package.json` views.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// The parsed manifest of a resolved package. Immutable after read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "devDependencies",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "optionalDependencies",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "peerDependencies",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    /// Fields this crate does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PackageManifest {
    /// Parse a manifest from raw JSON.
    ///
    /// # Errors
    /// Returns an error if the JSON is invalid or lacks name/version.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::store_corruption(format!("Invalid package.json: {e}")))
    }

    /// Parse a manifest from an already-decoded JSON value.
    ///
    /// # Errors
    /// Returns an error if required fields are missing.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        serde_json::from_value(value)
            .map_err(|e| StoreError::store_corruption(format!("Invalid package metadata: {e}")))
    }
}

/// Read and parse `<dir>/package.json`.
///
/// # Errors
/// `MISSING_MANIFEST` if the file does not exist; a corruption error if it
/// cannot be parsed.
pub async fn read_manifest(dir: &Path) -> Result<PackageManifest, StoreError> {
    let path = dir.join("package.json");
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::missing_manifest(dir));
        }
        Err(e) => return Err(e.into()),
    };
    PackageManifest::from_slice(&bytes)
}
