//! Store index: which entries have been ingested, keyed by relative path.
//!
//! An entry counts as present only when the index records it *and* the
//! entry's `package/package.json` still exists on disk; the coordinator
//! treats any mismatch as absent.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

/// Characters that cannot appear in a store path segment.
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

/// Derive the store-relative path for a package identity.
///
/// Pure and stable: equal identities always map to equal paths. `/` keeps
/// its meaning as a separator; every other filesystem-hostile character is
/// replaced with `+`.
#[must_use]
pub fn identity_to_path(identity: &str) -> String {
    identity
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if UNSAFE_CHARS.contains(&c) || c.is_control() {
                '+'
            } else {
                c
            }
        })
        .collect()
}

/// Metadata proving a prior ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The identity the entry was ingested under.
    pub pkg_id: String,
    /// Whether `integrity.json` holds a per-file index (true) or a single
    /// package-wide hash.
    pub per_file_integrity: bool,
}

/// Persistent mapping from store-relative path to ingest metadata.
///
/// Writers are serialized; readers run concurrently. When constructed with
/// a backing file, every `record` is flushed through a temp file and
/// rename so records survive the process.
pub struct StoreIndex {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl StoreIndex {
    /// An index with no persistence; records last for the process only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Load the index from `path`, starting empty if the file is absent.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                StoreError::store_corruption(format!(
                    "Corrupt store index at {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Whether the index records an entry at `rel`.
    #[must_use]
    pub fn has(&self, rel: &str) -> bool {
        self.entries
            .read()
            .expect("store index poisoned")
            .contains_key(rel)
    }

    /// The recorded metadata for `rel`, if any.
    #[must_use]
    pub fn get(&self, rel: &str) -> Option<IndexEntry> {
        self.entries
            .read()
            .expect("store index poisoned")
            .get(rel)
            .cloned()
    }

    /// Record an ingest and flush the index when backed by a file.
    ///
    /// # Errors
    /// Returns an error if persistence fails; the in-memory record is kept
    /// either way.
    pub fn record(&self, rel: &str, entry: IndexEntry) -> Result<(), StoreError> {
        {
            let mut entries = self.entries.write().expect("store index poisoned");
            entries.insert(rel.to_string(), entry);
        }
        self.flush()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries = self.entries.read().expect("store index poisoned");
        let data = serde_json::to_vec(&*entries)
            .map_err(|e| StoreError::store_io(format!("Failed to encode store index: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
