//! Subresource-integrity values and store-entry verification.
//!
//! Integrity is recorded either as a per-file index (strict mode) or as a
//! single package-wide SRI string. `integrity.json` is written compact,
//! via a temp file and rename.

use crate::error::StoreError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use walkdir::WalkDir;

/// Digest algorithm of an SRI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha512,
    Sha256,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha512 => "sha512",
            Self::Sha256 => "sha256",
        }
    }
}

/// A subresource-integrity value: `sha512-<base64 digest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: Algorithm,
    /// Base64-encoded digest.
    pub digest: String,
}

impl Integrity {
    /// Compute the integrity of a byte slice.
    #[must_use]
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let digest = match algorithm {
            Algorithm::Sha512 => BASE64.encode(Sha512::digest(data)),
            Algorithm::Sha256 => BASE64.encode(Sha256::digest(data)),
        };
        Self { algorithm, digest }
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), self.digest)
    }
}

impl FromStr for Integrity {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once('-')
            .ok_or_else(|| StoreError::bad_pref(format!("Invalid integrity string '{s}'")))?;
        let algorithm = match algorithm {
            "sha512" => Algorithm::Sha512,
            "sha256" => Algorithm::Sha256,
            other => {
                return Err(StoreError::bad_pref(format!(
                    "Unsupported integrity algorithm '{other}'"
                )))
            }
        };
        if digest.is_empty() {
            return Err(StoreError::bad_pref(format!("Empty digest in '{s}'")));
        }
        Ok(Self {
            algorithm,
            digest: digest.to_string(),
        })
    }
}

enum HashState {
    Sha512(Sha512),
    Sha256(Sha256),
}

/// Streaming SRI hasher; feed chunks as they arrive off the wire.
pub struct IntegrityHasher {
    algorithm: Algorithm,
    state: HashState,
}

impl IntegrityHasher {
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        let state = match algorithm {
            Algorithm::Sha512 => HashState::Sha512(Sha512::new()),
            Algorithm::Sha256 => HashState::Sha256(Sha256::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HashState::Sha512(h) => h.update(data),
            HashState::Sha256(h) => h.update(data),
        }
    }

    #[must_use]
    pub fn finish(self) -> Integrity {
        let digest = match self.state {
            HashState::Sha512(h) => BASE64.encode(h.finalize()),
            HashState::Sha256(h) => BASE64.encode(h.finalize()),
        };
        Integrity {
            algorithm: self.algorithm,
            digest,
        }
    }
}

/// Per-file record inside a strict-mode integrity index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIntegrity {
    pub integrity: String,
    pub mode: u32,
    pub size: u64,
}

/// What `integrity.json` records for one store entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryIntegrity {
    /// Per-file index: relative path → digest, mode, size.
    Files(BTreeMap<String, FileIntegrity>),
    /// Single package-wide SRI string over the source tarball.
    Package(String),
}

/// Decide whether an on-disk entry still matches its recorded integrity.
///
/// Strict mode recomputes per-file digests against a
/// [`EntryIntegrity::Files`] index; a package-wide record cannot prove the
/// unpacked tree, so under strict mode it is untrusted (the refetch then
/// records a per-file index). Fast mode accepts the record as-is. Returns
/// `false` when the entry must be refetched.
#[must_use]
pub fn verify_entry(pkg_dir: &Path, recorded: &EntryIntegrity, strict: bool) -> bool {
    if !strict {
        return true;
    }
    match recorded {
        EntryIntegrity::Files(index) => verify_file_index(pkg_dir, index),
        EntryIntegrity::Package(_) => false,
    }
}

fn verify_file_index(pkg_dir: &Path, index: &BTreeMap<String, FileIntegrity>) -> bool {
    for (rel, recorded) in index {
        let path = pkg_dir.join(rel);
        let Ok(data) = fs::read(&path) else {
            return false;
        };
        if data.len() as u64 != recorded.size {
            return false;
        }
        let Ok(expected) = Integrity::from_str(&recorded.integrity) else {
            return false;
        };
        if Integrity::from_bytes(expected.algorithm, &data) != expected {
            return false;
        }
    }

    // Files not present at ingest time also invalidate the entry.
    for entry in WalkDir::new(pkg_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(pkg_dir) else {
            return false;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !index.contains_key(rel.as_str()) {
            return false;
        }
    }

    true
}

/// Write `integrity.json` compact, through a temp file and rename.
///
/// # Errors
/// Returns an error when the file cannot be written.
pub fn write_integrity_file(path: &Path, entry: &EntryIntegrity) -> Result<(), StoreError> {
    let data = serde_json::to_vec(entry)
        .map_err(|e| StoreError::store_io(format!("Failed to encode integrity: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a previously written `integrity.json`, if present and decodable.
#[must_use]
pub fn read_integrity_file(path: &Path) -> Option<EntryIntegrity> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}
