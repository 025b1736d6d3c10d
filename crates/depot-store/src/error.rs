//! Store error types.

use std::fmt;
use std::io;
use std::path::Path;

/// Store error codes.
pub mod codes {
    pub const UNSUPPORTED_RESOLUTION: &str = "UNSUPPORTED_RESOLUTION";
    pub const BAD_TARBALL: &str = "BAD_TARBALL";
    pub const INTEGRITY_MISMATCH: &str = "INTEGRITY_MISMATCH";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const OFFLINE_MISS: &str = "OFFLINE_MISS";
    pub const MISSING_MANIFEST: &str = "MISSING_MANIFEST";
    pub const STORE_CORRUPTION: &str = "STORE_CORRUPTION";
    pub const RESOLVER_FAILURE: &str = "RESOLVER_FAILURE";
    pub const BAD_PREF: &str = "BAD_PREF";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const VERSION_NOT_FOUND: &str = "VERSION_NOT_FOUND";
    pub const STORE_IO: &str = "STORE_IO";
}

/// Store error.
///
/// Errors are cloneable so a single failed fetch can be observed by every
/// caller coalesced onto it.
#[derive(Debug, Clone)]
pub struct StoreError {
    code: &'static str,
    message: String,
    /// Total attempts made before giving up, for retried downloads.
    attempts: Option<u32>,
    /// The resource (URL) the error relates to, for retried downloads.
    resource: Option<String>,
}

impl StoreError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attempts: None,
            resource: None,
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attempts made before the error became final, if this error exhausted
    /// a retry policy.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// The resource the retried operation was fetching.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Decorate the error with the attempt count and the resource it was
    /// fetching. Applied once, when a retry policy gives up.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, resource: impl Into<String>) -> Self {
        self.attempts = Some(attempts);
        self.resource = Some(resource.into());
        self
    }

    /// Create an unsupported-resolution error.
    #[must_use]
    pub fn unsupported_resolution(resolution_type: &str) -> Self {
        Self::new(
            codes::UNSUPPORTED_RESOLUTION,
            format!("No fetcher registered for resolution type '{resolution_type}'"),
        )
    }

    /// Create a bad-tarball error for a size mismatch.
    #[must_use]
    pub fn bad_tarball(expected: u64, received: u64, url: &str) -> Self {
        Self::new(
            codes::BAD_TARBALL,
            format!("Unexpected tarball size: expected {expected} bytes, received {received} ({url})"),
        )
    }

    /// Create a bad-tarball error for a corrupt archive.
    pub fn corrupt_tarball(msg: impl Into<String>) -> Self {
        Self::new(codes::BAD_TARBALL, msg)
    }

    /// Create an integrity mismatch error.
    #[must_use]
    pub fn integrity_mismatch(expected: &str, actual: &str, url: &str) -> Self {
        Self::new(
            codes::INTEGRITY_MISMATCH,
            format!("Integrity check failed: expected {expected}, got {actual} ({url})"),
        )
    }

    /// Create a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(codes::NETWORK_ERROR, msg)
    }

    /// Create an offline-miss error.
    #[must_use]
    pub fn offline_miss(what: &str) -> Self {
        Self::new(
            codes::OFFLINE_MISS,
            format!("Offline and no cached metadata for {what}"),
        )
    }

    /// Create a missing-manifest error.
    #[must_use]
    pub fn missing_manifest(path: &Path) -> Self {
        Self::new(
            codes::MISSING_MANIFEST,
            format!("No package.json found at {}", path.display()),
        )
    }

    /// Create a store corruption error.
    pub fn store_corruption(msg: impl Into<String>) -> Self {
        Self::new(codes::STORE_CORRUPTION, msg)
    }

    /// Wrap a resolver error, preserving the original description.
    pub fn resolver_failure(pref: &str, cause: impl fmt::Display) -> Self {
        Self::new(
            codes::RESOLVER_FAILURE,
            format!("Failed to resolve '{pref}': {cause}"),
        )
    }

    /// Create a bad-pref error.
    pub fn bad_pref(msg: impl Into<String>) -> Self {
        Self::new(codes::BAD_PREF, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Create a version not found error.
    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::new(
            codes::VERSION_NOT_FOUND,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    /// Create a store I/O error.
    pub fn store_io(msg: impl Into<String>) -> Self {
        Self::new(codes::STORE_IO, msg)
    }

    /// Whether a download-layer retry policy may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, codes::NETWORK_ERROR | codes::BAD_TARBALL)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(attempts) = self.attempts {
            write!(f, " (after {attempts} attempts)")?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::STORE_IO, e.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::NETWORK_ERROR, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::NETWORK_ERROR, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::NETWORK_ERROR, e.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::NETWORK_ERROR, format!("Invalid JSON: {e}"))
    }
}
