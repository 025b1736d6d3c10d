//! Store configuration.
//!
//! Network, retry, and authentication settings are fixed at construction
//! time; everything request-specific travels in [`FetchOptions`].

use crate::error::StoreError;
use crate::manifest::PackageManifest;
use crate::resolve::Resolution;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default number of concurrent network requests.
pub const DEFAULT_NETWORK_CONCURRENCY: usize = 16;

/// Retry policy for tarball downloads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub count: u32,
    /// Backoff multiplier between attempts.
    pub factor: f64,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound on the delay between attempts.
    pub max_timeout: Duration,
    /// Randomize each delay by a factor of 1..2.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 2,
            factor: 10.0,
            min_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed: 0 = first retry).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.factor.max(1.0);
        let base = self.min_timeout.as_secs_f64() * factor.powi(retry as i32);
        let mut delay = Duration::from_secs_f64(base.min(self.max_timeout.as_secs_f64()));
        if self.randomize {
            delay = delay.mul_f64(1.0 + pseudo_jitter());
        }
        delay.min(self.max_timeout)
    }
}

/// A weak jitter source for retry randomization.
fn pseudo_jitter() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0),
    );
    (hasher.finish() % 1000) as f64 / 1000.0
}

/// Outbound proxy settings.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http: Option<Url>,
    pub https: Option<Url>,
    pub local_address: Option<std::net::IpAddr>,
}

/// TLS settings for registry connections.
#[derive(Debug, Clone)]
pub struct SslConfig {
    /// PEM client certificate.
    pub certificate: Option<String>,
    /// PEM client key.
    pub key: Option<String>,
    /// PEM CA bundle.
    pub ca: Option<String>,
    /// Verify server certificates.
    pub strict: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            certificate: None,
            key: None,
            ca: None,
            strict: true,
        }
    }
}

/// Store-wide configuration, normalized at construction.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Default registry, always with a trailing slash.
    pub registry: Url,
    /// Send credentials to hosts other than the registry host.
    pub always_auth: bool,
    /// Host → bearer token.
    pub auth_tokens: HashMap<String, String>,
    pub network_concurrency: usize,
    pub retry: RetryPolicy,
    pub proxy: ProxyConfig,
    pub ssl: SslConfig,
    pub user_agent: Option<String>,
}

impl StoreConfig {
    /// Create a configuration for the given registry URL.
    ///
    /// # Errors
    /// Returns an error if the registry URL is invalid.
    pub fn new(registry: &str) -> Result<Self, StoreError> {
        Ok(Self {
            registry: normalize_registry(registry)?,
            always_auth: false,
            auth_tokens: HashMap::new(),
            network_concurrency: DEFAULT_NETWORK_CONCURRENCY,
            retry: RetryPolicy::default(),
            proxy: ProxyConfig::default(),
            ssl: SslConfig::default(),
            user_agent: Some(concat!("depot/", env!("CARGO_PKG_VERSION")).to_string()),
        })
    }

    /// Look up the auth token recorded for a host.
    #[must_use]
    pub fn auth_token_for(&self, host: &str) -> Option<&str> {
        self.auth_tokens.get(host).map(String::as_str)
    }
}

/// Normalize a registry URL: parse and ensure a trailing slash so joins
/// behave.
pub fn normalize_registry(registry: &str) -> Result<Url, StoreError> {
    let with_slash = if registry.ends_with('/') {
        registry.to_string()
    } else {
        format!("{registry}/")
    };
    Url::parse(&with_slash)
        .map_err(|e| StoreError::bad_pref(format!("Invalid registry URL '{registry}': {e}")))
}

/// Filter deciding which tarball entries to skip during unpack.
pub type IgnoreFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-request options for [`crate::store::PackageStore::resolve_and_fetch`].
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Priority for metadata requests submitted on behalf of this call.
    pub download_priority: i32,
    /// Skip tarball entries for which the filter returns true.
    pub ignore: Option<IgnoreFilter>,
    /// Never touch the network; fail with `OFFLINE_MISS` when metadata is
    /// not cached.
    pub offline: bool,
    /// Known package identity, required alongside `shrinkwrap_resolution`.
    pub pkg_id: Option<String>,
    /// Project directory local paths are resolved against.
    pub prefix: PathBuf,
    /// Registry override for this request.
    pub registry: Option<Url>,
    /// Pinned resolution from a lockfile; skips the resolver when `update`
    /// is false.
    pub shrinkwrap_resolution: Option<Resolution>,
    /// Caller-supplied manifest; pre-settles the manifest future.
    pub manifest: Option<PackageManifest>,
    /// Ignore pinned resolutions and re-resolve.
    pub update: bool,
    /// Recompute per-file digests when probing an existing store entry.
    pub verify_store_integrity: bool,
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("download_priority", &self.download_priority)
            .field("offline", &self.offline)
            .field("pkg_id", &self.pkg_id)
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .field("update", &self.update)
            .field("verify_store_integrity", &self.verify_store_integrity)
            .finish_non_exhaustive()
    }
}
