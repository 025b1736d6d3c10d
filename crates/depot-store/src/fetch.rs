//! Fetching: mapping a resolution to unpacked bytes in a target directory.

use crate::client::{DownloadOptions, HttpClient, UnpackResult};
use crate::error::StoreError;
use crate::integrity::{FileIntegrity, Integrity};
use crate::resolve::Resolution;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// What a fetcher leaves behind on success: the per-file index of the
/// populated target directory, plus the package-wide integrity when the
/// source was a tarball.
#[derive(Debug)]
pub struct FetchedFiles {
    pub files: BTreeMap<String, FileIntegrity>,
    pub package_integrity: Option<Integrity>,
}

/// Per-fetch parameters.
pub struct FetchParams<'a> {
    pub pkg_id: &'a str,
    /// Where the cached source tarball lands (`packed.tgz`).
    pub save_tarball_to: &'a Path,
    pub ignore: Option<&'a (dyn Fn(&str) -> bool + Send + Sync)>,
    /// Admission priority for the network transfer.
    pub priority: i32,
}

/// One fetch strategy; owns network I/O and unpacking for its resolution
/// type. Must leave `target` populated only on success.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        resolution: &'a Resolution,
        target: &'a Path,
        params: &'a FetchParams<'a>,
    ) -> BoxFuture<'a, Result<FetchedFiles, StoreError>>;
}

/// Dispatch table keyed by resolution type.
pub struct FetcherRegistry {
    by_type: HashMap<String, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    /// Registry with the built-in tarball fetcher.
    #[must_use]
    pub fn new(client: Arc<HttpClient>) -> Self {
        let mut by_type: HashMap<String, Arc<dyn Fetcher>> = HashMap::new();
        by_type.insert("tarball".to_string(), Arc::new(TarballFetcher { client }));
        Self { by_type }
    }

    /// Register (or replace) the fetcher for a resolution type.
    pub fn register(&mut self, type_tag: impl Into<String>, fetcher: Arc<dyn Fetcher>) {
        self.by_type.insert(type_tag.into(), fetcher);
    }

    /// Fetch `resolution` into `target`.
    ///
    /// # Errors
    /// `UNSUPPORTED_RESOLUTION` when no fetcher is registered for the
    /// resolution's type.
    pub async fn fetch(
        &self,
        resolution: &Resolution,
        target: &Path,
        params: &FetchParams<'_>,
    ) -> Result<FetchedFiles, StoreError> {
        let type_tag = resolution.type_tag();
        let fetcher = self
            .by_type
            .get(type_tag)
            .ok_or_else(|| StoreError::unsupported_resolution(type_tag))?;
        fetcher.fetch(resolution, target, params).await
    }
}

/// Downloads and unpacks tarball resolutions.
struct TarballFetcher {
    client: Arc<HttpClient>,
}

impl Fetcher for TarballFetcher {
    fn fetch<'a>(
        &'a self,
        resolution: &'a Resolution,
        target: &'a Path,
        params: &'a FetchParams<'a>,
    ) -> BoxFuture<'a, Result<FetchedFiles, StoreError>> {
        async move {
            let Resolution::Tarball {
                url,
                integrity,
                registry,
            } = resolution
            else {
                return Err(StoreError::unsupported_resolution(resolution.type_tag()));
            };

            let url = Url::parse(url)
                .map_err(|e| StoreError::bad_pref(format!("Invalid tarball URL '{url}': {e}")))?;
            let registry = match registry {
                Some(registry) => Some(Url::parse(registry).map_err(|e| {
                    StoreError::bad_pref(format!("Invalid registry URL '{registry}': {e}"))
                })?),
                None => None,
            };

            // Unknown digest algorithms (old shasum-era metadata) cannot be
            // checked on the wire; the download proceeds unverified.
            let expected = integrity.as_deref().and_then(|sri| {
                Integrity::from_str(sri)
                    .map_err(|e| warn!(pkg_id = params.pkg_id, error = %e, "unusable integrity, skipping wire check"))
                    .ok()
            });

            let unpacked: UnpackResult = self
                .client
                .download(
                    &url,
                    params.save_tarball_to,
                    &DownloadOptions {
                        pkg_id: params.pkg_id,
                        integrity: expected.as_ref(),
                        registry: registry.as_ref(),
                        unpack_to: target,
                        ignore: params.ignore,
                        priority: params.priority,
                    },
                )
                .await?;

            Ok(FetchedFiles {
                files: unpacked.files,
                package_integrity: Some(unpacked.package_integrity),
            })
        }
        .boxed()
    }
}
