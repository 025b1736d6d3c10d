//! HTTP client: retryable JSON GETs and streaming tarball downloads.

use crate::config::StoreConfig;
use crate::error::{codes, StoreError};
use crate::integrity::{Algorithm, FileIntegrity, Integrity, IntegrityHasher};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::queue::RequestQueue;
use crate::tarball::extract_tarball;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// Total timeout for metadata requests. Downloads are unbounded; their
/// progress is the stream itself.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The key a URL's credentials are filed under: `host` or `host:port`,
/// npm-style.
#[must_use]
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Decide whether credentials may be attached to a request for `target`.
///
/// Credentials are sent when `always_auth` is set, when no registry scopes
/// the request, or when the target host equals the registry host. A tarball
/// served from a different host than its registry gets an anonymous
/// request.
#[must_use]
pub fn should_send_auth(always_auth: bool, registry: Option<&Url>, target: &Url) -> bool {
    match registry {
        None => true,
        Some(registry) => always_auth || host_key(registry) == host_key(target),
    }
}

/// Options for [`HttpClient::download`].
pub struct DownloadOptions<'a> {
    pub pkg_id: &'a str,
    /// Expected integrity of the tarball bytes; mismatch rejects the
    /// attempt.
    pub integrity: Option<&'a Integrity>,
    /// The registry this download was resolved from, for auth scoping.
    pub registry: Option<&'a Url>,
    /// Staging directory receiving the unpacked content.
    pub unpack_to: &'a Path,
    /// Tarball entries to skip.
    pub ignore: Option<&'a (dyn Fn(&str) -> bool + Send + Sync)>,
    /// Admission priority.
    pub priority: i32,
}

/// A completed download: the unpacked file index plus the integrity of the
/// tarball as transferred.
pub struct UnpackResult {
    pub files: BTreeMap<String, FileIntegrity>,
    pub package_integrity: Integrity,
}

/// Shared HTTP client. All requests pass through the request queue.
pub struct HttpClient {
    http: reqwest::Client,
    config: Arc<StoreConfig>,
    queue: RequestQueue,
    bus: ProgressBus,
}

impl HttpClient {
    /// Build a client from the store configuration.
    ///
    /// # Errors
    /// Returns an error if the TLS or proxy settings are unusable.
    pub fn new(
        config: Arc<StoreConfig>,
        queue: RequestQueue,
        bus: ProgressBus,
    ) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(!config.ssl.strict);

        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        if let Some(http_proxy) = &config.proxy.http {
            builder = builder.proxy(
                reqwest::Proxy::http(http_proxy.as_str())
                    .map_err(|e| StoreError::network(format!("Invalid http proxy: {e}")))?,
            );
        }
        if let Some(https_proxy) = &config.proxy.https {
            builder = builder.proxy(
                reqwest::Proxy::https(https_proxy.as_str())
                    .map_err(|e| StoreError::network(format!("Invalid https proxy: {e}")))?,
            );
        }
        if let Some(addr) = config.proxy.local_address {
            builder = builder.local_address(addr);
        }
        if let Some(ca) = &config.ssl.ca {
            let cert = reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| StoreError::network(format!("Invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(certificate), Some(key)) = (&config.ssl.certificate, &config.ssl.key) {
            let pem = format!("{certificate}\n{key}");
            let identity = reqwest::Identity::from_pem(pem.as_bytes())
                .map_err(|e| StoreError::network(format!("Invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| StoreError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            queue,
            bus,
        })
    }

    /// GET a JSON document. Credentials are resolved from the target host.
    /// No retry at this layer.
    ///
    /// # Errors
    /// `PKG_NOT_FOUND` on 404, `NETWORK_ERROR` otherwise.
    pub async fn get_json(&self, url: &Url, priority: i32) -> Result<serde_json::Value, StoreError> {
        self.queue
            .submit(priority, async {
                debug!(url = %url, "fetching metadata");
                let mut request = self.http.get(url.clone()).timeout(METADATA_TIMEOUT);
                if let Some(token) = host_key(url).and_then(|h| {
                    self.config.auth_token_for(&h).map(str::to_string)
                }) {
                    request = request.header(AUTHORIZATION, format!("Bearer {token}"));
                }

                let response = request.send().await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Err(StoreError::not_found(url.path().trim_start_matches('/')));
                }
                if !response.status().is_success() {
                    return Err(StoreError::network(format!(
                        "Request to {url} failed with status {}",
                        response.status()
                    )));
                }
                Ok(response.json().await?)
            })
            .await
    }

    /// Download a tarball: stream it through the integrity hasher, the
    /// unpacker, and an atomic writer for the cached copy at `save_path`.
    /// Retries per the configured policy; on exhaustion the final error is
    /// decorated with the attempt count and URL.
    ///
    /// # Errors
    /// `BAD_TARBALL` on size mismatch or corrupt archive,
    /// `INTEGRITY_MISMATCH` when the bytes do not match `opts.integrity`,
    /// `NETWORK_ERROR` on transport failure.
    pub async fn download(
        &self,
        url: &Url,
        save_path: &Path,
        opts: &DownloadOptions<'_>,
    ) -> Result<UnpackResult, StoreError> {
        let max_attempts = self.config.retry.count + 1;
        let mut integrity_retried = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self
                .queue
                .submit(opts.priority, self.download_once(url, save_path, opts, attempt))
                .await;

            let err = match result {
                Ok(unpacked) => return Ok(unpacked),
                Err(err) => err,
            };

            // Integrity mismatches get exactly one retry; everything else
            // follows the policy's attempt budget.
            let mut retryable = err.is_retryable();
            if err.code() == codes::INTEGRITY_MISMATCH {
                retryable = !integrity_retried;
                integrity_retried = true;
            }

            if !retryable || attempt >= max_attempts {
                return Err(err.with_attempts(attempt, url.as_str()));
            }

            let delay = self.config.retry.backoff(attempt - 1);
            warn!(
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "download failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn download_once(
        &self,
        url: &Url,
        save_path: &Path,
        opts: &DownloadOptions<'_>,
        attempt: u32,
    ) -> Result<UnpackResult, StoreError> {
        let tmp_path = save_path.with_extension("tgz.tmp");
        let result = self.download_attempt(url, save_path, &tmp_path, opts, attempt).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn download_attempt(
        &self,
        url: &Url,
        save_path: &Path,
        tmp_path: &Path,
        opts: &DownloadOptions<'_>,
        attempt: u32,
    ) -> Result<UnpackResult, StoreError> {
        // A failed earlier attempt may have left partial content behind.
        match tokio::fs::remove_dir_all(opts.unpack_to).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut request = self.http.get(url.clone());
        if should_send_auth(self.config.always_auth, opts.registry, url) {
            if let Some(token) = host_key(url).and_then(|h| {
                self.config.auth_token_for(&h).map(str::to_string)
            }) {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StoreError::network(format!(
                "Request to {url} failed with status {}",
                response.status()
            )));
        }

        let size = response.content_length();
        self.bus.emit(&ProgressEvent::FetchingStarted {
            pkg_id: opts.pkg_id.to_string(),
            size,
            attempt,
        });

        if let Some(parent) = save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(tmp_path).await?;

        // The wire stream feeds three consumers: the integrity hashers, the
        // cached-tarball writer, and (once the bytes are verified) the
        // unpacker.
        let mut sha512 = IntegrityHasher::new(Algorithm::Sha512);
        let mut alt_hasher = opts.integrity.and_then(|expected| {
            (expected.algorithm != Algorithm::Sha512)
                .then(|| IntegrityHasher::new(expected.algorithm))
        });
        let mut buffer: Vec<u8> = Vec::with_capacity(size.unwrap_or(0) as usize);
        let mut downloaded = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            // A transfer cut short against a declared content-length is a
            // truncated tarball, not a plain transport failure.
            let chunk = match (chunk, size) {
                (Ok(chunk), _) => chunk,
                (Err(_), Some(expected)) if downloaded < expected => {
                    return Err(StoreError::bad_tarball(expected, downloaded, url.as_str()));
                }
                (Err(e), _) => return Err(e.into()),
            };
            downloaded += chunk.len() as u64;
            sha512.update(&chunk);
            if let Some(hasher) = &mut alt_hasher {
                hasher.update(&chunk);
            }
            file.write_all(&chunk).await?;
            buffer.extend_from_slice(&chunk);
            self.bus.emit(&ProgressEvent::FetchingProgress {
                pkg_id: opts.pkg_id.to_string(),
                downloaded,
            });
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = size {
            if downloaded != expected {
                return Err(StoreError::bad_tarball(expected, downloaded, url.as_str()));
            }
        }

        let package_integrity = sha512.finish();
        if let Some(expected) = opts.integrity {
            let actual = match alt_hasher {
                Some(hasher) => hasher.finish(),
                None => package_integrity.clone(),
            };
            if actual != *expected {
                return Err(StoreError::integrity_mismatch(
                    &expected.to_string(),
                    &actual.to_string(),
                    url.as_str(),
                ));
            }
        }

        let files = extract_tarball(&buffer, opts.unpack_to, opts.ignore)?;

        // The cached tarball becomes visible only once complete and
        // verified.
        tokio::fs::rename(tmp_path, save_path).await?;

        Ok(UnpackResult {
            files,
            package_integrity,
        })
    }
}
