//! The fetch coordinator: per-identity coalescing, staged materialization,
//! atomic publication.
//!
//! One fetch per identity per process. Callers get back three
//! independently-settled futures (manifest, files, integrity persistence)
//! created atomically with the locker insertion; the work itself runs on a
//! spawned task and may be awaited by any number of callers.

use crate::client::HttpClient;
use crate::config::{FetchOptions, IgnoreFilter, StoreConfig};
use crate::error::StoreError;
use crate::fetch::{FetchParams, FetcherRegistry};
use crate::index::{identity_to_path, IndexEntry, StoreIndex};
use crate::integrity::{
    read_integrity_file, verify_entry, write_integrity_file, EntryIntegrity,
};
use crate::manifest::{read_manifest, PackageManifest};
use crate::packument::{new_meta_cache, MetaCache};
use crate::progress::{ProgressBus, ProgressEvent, ProgressReporter};
use crate::queue::RequestQueue;
use crate::resolve::{Resolution, ResolveContext, ResolveResult, Resolver, ResolverRegistry, WantedDependency};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, warn};
use url::Url;

/// A set-once future that any number of tasks can await.
pub struct Completable<T> {
    inner: Arc<CompletableInner<T>>,
}

struct CompletableInner<T> {
    cell: OnceLock<Result<T, StoreError>>,
    notify: Notify,
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Completable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completable")
            .field("settled", &self.inner.cell.get())
            .finish()
    }
}

impl<T: Clone> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletableInner {
                cell: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Settle the future. Returns false if it was already settled.
    pub fn complete(&self, value: Result<T, StoreError>) -> bool {
        let settled = self.inner.cell.set(value).is_ok();
        if settled {
            self.inner.notify.notify_waiters();
        }
        settled
    }

    /// Wait for the value. Resolves immediately once settled.
    ///
    /// # Errors
    /// Returns the error the future was settled with.
    pub async fn wait(&self) -> Result<T, StoreError> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(value) = self.inner.cell.get() {
                return value.clone();
            }
            notified.await;
        }
    }

    /// The settled value, if any, without waiting.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, StoreError>> {
        self.inner.cell.get().cloned()
    }
}

/// Outcome of the files future.
#[derive(Debug, Clone)]
pub struct FilesResult {
    /// The integrity recorded for the entry.
    pub index: EntryIntegrity,
    /// Whether this fetch populated the entry, or a trusted entry was
    /// reused.
    pub is_new: bool,
}

/// Handle to an in-flight (or completed) fetch. Cloning shares the
/// underlying futures; dropping does not cancel the work.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    pub pkg_id: String,
    /// Stable location of the unpacked content: the entry's `package`
    /// symlink. Valid to traverse once `fetching_files` resolves.
    pub path: PathBuf,
    pub resolution: Resolution,
    pub latest: Option<String>,
    pub normalized_pref: Option<String>,
    /// Settles when the manifest is known; pre-settled when the caller
    /// supplied one.
    pub fetching_manifest: Completable<PackageManifest>,
    /// Settles when the content is published under `path`.
    pub fetching_files: Completable<FilesResult>,
    /// Settles when `integrity.json` is on disk. On a refetch this settles
    /// immediately: the prior file stays authoritative until the new one
    /// replaces it, so a brief window may report stale integrity.
    pub calculating_integrity: Completable<()>,
}

/// A directory dependency: no fetch, no store entry.
#[derive(Debug, Clone)]
pub struct LocalPackage {
    pub pkg_id: String,
    pub resolution: Resolution,
    pub manifest: PackageManifest,
    pub normalized_pref: Option<String>,
}

/// What [`PackageStore::resolve_and_fetch`] returns.
#[derive(Debug, Clone)]
pub enum StoreResponse {
    Fetched(FetchHandle),
    Local(LocalPackage),
}

#[derive(Clone)]
struct LockerEntry {
    path: PathBuf,
    fetching_manifest: Completable<PackageManifest>,
    fetching_files: Completable<FilesResult>,
    calculating_integrity: Completable<()>,
}

/// Process-wide coalescing map: identity → the in-flight triple. Entries
/// are never removed; a failed fetch stays failed for the process.
#[derive(Clone, Default)]
pub struct FetchLocker {
    entries: Arc<Mutex<HashMap<String, LockerEntry>>>,
}

impl FetchLocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The content-addressed package store.
pub struct PackageStore {
    config: Arc<StoreConfig>,
    store_path: PathBuf,
    queue: RequestQueue,
    client: Arc<HttpClient>,
    resolvers: ResolverRegistry,
    fetchers: FetcherRegistry,
    index: Arc<StoreIndex>,
    locker: FetchLocker,
    meta_cache: MetaCache,
    bus: ProgressBus,
}

impl PackageStore {
    /// Create a store rooted at `store_path` with an in-memory index.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: StoreConfig, store_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_index(config, store_path, StoreIndex::in_memory())
    }

    /// Create a store with an explicit index.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_index(
        config: StoreConfig,
        store_path: impl Into<PathBuf>,
        index: StoreIndex,
    ) -> Result<Self, StoreError> {
        let config = Arc::new(config);
        let queue = RequestQueue::new(config.network_concurrency);
        let bus = ProgressBus::new();
        let client = Arc::new(HttpClient::new(
            Arc::clone(&config),
            queue.clone(),
            bus.clone(),
        )?);
        Ok(Self {
            config,
            store_path: store_path.into(),
            queue,
            fetchers: FetcherRegistry::new(Arc::clone(&client)),
            client,
            resolvers: ResolverRegistry::default(),
            index: Arc::new(index),
            locker: FetchLocker::new(),
            meta_cache: new_meta_cache(),
            bus,
        })
    }

    /// Share another store's coalescing map (or isolate with a fresh one).
    pub fn set_locker(&mut self, locker: FetchLocker) {
        self.locker = locker;
    }

    /// This store's coalescing map, for sharing.
    #[must_use]
    pub fn locker(&self) -> FetchLocker {
        self.locker.clone()
    }

    /// Register an additional resolver, probed after the built-ins.
    pub fn register_resolver(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.register(resolver);
    }

    /// Register a fetcher for a resolution type.
    pub fn register_fetcher(
        &mut self,
        type_tag: impl Into<String>,
        fetcher: Arc<dyn crate::fetch::Fetcher>,
    ) {
        self.fetchers.register(type_tag, fetcher);
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self, reporter: Arc<dyn ProgressReporter>) {
        self.bus.subscribe(reporter);
    }

    /// Resolve a wanted dependency and ensure its content is (or becomes)
    /// available in the store.
    ///
    /// # Errors
    /// Resolution failures are returned directly. Fetch failures surface
    /// through the returned handle's futures.
    pub async fn resolve_and_fetch(
        self: &Arc<Self>,
        wanted: &WantedDependency,
        opts: &FetchOptions,
    ) -> Result<StoreResponse, StoreError> {
        let registry = opts
            .registry
            .clone()
            .unwrap_or_else(|| self.config.registry.clone());

        let resolved = self.resolve(wanted, opts, &registry).await?;
        self.bus.emit(&ProgressEvent::Resolved {
            pkg_id: resolved.id.clone(),
        });

        // Directory dependencies bypass the store entirely.
        if let Resolution::Directory { path } = &resolved.resolution {
            let manifest = match opts.manifest.clone().or(resolved.manifest) {
                Some(manifest) => manifest,
                None => read_manifest(path).await?,
            };
            return Ok(StoreResponse::Local(LocalPackage {
                pkg_id: resolved.id,
                resolution: resolved.resolution,
                manifest,
                normalized_pref: resolved.normalized_pref,
            }));
        }

        let known_manifest = opts.manifest.clone().or_else(|| resolved.manifest.clone());
        let target = self.store_path.join(identity_to_path(&resolved.id));

        // Check-and-insert must be atomic; everything else happens outside
        // the lock.
        let (entry, is_first) = {
            let mut locker = self.locker.entries.lock().expect("locker poisoned");
            match locker.get(&resolved.id) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let entry = LockerEntry {
                        path: target.join("package"),
                        fetching_manifest: Completable::new(),
                        fetching_files: Completable::new(),
                        calculating_integrity: Completable::new(),
                    };
                    locker.insert(resolved.id.clone(), entry.clone());
                    (entry, true)
                }
            }
        };

        if is_first {
            if let Some(manifest) = &known_manifest {
                entry.fetching_manifest.complete(Ok(manifest.clone()));
            }
            let job = FetchJob {
                store: Arc::clone(self),
                pkg_id: resolved.id.clone(),
                resolution: resolved.resolution.clone(),
                target: target.clone(),
                known_manifest,
                verify: opts.verify_store_integrity,
                ignore: opts.ignore.clone(),
                entry: entry.clone(),
            };
            tokio::spawn(job.run());
        } else {
            debug!(pkg_id = %resolved.id, "coalesced onto in-flight fetch");
        }

        Ok(StoreResponse::Fetched(FetchHandle {
            pkg_id: resolved.id,
            path: entry.path.clone(),
            resolution: resolved.resolution,
            latest: resolved.latest,
            normalized_pref: resolved.normalized_pref,
            fetching_manifest: entry.fetching_manifest,
            fetching_files: entry.fetching_files,
            calculating_integrity: entry.calculating_integrity,
        }))
    }

    async fn resolve(
        self: &Arc<Self>,
        wanted: &WantedDependency,
        opts: &FetchOptions,
        registry: &Url,
    ) -> Result<ResolveResult, StoreError> {
        // A pinned resolution keeps installs deterministic: no resolver
        // runs unless an update was requested.
        if let (Some(resolution), false) = (&opts.shrinkwrap_resolution, opts.update) {
            let id = opts.pkg_id.clone().ok_or_else(|| {
                StoreError::bad_pref("A pinned resolution requires pkg_id")
            })?;
            return Ok(ResolveResult {
                id,
                resolution: resolution.clone(),
                manifest: None,
                latest: None,
                normalized_pref: None,
            });
        }

        let ctx = ResolveContext {
            client: Arc::clone(&self.client),
            registry: registry.clone(),
            meta_cache: Arc::clone(&self.meta_cache),
            offline: opts.offline,
            prefix: opts.prefix.clone(),
            download_priority: opts.download_priority,
        };
        self.resolvers.resolve(wanted, &ctx).await
    }
}

/// Everything the spawned fetch task owns.
struct FetchJob {
    store: Arc<PackageStore>,
    pkg_id: String,
    resolution: Resolution,
    target: PathBuf,
    known_manifest: Option<PackageManifest>,
    verify: bool,
    ignore: Option<IgnoreFilter>,
    entry: LockerEntry,
}

impl FetchJob {
    async fn run(self) {
        if let Err(err) = self.fetch_to_store().await {
            warn!(pkg_id = %self.pkg_id, error = %err, "fetch failed");
            self.store.bus.emit(&ProgressEvent::Error {
                pkg_id: self.pkg_id.clone(),
                code: err.code(),
                message: err.message().to_string(),
            });
            // Set-once: a manifest already surfaced stays resolved.
            self.entry.fetching_manifest.complete(Err(err.clone()));
            self.entry.fetching_files.complete(Err(err));
            // calculating_integrity may stay pending when the failure
            // preceded integrity recording.
        }
    }

    async fn fetch_to_store(&self) -> Result<(), StoreError> {
        let rel = identity_to_path(&self.pkg_id);
        let target = &self.target;
        let link_to_unpacked = target.join("package");
        let target_stage = stage_path(target);
        let integrity_path = target.join("integrity.json");
        let packed_path = target.join("packed.tgz");

        // Hit probe: entry counts as present only when the index records it
        // and the manifest is on disk.
        if self.store.index.has(&rel) && fs::metadata(link_to_unpacked.join("package.json")).is_ok()
        {
            if let Some(trusted) = self.probe_entry(&link_to_unpacked, &integrity_path) {
                self.store.bus.emit(&ProgressEvent::FoundInStore {
                    pkg_id: self.pkg_id.clone(),
                });
                if self.entry.fetching_manifest.peek().is_none() {
                    let manifest = read_manifest(&link_to_unpacked).await?;
                    self.entry.fetching_manifest.complete(Ok(manifest));
                }
                self.entry.fetching_files.complete(Ok(FilesResult {
                    index: trusted,
                    is_new: false,
                }));
                self.entry.calculating_integrity.complete(Ok(()));
                return Ok(());
            }
            warn!(pkg_id = %self.pkg_id, "refetching, store entry was modified");
        }

        let target_exists = fs::metadata(target).is_ok();

        // Stage reset: a crash mid-fetch leaves only stage debris, never a
        // partially visible entry.
        remove_dir_if_exists(&target_stage).await?;
        tokio::fs::create_dir_all(target).await?;

        self.store.bus.emit(&ProgressEvent::ResolvingContent {
            pkg_id: self.pkg_id.clone(),
        });

        // The prior integrity file stays authoritative through a refetch.
        if target_exists {
            self.entry.calculating_integrity.complete(Ok(()));
        }

        let priority = self.store.queue.next_download_priority();
        let ignore = self.ignore.clone();
        let params = FetchParams {
            pkg_id: &self.pkg_id,
            save_tarball_to: &packed_path,
            ignore: ignore.as_deref(),
            priority,
        };
        let fetched = {
            let fetch = self
                .store
                .fetchers
                .fetch(&self.resolution, &target_stage, &params);
            // On a refetch, drop only the unpacked content in parallel with
            // the download; packed.tgz and integrity.json survive until
            // overwritten.
            let cleanup = async {
                if target_exists {
                    remove_dir_if_exists(&target.join("node_modules")).await?;
                }
                Ok::<(), StoreError>(())
            };
            let (fetched, ()) = tokio::try_join!(fetch, cleanup)?;
            fetched
        };

        let recorded = if self.verify {
            EntryIntegrity::Files(fetched.files.clone())
        } else if let Some(package) = &fetched.package_integrity {
            EntryIntegrity::Package(package.to_string())
        } else {
            EntryIntegrity::Files(fetched.files.clone())
        };

        if target_exists {
            // Replace the preserved file now that new content is verified;
            // the settled future already reported the prior state.
            if let Err(err) = write_integrity_file(&integrity_path, &recorded) {
                warn!(pkg_id = %self.pkg_id, error = %err, "failed to refresh integrity.json");
            }
        } else {
            // Fresh entry: record integrity in the background. Publication
            // does not wait for this write.
            let calculating = self.entry.calculating_integrity.clone();
            let recorded = recorded.clone();
            let pkg_id = self.pkg_id.clone();
            tokio::task::spawn_blocking(move || {
                let result = write_integrity_file(&integrity_path, &recorded);
                if let Err(err) = &result {
                    warn!(pkg_id = %pkg_id, error = %err, "failed to write integrity.json");
                }
                calculating.complete(result);
            });
        }

        // Manifest surfacing: the staged copy is the source of truth when
        // the caller did not supply one.
        let manifest = match &self.known_manifest {
            Some(manifest) => manifest.clone(),
            None => {
                let manifest = read_manifest(&target_stage).await?;
                self.entry.fetching_manifest.complete(Ok(manifest.clone()));
                manifest
            }
        };

        // Atomic publish: one rename makes the entry visible, then the
        // stable `package` link is recreated.
        let unpacked = target.join("node_modules").join(&manifest.name);
        if let Some(parent) = unpacked.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&target_stage, &unpacked).await?;
        relink_package(&link_to_unpacked, &manifest.name)?;

        self.store.index.record(
            &rel,
            IndexEntry {
                pkg_id: self.pkg_id.clone(),
                per_file_integrity: matches!(recorded, EntryIntegrity::Files(_)),
            },
        )?;

        self.entry.fetching_files.complete(Ok(FilesResult {
            index: recorded,
            is_new: true,
        }));
        self.store.bus.emit(&ProgressEvent::Fetched {
            pkg_id: self.pkg_id.clone(),
        });
        Ok(())
    }

    /// Run the integrity gate over an existing entry. `Some(recorded)` when
    /// the entry is trustworthy, `None` to trigger a refetch.
    fn probe_entry(&self, link_to_unpacked: &Path, integrity_path: &Path) -> Option<EntryIntegrity> {
        let recorded = read_integrity_file(integrity_path)?;
        let unpacked = fs::canonicalize(link_to_unpacked).ok()?;
        verify_entry(&unpacked, &recorded, self.verify).then_some(recorded)
    }
}

fn stage_path(target: &Path) -> PathBuf {
    let mut stage = target.as_os_str().to_os_string();
    stage.push("_stage");
    PathBuf::from(stage)
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recreate `<target>/package` pointing at `node_modules/<name>`. The link
/// target is relative so the store can be relocated.
fn relink_package(link: &Path, pkg_name: &str) -> Result<(), StoreError> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    let dest = Path::new("node_modules").join(pkg_name);

    #[cfg(unix)]
    std::os::unix::fs::symlink(&dest, link)?;

    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(&dest, link)?;

    Ok(())
}
