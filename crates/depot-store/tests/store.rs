//! End-to-end store scenarios against an in-process registry.

mod common;

use common::{make_package_tgz, packument_for, sha512_sri, MockRegistry};
use depot_store::store::{PackageStore, StoreResponse};
use depot_store::{
    error_codes, EntryIntegrity, FetchOptions, Resolution, StoreConfig, StoreIndex,
    WantedDependency,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config_for(addr: SocketAddr) -> StoreConfig {
    let mut config = StoreConfig::new(&format!("http://{addr}/")).unwrap();
    config.retry.min_timeout = Duration::from_millis(10);
    config.retry.max_timeout = Duration::from_millis(50);
    config
}

async fn registry_with_foo() -> (MockRegistry, SocketAddr, Vec<u8>) {
    let registry = MockRegistry::new();
    let addr = registry.serve().await;
    let tgz = make_package_tgz("foo", "1.0.0");
    registry.add_packument(
        "foo",
        packument_for("foo", "1.0.0", &format!("http://{addr}"), Some(&sha512_sri(&tgz))),
    );
    registry.add_tarball("foo-1.0.0.tgz", tgz.clone());
    (registry, addr, tgz)
}

fn fetched(response: StoreResponse) -> depot_store::FetchHandle {
    match response {
        StoreResponse::Fetched(handle) => handle,
        StoreResponse::Local(_) => panic!("expected a fetched response"),
    }
}

/// S1: empty store, one tarball download, entry fully materialized.
#[tokio::test(flavor = "multi_thread")]
async fn fresh_install_materializes_entry() {
    let (registry, addr, _) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(PackageStore::new(config_for(addr), store_dir.path()).unwrap());
    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@^1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );

    assert_eq!(handle.pkg_id, format!("{}/foo/1.0.0", addr.ip()));

    let files = handle.fetching_files.wait().await.unwrap();
    assert!(files.is_new);
    let manifest = handle.fetching_manifest.wait().await.unwrap();
    assert_eq!(manifest.name, "foo");
    handle.calculating_integrity.wait().await.unwrap();

    let target = store_dir
        .path()
        .join(format!("{}/foo/1.0.0", addr.ip()));
    assert!(target.join("integrity.json").exists());
    assert!(target.join("packed.tgz").exists());
    assert!(target.join("package").join("package.json").exists());
    assert!(target
        .join("node_modules")
        .join("foo")
        .join("index.js")
        .exists());
    assert!(!path_exists(&format!("{}_stage", target.display())));

    assert_eq!(registry.tarball_hits(), 1);
}

fn path_exists(path: &str) -> bool {
    Path::new(path).exists()
}

/// S2 + round trip: a second run with a pinned resolution touches neither
/// the resolver nor the network and reuses the recorded index.
#[tokio::test(flavor = "multi_thread")]
async fn warm_hit_skips_network() {
    let (registry, addr, _) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();
    let index_path = store_dir.path().join("store.json");

    let first_store = Arc::new(
        PackageStore::with_index(
            config_for(addr),
            store_dir.path(),
            StoreIndex::load(&index_path).unwrap(),
        )
        .unwrap(),
    );
    let first = fetched(
        first_store
            .resolve_and_fetch(&WantedDependency::new("foo@^1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    let first_files = first.fetching_files.wait().await.unwrap();
    assert!(first_files.is_new);
    first.calculating_integrity.wait().await.unwrap();

    let requests_after_first = registry.requests().len();

    // Fresh process: new store and locker, same store dir and index file.
    let second_store = Arc::new(
        PackageStore::with_index(
            config_for(addr),
            store_dir.path(),
            StoreIndex::load(&index_path).unwrap(),
        )
        .unwrap(),
    );
    let second = fetched(
        second_store
            .resolve_and_fetch(
                &WantedDependency::new("foo@^1.0.0"),
                &FetchOptions {
                    shrinkwrap_resolution: Some(first.resolution.clone()),
                    pkg_id: Some(first.pkg_id.clone()),
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap(),
    );

    let second_files = second.fetching_files.wait().await.unwrap();
    assert!(!second_files.is_new);
    assert_eq!(second_files.index, first_files.index);
    let manifest = second.fetching_manifest.wait().await.unwrap();
    assert_eq!(manifest.version, "1.0.0");
    second.calculating_integrity.wait().await.unwrap();

    // No resolver call, no download: the request log did not grow.
    assert_eq!(registry.requests().len(), requests_after_first);
}

/// S3: a tampered entry under strict verification is refetched atomically,
/// with `packed.tgz` and `integrity.json` preserved through the window.
#[tokio::test(flavor = "multi_thread")]
async fn tampered_entry_triggers_refetch() {
    let (registry, addr, _) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();
    let index_path = store_dir.path().join("store.json");
    let strict = FetchOptions {
        verify_store_integrity: true,
        ..FetchOptions::default()
    };

    let first_store = Arc::new(
        PackageStore::with_index(
            config_for(addr),
            store_dir.path(),
            StoreIndex::load(&index_path).unwrap(),
        )
        .unwrap(),
    );
    let first = fetched(
        first_store
            .resolve_and_fetch(&WantedDependency::new("foo@^1.0.0"), &strict)
            .await
            .unwrap(),
    );
    assert!(first.fetching_files.wait().await.unwrap().is_new);
    first.calculating_integrity.wait().await.unwrap();

    // Corrupt one file under the published entry.
    let target = store_dir
        .path()
        .join(format!("{}/foo/1.0.0", addr.ip()));
    let victim = target.join("node_modules").join("foo").join("index.js");
    std::fs::write(&victim, b"tampered").unwrap();

    let second_store = Arc::new(
        PackageStore::with_index(
            config_for(addr),
            store_dir.path(),
            StoreIndex::load(&index_path).unwrap(),
        )
        .unwrap(),
    );
    let second = fetched(
        second_store
            .resolve_and_fetch(&WantedDependency::new("foo@^1.0.0"), &strict)
            .await
            .unwrap(),
    );
    let files = second.fetching_files.wait().await.unwrap();
    assert!(files.is_new, "tampered entry must be refetched");

    assert_eq!(registry.tarball_hits(), 2);
    assert_eq!(std::fs::read(&victim).unwrap(), b"module.exports = 42;");
    assert!(target.join("packed.tgz").exists());
    assert!(target.join("integrity.json").exists());
}

/// S4: 50 concurrent requests for one identity cause exactly one download.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_coalesce() {
    let (registry, addr, _) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config_for(addr), store_dir.path()).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let handle = fetched(
                store
                    .resolve_and_fetch(
                        &WantedDependency::new("foo@^1.0.0"),
                        &FetchOptions::default(),
                    )
                    .await
                    .unwrap(),
            );
            let files = handle.fetching_files.wait().await.unwrap();
            let manifest = handle.fetching_manifest.wait().await.unwrap();
            handle.calculating_integrity.wait().await.unwrap();
            (handle.path.clone(), files.is_new, manifest.name)
        }));
    }

    let mut paths = Vec::new();
    for task in tasks {
        let (path, is_new, name) = task.await.unwrap();
        assert!(is_new, "all callers observe the one shared fetch");
        assert_eq!(name, "foo");
        paths.push(path);
    }
    paths.dedup();
    assert_eq!(paths.len(), 1, "all handles point at the same path");

    assert_eq!(registry.tarball_hits(), 1);
}

/// S6: offline with nothing cached fails fast and writes nothing.
#[tokio::test(flavor = "multi_thread")]
async fn offline_without_cache_misses() {
    let store_dir = tempfile::tempdir().unwrap();
    let store_path = store_dir.path().join("store");
    let config = StoreConfig::new("http://127.0.0.1:9/").unwrap();
    let store = Arc::new(PackageStore::new(config, &store_path).unwrap());

    let err = store
        .resolve_and_fetch(
            &WantedDependency::new("bar@^2.0.0"),
            &FetchOptions {
                offline: true,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), error_codes::OFFLINE_MISS);
    assert!(!store_path.exists(), "no filesystem writes under the store");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_package_is_not_found() {
    let registry = MockRegistry::new();
    let addr = registry.serve().await;
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config_for(addr), store_dir.path()).unwrap());

    let err = store
        .resolve_and_fetch(&WantedDependency::new("ghost@^1.0.0"), &FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::PKG_NOT_FOUND);
}

/// Property 6: a tarball host different from the registry host gets an
/// anonymous request unless `always_auth` is set.
#[tokio::test(flavor = "multi_thread")]
async fn cross_host_tarball_is_anonymous() {
    let registry = MockRegistry::new();
    let registry_addr = registry.serve().await;
    let cdn = MockRegistry::new();
    let cdn_addr = cdn.serve().await;

    let tgz = make_package_tgz("foo", "1.0.0");
    registry.add_packument(
        "foo",
        packument_for("foo", "1.0.0", &format!("http://{cdn_addr}"), Some(&sha512_sri(&tgz))),
    );
    cdn.add_tarball("foo-1.0.0.tgz", tgz);

    let mut config = config_for(registry_addr);
    config
        .auth_tokens
        .insert(registry_addr.to_string(), "registry-token".to_string());
    config
        .auth_tokens
        .insert(cdn_addr.to_string(), "cdn-token".to_string());

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config, store_dir.path()).unwrap());
    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    handle.fetching_files.wait().await.unwrap();

    // Metadata went to the registry host with its token.
    let registry_requests = registry.requests();
    assert_eq!(
        registry_requests[0].authorization.as_deref(),
        Some("Bearer registry-token")
    );

    // The cross-host tarball request carried no credentials.
    let cdn_requests = cdn.requests();
    assert_eq!(cdn_requests.len(), 1);
    assert_eq!(cdn_requests[0].authorization, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn same_host_tarball_is_authenticated() {
    let (registry, addr, _) = registry_with_foo().await;
    let mut config = config_for(addr);
    config
        .auth_tokens
        .insert(addr.to_string(), "s3cret".to_string());

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config, store_dir.path()).unwrap());
    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    handle.fetching_files.wait().await.unwrap();

    for request in registry.requests() {
        assert_eq!(request.authorization.as_deref(), Some("Bearer s3cret"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn always_auth_sends_credentials_cross_host() {
    let registry = MockRegistry::new();
    let registry_addr = registry.serve().await;
    let cdn = MockRegistry::new();
    let cdn_addr = cdn.serve().await;

    let tgz = make_package_tgz("foo", "1.0.0");
    registry.add_packument(
        "foo",
        packument_for("foo", "1.0.0", &format!("http://{cdn_addr}"), Some(&sha512_sri(&tgz))),
    );
    cdn.add_tarball("foo-1.0.0.tgz", tgz);

    let mut config = config_for(registry_addr);
    config.always_auth = true;
    config
        .auth_tokens
        .insert(cdn_addr.to_string(), "cdn-token".to_string());

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config, store_dir.path()).unwrap());
    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    handle.fetching_files.wait().await.unwrap();

    let cdn_requests = cdn.requests();
    assert_eq!(
        cdn_requests[0].authorization.as_deref(),
        Some("Bearer cdn-token")
    );
}

/// An integrity mismatch is retried exactly once before failing.
#[tokio::test(flavor = "multi_thread")]
async fn integrity_mismatch_fails_after_one_retry() {
    let registry = MockRegistry::new();
    let addr = registry.serve().await;
    let tgz = make_package_tgz("foo", "1.0.0");
    // Advertise the integrity of different bytes.
    registry.add_packument(
        "foo",
        packument_for(
            "foo",
            "1.0.0",
            &format!("http://{addr}"),
            Some(&sha512_sri(b"other bytes")),
        ),
    );
    registry.add_tarball("foo-1.0.0.tgz", tgz);

    let mut config = config_for(addr);
    config.retry.count = 5;
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config, store_dir.path()).unwrap());

    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    let err = handle.fetching_files.wait().await.unwrap_err();
    assert_eq!(err.code(), error_codes::INTEGRITY_MISMATCH);
    assert_eq!(err.attempts(), Some(2));
    assert_eq!(registry.tarball_hits(), 2);
}

/// Git resolutions parse but have no registered fetcher by default.
#[tokio::test(flavor = "multi_thread")]
async fn git_resolution_is_unsupported_by_default() {
    let store_dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new("http://127.0.0.1:9/").unwrap();
    let store = Arc::new(PackageStore::new(config, store_dir.path()).unwrap());

    let handle = fetched(
        store
            .resolve_and_fetch(
                &WantedDependency::new("git+https://github.com/user/repo.git#0a1b2c"),
                &FetchOptions::default(),
            )
            .await
            .unwrap(),
    );
    assert!(matches!(handle.resolution, Resolution::Git { .. }));

    let err = handle.fetching_files.wait().await.unwrap_err();
    assert_eq!(err.code(), error_codes::UNSUPPORTED_RESOLUTION);
}

/// The fast-mode integrity record is a single package-wide SRI string.
#[tokio::test(flavor = "multi_thread")]
async fn fast_mode_records_package_integrity() {
    let (_registry, addr, tgz) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config_for(addr), store_dir.path()).unwrap());

    let handle = fetched(
        store
            .resolve_and_fetch(&WantedDependency::new("foo@^1.0.0"), &FetchOptions::default())
            .await
            .unwrap(),
    );
    let files = handle.fetching_files.wait().await.unwrap();
    match files.index {
        EntryIntegrity::Package(sri) => assert_eq!(sri, sha512_sri(&tgz)),
        EntryIntegrity::Files(_) => panic!("fast mode should record a package-wide hash"),
    }
}

/// Strict mode records a per-file index.
#[tokio::test(flavor = "multi_thread")]
async fn strict_mode_records_file_index() {
    let (_registry, addr, _) = registry_with_foo().await;
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PackageStore::new(config_for(addr), store_dir.path()).unwrap());

    let handle = fetched(
        store
            .resolve_and_fetch(
                &WantedDependency::new("foo@^1.0.0"),
                &FetchOptions {
                    verify_store_integrity: true,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap(),
    );
    let files = handle.fetching_files.wait().await.unwrap();
    match files.index {
        EntryIntegrity::Files(index) => {
            assert!(index.contains_key("package.json"));
            assert!(index.contains_key("index.js"));
        }
        EntryIntegrity::Package(_) => panic!("strict mode should record per-file digests"),
    }
    handle.calculating_integrity.wait().await.unwrap();
}
