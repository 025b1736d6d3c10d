//! Shared fixtures: an in-process registry + tarball host, and tarball
//! builders.

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// One observed request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
}

/// A mock registry serving packuments at `/:name` and tarballs at
/// `/tarballs/:file`.
#[derive(Clone, Default)]
pub struct MockRegistry {
    packuments: Arc<Mutex<HashMap<String, Value>>>,
    tarballs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packument(&self, name: &str, packument: Value) {
        self.packuments
            .lock()
            .unwrap()
            .insert(name.to_string(), packument);
    }

    pub fn add_tarball(&self, file: &str, bytes: Vec<u8>) {
        self.tarballs
            .lock()
            .unwrap()
            .insert(file.to_string(), bytes);
    }

    /// Start serving on an ephemeral port; returns the bound address.
    pub async fn serve(&self) -> SocketAddr {
        let app = Router::new()
            .route("/tarballs/:file", get(tarball_handler))
            .route("/:name", get(packument_handler))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock registry");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock registry");
        });
        addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// How many tarball downloads the server saw.
    pub fn tarball_hits(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path.starts_with("/tarballs/"))
            .count()
    }
}

fn record(state: &MockRegistry, path: String, headers: &HeaderMap) {
    state.requests.lock().unwrap().push(RecordedRequest {
        path,
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
}

async fn packument_handler(
    State(state): State<MockRegistry>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    record(&state, format!("/{name}"), &headers);
    let packuments = state.packuments.lock().unwrap();
    match packuments.get(&name) {
        Some(packument) => Json(packument.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn tarball_handler(
    State(state): State<MockRegistry>,
    UrlPath(file): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    record(&state, format!("/tarballs/{file}"), &headers);
    let tarballs = state.tarballs.lock().unwrap();
    match tarballs.get(&file) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Build a gzipped tarball from `(path, content)` entries.
pub fn make_tgz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.finish().unwrap();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// A standard one-package tarball with the given manifest.
pub fn make_package_tgz(name: &str, version: &str) -> Vec<u8> {
    let manifest = format!(r#"{{"name":"{name}","version":"{version}"}}"#);
    make_tgz(&[
        ("package/package.json", manifest.as_bytes()),
        ("package/index.js", b"module.exports = 42;"),
    ])
}

/// SRI string (`sha512-...`) of a byte slice.
pub fn sha512_sri(bytes: &[u8]) -> String {
    format!("sha512-{}", BASE64.encode(Sha512::digest(bytes)))
}

/// A packument with one version whose tarball lives on `tarball_base`.
pub fn packument_for(
    name: &str,
    version: &str,
    tarball_base: &str,
    integrity: Option<&str>,
) -> Value {
    let mut dist = serde_json::json!({
        "tarball": format!("{tarball_base}/tarballs/{name}-{version}.tgz"),
    });
    if let Some(integrity) = integrity {
        dist["integrity"] = Value::String(integrity.to_string());
    }
    serde_json::json!({
        "name": name,
        "dist-tags": { "latest": version },
        "versions": {
            version: {
                "name": name,
                "version": version,
                "dist": dist,
            }
        }
    })
}
