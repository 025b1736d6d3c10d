//! Registry metadata (packument) helpers and version resolution.

use crate::error::StoreError;
use semver::{Version, VersionReq};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-store packument cache: package name → packument JSON.
///
/// Shared so one process never fetches the same packument twice, and so
/// offline mode has something to consult.
pub type MetaCache = Arc<RwLock<HashMap<String, Arc<Value>>>>;

/// Create an empty packument cache.
#[must_use]
pub fn new_meta_cache() -> MetaCache {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Extract the latest version from a packument.
#[must_use]
pub fn get_latest_version(packument: &Value) -> Option<&str> {
    packument.get("dist-tags")?.get("latest")?.as_str()
}

/// Extract the tarball URL for a specific version.
#[must_use]
pub fn get_tarball_url<'a>(packument: &'a Value, version: &str) -> Option<&'a str> {
    packument
        .get("versions")?
        .get(version)?
        .get("dist")?
        .get("tarball")?
        .as_str()
}

/// Extract the recorded integrity for a specific version.
#[must_use]
pub fn get_integrity<'a>(packument: &'a Value, version: &str) -> Option<&'a str> {
    packument
        .get("versions")?
        .get(version)?
        .get("dist")?
        .get("integrity")?
        .as_str()
}

/// Get all available version strings from a packument.
#[must_use]
pub fn get_versions(packument: &Value) -> Vec<&str> {
    packument
        .get("versions")
        .and_then(|v| v.as_object())
        .map(|obj| obj.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Resolve a version range against a packument.
///
/// # Rules
/// - If `range` is `None` or a dist-tag name, returns the tagged version
/// - If `range` is an exact version, returns it if present
/// - If `range` is a semver range, returns the highest satisfying version
/// - Supports OR ranges like `^1.0.0 || ^2.0.0`
///
/// # Errors
/// Returns an error if no version satisfies the range.
pub fn resolve_version(packument: &Value, range: Option<&str>) -> Result<String, StoreError> {
    let name = packument
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    let Some(range) = range else {
        return get_latest_version(packument)
            .map(String::from)
            .ok_or_else(|| StoreError::version_not_found(name, "latest"));
    };

    // Dist-tag ("latest", "next", ...).
    if let Some(tagged) = packument
        .get("dist-tags")
        .and_then(|t| t.get(range))
        .and_then(Value::as_str)
    {
        return Ok(tagged.to_string());
    }

    let versions = get_versions(packument);

    // Exact version fast path.
    if Version::parse(range).is_ok() && versions.contains(&range) {
        return Ok(range.to_string());
    }

    let mut parsed: Vec<Version> = versions.iter().filter_map(|v| Version::parse(v).ok()).collect();
    parsed.sort_by(|a, b| b.cmp(a));

    if range.contains("||") {
        return resolve_or_range(name, range, &parsed);
    }

    let req = parse_range(name, range)?;
    for version in &parsed {
        if req.matches(version) {
            return Ok(version.to_string());
        }
    }

    Err(StoreError::version_not_found(name, range))
}

/// Resolve an OR range like `^1.0.0 || ^2.0.0`: the highest version
/// matching any alternative wins.
fn resolve_or_range(name: &str, range: &str, versions: &[Version]) -> Result<String, StoreError> {
    let reqs: Vec<VersionReq> = range
        .split("||")
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map(|alt| parse_range(name, alt))
        .collect::<Result<_, _>>()?;

    for version in versions {
        if reqs.iter().any(|req| req.matches(version)) {
            return Ok(version.to_string());
        }
    }

    Err(StoreError::version_not_found(name, range))
}

fn parse_range(name: &str, range: &str) -> Result<VersionReq, StoreError> {
    // npm's bare wildcard forms.
    let normalized = match range.trim() {
        "" | "*" | "x" | "X" => "*",
        other => other,
    };
    VersionReq::parse(normalized)
        .map_err(|e| StoreError::bad_pref(format!("Invalid range '{range}' for {name}: {e}")))
}
