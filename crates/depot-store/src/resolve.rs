//! Resolution: mapping a wanted dependency to a package identity and a
//! description of where its content lives.
//!
//! Resolvers are probed in registration order; the first one that claims a
//! pref owns it. Built-ins cover local directories, git prefs, direct
//! tarball URLs, and registry `name@range` prefs.

use crate::client::HttpClient;
use crate::error::StoreError;
use crate::manifest::{read_manifest, PackageManifest};
use crate::packument::{
    get_integrity, get_latest_version, get_tarball_url, resolve_version, MetaCache,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A dependency as requested by the caller. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedDependency {
    /// The caller's preferred name, when the pref alone does not name the
    /// package (e.g. a bare range from a dependencies map).
    pub alias: Option<String>,
    /// Opaque reference: version range, URL, or path.
    pub pref: String,
}

impl WantedDependency {
    #[must_use]
    pub fn new(pref: impl Into<String>) -> Self {
        Self {
            alias: None,
            pref: pref.into(),
        }
    }

    #[must_use]
    pub fn aliased(alias: impl Into<String>, pref: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            pref: pref.into(),
        }
    }
}

/// A resolution produced by an extension resolver; carried opaquely and
/// dispatched to fetchers by its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionResolution {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(flatten)]
    pub data: Value,
}

/// Where a resolved package's content comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Resolution {
    Tarball {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        integrity: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
    },
    Git {
        repo: String,
        commit: String,
    },
    Directory {
        path: PathBuf,
    },
    #[serde(untagged)]
    Other(ExtensionResolution),
}

impl Resolution {
    /// The tag fetchers dispatch on.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Tarball { .. } => "tarball",
            Self::Git { .. } => "git",
            Self::Directory { .. } => "directory",
            Self::Other(ext) => &ext.type_tag,
        }
    }
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    /// Canonical package identity; the store key.
    pub id: String,
    pub resolution: Resolution,
    /// Manifest, when the resolver already has it (registry metadata,
    /// local directory).
    pub manifest: Option<PackageManifest>,
    /// The registry's latest version, when known.
    pub latest: Option<String>,
    pub normalized_pref: Option<String>,
}

/// Everything a resolver may consult.
pub struct ResolveContext {
    pub client: Arc<HttpClient>,
    /// Effective registry for this request.
    pub registry: Url,
    pub meta_cache: MetaCache,
    pub offline: bool,
    /// Base directory for relative local paths.
    pub prefix: PathBuf,
    /// Priority for metadata requests.
    pub download_priority: i32,
}

/// A single resolution strategy.
pub trait Resolver: Send + Sync {
    /// Whether this resolver owns the pref. First claimant wins.
    fn claims(&self, wanted: &WantedDependency) -> bool;

    fn resolve<'a>(
        &'a self,
        wanted: &'a WantedDependency,
        ctx: &'a ResolveContext,
    ) -> BoxFuture<'a, Result<ResolveResult, StoreError>>;
}

/// Ordered resolver dispatch.
pub struct ResolverRegistry {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self {
            resolvers: vec![
                Arc::new(DirectoryResolver),
                Arc::new(GitResolver),
                Arc::new(TarballUrlResolver),
                Arc::new(RegistryResolver),
            ],
        }
    }
}

impl ResolverRegistry {
    /// Append a resolver, probed after the built-ins.
    pub fn register(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.push(resolver);
    }

    /// Resolve `wanted` with the first claiming resolver.
    ///
    /// # Errors
    /// `BAD_PREF` when no resolver claims the pref; otherwise whatever the
    /// owning resolver reports.
    pub async fn resolve(
        &self,
        wanted: &WantedDependency,
        ctx: &ResolveContext,
    ) -> Result<ResolveResult, StoreError> {
        let resolver = self
            .resolvers
            .iter()
            .find(|r| r.claims(wanted))
            .ok_or_else(|| {
                StoreError::bad_pref(format!("Cannot interpret pref '{}'", wanted.pref))
            })?;
        resolver.resolve(wanted, ctx).await
    }
}

/// Resolves `link:` / `file:` / plain-path prefs to a local directory.
pub struct DirectoryResolver;

fn local_path_of(pref: &str) -> Option<&str> {
    pref.strip_prefix("link:")
        .or_else(|| pref.strip_prefix("file:"))
        .or_else(|| {
            (pref.starts_with("./")
                || pref.starts_with("../")
                || pref.starts_with('/')
                || pref == "."
                || pref == "..")
                .then_some(pref)
        })
}

impl Resolver for DirectoryResolver {
    fn claims(&self, wanted: &WantedDependency) -> bool {
        local_path_of(&wanted.pref).is_some()
    }

    fn resolve<'a>(
        &'a self,
        wanted: &'a WantedDependency,
        ctx: &'a ResolveContext,
    ) -> BoxFuture<'a, Result<ResolveResult, StoreError>> {
        async move {
            let rel = local_path_of(&wanted.pref)
                .ok_or_else(|| StoreError::bad_pref(format!("Not a local pref: {}", wanted.pref)))?;
            let path = if PathBuf::from(rel).is_absolute() {
                PathBuf::from(rel)
            } else {
                ctx.prefix.join(rel)
            };
            let manifest = read_manifest(&path).await?;
            let id = format!("file:{rel}");
            Ok(ResolveResult {
                id,
                resolution: Resolution::Directory { path },
                manifest: Some(manifest),
                latest: None,
                normalized_pref: Some(format!("file:{rel}")),
            })
        }
        .boxed()
    }
}

/// Parses `git+<url>#<commit>` prefs. Checkout mechanics live in a fetcher
/// registered by the caller.
pub struct GitResolver;

impl Resolver for GitResolver {
    fn claims(&self, wanted: &WantedDependency) -> bool {
        wanted.pref.starts_with("git+") || wanted.pref.starts_with("git://")
    }

    fn resolve<'a>(
        &'a self,
        wanted: &'a WantedDependency,
        _ctx: &'a ResolveContext,
    ) -> BoxFuture<'a, Result<ResolveResult, StoreError>> {
        async move {
            let pref = wanted.pref.strip_prefix("git+").unwrap_or(&wanted.pref);
            let (repo, commit) = pref.split_once('#').ok_or_else(|| {
                StoreError::bad_pref(format!(
                    "Git pref '{}' must pin a commit after '#'",
                    wanted.pref
                ))
            })?;
            if commit.is_empty() {
                return Err(StoreError::bad_pref(format!(
                    "Git pref '{}' has an empty commit",
                    wanted.pref
                )));
            }

            let repo_url = Url::parse(repo)
                .map_err(|e| StoreError::bad_pref(format!("Invalid git URL '{repo}': {e}")))?;
            let host = repo_url.host_str().unwrap_or("local");
            let repo_path = repo_url.path().trim_matches('/').trim_end_matches(".git");
            let id = format!("{host}/{repo_path}/{commit}");

            Ok(ResolveResult {
                id,
                resolution: Resolution::Git {
                    repo: repo.to_string(),
                    commit: commit.to_string(),
                },
                manifest: None,
                latest: None,
                normalized_pref: Some(wanted.pref.clone()),
            })
        }
        .boxed()
    }
}

/// Resolves direct `https://...tgz` prefs.
pub struct TarballUrlResolver;

impl Resolver for TarballUrlResolver {
    fn claims(&self, wanted: &WantedDependency) -> bool {
        (wanted.pref.starts_with("http://") || wanted.pref.starts_with("https://"))
            && (wanted.pref.ends_with(".tgz")
                || wanted.pref.ends_with(".tar.gz")
                || wanted.pref.ends_with(".tar"))
    }

    fn resolve<'a>(
        &'a self,
        wanted: &'a WantedDependency,
        _ctx: &'a ResolveContext,
    ) -> BoxFuture<'a, Result<ResolveResult, StoreError>> {
        async move {
            let url = Url::parse(&wanted.pref)
                .map_err(|e| StoreError::bad_pref(format!("Invalid tarball URL: {e}")))?;
            let host = url
                .host_str()
                .ok_or_else(|| StoreError::bad_pref("Tarball URL has no host"))?;
            let id = format!("{host}{}", url.path());

            Ok(ResolveResult {
                id,
                resolution: Resolution::Tarball {
                    url: wanted.pref.clone(),
                    integrity: None,
                    registry: None,
                },
                manifest: None,
                latest: None,
                normalized_pref: Some(wanted.pref.clone()),
            })
        }
        .boxed()
    }
}

/// Resolves `name@range` prefs against the registry.
pub struct RegistryResolver;

/// A parsed registry pref: package name plus optional range.
#[derive(Debug, PartialEq, Eq)]
struct RegistrySpec {
    name: String,
    range: Option<String>,
}

fn looks_like_range(pref: &str) -> bool {
    pref.is_empty()
        || pref == "*"
        || pref.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '^' | '~' | '>' | '<' | '='))
}

fn parse_registry_pref(wanted: &WantedDependency) -> Option<RegistrySpec> {
    // A bare range with an alias: `{ alias: "foo", pref: "^1.0.0" }`.
    if let Some(alias) = &wanted.alias {
        if looks_like_range(&wanted.pref) {
            return Some(RegistrySpec {
                name: alias.clone(),
                range: if wanted.pref.is_empty() {
                    None
                } else {
                    Some(wanted.pref.clone())
                },
            });
        }
    }

    let pref = wanted.pref.as_str();
    let (name, range) = if let Some(rest) = pref.strip_prefix('@') {
        // Scoped: the version delimiter is the `@` after the slash.
        let slash = rest.find('/')?;
        if slash == 0 {
            return None;
        }
        match rest[slash + 1..].find('@') {
            Some(at) => {
                let split = 1 + slash + 1 + at;
                (&pref[..split], Some(&pref[split + 1..]))
            }
            None => (pref, None),
        }
    } else {
        match pref.find('@') {
            Some(at) => (&pref[..at], Some(&pref[at + 1..])),
            None => (pref, None),
        }
    };

    if name.is_empty() || range == Some("") {
        return None;
    }
    let bare = name.strip_prefix('@').map_or(name, |rest| {
        rest.split_once('/').map_or(rest, |(_, n)| n)
    });
    if bare.is_empty()
        || !bare
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return None;
    }

    Some(RegistrySpec {
        name: name.to_string(),
        range: range.map(str::to_string),
    })
}

/// URL-encode a package name for registry requests (`/` in scopes becomes
/// `%2F`).
fn encode_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

impl RegistryResolver {
    async fn packument(
        wanted_name: &str,
        ctx: &ResolveContext,
    ) -> Result<Arc<Value>, StoreError> {
        {
            let cache = ctx.meta_cache.read().await;
            if let Some(cached) = cache.get(wanted_name) {
                return Ok(Arc::clone(cached));
            }
        }

        if ctx.offline {
            return Err(StoreError::offline_miss(wanted_name));
        }

        let url = ctx.registry.join(&encode_name(wanted_name)).map_err(|e| {
            StoreError::bad_pref(format!("Failed to build URL for '{wanted_name}': {e}"))
        })?;
        let packument = Arc::new(
            ctx.client
                .get_json(&url, ctx.download_priority)
                .await?,
        );

        let mut cache = ctx.meta_cache.write().await;
        Ok(Arc::clone(
            cache
                .entry(wanted_name.to_string())
                .or_insert(packument),
        ))
    }
}

impl Resolver for RegistryResolver {
    fn claims(&self, wanted: &WantedDependency) -> bool {
        parse_registry_pref(wanted).is_some()
    }

    fn resolve<'a>(
        &'a self,
        wanted: &'a WantedDependency,
        ctx: &'a ResolveContext,
    ) -> BoxFuture<'a, Result<ResolveResult, StoreError>> {
        async move {
            let spec = parse_registry_pref(wanted).ok_or_else(|| {
                StoreError::bad_pref(format!("Not a registry pref: {}", wanted.pref))
            })?;

            let packument = Self::packument(&spec.name, ctx).await?;
            let version = resolve_version(&packument, spec.range.as_deref())?;
            debug!(name = %spec.name, version = %version, "resolved registry dependency");

            let version_data = packument
                .get("versions")
                .and_then(|v| v.get(&version))
                .ok_or_else(|| StoreError::version_not_found(&spec.name, &version))?;
            let manifest = PackageManifest::from_value(version_data.clone()).map_err(|e| {
                StoreError::resolver_failure(&wanted.pref, e)
            })?;

            let tarball = get_tarball_url(&packument, &version)
                .ok_or_else(|| {
                    StoreError::resolver_failure(
                        &wanted.pref,
                        format!("No tarball recorded for {}@{version}", spec.name),
                    )
                })?
                .to_string();
            let integrity = get_integrity(&packument, &version).map(str::to_string);

            let host = ctx.registry.host_str().unwrap_or("registry");
            let id = format!("{host}/{}/{version}", spec.name);

            Ok(ResolveResult {
                id,
                resolution: Resolution::Tarball {
                    url: tarball,
                    integrity,
                    registry: Some(ctx.registry.to_string()),
                },
                manifest: Some(manifest),
                latest: get_latest_version(&packument).map(str::to_string),
                normalized_pref: Some(format!(
                    "{}@{}",
                    spec.name,
                    spec.range.as_deref().unwrap_or("latest")
                )),
            })
        }
        .boxed()
    }
}
