#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Content-addressed package store.
//!
//! Given a wanted dependency, the store resolves it to a concrete
//! identity, fetches its content if not already present, verifies
//! integrity, unpacks it into a canonical layout, and hands back a handle
//! with three independently-settled futures. Concurrent requests for the
//! same identity coalesce onto a single fetch.

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod index;
pub mod integrity;
pub mod manifest;
pub mod packument;
pub mod progress;
pub mod queue;
pub mod resolve;
pub mod store;
pub mod tarball;

pub use config::{FetchOptions, RetryPolicy, StoreConfig};
pub use error::{codes as error_codes, StoreError};
pub use fetch::{FetchedFiles, Fetcher, FetcherRegistry};
pub use index::{identity_to_path, IndexEntry, StoreIndex};
pub use integrity::{Algorithm, EntryIntegrity, FileIntegrity, Integrity};
pub use manifest::PackageManifest;
pub use progress::{ProgressBus, ProgressEvent, ProgressReporter};
pub use queue::RequestQueue;
pub use resolve::{
    Resolution, ResolveContext, Resolver, ResolverRegistry, ResolveResult, WantedDependency,
};
pub use store::{
    Completable, FetchHandle, FetchLocker, FilesResult, LocalPackage, PackageStore, StoreResponse,
};
