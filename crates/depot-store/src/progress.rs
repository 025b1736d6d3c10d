//! Structured progress events.
//!
//! Delivery is fire-and-forget: the bus invokes reporters inline and
//! expects them not to block. Anything slow belongs on the reporter's own
//! channel.

use std::sync::{Arc, RwLock};
use tracing::debug;

/// Progress of one package through the store pipeline.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A wanted dependency was resolved to an identity.
    Resolved { pkg_id: String },
    /// The package was not usable from the store; a fetch is starting.
    ResolvingContent { pkg_id: String },
    /// A trusted store entry was reused without fetching.
    FoundInStore { pkg_id: String },
    /// A download attempt started.
    FetchingStarted {
        pkg_id: String,
        size: Option<u64>,
        attempt: u32,
    },
    /// Bytes arrived.
    FetchingProgress { pkg_id: String, downloaded: u64 },
    /// The package was unpacked and published.
    Fetched { pkg_id: String },
    /// The fetch failed.
    Error {
        pkg_id: String,
        code: &'static str,
        message: String,
    },
}

impl ProgressEvent {
    /// The identity the event refers to.
    #[must_use]
    pub fn pkg_id(&self) -> &str {
        match self {
            Self::Resolved { pkg_id }
            | Self::ResolvingContent { pkg_id }
            | Self::FoundInStore { pkg_id }
            | Self::FetchingStarted { pkg_id, .. }
            | Self::FetchingProgress { pkg_id, .. }
            | Self::Fetched { pkg_id }
            | Self::Error { pkg_id, .. } => pkg_id,
        }
    }

    /// Machine-readable status name, mirroring the variant.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::ResolvingContent { .. } => "resolving_content",
            Self::FoundInStore { .. } => "found_in_store",
            Self::FetchingStarted { .. } => "fetching_started",
            Self::FetchingProgress { .. } => "fetching_progress",
            Self::Fetched { .. } => "fetched",
            Self::Error { .. } => "error",
        }
    }
}

/// Receives progress events. Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Fan-out bus for [`ProgressEvent`]s.
#[derive(Clone, Default)]
pub struct ProgressBus {
    reporters: Arc<RwLock<Vec<Arc<dyn ProgressReporter>>>>,
}

impl ProgressBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reporter for all future events.
    pub fn subscribe(&self, reporter: Arc<dyn ProgressReporter>) {
        self.reporters
            .write()
            .expect("progress bus poisoned")
            .push(reporter);
    }

    /// Deliver an event to every reporter.
    pub fn emit(&self, event: &ProgressEvent) {
        debug!(status = event.status(), pkg_id = event.pkg_id(), "store progress");
        let reporters = self.reporters.read().expect("progress bus poisoned");
        for reporter in reporters.iter() {
            reporter.on_event(event);
        }
    }
}
