//! # Repost Offline Worker
//!
//! The offline caching layer of the Repost dashboard, modelled on a browser
//! service worker: every request the dashboard makes is classified and routed
//! through a caching policy, cache generations are versioned and pruned on
//! activation, and background sync, push and control messages are handled on
//! their own event paths.
//!
//! ## Features
//!
//! - **Cache storage**: named cache generations over memory or disk
//! - **Routing**: network-first for the API, cache-first for static assets,
//!   offline fallback for navigations, share-target interception
//! - **Lifecycle**: install (pre-warm), activate (prune, claim), skip-waiting
//! - **Background events**: sync tags, push notifications, notification clicks
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (WorkerRecord → OfflineWorker)
//!     │       └── lifecycle transitions
//!     ├── CacheStorage (memory | disk)
//!     │       └── Cache → RequestKey → CacheEntry
//!     ├── Clients
//!     └── Notifications
//!
//! OfflineWorker::on_fetch
//!     └── classify() → RequestClass
//!             ├── Api         → policy::network_first
//!             ├── Navigation  → policy::navigate_with_fallback
//!             ├── Static      → policy::cache_first
//!             ├── ShareTarget → share::handle_share_target
//!             └── Ignored     → passthrough
//! ```

use thiserror::Error;

pub mod background;
pub mod cache;
pub mod classify;
pub mod clients;
pub mod config;
pub mod disk;
pub mod lifecycle;
pub mod message;
pub mod notifications;
pub mod policy;
pub mod share;
pub mod sync;
pub mod worker;

pub use background::{LoggingSyncRunner, NotificationClick, PushPayload, SyncTag, SyncTaskRunner};
pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage, RequestKey};
pub use classify::{classify, RequestClass};
pub use clients::{Client, ClientType, Clients};
pub use config::{CacheGeneration, NotificationConfig, WorkerConfig};
pub use disk::DiskCacheStorage;
pub use lifecycle::{
    ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};
pub use message::{ControlAction, WorkerMessage};
pub use notifications::{Notification, NotificationAction, NotificationData, Notifications};
pub use policy::{FetchResponse, ResponseSource};
pub use share::{ContentIntake, ShareRecord};
pub use sync::{SyncManager, SyncReport};
pub use worker::{FetchOutcome, HostContext, OfflineWorker, OfflineWorkerBuilder};

use repost_common::RepostError;
use repost_net::NetError;

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    #[error("Invalid cache name: {0}")]
    InvalidCacheName(String),

    #[error("Precache failed for {url}: {reason}")]
    Precache { url: String, reason: String },

    #[error("State error: {0}")]
    State(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Share target error: {0}")]
    Share(String),

    #[error("Sync task '{tag}' failed: {source}")]
    Sync {
        tag: String,
        #[source]
        source: SyncError,
    },
}

/// Failures reported by a [`SyncTaskRunner`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The backend could not be reached; the platform should try again later.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered and refused the work; retrying will not help.
    #[error("backend rejected sync with status {0}")]
    Rejected(u16),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Rejected(_))
    }
}

/// Result type alias for worker operations.
pub type SwResult<T> = Result<T, SwError>;

impl From<SwError> for RepostError {
    fn from(err: SwError) -> Self {
        match err {
            SwError::Network(e) => RepostError::network_with_source("fetch failed", e),
            SwError::Io(e) => RepostError::Io(e),
            SwError::Config(msg) => RepostError::config(msg),
            SwError::InvalidUrl(e) => RepostError::config(format!("invalid URL: {e}")),
            e @ (SwError::Cache(_)
            | SwError::CacheNotFound(_)
            | SwError::InvalidCacheName(_)
            | SwError::Serialization(_)) => RepostError::cache_with_source("cache storage", e),
            e @ (SwError::Precache { .. } | SwError::State(_) | SwError::Sync { .. }) => {
                RepostError::lifecycle_with_source("worker lifecycle", e)
            }
            SwError::Share(msg) => RepostError::InvalidArgument(msg),
        }
    }
}
