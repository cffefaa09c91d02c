//! # Peppi Service Worker
//!
//! Offline caching and sync engine behind the PeppiAcademy web app.
//!
//! ## Features
//!
//! - **Versioned caches**: `app-v1` style stores, stale versions evicted on activate
//! - **Strategies**: cache-first for static assets, network-first for API prefixes
//! - **Lifecycle**: all-or-nothing bootstrap install, skip-waiting, client claim
//! - **Offline packages**: sequential manifest download with progress broadcasts
//! - **Messaging**: `SKIP_WAITING`, `CACHE_CONTENT`, `CLEAR_CACHE` commands
//! - **Push**: notifications with focus-or-open click handling, background sync
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── StrategyRouter ──→ cache_first / network_first
//!     ├── LifecycleController
//!     ├── OfflineDownloader
//!     └── CacheManager
//!             └── CacheBackend (MemoryCacheStorage)
//!                     └── Cache
//!                             └── RequestKey → CachedResponse
//!
//! WorkerHost
//!     ├── Fetcher   (peppi-net)
//!     ├── Clients   (ClientRegistry)
//!     └── Notifier  (NotificationCenter)
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod messaging;
pub mod offline;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use cache::{
    CacheBackend, CacheHandle, CacheIdentity, CacheManager, CachedResponse, MemoryCacheStorage,
    RequestKey,
};
pub use config::WorkerConfig;
pub use error::{CacheError, SwError, SwResult};
pub use lifecycle::{Lifecycle, LifecycleController, WorkerState};
pub use messaging::{
    ClientInfo, ClientMatchOptions, ClientMessage, ClientRegistry, ClientType, Clients,
    MessageError, Notification, NotificationAction, NotificationCenter, Notifier, PushPayload,
    WorkerMessage,
};
pub use offline::{DownloadProgress, DownloadReport, OfflineDownloader, OfflineManifest, PackageMatch};
pub use strategy::{PassReason, Route, RouteRule, Strategy, StrategyRouter};
pub use worker::{Dispatch, ExtendableEvent, ServiceWorker, WorkerEvent, WorkerHost};
