//! Worker configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheIdentity;
use crate::error::{SwError, SwResult};
use crate::offline::PackageMatch;
use crate::strategy::RouteRule;

/// Service worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker controls; relative URLs resolve against it
    pub origin: String,

    /// Versioned store for the app shell
    pub static_cache: CacheIdentity,

    /// Store for downloaded content packages
    pub offline_cache: CacheIdentity,

    /// Fetched into the static cache at install time, all or nothing
    pub bootstrap_urls: Vec<String>,

    /// Path-prefix routing; anything unmatched is cache-first
    pub routes: Vec<RouteRule>,

    /// Document served to navigations when offline
    pub offline_fallback: String,

    /// Activate right after install instead of waiting
    pub skip_waiting_on_install: bool,

    /// Background sync tag that triggers `SYNC_COMPLETE`
    pub sync_tag: String,

    /// Notification icon
    pub notification_icon: String,

    /// Notification badge
    pub notification_badge: String,

    /// How `CLEAR_CACHE` matches package ids against cached URLs
    pub package_match: PackageMatch,

    /// Look in the offline store when the static cache misses or the
    /// network fails
    pub serve_offline_packages: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000/".to_string(),
            static_cache: CacheIdentity::new("app", "v1"),
            offline_cache: CacheIdentity::new("offline", "v1"),
            bootstrap_urls: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/icon-192.png".to_string(),
                "/icon-512.png".to_string(),
            ],
            routes: vec![RouteRule::network_first("/api/")],
            offline_fallback: "/".to_string(),
            skip_waiting_on_install: true,
            sync_tag: "sync-progress".to_string(),
            notification_icon: "/icon-192.png".to_string(),
            notification_badge: "/icon-192.png".to_string(),
            package_match: PackageMatch::Substring,
            serve_offline_packages: false,
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwError::config(format!("invalid worker config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> SwResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// The parsed origin.
    pub fn origin_url(&self) -> SwResult<Url> {
        let origin = Url::parse(&self.origin)
            .map_err(|e| SwError::config(format!("bad origin {:?}: {e}", self.origin)))?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(SwError::config(format!("origin must be http(s): {origin}")));
        }
        Ok(origin)
    }

    pub fn validate(&self) -> SwResult<()> {
        self.origin_url()?;
        if self.static_cache == self.offline_cache {
            return Err(SwError::config(format!(
                "static and offline caches share the name {}",
                self.static_cache
            )));
        }
        if let Some(rule) = self.routes.iter().find(|r| !r.prefix.starts_with('/')) {
            return Err(SwError::config(format!(
                "route prefix must start with '/': {:?}",
                rule.prefix
            )));
        }
        for path in self.bootstrap_urls.iter().chain([&self.offline_fallback]) {
            self.resolve(path)?;
        }
        Ok(())
    }

    /// Resolve a possibly relative URL against the origin.
    pub fn resolve(&self, url: &str) -> SwResult<Url> {
        self.origin_url()?
            .join(url)
            .map_err(|e| SwError::config(format!("bad URL {url:?}: {e}")))
    }

    /// Caches that survive activation.
    pub fn retained_caches(&self) -> [CacheIdentity; 2] {
        [self.static_cache.clone(), self.offline_cache.clone()]
    }
}
