//! Bulk download of content packages into the offline cache.

use std::sync::Arc;

use peppi_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheIdentity, CacheManager};
use crate::error::{SwError, SwResult};
use crate::messaging::{broadcast, Clients, WorkerMessage};

/// URLs of one content package, grouped the way the app sends them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfflineManifest {
    pub stories: Vec<String>,
    pub audio_files: Vec<String>,
    pub images: Vec<String>,
}

impl OfflineManifest {
    /// Every URL in download order: stories, then audio, then images.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.stories
            .iter()
            .chain(&self.audio_files)
            .chain(&self.images)
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stories.len() + self.audio_files.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Running count broadcast after every download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub cached: usize,
    pub total: usize,
}

/// Outcome of a whole manifest download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub cached: usize,
    pub total: usize,
    pub failed: Vec<String>,
}

/// How a package id selects offline cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageMatch {
    /// The id appears anywhere in the URL.
    #[default]
    Substring,
    /// The id equals one path segment of the URL.
    PathSegment,
}

impl PackageMatch {
    pub fn matches(&self, url: &str, package_id: &str) -> bool {
        match self {
            PackageMatch::Substring => url.contains(package_id),
            PackageMatch::PathSegment if package_id.is_empty() => false,
            PackageMatch::PathSegment => Url::parse(url)
                .ok()
                .and_then(|url| {
                    url.path_segments()
                        .map(|mut segments| segments.any(|s| s == package_id))
                })
                .unwrap_or(false),
        }
    }
}

/// Fetches manifests into the offline cache and removes packages from it.
#[derive(Clone)]
pub struct OfflineDownloader {
    manager: CacheManager,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn Clients>,
    cache: CacheIdentity,
    origin: Url,
    package_match: PackageMatch,
}

impl OfflineDownloader {
    pub fn new(
        manager: CacheManager,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn Clients>,
        cache: CacheIdentity,
        origin: Url,
        package_match: PackageMatch,
    ) -> Self {
        Self {
            manager,
            fetcher,
            clients,
            cache,
            origin,
            package_match,
        }
    }

    /// Download every manifest URL, one at a time.
    ///
    /// A failed URL is logged and skipped. Progress is broadcast after every
    /// attempt, so clients see exactly `manifest.len()` progress events.
    pub async fn download(&self, manifest: &OfflineManifest) -> SwResult<DownloadReport> {
        let cache = self.manager.open(&self.cache).await?;
        let mut report = DownloadReport {
            total: manifest.len(),
            ..Default::default()
        };

        info!(cache = %cache.name(), total = report.total, "Caching offline content");

        for raw in manifest.urls() {
            let attempt = match self.origin.join(raw) {
                Ok(url) => {
                    self.manager
                        .add(&cache, self.fetcher.as_ref(), &Request::get(url))
                        .await
                }
                Err(e) => Err(SwError::config(format!("bad URL {raw:?}: {e}"))),
            };

            match attempt {
                Ok(()) => {
                    report.cached += 1;
                    debug!(url = %raw, "Cached offline asset");
                }
                Err(err) => {
                    warn!(url = %raw, error = %err, "Failed to cache offline asset");
                    report.failed.push(raw.to_string());
                }
            }

            let progress = DownloadProgress {
                cached: report.cached,
                total: report.total,
            };
            broadcast(self.clients.as_ref(), &WorkerMessage::DownloadProgress(progress)).await;
        }

        info!(
            cached = report.cached,
            failed = report.failed.len(),
            "Offline download finished"
        );
        Ok(report)
    }

    /// Delete every offline entry belonging to `package_id`. Returns how many
    /// entries were removed.
    pub async fn clear_package(&self, package_id: &str) -> SwResult<usize> {
        let cache = self.manager.open(&self.cache).await?;
        let mut removed = 0;
        for key in cache.keys().await? {
            if self.package_match.matches(&key.url, package_id) && cache.delete(&key).await? {
                removed += 1;
            }
        }

        info!(package = %package_id, removed, "Cleared offline package");
        Ok(removed)
    }
}
