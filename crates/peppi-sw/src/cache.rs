//! Named cache stores and the manager that writes to them.
//!
//! ```text
//! CacheManager
//!     │
//!     ├── open(identity) ──→ CacheHandle ("app-v1")
//!     │                          └── RequestKey → CachedResponse
//!     │
//!     └── evict_stale_stores(retain)
//!
//! CacheBackend (open / get / put / delete / keys / names / delete_store)
//!     └── MemoryCacheStorage
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use peppi_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use crate::error::{CacheError, SwError, SwResult};

// ==================== Identity ====================

/// A versioned cache store name such as `app-v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheIdentity {
    pub prefix: String,
    pub version: String,
}

impl CacheIdentity {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    /// The store name used with the backend.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.version)
    }
}

impl FromStr for CacheIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('-') {
            Some((prefix, version)) if !prefix.is_empty() && !version.is_empty() => {
                Ok(Self::new(prefix, version))
            }
            _ => Err(format!("cache identity must look like <name>-<version>: {s:?}")),
        }
    }
}

impl TryFrom<String> for CacheIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheIdentity> for String {
    fn from(identity: CacheIdentity) -> Self {
        identity.to_string()
    }
}

// ==================== Entries ====================

/// Lookup key of a cache entry: method plus URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }
}

/// An immutable copy of a response taken at cache-write time.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Snapshot a response.
    pub fn snapshot(response: &Response) -> Self {
        Self {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: peppi_common::epoch_millis(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Approximate storage footprint in bytes.
    pub fn size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        (self.body.len() + headers + self.url.as_str().len()) as u64
    }
}

// ==================== Backend ====================

/// Key-value store primitive holding named caches.
///
/// Implementations must tolerate interleaved calls from concurrent event
/// handlers; atomicity is only required per key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the named store if it does not exist.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Entry for `key`. Fails with [`CacheError::Unavailable`] when the
    /// store does not exist.
    async fn get(&self, name: &str, key: &RequestKey)
        -> Result<Option<CachedResponse>, CacheError>;

    /// Insert or replace an entry, creating the store if needed.
    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: CachedResponse,
    ) -> Result<(), CacheError>;

    /// Fails with [`CacheError::Unavailable`] when the store does not exist.
    async fn delete(&self, name: &str, key: &RequestKey) -> Result<bool, CacheError>;

    /// Keys of a store. Fails with [`CacheError::Unavailable`] when the store
    /// does not exist.
    async fn keys(&self, name: &str) -> Result<Vec<RequestKey>, CacheError>;

    /// Names of every existing store.
    async fn names(&self) -> Result<Vec<String>, CacheError>;

    async fn delete_store(&self, name: &str) -> Result<bool, CacheError>;
}

/// In-process cache storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    stores: RwLock<HashMap<String, HashMap<RequestKey, CachedResponse>>>,
    quota: Option<u64>,
}

impl MemoryCacheStorage {
    /// Create unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that rejects writes past `bytes` in total.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            quota: Some(bytes),
        }
    }

    /// Bytes currently held across all stores.
    pub async fn usage(&self) -> u64 {
        let stores = self.stores.read().await;
        stores
            .values()
            .flat_map(|store| store.values())
            .map(CachedResponse::size)
            .sum()
    }

    /// Number of entries in a store.
    pub async fn entry_count(&self, name: &str) -> usize {
        self.stores
            .read()
            .await
            .get(name)
            .map(|store| store.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn get(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CachedResponse>, CacheError> {
        let stores = self.stores.read().await;
        let store = stores
            .get(name)
            .ok_or_else(|| CacheError::Unavailable(name.to_string()))?;
        Ok(store.get(key).cloned())
    }

    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: CachedResponse,
    ) -> Result<(), CacheError> {
        let mut stores = self.stores.write().await;

        if let Some(quota) = self.quota {
            let replaced = stores
                .get(name)
                .and_then(|store| store.get(&key))
                .map(CachedResponse::size)
                .unwrap_or(0);
            let used: u64 = stores
                .values()
                .flat_map(|store| store.values())
                .map(CachedResponse::size)
                .sum::<u64>()
                - replaced;
            let needed = response.size();
            let available = quota.saturating_sub(used);
            if needed > available {
                return Err(CacheError::QuotaExceeded { needed, available });
            }
        }

        stores
            .entry(name.to_string())
            .or_default()
            .insert(key, response);
        Ok(())
    }

    async fn delete(&self, name: &str, key: &RequestKey) -> Result<bool, CacheError> {
        let mut stores = self.stores.write().await;
        let store = stores
            .get_mut(name)
            .ok_or_else(|| CacheError::Unavailable(name.to_string()))?;
        Ok(store.remove(key).is_some())
    }

    async fn keys(&self, name: &str) -> Result<Vec<RequestKey>, CacheError> {
        let stores = self.stores.read().await;
        let store = stores
            .get(name)
            .ok_or_else(|| CacheError::Unavailable(name.to_string()))?;
        Ok(store.keys().cloned().collect())
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_store(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.stores.write().await.remove(name).is_some())
    }
}

// ==================== Handle ====================

/// An opened cache store.
#[derive(Clone)]
pub struct CacheHandle {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle").field("name", &self.name).finish()
    }
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached response for a request, if any.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        self.match_key(&RequestKey::for_request(request)).await
    }

    /// Cached response for a GET of `url`, if any.
    pub async fn match_url(&self, url: &Url) -> Result<Option<Response>, CacheError> {
        self.match_key(&RequestKey::get(url)).await
    }

    async fn match_key(&self, key: &RequestKey) -> Result<Option<Response>, CacheError> {
        let hit = self.backend.get(&self.name, key).await?;
        trace!(cache = %self.name, url = %key.url, hit = hit.is_some(), "Cache lookup");
        Ok(hit.map(|entry| entry.to_response()))
    }

    /// Store a snapshot of `response` unconditionally.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        self.backend
            .put(
                &self.name,
                RequestKey::for_request(request),
                CachedResponse::snapshot(response),
            )
            .await
    }

    pub async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        self.backend.delete(&self.name, key).await
    }

    pub async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        self.backend.keys(&self.name).await
    }
}

// ==================== Manager ====================

/// Decides whether a response is worth caching.
pub type SuccessPredicate = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Opens stores, writes entries and evicts stale generations.
#[derive(Clone)]
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    is_success: SuccessPredicate,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager").finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a manager that caches 2xx responses.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            is_success: Arc::new(|status: StatusCode| status.is_success()),
        }
    }

    /// Replace the success predicate.
    pub fn with_success_predicate(
        mut self,
        predicate: impl Fn(StatusCode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_success = Arc::new(predicate);
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn is_success(&self, response: &Response) -> bool {
        (self.is_success)(response.status)
    }

    /// Open (creating if absent) the store for `identity`.
    pub async fn open(&self, identity: &CacheIdentity) -> Result<CacheHandle, CacheError> {
        let name = identity.name();
        self.backend.open(&name).await?;
        Ok(CacheHandle {
            name,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Cache a snapshot of `response` if it is a successful answer to a GET.
    ///
    /// Returns whether anything was written.
    pub async fn put_if_successful(
        &self,
        cache: &CacheHandle,
        request: &Request,
        response: &Response,
    ) -> Result<bool, CacheError> {
        if request.method != Method::GET || !self.is_success(response) {
            trace!(
                cache = %cache.name,
                url = %request.url,
                status = %response.status,
                "Not caching response"
            );
            return Ok(false);
        }

        cache.put(request, response).await?;
        debug!(cache = %cache.name, url = %request.url, "Cached response");
        Ok(true)
    }

    /// Fetch `request` and store the result; a non-success status is an error.
    pub async fn add(
        &self,
        cache: &CacheHandle,
        fetcher: &dyn Fetcher,
        request: &Request,
    ) -> SwResult<()> {
        let response = fetcher.fetch(request).await?;
        if !self.is_success(&response) {
            return Err(SwError::BadStatus {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        cache.put(request, &response).await?;
        Ok(())
    }

    /// Fetch every request, then store them all. Nothing is written unless
    /// every fetch succeeds.
    pub async fn add_all(
        &self,
        cache: &CacheHandle,
        fetcher: &dyn Fetcher,
        requests: &[Request],
    ) -> SwResult<usize> {
        let mut fetched = Vec::with_capacity(requests.len());
        for request in requests {
            let response = fetcher.fetch(request).await?;
            if !self.is_success(&response) {
                return Err(SwError::BadStatus {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            fetched.push((request, response));
        }

        for (request, response) in &fetched {
            cache.put(request, response).await?;
        }
        Ok(fetched.len())
    }

    /// Delete every store whose name is not in `retain`.
    pub async fn evict_stale_stores(
        &self,
        retain: &[CacheIdentity],
    ) -> Result<Vec<String>, CacheError> {
        let keep: Vec<String> = retain.iter().map(CacheIdentity::name).collect();
        let mut deleted = Vec::new();

        for name in self.backend.names().await? {
            if keep.contains(&name) {
                continue;
            }
            if self.backend.delete_store(&name).await? {
                info!(cache = %name, "Deleted stale cache");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{url, ScriptedFetcher};
    use http::{HeaderName, HeaderValue};

    fn manager() -> (Arc<MemoryCacheStorage>, CacheManager) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let manager = CacheManager::new(storage.clone());
        (storage, manager)
    }

    fn ok(path: &str, body: &str) -> Response {
        Response::new(url(path), StatusCode::OK).with_body(body.to_string())
    }

    #[test]
    fn test_identity_round_trip() {
        let identity: CacheIdentity = "bhashamitra-static-v3".parse().unwrap();
        assert_eq!(identity.prefix, "bhashamitra-static");
        assert_eq!(identity.version, "v3");
        assert_eq!(identity.name(), "bhashamitra-static-v3");

        assert!("app".parse::<CacheIdentity>().is_err());
        assert!("-v1".parse::<CacheIdentity>().is_err());
    }

    #[test]
    fn test_identity_serde_as_string() {
        let identity = CacheIdentity::new("offline", "v1");
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, "\"offline-v1\"");
        let back: CacheIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }

    #[test]
    fn test_request_key_drops_fragment() {
        let a = RequestKey::get(&url("/stories/1#page-2"));
        let b = RequestKey::get(&url("/stories/1"));
        assert_eq!(a, b);
        assert_ne!(a, RequestKey::new(Method::POST, &url("/stories/1")));
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (storage, manager) = manager();
        let identity = CacheIdentity::new("app", "v1");

        manager.open(&identity).await.unwrap();
        let cache = manager.open(&identity).await.unwrap();
        cache
            .put(&Request::get(url("/")), &ok("/", "home"))
            .await
            .unwrap();
        manager.open(&identity).await.unwrap();

        assert_eq!(storage.names().await.unwrap(), vec!["app-v1".to_string()]);
        assert_eq!(storage.entry_count("app-v1").await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_headers() {
        let (_, manager) = manager();
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();

        let request = Request::get(url("/manifest.json"));
        let response = ok("/manifest.json", "{}").with_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/manifest+json"),
        );
        cache.put(&request, &response).await.unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(
            hit.headers.get("content-type").unwrap(),
            "application/manifest+json"
        );
    }

    #[tokio::test]
    async fn test_deleted_store_is_unavailable() {
        let (storage, manager) = manager();
        let cache = manager.open(&CacheIdentity::new("app", "v0")).await.unwrap();
        let request = Request::get(url("/"));
        cache.put(&request, &ok("/", "home")).await.unwrap();

        assert!(storage.delete_store("app-v0").await.unwrap());

        assert!(matches!(
            cache.match_request(&request).await,
            Err(CacheError::Unavailable(name)) if name == "app-v0"
        ));
        assert!(matches!(cache.keys().await, Err(CacheError::Unavailable(_))));
        assert!(matches!(
            cache.delete(&RequestKey::for_request(&request)).await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(storage.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_if_successful() {
        let (storage, manager) = manager();
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();

        let request = Request::get(url("/logo.svg"));
        assert!(manager
            .put_if_successful(&cache, &request, &ok("/logo.svg", "<svg/>"))
            .await
            .unwrap());

        let missing = Request::get(url("/missing.svg"));
        let not_found = Response::new(url("/missing.svg"), StatusCode::NOT_FOUND);
        assert!(!manager
            .put_if_successful(&cache, &missing, &not_found)
            .await
            .unwrap());

        let post = Request::get(url("/api/progress")).method(Method::POST);
        assert!(!manager
            .put_if_successful(&cache, &post, &ok("/api/progress", "{}"))
            .await
            .unwrap());

        assert_eq!(storage.entry_count("app-v1").await, 1);
        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"<svg/>"));
    }

    #[tokio::test]
    async fn test_custom_success_predicate() {
        let (_, manager) = manager();
        let manager = manager.with_success_predicate(|status| status == StatusCode::OK);
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();

        let request = Request::get(url("/created"));
        let created = Response::new(url("/created"), StatusCode::CREATED);
        assert!(!manager
            .put_if_successful(&cache, &request, &created)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_quota_failure_propagates() {
        let storage = Arc::new(MemoryCacheStorage::with_quota(64));
        let manager = CacheManager::new(storage.clone());
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();

        let request = Request::get(url("/audio/lesson-1.mp3"));
        let big = ok("/audio/lesson-1.mp3", &"x".repeat(256));
        let result = manager.put_if_successful(&cache, &request, &big).await;

        assert!(matches!(result, Err(CacheError::QuotaExceeded { .. })));
        assert_eq!(storage.usage().await, 0);
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let (storage, manager) = manager();
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();
        let fetcher = ScriptedFetcher::new()
            .respond("/", 200, "home")
            .respond("/manifest.json", 404, "");

        let requests = vec![
            Request::get(url("/")),
            Request::get(url("/manifest.json")),
        ];
        let result = manager.add_all(&cache, &fetcher, &requests).await;

        assert!(matches!(result, Err(SwError::BadStatus { .. })));
        assert_eq!(storage.entry_count("app-v1").await, 0);
    }

    #[tokio::test]
    async fn test_evict_stale_stores() {
        let (storage, manager) = manager();
        for name in ["app-v0", "app-v1", "offline-v1", "legacy-cache-v9"] {
            storage.open(name).await.unwrap();
        }

        let mut deleted = manager
            .evict_stale_stores(&[
                CacheIdentity::new("app", "v1"),
                CacheIdentity::new("offline", "v1"),
            ])
            .await
            .unwrap();
        deleted.sort();

        assert_eq!(deleted, vec!["app-v0", "legacy-cache-v9"]);
        assert_eq!(
            storage.names().await.unwrap(),
            vec!["app-v1".to_string(), "offline-v1".to_string()]
        );
    }
}
