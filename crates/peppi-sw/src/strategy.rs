//! Request classification and the two caching strategies.

use http::Method;
use peppi_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use url::{Origin, Url};

use crate::cache::{CacheHandle, CacheManager};
use crate::error::SwResult;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve from cache, go to the network only on a miss.
    CacheFirst,
    /// Go to the network, fall back to cache only when it fails.
    NetworkFirst,
}

/// Route table entry: requests whose path starts with `prefix` use `strategy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub strategy: Strategy,
}

impl RouteRule {
    pub fn network_first(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            strategy: Strategy::NetworkFirst,
        }
    }

    pub fn cache_first(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            strategy: Strategy::CacheFirst,
        }
    }
}

/// Why a request is left to the network untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    NonGet,
    CrossOrigin,
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PassThrough(PassReason),
    Handle(Strategy),
}

/// Chooses a strategy for each same-origin GET.
#[derive(Debug, Clone)]
pub struct StrategyRouter {
    origin: Origin,
    rules: Vec<RouteRule>,
    default: Strategy,
}

impl StrategyRouter {
    /// Create a router for `scope`'s origin. The longest matching prefix wins;
    /// unmatched requests are served cache-first.
    pub fn new(scope: &Url, mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            origin: scope.origin(),
            rules,
            default: Strategy::CacheFirst,
        }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn classify(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            return Route::PassThrough(PassReason::NonGet);
        }
        if request.url.origin() != self.origin {
            return Route::PassThrough(PassReason::CrossOrigin);
        }

        let path = request.url.path();
        let strategy = self
            .rules
            .iter()
            .find(|rule| path.starts_with(&rule.prefix))
            .map(|rule| rule.strategy)
            .unwrap_or(self.default);
        Route::Handle(strategy)
    }
}

/// Serve from `cache` when possible; otherwise fetch and cache.
///
/// When the network fails for a navigation, `offline_fallback` is served from
/// the same cache if present. Any other failure is returned to the caller.
pub async fn cache_first(
    manager: &CacheManager,
    cache: &CacheHandle,
    fetcher: &dyn Fetcher,
    request: &Request,
    offline_fallback: Option<&Url>,
) -> SwResult<Response> {
    if let Some(cached) = cache.match_request(request).await? {
        trace!(url = %request.url, "Cache hit");
        return Ok(cached);
    }

    match fetcher.fetch(request).await {
        Ok(response) => {
            manager
                .put_if_successful(cache, request, &response)
                .await?;
            Ok(response)
        }
        Err(err) => {
            if request.is_navigation() {
                if let Some(fallback) = offline_fallback {
                    if let Some(page) = cache.match_url(fallback).await? {
                        debug!(url = %request.url, fallback = %fallback, "Serving offline page");
                        return Ok(page);
                    }
                }
            }
            warn!(url = %request.url, error = %err, "Fetch failed with no cached copy");
            Err(err.into())
        }
    }
}

/// Fetch first, keeping `cache` warm; fall back to the cached copy on failure.
pub async fn network_first(
    manager: &CacheManager,
    cache: &CacheHandle,
    fetcher: &dyn Fetcher,
    request: &Request,
) -> SwResult<Response> {
    match fetcher.fetch(request).await {
        Ok(response) => {
            manager
                .put_if_successful(cache, request, &response)
                .await?;
            Ok(response)
        }
        Err(err) => match cache.match_request(request).await? {
            Some(cached) => {
                debug!(url = %request.url, error = %err, "Network failed, serving cached copy");
                Ok(cached)
            }
            None => {
                warn!(url = %request.url, error = %err, "Network failed with no cached copy");
                Err(err.into())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheIdentity, MemoryCacheStorage};
    use crate::error::SwError;
    use crate::test_support::{url, ScriptedFetcher, ORIGIN};
    use http::StatusCode;
    use peppi_net::RequestMode;
    use std::sync::Arc;

    fn router() -> StrategyRouter {
        StrategyRouter::new(
            &Url::parse(ORIGIN).unwrap(),
            vec![
                RouteRule::network_first("/api/"),
                RouteRule::cache_first("/api/static/"),
            ],
        )
    }

    async fn static_cache() -> (CacheManager, CacheHandle) {
        let manager = CacheManager::new(Arc::new(MemoryCacheStorage::new()));
        let cache = manager.open(&CacheIdentity::new("app", "v1")).await.unwrap();
        (manager, cache)
    }

    #[test]
    fn test_classify() {
        let router = router();

        assert_eq!(
            router.classify(&Request::get(url("/api/lessons"))),
            Route::Handle(Strategy::NetworkFirst)
        );
        assert_eq!(
            router.classify(&Request::get(url("/stories/elephant"))),
            Route::Handle(Strategy::CacheFirst)
        );
        assert_eq!(
            router.classify(&Request::get(url("/api/static/alphabet.json"))),
            Route::Handle(Strategy::CacheFirst)
        );
    }

    #[test]
    fn test_rules_longest_prefix_first() {
        let router = router();
        let prefixes: Vec<&str> = router
            .rules()
            .iter()
            .map(|rule| rule.prefix.as_str())
            .collect();
        assert_eq!(prefixes, vec!["/api/static/", "/api/"]);
    }

    #[test]
    fn test_classify_pass_through() {
        let router = router();

        let post = Request::get(url("/api/progress")).method(Method::POST);
        assert_eq!(router.classify(&post), Route::PassThrough(PassReason::NonGet));

        let cdn = Request::get(Url::parse("https://cdn.example.com/font.woff2").unwrap())
            .mode(RequestMode::NoCors);
        assert_eq!(
            router.classify(&cdn),
            Route::PassThrough(PassReason::CrossOrigin)
        );
    }

    #[tokio::test]
    async fn test_cache_first_fetches_once() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new().respond("/app.js", 200, "console.log(1)");
        let request = Request::get(url("/app.js"));

        let first = cache_first(&manager, &cache, &fetcher, &request, None)
            .await
            .unwrap();
        let second = cache_first(&manager, &cache, &fetcher, &request, None)
            .await
            .unwrap();

        assert_eq!(first.body, second.body);
        assert_eq!(fetcher.calls("/app.js"), 1);
    }

    #[tokio::test]
    async fn test_cache_first_server_error_not_cached() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new().respond("/icon-192.png", 500, "");
        let request = Request::get(url("/icon-192.png"));

        let response = cache_first(&manager, &cache, &fetcher, &request, Some(&url("/")))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(cache.match_request(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_first_navigation_fallback() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new().respond("/", 200, "<html>home</html>");
        cache_first(&manager, &cache, &fetcher, &Request::get(url("/")), None)
            .await
            .unwrap();

        fetcher.set_offline(true);
        let navigation = Request::navigate(url("/lessons/7"));
        let page = cache_first(&manager, &cache, &fetcher, &navigation, Some(&url("/")))
            .await
            .unwrap();
        assert_eq!(page.text().unwrap(), "<html>home</html>");

        let image = Request::get(url("/images/tiger.png"));
        let result = cache_first(&manager, &cache, &fetcher, &image, Some(&url("/"))).await;
        assert!(matches!(result, Err(SwError::Network(_))));
    }

    #[tokio::test]
    async fn test_cache_first_navigation_without_fallback_fails() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new();

        let navigation = Request::navigate(url("/lessons/7"));
        let result = cache_first(&manager, &cache, &fetcher, &navigation, Some(&url("/"))).await;
        assert!(matches!(result, Err(SwError::Network(_))));
    }

    #[tokio::test]
    async fn test_network_first_always_fetches() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new().respond("/api/lessons", 200, "[1,2]");
        let request = Request::get(url("/api/lessons"));

        network_first(&manager, &cache, &fetcher, &request)
            .await
            .unwrap();
        network_first(&manager, &cache, &fetcher, &request)
            .await
            .unwrap();

        assert_eq!(fetcher.calls("/api/lessons"), 2);
    }

    #[tokio::test]
    async fn test_network_first_offline_fallback() {
        let (manager, cache) = static_cache().await;
        let fetcher = ScriptedFetcher::new().respond("/api/lessons", 200, "[1,2]");
        let request = Request::get(url("/api/lessons"));

        network_first(&manager, &cache, &fetcher, &request)
            .await
            .unwrap();
        fetcher.set_offline(true);

        let cached = network_first(&manager, &cache, &fetcher, &request)
            .await
            .unwrap();
        assert_eq!(cached.status, StatusCode::OK);
        assert_eq!(cached.text().unwrap(), "[1,2]");

        let uncached = Request::get(url("/api/badges"));
        let result = network_first(&manager, &cache, &fetcher, &uncached).await;
        assert!(matches!(result, Err(SwError::Network(_))));
    }
}
