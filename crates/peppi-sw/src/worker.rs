//! The service worker: one owning instance per origin, driven by events.
//!
//! ```text
//! host ── WorkerEvent ──→ ServiceWorker::dispatch ──→ Dispatch
//!                                                      ├── PassThrough
//!                                                      ├── RespondWith(response future)
//!                                                      └── Extended(ExtendableEvent)
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt};
use peppi_net::{Fetcher, Request, Response};
use serde_json::Value as JsonValue;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheBackend, CacheManager};
use crate::config::WorkerConfig;
use crate::error::SwResult;
use crate::lifecycle::{LifecycleController, WorkerState};
use crate::messaging::{
    broadcast, focus_or_open, ClientInfo, ClientMessage, Clients, Notification, Notifier,
    PushPayload, WorkerMessage,
};
use crate::offline::{DownloadReport, OfflineDownloader, OfflineManifest};
use crate::strategy::{cache_first, network_first, Route, Strategy, StrategyRouter};

// ==================== Events ====================

/// Events delivered by the host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    /// A command posted by a page.
    Message(JsonValue),
    /// Raw push data, if the push carried any.
    Push(Option<Bytes>),
    NotificationClick {
        url: Option<String>,
        action: Option<String>,
    },
    Sync {
        tag: String,
    },
}

/// Lifetime token for an event. The host keeps the worker alive until
/// every registered operation has finished.
#[derive(Default)]
pub struct ExtendableEvent {
    pending: Vec<BoxFuture<'static, SwResult<()>>>,
}

impl fmt::Debug for ExtendableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the event until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = SwResult<()>> + Send + 'static,
    {
        self.pending.push(work.boxed());
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drive all pending work to completion. Returns the first error.
    pub async fn settle(self) -> SwResult<()> {
        join_all(self.pending).await.into_iter().collect()
    }
}

/// What the host should do with a dispatched event.
pub enum Dispatch {
    /// Let the request go to the network untouched.
    PassThrough,
    /// Answer the request with this response.
    RespondWith(BoxFuture<'static, SwResult<Response>>),
    /// Keep the worker alive until the event settles.
    Extended(ExtendableEvent),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::PassThrough => f.write_str("PassThrough"),
            Dispatch::RespondWith(_) => f.write_str("RespondWith(..)"),
            Dispatch::Extended(event) => f.debug_tuple("Extended").field(event).finish(),
        }
    }
}

impl Dispatch {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Dispatch::PassThrough)
    }

    /// Wait for the dispatched work. Yields the response for fetch events.
    pub async fn complete(self) -> SwResult<Option<Response>> {
        match self {
            Dispatch::PassThrough => Ok(None),
            Dispatch::RespondWith(response) => response.await.map(Some),
            Dispatch::Extended(event) => event.settle().await.map(|()| None),
        }
    }
}

// ==================== Worker ====================

/// Primitives supplied by the host environment.
#[derive(Clone)]
pub struct WorkerHost {
    pub cache: Arc<dyn CacheBackend>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clients: Arc<dyn Clients>,
    pub notifier: Arc<dyn Notifier>,
}

/// Offline caching service worker.
pub struct ServiceWorker {
    config: WorkerConfig,
    manager: CacheManager,
    router: StrategyRouter,
    lifecycle: LifecycleController,
    downloader: OfflineDownloader,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn Clients>,
    notifier: Arc<dyn Notifier>,
    bootstrap: Vec<Request>,
    offline_fallback: Url,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("origin", &self.config.origin)
            .field("static_cache", &self.config.static_cache.name())
            .field("offline_cache", &self.config.offline_cache.name())
            .finish()
    }
}

impl ServiceWorker {
    /// Validate `config` and build a worker over the host primitives.
    pub fn new(config: WorkerConfig, host: WorkerHost) -> SwResult<Arc<Self>> {
        config.validate()?;

        let bootstrap = config
            .bootstrap_urls
            .iter()
            .map(|path| config.resolve(path).map(Request::get))
            .collect::<SwResult<Vec<_>>>()?;
        let offline_fallback = config.resolve(&config.offline_fallback)?;
        let origin = config.origin_url()?;

        let manager = CacheManager::new(host.cache);
        let router = StrategyRouter::new(&origin, config.routes.clone());
        let downloader = OfflineDownloader::new(
            manager.clone(),
            host.fetcher.clone(),
            host.clients.clone(),
            config.offline_cache.clone(),
            origin,
            config.package_match,
        );

        info!(
            origin = %config.origin,
            static_cache = %config.static_cache,
            offline_cache = %config.offline_cache,
            "Service worker created"
        );

        Ok(Arc::new(Self {
            config,
            manager,
            router,
            lifecycle: LifecycleController::new(),
            downloader,
            fetcher: host.fetcher,
            clients: host.clients,
            notifier: host.notifier,
            bootstrap,
            offline_fallback,
        }))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn router(&self) -> &StrategyRouter {
        &self.router
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    /// Route an event to its handler.
    pub fn dispatch(self: &Arc<Self>, event: WorkerEvent) -> Dispatch {
        let this = Arc::clone(self);
        let mut extended = ExtendableEvent::new();

        match event {
            WorkerEvent::Fetch(request) => {
                return match self.router.classify(&request) {
                    Route::PassThrough(reason) => {
                        trace!(url = %request.url, method = %request.method, ?reason, "Not intercepted");
                        Dispatch::PassThrough
                    }
                    Route::Handle(strategy) => Dispatch::RespondWith(
                        async move { this.handle_fetch(&request, strategy).await }.boxed(),
                    ),
                };
            }
            WorkerEvent::Install => extended.wait_until(async move { this.install().await }),
            WorkerEvent::Activate => {
                extended.wait_until(async move { this.activate().await.map(|_| ()) })
            }
            WorkerEvent::Message(value) => {
                extended.wait_until(async move { this.handle_message(&value).await })
            }
            WorkerEvent::Push(data) => {
                extended.wait_until(async move { this.handle_push(data.as_deref()).await })
            }
            WorkerEvent::NotificationClick { url, action } => extended.wait_until(async move {
                this.handle_notification_click(url.as_deref(), action.as_deref())
                    .await
                    .map(|_| ())
            }),
            WorkerEvent::Sync { tag } => {
                extended.wait_until(async move { this.handle_sync(&tag).await.map(|_| ()) })
            }
        }

        Dispatch::Extended(extended)
    }

    // ==================== Lifecycle ====================

    /// Populate the static cache with the bootstrap set, then activate
    /// immediately when skip-waiting applies.
    pub async fn install(&self) -> SwResult<()> {
        self.lifecycle
            .install(
                &self.manager,
                self.fetcher.as_ref(),
                &self.config.static_cache,
                &self.bootstrap,
            )
            .await?;

        if self.config.skip_waiting_on_install {
            self.lifecycle.skip_waiting().await;
        }
        if self.lifecycle.snapshot().await.skip_waiting_requested() {
            self.activate().await?;
        }
        Ok(())
    }

    /// Delete stores outside the retain set and claim open clients.
    pub async fn activate(&self) -> SwResult<bool> {
        self.lifecycle
            .activate(
                &self.manager,
                self.clients.as_ref(),
                &self.config.retained_caches(),
            )
            .await
    }

    /// Leave the waiting state now. Returns whether activation ran.
    pub async fn skip_waiting(&self) -> SwResult<bool> {
        if self.lifecycle.skip_waiting().await {
            self.activate().await
        } else {
            debug!("Skip waiting recorded; worker is not waiting");
            Ok(false)
        }
    }

    // ==================== Handlers ====================

    /// Serve an intercepted request with `strategy` against the static cache.
    pub async fn handle_fetch(&self, request: &Request, strategy: Strategy) -> SwResult<Response> {
        let cache = self.manager.open(&self.config.static_cache).await?;
        let packages = if self.config.serve_offline_packages {
            Some(self.manager.open(&self.config.offline_cache).await?)
        } else {
            None
        };

        match strategy {
            Strategy::CacheFirst => {
                if let Some(packages) = &packages {
                    if cache.match_request(request).await?.is_none() {
                        if let Some(hit) = packages.match_request(request).await? {
                            trace!(url = %request.url, "Served from offline packages");
                            return Ok(hit);
                        }
                    }
                }
                cache_first(
                    &self.manager,
                    &cache,
                    self.fetcher.as_ref(),
                    request,
                    Some(&self.offline_fallback),
                )
                .await
            }
            Strategy::NetworkFirst => {
                match network_first(&self.manager, &cache, self.fetcher.as_ref(), request).await {
                    Err(err) if err.is_network() => match &packages {
                        Some(packages) => packages.match_request(request).await?.ok_or(err),
                        None => Err(err),
                    },
                    result => result,
                }
            }
        }
    }

    /// Run a page command. Unknown or malformed commands are logged and dropped.
    pub async fn handle_message(&self, value: &JsonValue) -> SwResult<()> {
        let message = match ClientMessage::parse(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Ignoring client message");
                return Ok(());
            }
        };

        debug!(?message, "Client message");
        match message {
            ClientMessage::SkipWaiting => {
                self.skip_waiting().await?;
            }
            ClientMessage::CacheContent(manifest) => {
                self.download(&manifest).await?;
            }
            ClientMessage::ClearCache(package_id) => {
                self.downloader.clear_package(&package_id).await?;
            }
        }
        Ok(())
    }

    /// Fetch a manifest into the offline cache.
    pub async fn download(&self, manifest: &OfflineManifest) -> SwResult<DownloadReport> {
        self.downloader.download(manifest).await
    }

    /// Show a notification for a push. Absent or malformed data is a no-op.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> SwResult<()> {
        let Some(payload) = PushPayload::parse(data) else {
            return Ok(());
        };

        let notification = Notification {
            title: payload.title,
            body: payload.body,
            icon: self.config.notification_icon.clone(),
            badge: self.config.notification_badge.clone(),
            url: payload.url.unwrap_or_else(|| "/".to_string()),
            actions: payload.actions,
        };
        if let Err(err) = self.notifier.show(notification).await {
            warn!(error = %err, "Failed to show notification");
        }
        Ok(())
    }

    /// Focus a window showing the notification's URL, or open one.
    pub async fn handle_notification_click(
        &self,
        url: Option<&str>,
        action: Option<&str>,
    ) -> SwResult<ClientInfo> {
        let target = self.config.resolve(url.unwrap_or("/"))?;
        debug!(url = %target, action = ?action, "Notification clicked");
        focus_or_open(self.clients.as_ref(), &target).await
    }

    /// Broadcast `SYNC_COMPLETE` for the configured tag. Returns how many
    /// clients were told.
    pub async fn handle_sync(&self, tag: &str) -> SwResult<usize> {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring sync with unknown tag");
            return Ok(0);
        }

        let message = WorkerMessage::SyncComplete {
            timestamp: peppi_common::iso8601_now(),
        };
        Ok(broadcast(self.clients.as_ref(), &message).await)
    }
}
