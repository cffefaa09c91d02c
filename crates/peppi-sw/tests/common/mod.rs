//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use peppi_net::{Fetcher, NetError, Request, Response};
use peppi_sw::{
    ClientInfo, ClientRegistry, ClientType, MemoryCacheStorage, NotificationCenter,
    ServiceWorker, SwResult, WorkerConfig, WorkerEvent, WorkerHost, WorkerMessage,
};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const ORIGIN: &str = "https://peppi.academy/";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// A scripted origin server. Unknown paths answer 404; when offline every
/// request fails like a dropped connection.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, (u16, String)>>,
    log: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves the default bootstrap set.
    pub fn with_app_shell() -> Self {
        let network = Self::new();
        network.serve("/", 200, "<html>Peppi home</html>");
        network.serve("/manifest.json", 200, r#"{"name":"PeppiAcademy"}"#);
        network.serve("/icon-192.png", 200, "icon-192");
        network.serve("/icon-512.png", 200, "icon-512");
        network
    }

    pub fn serve(&self, path: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Requests seen for `path`, including failed ones.
    pub fn hits(&self, path: &str) -> usize {
        let key = url(path).to_string();
        self.log.lock().unwrap().iter().filter(|u| **u == key).count()
    }

    pub fn total_hits(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        self.log.lock().unwrap().push(key.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(key));
        }

        let route = self.routes.lock().unwrap().get(&key).cloned();
        let (status, body) = route.unwrap_or((404, String::new()));
        Ok(Response::new(request.url.clone(), StatusCode::from_u16(status).unwrap()).with_body(body))
    }
}

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        origin: ORIGIN.to_string(),
        ..Default::default()
    }
}

/// A worker wired to in-memory primitives.
pub struct TestApp {
    pub worker: Arc<ServiceWorker>,
    pub storage: Arc<MemoryCacheStorage>,
    pub network: Arc<FakeNetwork>,
    pub clients: Arc<ClientRegistry>,
    pub notifications: Arc<NotificationCenter>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(
            test_config(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(FakeNetwork::with_app_shell()),
        )
    }

    pub fn build(
        config: WorkerConfig,
        storage: Arc<MemoryCacheStorage>,
        network: Arc<FakeNetwork>,
    ) -> Self {
        let clients = Arc::new(ClientRegistry::new());
        let notifications = Arc::new(NotificationCenter::new());
        let worker = ServiceWorker::new(
            config,
            WorkerHost {
                cache: storage.clone(),
                fetcher: network.clone(),
                clients: clients.clone(),
                notifier: notifications.clone(),
            },
        )
        .unwrap();

        Self {
            worker,
            storage,
            network,
            clients,
            notifications,
        }
    }

    /// Installed and active.
    pub async fn installed() -> Self {
        let app = Self::new();
        app.send(WorkerEvent::Install).await.unwrap();
        app
    }

    pub async fn send(&self, event: WorkerEvent) -> SwResult<Option<Response>> {
        self.worker.dispatch(event).complete().await
    }

    pub async fn fetch(&self, request: Request) -> SwResult<Option<Response>> {
        self.send(WorkerEvent::Fetch(request)).await
    }

    pub async fn post(&self, message: JsonValue) {
        self.send(WorkerEvent::Message(message)).await.unwrap();
    }

    pub async fn open_tab(&self, path: &str) -> (ClientInfo, UnboundedReceiver<WorkerMessage>) {
        self.clients.connect(url(path), ClientType::Window).await
    }

    pub async fn static_entries(&self) -> usize {
        self.storage
            .entry_count(&self.worker.config().static_cache.name())
            .await
    }

    pub async fn offline_entries(&self) -> usize {
        self.storage
            .entry_count(&self.worker.config().offline_cache.name())
            .await
    }
}

/// Drain every message already delivered to a client.
pub fn drain(rx: &mut UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
