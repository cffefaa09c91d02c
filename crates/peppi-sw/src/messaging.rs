//! The command channel between pages and the worker, client enumeration,
//! and push notifications.
//!
//! ```text
//! page ── {type: "CACHE_CONTENT", payload} ──→ ClientMessage ──→ worker
//! worker ── WorkerMessage ──→ broadcast ──→ every window client
//! push server ── PushPayload ──→ Notification ──→ Notifier
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::offline::{DownloadProgress, OfflineManifest};

// ==================== Protocol ====================

/// Why a page message could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Commands sent by pages to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `{ type: "SKIP_WAITING" }`
    SkipWaiting,
    /// `{ type: "CACHE_CONTENT", payload: { stories, audioFiles, images } }`
    CacheContent(OfflineManifest),
    /// `{ type: "CLEAR_CACHE", payload: "<package id>" }`
    ClearCache(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: JsonValue,
}

impl ClientMessage {
    pub fn parse(value: &JsonValue) -> Result<Self, MessageError> {
        let raw = RawMessage::deserialize(value)
            .map_err(|e| MessageError::Malformed(e.to_string()))?;

        match raw.kind.as_str() {
            "SKIP_WAITING" => Ok(Self::SkipWaiting),
            "CACHE_CONTENT" => serde_json::from_value(raw.payload)
                .map(Self::CacheContent)
                .map_err(|e| MessageError::Malformed(format!("CACHE_CONTENT: {e}"))),
            "CLEAR_CACHE" => match raw.payload {
                JsonValue::String(package_id) => Ok(Self::ClearCache(package_id)),
                other => Err(MessageError::Malformed(format!(
                    "CLEAR_CACHE expects a string payload, got {other}"
                ))),
            },
            _ => Err(MessageError::UnknownType(raw.kind)),
        }
    }

    /// The wire form of this command.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::SkipWaiting => serde_json::json!({ "type": "SKIP_WAITING" }),
            Self::CacheContent(manifest) => {
                serde_json::json!({ "type": "CACHE_CONTENT", "payload": manifest })
            }
            Self::ClearCache(package_id) => {
                serde_json::json!({ "type": "CLEAR_CACHE", "payload": package_id })
            }
        }
    }
}

/// Events the worker sends to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SyncComplete { timestamp: String },
    DownloadProgress(DownloadProgress),
}

// ==================== Clients ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A page (or worker) the service worker can talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Whether this worker intercepts the client's requests.
    pub controlled: bool,
}

/// Options for `match_all`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Client enumeration and delivery primitive.
#[async_trait]
pub trait Clients: Send + Sync {
    async fn match_all(&self, options: ClientMatchOptions) -> Vec<ClientInfo>;

    async fn post_message(&self, client_id: &str, message: &WorkerMessage) -> SwResult<()>;

    async fn focus(&self, client_id: &str) -> SwResult<ClientInfo>;

    async fn open_window(&self, url: &Url) -> SwResult<ClientInfo>;

    /// Take control of every open client. Returns how many were claimed.
    async fn claim(&self) -> SwResult<usize>;
}

struct ClientSlot {
    info: ClientInfo,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// In-process [`Clients`] implementation. Each connected client receives
/// worker messages on its own channel.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientSlot>>,
    opened: RwLock<Vec<(ClientInfo, mpsc::UnboundedReceiver<WorkerMessage>)>>,
    claimed: AtomicBool,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client showing `url`.
    ///
    /// Clients connecting after a claim are controlled from the start.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (ClientInfo, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = ClientInfo {
            id: next_client_id(),
            url,
            client_type,
            focused: false,
            controlled: self.claimed.load(Ordering::SeqCst),
        };
        self.clients.write().await.insert(
            info.id.clone(),
            ClientSlot {
                info: info.clone(),
                tx,
            },
        );
        debug!(client = %info.id, url = %info.url, "Client connected");
        (info, rx)
    }

    pub async fn disconnect(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients
            .write()
            .await
            .remove(client_id)
            .map(|slot| slot.info)
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|slot| slot.info.clone())
    }

    /// Windows opened by the worker, with their message receivers.
    pub async fn take_opened(&self) -> Vec<(ClientInfo, mpsc::UnboundedReceiver<WorkerMessage>)> {
        std::mem::take(&mut *self.opened.write().await)
    }
}

#[async_trait]
impl Clients for ClientRegistry {
    async fn match_all(&self, options: ClientMatchOptions) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        let mut matched: Vec<ClientInfo> = clients
            .values()
            .map(|slot| &slot.info)
            .filter(|info| options.include_uncontrolled || info.controlled)
            .filter(|info| match options.client_type {
                ClientType::All => true,
                t => info.client_type == t,
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    async fn post_message(&self, client_id: &str, message: &WorkerMessage) -> SwResult<()> {
        let clients = self.clients.read().await;
        let slot = clients
            .get(client_id)
            .ok_or_else(|| SwError::Client(format!("no such client: {client_id}")))?;
        slot.tx
            .send(message.clone())
            .map_err(|_| SwError::Client(format!("client {client_id} has gone away")))
    }

    async fn focus(&self, client_id: &str) -> SwResult<ClientInfo> {
        let mut clients = self.clients.write().await;
        let slot = clients
            .get(client_id)
            .ok_or_else(|| SwError::Client(format!("no such client: {client_id}")))?;
        if slot.info.client_type != ClientType::Window {
            return Err(SwError::Client(
                "Can only focus window clients".to_string(),
            ));
        }

        for slot in clients.values_mut() {
            slot.info.focused = slot.info.id == client_id;
        }
        clients
            .get(client_id)
            .map(|slot| slot.info.clone())
            .ok_or_else(|| SwError::Client(format!("no such client: {client_id}")))
    }

    async fn open_window(&self, url: &Url) -> SwResult<ClientInfo> {
        let (info, rx) = self.connect(url.clone(), ClientType::Window).await;
        let info = self.focus(&info.id).await?;
        info!(client = %info.id, url = %url, "Opened window");
        self.opened.write().await.push((info.clone(), rx));
        Ok(info)
    }

    async fn claim(&self) -> SwResult<usize> {
        self.claimed.store(true, Ordering::SeqCst);
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for slot in clients.values_mut() {
            if !slot.info.controlled {
                slot.info.controlled = true;
                claimed += 1;
            }
        }
        Ok(claimed)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Deliver `message` to every controlled window client. Returns how many
/// clients received it; delivery failures are logged and skipped.
pub async fn broadcast(clients: &dyn Clients, message: &WorkerMessage) -> usize {
    let targets = clients.match_all(ClientMatchOptions::default()).await;
    let mut delivered = 0;
    for client in &targets {
        match clients.post_message(&client.id, message).await {
            Ok(()) => delivered += 1,
            Err(err) => warn!(client = %client.id, error = %err, "Failed to post message"),
        }
    }
    debug!(delivered, total = targets.len(), ?message, "Broadcast");
    delivered
}

/// Focus a window already showing `target`, or open a new one.
pub async fn focus_or_open(clients: &dyn Clients, target: &Url) -> SwResult<ClientInfo> {
    let windows = clients
        .match_all(ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        })
        .await;

    match windows.iter().find(|client| &client.url == target) {
        Some(existing) => clients.focus(&existing.id).await,
        None => clients.open_window(target).await,
    }
}

// ==================== Notifications ====================

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// JSON body of a push message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
}

impl PushPayload {
    /// Parse push data; `None` for absent or malformed payloads.
    pub fn parse(data: Option<&[u8]>) -> Option<Self> {
        let data = data?;
        match serde_json::from_slice(data) {
            Ok(payload) => Some(payload),
            Err(err) => {
                debug!(error = %err, "Ignoring malformed push payload");
                None
            }
        }
    }
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Opened when the notification is clicked.
    pub url: String,
    pub actions: Vec<NotificationAction>,
}

/// Notification-display primitive.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: Notification) -> SwResult<()>;
}

/// In-process [`Notifier`] that records what was shown.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: RwLock<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shown(&self) -> Vec<Notification> {
        self.shown.read().await.clone()
    }
}

#[async_trait]
impl Notifier for NotificationCenter {
    async fn show(&self, notification: Notification) -> SwResult<()> {
        info!(title = %notification.title, "Showing notification");
        self.shown.write().await.push(notification);
        Ok(())
    }
}
