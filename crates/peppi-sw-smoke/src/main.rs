//! Peppi service worker smoke harness
//!
//! Runs install and activate against a live origin, optionally downloads an
//! offline manifest, fires a background sync and prints a JSON summary of
//! the resulting cache state on stdout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use peppi_common::{init_logging, LogConfig, LogFormat};
use peppi_net::{FetcherConfig, HttpFetcher};
use peppi_sw::{
    CacheBackend, ClientRegistry, ClientType, MemoryCacheStorage, NotificationCenter,
    OfflineManifest, ServiceWorker, WorkerConfig, WorkerEvent, WorkerHost, WorkerMessage,
};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "peppi-sw-smoke")]
#[command(about = "Install the Peppi service worker against a live origin and report its caches")]
#[command(version)]
struct Args {
    /// Worker config (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Offline manifest (JSON) to download after activation
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Log output: pretty, compact or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Debug logging with source locations
    #[arg(short, long)]
    verbose: bool,

    /// Filter directives, e.g. "peppi_sw=trace,reqwest=warn"
    #[arg(long)]
    log_filter: Option<String>,
}

/// Wall-clock timings per harness step.
#[derive(Default)]
struct StepTimings {
    steps: BTreeMap<&'static str, Duration>,
}

impl StepTimings {
    async fn time<T, F>(&mut self, step: &'static str, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let start = Instant::now();
        let result = work.await;
        self.steps.insert(step, start.elapsed());
        result
    }

    fn summary(&self) -> serde_json::Value {
        let steps: serde_json::Map<String, serde_json::Value> = self
            .steps
            .iter()
            .map(|(step, elapsed)| {
                let ms = (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
                (step.to_string(), json!(ms))
            })
            .collect();
        serde_json::Value::Object(steps)
    }
}

fn load_manifest(path: &Path) -> Result<OfflineManifest> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing manifest {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    if let Some(directives) = &args.log_filter {
        log_config = log_config.with_directives(directives.as_str());
    }
    init_logging(log_config.with_format(args.log_format));

    let config = match args.config.as_deref() {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    let manifest = args.manifest.as_deref().map(load_manifest).transpose()?;

    let storage = Arc::new(MemoryCacheStorage::new());
    let clients = Arc::new(ClientRegistry::new());
    let worker = ServiceWorker::new(
        config,
        WorkerHost {
            cache: storage.clone(),
            fetcher: Arc::new(HttpFetcher::new(FetcherConfig::default())?),
            clients: clients.clone(),
            notifier: Arc::new(NotificationCenter::new()),
        },
    )?;

    let (tab, mut inbox) = clients
        .connect(worker.config().resolve("/")?, ClientType::Window)
        .await;
    info!(origin = %worker.config().origin, client = %tab.id, "Starting smoke run");

    let mut timings = StepTimings::default();
    let install = timings
        .time("install", worker.dispatch(WorkerEvent::Install).complete())
        .await;
    if let Err(err) = &install {
        error!(error = %err, "Install failed");
    }

    let download = match (&install, manifest) {
        (Ok(_), Some(manifest)) => {
            let report = timings.time("download", worker.download(&manifest)).await?;
            Some(json!({
                "cached": report.cached,
                "total": report.total,
                "failed": report.failed,
            }))
        }
        _ => None,
    };

    if install.is_ok() {
        let tag = worker.config().sync_tag.clone();
        timings
            .time("sync", worker.dispatch(WorkerEvent::Sync { tag }).complete())
            .await?;
    }

    let mut progress_events = 0;
    let mut sync_events = 0;
    while let Ok(message) = inbox.try_recv() {
        match message {
            WorkerMessage::DownloadProgress(_) => progress_events += 1,
            WorkerMessage::SyncComplete { .. } => sync_events += 1,
        }
    }

    let mut caches = serde_json::Map::new();
    for name in storage.names().await? {
        let entries = storage.entry_count(&name).await;
        caches.insert(name, json!(entries));
    }

    let summary = json!({
        "origin": worker.config().origin,
        "state": format!("{:?}", worker.state().await),
        "install": install.as_ref().map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string()),
        "caches": caches,
        "usage_bytes": storage.usage().await,
        "download": download,
        "progress_events": progress_events,
        "sync_events": sync_events,
        "timings_ms": timings.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    install.context("service worker install failed")?;
    Ok(())
}
