//! Install / activate state machine.
//!
//! ```text
//! Parsed ──install──→ Installing ──ok──→ Waiting ──activate──→ Activating ──→ Active
//!                          │
//!                          └──failed──→ Redundant
//! ```

use peppi_net::{Fetcher, Request};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::cache::{CacheIdentity, CacheManager};
use crate::error::{SwError, SwResult};
use crate::messaging::Clients;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Script evaluated, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting to take over.
    Waiting,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Active,
    /// Install failed or replaced.
    Redundant,
}

/// Current state plus whether a skip-waiting request is pending.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: WorkerState,
    skip_waiting: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }

    fn transition(&mut self, from: WorkerState, to: WorkerState) -> SwResult<()> {
        if self.state != from {
            return Err(SwError::state(format!(
                "cannot move to {to:?} from {:?}",
                self.state
            )));
        }
        self.set_state(to);
        Ok(())
    }

    pub fn begin_install(&mut self) -> SwResult<()> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)
    }

    pub fn install_succeeded(&mut self) -> SwResult<()> {
        self.transition(WorkerState::Installing, WorkerState::Waiting)
    }

    pub fn install_failed(&mut self) {
        self.set_state(WorkerState::Redundant);
    }

    /// Request activation without waiting. Returns true when the worker is
    /// waiting and should activate now.
    pub fn skip_waiting(&mut self) -> bool {
        self.skip_waiting = true;
        self.state == WorkerState::Waiting
    }

    /// Start activating. `Ok(false)` when activation already ran or is running.
    pub fn begin_activate(&mut self) -> SwResult<bool> {
        match self.state {
            WorkerState::Waiting => {
                self.set_state(WorkerState::Activating);
                Ok(true)
            }
            WorkerState::Activating | WorkerState::Active => Ok(false),
            other => Err(SwError::state(format!("cannot activate from {other:?}"))),
        }
    }

    pub fn activate_succeeded(&mut self) -> SwResult<()> {
        self.transition(WorkerState::Activating, WorkerState::Active)
    }

    /// Return to waiting so activation can be retried.
    pub fn activate_failed(&mut self) {
        if self.state == WorkerState::Activating {
            self.set_state(WorkerState::Waiting);
        }
    }
}

/// Runs the install and activate steps against the caches.
#[derive(Debug, Default)]
pub struct LifecycleController {
    lifecycle: Mutex<Lifecycle>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.lock().await.state()
    }

    pub async fn snapshot(&self) -> Lifecycle {
        self.lifecycle.lock().await.clone()
    }

    /// Open the static cache and store every bootstrap URL. Any failure fails
    /// the install and leaves the worker redundant.
    pub async fn install(
        &self,
        manager: &CacheManager,
        fetcher: &dyn Fetcher,
        static_cache: &CacheIdentity,
        bootstrap: &[Request],
    ) -> SwResult<()> {
        self.lifecycle.lock().await.begin_install()?;

        let result = async {
            let cache = manager.open(static_cache).await?;
            manager.add_all(&cache, fetcher, bootstrap).await
        }
        .await;

        let mut lifecycle = self.lifecycle.lock().await;
        match result {
            Ok(count) => {
                lifecycle.install_succeeded()?;
                info!(cache = %static_cache, count, "Installed bootstrap assets");
                Ok(())
            }
            Err(err) => {
                lifecycle.install_failed();
                error!(cache = %static_cache, error = %err, "Install failed");
                Err(err)
            }
        }
    }

    /// See [`Lifecycle::skip_waiting`].
    pub async fn skip_waiting(&self) -> bool {
        self.lifecycle.lock().await.skip_waiting()
    }

    /// Delete stale caches, then claim all clients. Returns false if the
    /// worker was already active.
    pub async fn activate(
        &self,
        manager: &CacheManager,
        clients: &dyn Clients,
        retain: &[CacheIdentity],
    ) -> SwResult<bool> {
        if !self.lifecycle.lock().await.begin_activate()? {
            debug!("Worker already active");
            return Ok(false);
        }

        let result = async {
            let deleted = manager.evict_stale_stores(retain).await?;
            let claimed = clients.claim().await?;
            Ok::<_, SwError>((deleted, claimed))
        }
        .await;

        let mut lifecycle = self.lifecycle.lock().await;
        match result {
            Ok((deleted, claimed)) => {
                lifecycle.activate_succeeded()?;
                info!(deleted = deleted.len(), claimed, "Worker activated");
                Ok(true)
            }
            Err(err) => {
                lifecycle.activate_failed();
                error!(error = %err, "Activation failed");
                Err(err)
            }
        }
    }
}
