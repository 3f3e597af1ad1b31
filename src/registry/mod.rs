//! Periodic + on-demand enabled-channel snapshot rebuild (C4).
//!
//! The registry is the single writer of the snapshot vector; every other
//! component only ever reads it via `snapshots()`. Reloads are watermark-gated
//! on `channel.updated_at` so repeated ticks with no DB change are free.

pub mod repository;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub use repository::{ChannelRepository, InMemoryChannelRepository, PgChannelRepository};

use crate::snapshot::ChannelSnapshot;

/// Process-wide flag, per SPEC_FULL.md §9 ("Global mutable state"): tests
/// flip this so `async_reload` becomes synchronous-and-inert instead of
/// racing the assertions that follow it.
static ASYNC_RELOAD_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disables (or re-enables) `ChannelRegistry::async_reload` process-wide.
/// Intended for test setup only.
pub fn set_async_reload_disabled_for_tests(disabled: bool) {
    ASYNC_RELOAD_DISABLED.store(disabled, Ordering::SeqCst);
}

fn async_reload_disabled() -> bool {
    ASYNC_RELOAD_DISABLED.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub reload_interval: Duration,
    pub async_reload_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(60),
            async_reload_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ChannelRegistry {
    repo: Arc<dyn ChannelRepository>,
    snapshots: ArcSwap<Vec<Arc<ChannelSnapshot>>>,
    watermark: Mutex<Option<DateTime<Utc>>>,
    config: RegistryConfig,
}

impl ChannelRegistry {
    pub fn new(repo: Arc<dyn ChannelRepository>, config: RegistryConfig) -> Self {
        Self {
            repo,
            snapshots: ArcSwap::from_pointee(Vec::new()),
            watermark: Mutex::new(None),
            config,
        }
    }

    /// Current enabled-channel snapshot vector, ordered by descending
    /// `ordering_weight` (the order the repository returned them in).
    pub fn snapshots(&self) -> Arc<Vec<Arc<ChannelSnapshot>>> {
        self.snapshots.load_full()
    }

    pub fn find(&self, channel_id: i64) -> Option<Arc<ChannelSnapshot>> {
        self.snapshots()
            .iter()
            .find(|s| s.channel.id == channel_id)
            .cloned()
    }

    /// Runs once at startup to populate the snapshot before serving traffic.
    pub async fn load_initial(&self) -> anyhow::Result<()> {
        self.force_reload().await.map(|_| ())
    }

    /// Resets the watermark and reloads unconditionally. Used by
    /// `async_reload` and by operator-triggered "refresh now" calls.
    pub async fn force_reload(&self) -> anyhow::Result<bool> {
        *self.watermark.lock().unwrap() = None;
        self.reload_if_needed().await
    }

    /// Step 1-4 of SPEC_FULL.md §4.3. Returns `Ok(false)` without touching
    /// the snapshot when the DB watermark hasn't advanced (idempotent skip).
    /// On any failure the previous snapshot is left untouched -- the new
    /// vector is only ever stored after it is built completely.
    pub async fn reload_if_needed(&self) -> anyhow::Result<bool> {
        let latest = self.repo.max_updated_at().await?;
        let current = *self.watermark.lock().unwrap();

        match (latest, current) {
            (Some(latest), Some(current)) if latest <= current => return Ok(false),
            (None, Some(_)) => return Ok(false),
            _ => {}
        }

        let channels = self.repo.list_enabled_ordered().await?;
        let mut snapshots = Vec::with_capacity(channels.len());
        for channel in channels {
            let prices = self.repo.model_prices(channel.id).await?;
            snapshots.push(Arc::new(ChannelSnapshot::build(channel, prices)));
        }

        let count = snapshots.len();
        self.snapshots.store(Arc::new(snapshots));
        *self.watermark.lock().unwrap() = latest;
        info!(channel_count = count, "channel registry snapshot reloaded");
        Ok(true)
    }

    /// Fires a detached, timeout-bounded reload. Tokio isolates panics to
    /// the spawned task (the panic-guard SPEC_FULL.md §4.3 asks for) without
    /// taking down the caller. A no-op when the process-level test flag is
    /// set, so unit tests can assert on deterministic state.
    pub fn async_reload(self: &Arc<Self>) {
        if async_reload_disabled() {
            return;
        }
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = registry.config.async_reload_timeout;
            match tokio::time::timeout(timeout, registry.force_reload()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "async channel reload failed"),
                Err(_) => warn!(?timeout, "async channel reload timed out"),
            }
        });
    }

    /// Spawns the every-`reload_interval` background tick. The returned
    /// handle is owned by the caller (typically `GatewayCore::start`) so it
    /// can be aborted on shutdown.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reload_interval);
            ticker.tick().await; // first tick fires immediately; skip it, load_initial covers startup
            loop {
                ticker.tick().await;
                if let Err(err) = self.reload_if_needed().await {
                    warn!(error = %err, "scheduled channel reload failed; keeping previous snapshot");
                }
            }
        })
    }
}
