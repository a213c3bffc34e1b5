//! One-stop composition of the cache subsystems.
//!
//! Hosts construct a [`CacheContext`] at startup and hand its pieces to the
//! layers that need them: the canvas renderer reads from the pyramid, the
//! import path registers resources and assets, and the idle hook drives
//! quality-tier generation and budget cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::budget::{
    BudgetConfig, CleanupConfig, DegradationController, MemoryBudgetManager,
};
use crate::cache::pyramid::PyramidConfig;
use crate::cache::{DiskTierStore, ResourceCache, ThumbnailPyramidCache, TierStore};
use crate::pipeline::idle::{DEFAULT_TICK_PERIOD, IdleScheduler};
use crate::pipeline::scheduler::{ProgressObserver, SchedulerConfig};
use crate::remote::{RemoteConfig, RemoteFallbackLoader, TierFetcher};
use crate::stats::{CacheSnapshot, StatsCollector};
use crate::types::ContentHash;

/// Configuration for the full cache stack.
pub struct ContextConfig {
    pub pyramid: PyramidConfig,
    pub scheduler: SchedulerConfig,
    pub budget: BudgetConfig,
    pub cleanup: CleanupConfig,
    /// Root directory for the durable tier store; `None` disables persistence.
    pub persistence_dir: Option<PathBuf>,
    /// Asset server fallback; `None` keeps generation fully local.
    pub remote: Option<RemoteConfig>,
    pub progress: Option<Arc<dyn ProgressObserver>>,
    /// Fallback idle tick period, used until a host idle signal is wired;
    /// `None` leaves idle ticks entirely to the host.
    pub idle_tick_period: Option<Duration>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pyramid: PyramidConfig::default(),
            scheduler: SchedulerConfig::default(),
            budget: BudgetConfig::default(),
            cleanup: CleanupConfig::default(),
            persistence_dir: None,
            remote: None,
            progress: None,
            idle_tick_period: Some(DEFAULT_TICK_PERIOD),
        }
    }
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("pyramid", &self.pyramid)
            .field("scheduler", &self.scheduler)
            .field("budget", &self.budget)
            .field("cleanup", &self.cleanup)
            .field("persistence_dir", &self.persistence_dir)
            .field("remote", &self.remote)
            .field("idle_tick_period", &self.idle_tick_period)
            .finish_non_exhaustive()
    }
}

/// Owns every cache subsystem and the wiring between them.
pub struct CacheContext {
    resources: Arc<ResourceCache>,
    stats: Arc<StatsCollector>,
    idle: Arc<IdleScheduler>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    pyramid: ThumbnailPyramidCache,
    budget: Arc<MemoryBudgetManager>,
    degradation: DegradationController,
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("pyramid", &self.pyramid)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl CacheContext {
    /// Build the full stack. Must run inside a tokio runtime unless
    /// `idle_tick_period` is `None`: without a host idle signal, the
    /// fallback timer is what unparks quality-tier work and cleanup.
    pub fn new(config: ContextConfig) -> crate::Result<Self> {
        let resources = Arc::new(ResourceCache::new());
        let stats = Arc::new(StatsCollector::new());
        let idle = IdleScheduler::new();
        let idle_timer = Mutex::new(config.idle_tick_period.map(|period| idle.spawn_timer(period)));

        let persistence: Option<Arc<dyn TierStore>> = match config.persistence_dir {
            Some(dir) => Some(Arc::new(DiskTierStore::new(dir)?)),
            None => None,
        };
        let remote: Option<Arc<dyn TierFetcher>> = match config.remote {
            Some(remote) => Some(Arc::new(RemoteFallbackLoader::new(remote)?)),
            None => None,
        };

        let pyramid = ThumbnailPyramidCache::new(
            config.pyramid,
            config.scheduler,
            Arc::clone(&resources),
            Arc::clone(&idle),
            persistence,
            remote,
            config.progress,
            Some(Arc::clone(&stats)),
        );

        let budget = Arc::new(MemoryBudgetManager::new(config.budget));
        let degradation = DegradationController::new(
            Arc::clone(&budget),
            Arc::clone(&resources),
            Arc::clone(&idle),
            config.cleanup,
        );

        Ok(Self { resources, stats, idle, idle_timer, pyramid, budget, degradation })
    }

    pub fn resources(&self) -> &Arc<ResourceCache> {
        &self.resources
    }

    pub fn pyramid(&self) -> &ThumbnailPyramidCache {
        &self.pyramid
    }

    pub fn budget(&self) -> &Arc<MemoryBudgetManager> {
        &self.budget
    }

    pub fn degradation(&self) -> &DegradationController {
        &self.degradation
    }

    pub fn idle(&self) -> &Arc<IdleScheduler> {
        &self.idle
    }

    /// Signal one idle window; parked quality-tier work and cleanup
    /// continuations resume.
    pub fn tick_idle(&self) {
        self.idle.tick();
    }

    /// Stop the fallback idle timer. Call once the host drives idle windows
    /// itself through [`CacheContext::tick_idle`].
    pub fn disable_idle_fallback(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
        }
    }

    /// Drop one reference to a resource. When the last holder lets go, the
    /// hash's cached and persisted tiers are purged along with the entry.
    pub async fn release_resource(&self, hash: &ContentHash) -> crate::Result<()> {
        if self.resources.remove_reference(hash) {
            self.pyramid.purge(hash).await?;
        }
        Ok(())
    }

    /// Point-in-time statistics with pyramid and pipeline gauges refreshed.
    pub fn snapshot(&self) -> CacheSnapshot {
        let scheduler = self.pyramid.scheduler();
        self.stats.update_pipeline_depth(scheduler.in_flight(), scheduler.queued());
        self.stats.snapshot()
    }
}

impl Drop for CacheContext {
    fn drop(&mut self) {
        self.disable_idle_fallback();
    }
}
