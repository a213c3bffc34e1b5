//! The multi-resolution tier store: lookup, byte accounting, and
//! locality-aware eviction.
//!
//! Tiers within a hash are monotonic: once present, a tier is never silently
//! replaced, only evicted together with its whole hash. The byte ledger is
//! mutated only in synchronous sections, so readers always observe it equal
//! to the sum of live tier sizes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::persist::TierStore;
use crate::cache::resource::ResourceCache;
use crate::codec::Raster;
use crate::pipeline::idle::IdleScheduler;
use crate::pipeline::scheduler::{
    GenerationScheduler, JobResult, ProgressObserver, SchedulerConfig, TierSink,
};
use crate::remote::TierFetcher;
use crate::stats::StatsCollector;
use crate::types::{ContentHash, GenerationPriority, PyramidBudget, Tier};

/// Supplies the set of hashes currently on screen (or near it). Consulted
/// once per eviction pass; never persisted.
pub trait VisibilitySource: Send + Sync {
    fn visible_hashes(&self) -> HashSet<ContentHash>;
}

/// Tuning for the pyramid store.
#[derive(Debug, Clone, Copy)]
pub struct PyramidConfig {
    pub budget: PyramidBudget,
    /// Eviction recovers down to this fraction of `max_bytes`.
    pub recovery_ratio: f32,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self { budget: PyramidBudget::default(), recovery_ratio: 0.9 }
    }
}

#[derive(Debug, Default)]
struct HashEntry {
    tiers: BTreeMap<Tier, Arc<Raster>>,
    bytes: usize,
}

#[derive(Debug)]
struct PyramidInner {
    /// Recency-ordered: front is the oldest hash, back the most recent.
    entries: LinkedHashMap<ContentHash, HashEntry>,
    current_bytes: usize,
    budget: PyramidBudget,
}

pub(crate) struct PyramidShared {
    inner: Mutex<PyramidInner>,
    recovery_ratio: f32,
    visibility: Mutex<Option<Arc<dyn VisibilitySource>>>,
    stats: Option<Arc<StatsCollector>>,
}

impl std::fmt::Debug for PyramidShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PyramidShared")
            .field("entries", &inner.entries.len())
            .field("current_bytes", &inner.current_bytes)
            .field("budget", &inner.budget)
            .finish_non_exhaustive()
    }
}

impl PyramidShared {
    fn get(&self, hash: &ContentHash, tier: Tier) -> Option<Arc<Raster>> {
        let mut inner = self.inner.lock();
        let hit = inner
            .entries
            .to_back(hash)
            .and_then(|entry| entry.tiers.get(&tier).cloned());
        drop(inner);
        if let Some(stats) = &self.stats {
            stats.record_lookup(hit.is_some());
        }
        hit
    }

    fn get_best(&self, hash: &ContentHash, target_w: u32, target_h: u32) -> Option<Arc<Raster>> {
        let target = target_w.max(target_h);
        let threshold = if target <= 128 { 0.5 } else { 0.8 };
        let wanted = (target as f32 * threshold).ceil() as u32;

        let mut inner = self.inner.lock();
        let best = inner.entries.to_back(hash).and_then(|entry| {
            entry
                .tiers
                .iter()
                .find(|(tier, _)| **tier >= wanted)
                .or_else(|| entry.tiers.iter().next_back())
                .map(|(_, raster)| Arc::clone(raster))
        });
        drop(inner);
        if let Some(stats) = &self.stats {
            stats.record_lookup(best.is_some());
        }
        best
    }

    /// Insert-if-absent; returns the raster actually stored and whether an
    /// eviction check is due.
    fn insert(&self, hash: &ContentHash, tier: Tier, raster: Arc<Raster>) -> (Arc<Raster>, bool) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(hash) {
            inner.entries.insert(hash.clone(), HashEntry::default());
        }
        let entry = inner.entries.to_back(hash).expect("entry just ensured");
        let stored = match entry.tiers.get(&tier) {
            Some(existing) => Arc::clone(existing),
            None => {
                let cost = raster.byte_size();
                entry.tiers.insert(tier, Arc::clone(&raster));
                entry.bytes += cost;
                inner.current_bytes += cost;
                raster
            }
        };
        let over = inner.current_bytes > inner.budget.max_bytes
            || inner.entries.len() > inner.budget.max_entries;
        drop(inner);
        self.publish_usage();
        (stored, over)
    }

    /// Evict whole hashes, oldest first, until back under the recovery line.
    ///
    /// Non-visible hashes go first; visible hashes are touched only when no
    /// non-visible hash remains and byte usage still exceeds the line.
    fn run_eviction(&self) {
        // Snapshot visibility before taking the ledger lock; the collaborator
        // may reach back into the cache.
        let visible = self
            .visibility
            .lock()
            .as_ref()
            .map(|source| source.visible_hashes())
            .unwrap_or_default();

        let mut inner = self.inner.lock();
        let recovery_bytes = (inner.budget.max_bytes as f64 * self.recovery_ratio as f64) as usize;
        let max_entries = inner.budget.max_entries;

        let order: Vec<ContentHash> = inner.entries.keys().cloned().collect();
        let mut evicted = 0usize;

        for hash in order.iter().filter(|hash| !visible.contains(hash)) {
            if inner.current_bytes <= recovery_bytes && inner.entries.len() <= max_entries {
                break;
            }
            if let Some(entry) = inner.entries.remove(hash) {
                inner.current_bytes -= entry.bytes;
                evicted += 1;
            }
        }

        if inner.current_bytes > recovery_bytes {
            for hash in order.iter().filter(|hash| visible.contains(hash)) {
                if inner.current_bytes <= recovery_bytes {
                    break;
                }
                if let Some(entry) = inner.entries.remove(hash) {
                    inner.current_bytes -= entry.bytes;
                    evicted += 1;
                }
            }
        }

        let (bytes, len) = (inner.current_bytes, inner.entries.len());
        drop(inner);
        if evicted > 0 {
            debug!(evicted, bytes, len, "pyramid eviction pass complete");
        }
        self.publish_usage();
    }

    fn publish_usage(&self) {
        if let Some(stats) = &self.stats {
            let inner = self.inner.lock();
            stats.update_pyramid_usage(
                inner.current_bytes as u64,
                inner.budget.max_bytes as u64,
                inner.entries.len(),
            );
        }
    }
}

impl TierSink for PyramidShared {
    fn tier(&self, hash: &ContentHash, tier: Tier) -> Option<Arc<Raster>> {
        // Internal pipeline probe: no recency refresh, no lookup counters.
        self.inner.lock().entries.get(hash).and_then(|entry| entry.tiers.get(&tier).cloned())
    }

    fn publish(&self, hash: &ContentHash, tier: Tier, raster: Arc<Raster>) -> Arc<Raster> {
        let (stored, over) = self.insert(hash, tier, raster);
        if over {
            self.run_eviction();
        }
        stored
    }
}

/// Deduplicating multi-resolution thumbnail store with a byte budget.
///
/// Composes the persistence tier, remote fallback loader, and generation
/// scheduler behind a lookup API.
pub struct ThumbnailPyramidCache {
    shared: Arc<PyramidShared>,
    scheduler: GenerationScheduler,
    persistence: Option<Arc<dyn TierStore>>,
}

impl std::fmt::Debug for ThumbnailPyramidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailPyramidCache")
            .field("shared", &self.shared)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl ThumbnailPyramidCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PyramidConfig,
        scheduler_config: SchedulerConfig,
        resources: Arc<ResourceCache>,
        idle: Arc<IdleScheduler>,
        persistence: Option<Arc<dyn TierStore>>,
        remote: Option<Arc<dyn TierFetcher>>,
        progress: Option<Arc<dyn ProgressObserver>>,
        stats: Option<Arc<StatsCollector>>,
    ) -> Self {
        let shared = Arc::new(PyramidShared {
            inner: Mutex::new(PyramidInner {
                entries: LinkedHashMap::new(),
                current_bytes: 0,
                budget: config.budget,
            }),
            recovery_ratio: config.recovery_ratio,
            visibility: Mutex::new(None),
            stats,
        });
        let scheduler = GenerationScheduler::new(
            scheduler_config,
            Arc::clone(&shared) as Arc<dyn TierSink>,
            resources,
            idle,
            persistence.clone(),
            remote,
            progress,
        );
        Self { shared, scheduler, persistence }
    }

    /// Wire the viewport-derived visibility collaborator.
    pub fn set_visibility_source(&self, source: Arc<dyn VisibilitySource>) {
        *self.shared.visibility.lock() = Some(source);
    }

    /// O(1) tier lookup; refreshes the hash's recency.
    pub fn get(&self, hash: &ContentHash, tier: Tier) -> Option<Arc<Raster>> {
        self.shared.get(hash, tier)
    }

    /// Smallest tier that satisfies the quality threshold for the target
    /// size, falling back to the largest tier present. Never upscales: a
    /// request beyond the largest tier gets that largest tier.
    pub fn get_best(&self, hash: &ContentHash, target_w: u32, target_h: u32) -> Option<Arc<Raster>> {
        self.shared.get_best(hash, target_w, target_h)
    }

    /// Idempotently trigger generation; concurrent callers share one job.
    pub fn ensure(
        &self,
        hash: ContentHash,
        source: Option<Arc<Raster>>,
        priority: GenerationPriority,
    ) -> impl std::future::Future<Output = JobResult> + Send + 'static + use<> {
        self.scheduler.ensure(hash, source, priority)
    }

    /// Insert a tier directly. Insert-if-absent; triggers an eviction check
    /// when the budget is exceeded.
    pub fn set(&self, hash: &ContentHash, tier: Tier, raster: Arc<Raster>) -> Arc<Raster> {
        self.shared.publish(hash, tier, raster)
    }

    /// Tiers currently materialized for a hash, smallest first. Does not
    /// refresh recency.
    pub fn available_tiers(&self, hash: &ContentHash) -> Vec<Tier> {
        self.shared
            .inner
            .lock()
            .entries
            .get(hash)
            .map(|entry| entry.tiers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.shared.inner.lock().entries.contains_key(hash)
    }

    /// Number of cached hashes.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().entries.is_empty()
    }

    /// Live byte ledger; always equals the sum of cached tier sizes.
    pub fn current_bytes(&self) -> usize {
        self.shared.inner.lock().current_bytes
    }

    /// Drop every cached and persisted tier of a hash.
    ///
    /// For assets leaving the document entirely (last reference released);
    /// budget eviction never calls this, so evicted hashes stay reloadable
    /// from the persistence tier.
    pub async fn purge(&self, hash: &ContentHash) -> super::Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if let Some(entry) = inner.entries.remove(hash) {
                inner.current_bytes -= entry.bytes;
            }
        }
        self.shared.publish_usage();
        if let Some(store) = &self.persistence {
            store.remove(hash).await?;
        }
        Ok(())
    }

    /// Replace the budget and immediately re-apply eviction rules.
    pub fn set_budget(&self, budget: PyramidBudget) {
        let over = {
            let mut inner = self.shared.inner.lock();
            inner.budget = budget;
            inner.current_bytes > budget.max_bytes || inner.entries.len() > budget.max_entries
        };
        if over {
            self.shared.run_eviction();
        }
        self.shared.publish_usage();
    }

    pub fn scheduler(&self) -> &GenerationScheduler {
        &self.scheduler
    }
}
