//! Priority-queued, concurrency-capped tier generation.
//!
//! One live job exists per content hash: concurrent `ensure` calls for the
//! same hash share a single future. Jobs above the concurrency cap wait in a
//! two-level priority queue and are granted slots as running jobs finish.
//! Abandoning a shared future does not cancel the underlying work; results
//! always land in the pyramid for future use.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::persist::TierStore;
use crate::cache::resource::ResourceCache;
use crate::codec::Raster;
use crate::error::TierSourceError;
use crate::pipeline::idle::IdleScheduler;
use crate::pipeline::scale::{self, ScaleFilter};
use crate::remote::TierFetcher;
use crate::types::{
    ContentHash, GenerationPriority, PRIORITY_TIER_MAX, TIERS, Tier, eligible_tiers,
};

/// Tiers a finished job left behind, smallest first.
pub type ThumbnailSet = BTreeMap<Tier, Arc<Raster>>;

/// Outcome shared between every caller waiting on a hash.
pub type JobResult = Result<ThumbnailSet, TierSourceError>;

type SharedJob = Shared<BoxFuture<'static, JobResult>>;

/// Receives fractional generation progress per hash. Optional; its absence
/// changes nothing about cache behavior.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, hash: &ContentHash, fraction: f32);
}

/// Destination for generated tiers, implemented by the pyramid store.
pub trait TierSink: Send + Sync {
    /// Tier already present in the pyramid, if any.
    fn tier(&self, hash: &ContentHash, tier: Tier) -> Option<Arc<Raster>>;

    /// Publish a produced tier. Insert-if-absent: the returned raster is the
    /// one actually stored, which may predate this call.
    fn publish(&self, hash: &ContentHash, tier: Tier, raster: Arc<Raster>) -> Arc<Raster>;
}

/// Tuning knobs for the generation pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Simultaneous rasterization jobs; excess callers queue.
    pub max_concurrent_jobs: usize,
    /// Kernel used for local tier rasterization.
    pub filter: ScaleFilter,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent_jobs: 2, filter: ScaleFilter::default() }
    }
}

/// Reporting-only pipeline counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerCounters {
    pub jobs_started: u64,
    pub tiers_rasterized: u64,
    pub persistence_hits: u64,
    pub remote_hits: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    jobs_started: AtomicU64,
    tiers_rasterized: AtomicU64,
    persistence_hits: AtomicU64,
    remote_hits: AtomicU64,
}

#[derive(Debug)]
struct SlotWaiter {
    priority: GenerationPriority,
    sequence: u64,
    ready: oneshot::Sender<()>,
}

impl Eq for SlotWaiter {}

impl PartialEq for SlotWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Ord for SlotWaiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Normal outranks Low; within a level, first come first served.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for SlotWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct SlotState {
    running: usize,
    pending: BinaryHeap<SlotWaiter>,
    sequence: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    sink: Arc<dyn TierSink>,
    resources: Arc<ResourceCache>,
    idle: Arc<IdleScheduler>,
    persistence: Option<Arc<dyn TierStore>>,
    remote: Option<Arc<dyn TierFetcher>>,
    progress: Option<Arc<dyn ProgressObserver>>,
    jobs: Mutex<HashMap<ContentHash, SharedJob>>,
    slots: Mutex<SlotState>,
    counters: AtomicCounters,
}

/// Deduplicating generation pipeline shared by all pyramid consumers.
#[derive(Clone)]
pub struct GenerationScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for GenerationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationScheduler")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl GenerationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        sink: Arc<dyn TierSink>,
        resources: Arc<ResourceCache>,
        idle: Arc<IdleScheduler>,
        persistence: Option<Arc<dyn TierStore>>,
        remote: Option<Arc<dyn TierFetcher>>,
        progress: Option<Arc<dyn ProgressObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                sink,
                resources,
                idle,
                persistence,
                remote,
                progress,
                jobs: Mutex::new(HashMap::new()),
                slots: Mutex::new(SlotState::default()),
                counters: AtomicCounters::default(),
            }),
        }
    }

    /// Idempotently trigger tier generation for a hash.
    ///
    /// Returns a clonable future every concurrent caller shares; the work
    /// itself runs as a detached task and survives abandoned callers. Must
    /// be called from within a tokio runtime.
    pub fn ensure(
        &self,
        hash: ContentHash,
        source: Option<Arc<Raster>>,
        priority: GenerationPriority,
    ) -> impl std::future::Future<Output = JobResult> + Send + 'static + use<> {
        let mut jobs = self.inner.jobs.lock();
        if let Some(job) = jobs.get(&hash) {
            return job.clone();
        }

        let inner = Arc::clone(&self.inner);
        let job_hash = hash.clone();
        let task = tokio::spawn(async move {
            let result = run_job(&inner, &job_hash, source, priority).await;
            inner.jobs.lock().remove(&job_hash);
            if let Err(ref err) = result {
                debug!(hash = %job_hash, "generation job failed: {err}");
            }
            result
        });

        let aborted_hash = hash.to_string();
        let shared: SharedJob = async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(TierSourceError::JobAborted { hash: aborted_hash }),
            }
        }
        .boxed()
        .shared();

        jobs.insert(hash, shared.clone());
        shared
    }

    /// Number of hashes with a live generation job.
    pub fn in_flight(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Jobs waiting for a rasterization slot.
    pub fn queued(&self) -> usize {
        self.inner.slots.lock().pending.len()
    }

    pub fn counters(&self) -> SchedulerCounters {
        let c = &self.inner.counters;
        SchedulerCounters {
            jobs_started: c.jobs_started.load(Ordering::Relaxed),
            tiers_rasterized: c.tiers_rasterized.load(Ordering::Relaxed),
            persistence_hits: c.persistence_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
        }
    }
}

struct SlotPermit {
    inner: Arc<SchedulerInner>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut slots = self.inner.slots.lock();
        while let Some(waiter) = slots.pending.pop() {
            // Hand the slot over; `running` stays unchanged. A closed
            // receiver means the waiter vanished, try the next one.
            if waiter.ready.send(()).is_ok() {
                return;
            }
        }
        slots.running -= 1;
    }
}

async fn acquire_slot(inner: &Arc<SchedulerInner>, priority: GenerationPriority) -> SlotPermit {
    let waiter = {
        let mut slots = inner.slots.lock();
        if slots.running < inner.config.max_concurrent_jobs {
            slots.running += 1;
            None
        } else {
            let (ready, parked) = oneshot::channel();
            slots.sequence += 1;
            let sequence = slots.sequence;
            slots.pending.push(SlotWaiter { priority, sequence, ready });
            Some(parked)
        }
    };

    if let Some(parked) = waiter {
        let _ = parked.await;
    }
    SlotPermit { inner: Arc::clone(inner) }
}

async fn run_job(
    inner: &Arc<SchedulerInner>,
    hash: &ContentHash,
    source: Option<Arc<Raster>>,
    priority: GenerationPriority,
) -> JobResult {
    // Without an in-memory source the native size is unknown; persistence
    // and the remote store decide tier by tier.
    let tiers: Vec<Tier> = match source.as_ref().map(|raster| raster.longest_edge()) {
        Some(native) => eligible_tiers(native).collect(),
        None => TIERS.to_vec(),
    };

    let mut produced = ThumbnailSet::new();
    if tiers.is_empty() {
        // Source smaller than the smallest tier; consumers use the original.
        report_progress(inner, hash, 1.0);
        return Ok(produced);
    }

    let permit = acquire_slot(inner, priority).await;
    inner.counters.jobs_started.fetch_add(1, Ordering::Relaxed);

    let phase1: Vec<Tier> = tiers.iter().copied().filter(|t| *t <= PRIORITY_TIER_MAX).collect();
    let phase2: Vec<Tier> = tiers.iter().copied().filter(|t| *t > PRIORITY_TIER_MAX).collect();
    let phase1_span = if phase2.is_empty() { 1.0 } else { 0.6 };

    // Phase 1: fast-feedback tiers, smallest first, back to back.
    for (index, tier) in phase1.iter().enumerate() {
        match produce_tier(inner, hash, *tier, source.as_deref()).await {
            Some(raster) => {
                produced.insert(*tier, raster);
            }
            None if produced.is_empty() => {
                return Err(TierSourceError::SourceUnavailable { hash: hash.to_string() });
            }
            None => {}
        }
        let fraction = phase1_span * (index + 1) as f32 / phase1.len() as f32;
        report_progress(inner, hash, fraction);
        tokio::task::yield_now().await;
    }

    // The cap bounds simultaneous rasterization; a job parked on the idle
    // gate is not rasterizing and must not starve queued priority tiers.
    drop(permit);

    // Phase 2: quality tiers, gated on an idle window so interaction never
    // waits on large resizes.
    if !phase2.is_empty() {
        inner.idle.idle().await;
        let _permit = acquire_slot(inner, priority).await;
        for (index, tier) in phase2.iter().enumerate() {
            if let Some(raster) = produce_tier(inner, hash, *tier, source.as_deref()).await {
                produced.insert(*tier, raster);
            }
            let fraction = 0.6 + 0.4 * (index + 1) as f32 / phase2.len() as f32;
            report_progress(inner, hash, fraction);
            tokio::task::yield_now().await;
        }
    }

    Ok(produced)
}

/// Produce one tier, trying sources cheapest first: the pyramid itself, the
/// persistence tier, the remote store, then local rasterization. Misses and
/// recoverable failures fall through silently.
async fn produce_tier(
    inner: &Arc<SchedulerInner>,
    hash: &ContentHash,
    tier: Tier,
    source: Option<&Raster>,
) -> Option<Arc<Raster>> {
    if let Some(existing) = inner.sink.tier(hash, tier) {
        return Some(existing);
    }

    if let Some(store) = &inner.persistence {
        match store.load_tier(hash, tier).await {
            Ok(Some(raster)) => {
                inner.counters.persistence_hits.fetch_add(1, Ordering::Relaxed);
                return Some(inner.sink.publish(hash, tier, Arc::new(raster)));
            }
            Ok(None) => {}
            Err(err) => {
                let err = TierSourceError::PersistenceUnavailable { reason: err.to_string() };
                debug!(hash = %hash, tier, "{err}");
            }
        }
    }

    if let Some(remote) = &inner.remote {
        // The remote store is addressed by server-assigned name, never hash.
        if let Some(name) = inner.resources.server_name(hash) {
            match remote.fetch_tier(&name, tier).await {
                Some(raster) => {
                    inner.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(inner.sink.publish(hash, tier, Arc::new(raster)));
                }
                None => {
                    let err = TierSourceError::RemoteMiss {
                        tier,
                        reason: "exhausted retries".to_string(),
                    };
                    debug!(hash = %hash, tier, "{err}");
                }
            }
        }
    }

    if let Some(source) = source {
        match scale::downscale_to_tier(source, tier, inner.config.filter) {
            Ok(raster) => {
                inner.counters.tiers_rasterized.fetch_add(1, Ordering::Relaxed);
                let raster = inner.sink.publish(hash, tier, Arc::new(raster));
                write_back(inner, hash, tier, &raster);
                return Some(raster);
            }
            Err(err) => warn!(hash = %hash, tier, "local rasterization failed: {err}"),
        }
    }

    None
}

/// Persist a locally rasterized tier without blocking the pipeline. Failures
/// are logged and dropped; the tier is already live in the pyramid.
fn write_back(inner: &Arc<SchedulerInner>, hash: &ContentHash, tier: Tier, raster: &Arc<Raster>) {
    let Some(store) = inner.persistence.clone() else { return };
    let hash = hash.clone();
    let raster = Arc::clone(raster);
    tokio::spawn(async move {
        if let Err(err) = store.store_tier(&hash, tier, &raster).await {
            warn!(hash = %hash, tier, "tier write-back failed: {err}");
        }
    });
}

fn report_progress(inner: &Arc<SchedulerInner>, hash: &ContentHash, fraction: f32) {
    if let Some(observer) = &inner.progress {
        observer.on_progress(hash, fraction.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelDimensions;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    /// Plain map sink standing in for the pyramid.
    #[derive(Default)]
    struct MapSink {
        tiers: PlMutex<HashMap<(ContentHash, Tier), Arc<Raster>>>,
    }

    impl TierSink for MapSink {
        fn tier(&self, hash: &ContentHash, tier: Tier) -> Option<Arc<Raster>> {
            self.tiers.lock().get(&(hash.clone(), tier)).cloned()
        }

        fn publish(&self, hash: &ContentHash, tier: Tier, raster: Arc<Raster>) -> Arc<Raster> {
            self.tiers
                .lock()
                .entry((hash.clone(), tier))
                .or_insert(raster)
                .clone()
        }
    }

    fn raster(size: u32) -> Arc<Raster> {
        Arc::new(Raster::new(
            PixelDimensions { width: size, height: size / 2 },
            vec![200; (size * (size / 2) * 4) as usize],
        ))
    }

    fn scheduler(sink: Arc<MapSink>, idle: Arc<IdleScheduler>) -> GenerationScheduler {
        GenerationScheduler::new(
            SchedulerConfig { filter: ScaleFilter::Nearest, ..Default::default() },
            sink,
            Arc::new(ResourceCache::new()),
            idle,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn same_tick_ensures_share_one_job() {
        let sink = Arc::new(MapSink::default());
        let idle = IdleScheduler::new();
        let scheduler = scheduler(Arc::clone(&sink), Arc::clone(&idle));

        let hash = ContentHash::new("abc");
        // 100px source: only the 64 tier is eligible, no idle gate needed.
        let source = raster(100);

        let first = scheduler.ensure(hash.clone(), Some(Arc::clone(&source)), GenerationPriority::Normal);
        let second = scheduler.ensure(hash.clone(), Some(source), GenerationPriority::Normal);

        let (a, b) = tokio::join!(first, second);
        let a = a.expect("first caller resolves");
        let b = b.expect("second caller resolves");

        assert_eq!(a.keys().copied().collect::<Vec<_>>(), vec![64]);
        assert_eq!(a, b);
        assert_eq!(scheduler.counters().jobs_started, 1);
        assert_eq!(scheduler.counters().tiers_rasterized, 1);
    }

    #[tokio::test]
    async fn job_without_any_source_fails_terminally() {
        let sink = Arc::new(MapSink::default());
        let scheduler = scheduler(sink, IdleScheduler::new());

        let err = scheduler
            .ensure(ContentHash::new("ghost"), None, GenerationPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, TierSourceError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn tiny_source_produces_empty_set() {
        let sink = Arc::new(MapSink::default());
        let scheduler = scheduler(sink, IdleScheduler::new());

        let set = scheduler
            .ensure(ContentHash::new("tiny"), Some(raster(50)), GenerationPriority::Normal)
            .await
            .expect("empty success");
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn quality_tiers_wait_for_idle_and_arrive_smallest_first() {
        let sink = Arc::new(MapSink::default());
        let idle = IdleScheduler::new();
        let scheduler = scheduler(Arc::clone(&sink), Arc::clone(&idle));

        let hash = ContentHash::new("big");
        let job = scheduler.ensure(hash.clone(), Some(raster(2000)), GenerationPriority::Normal);
        let handle = tokio::spawn(job);

        // Let phase 1 run to completion; phase 2 must stay parked.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        {
            let tiers = sink.tiers.lock();
            assert!(tiers.contains_key(&(hash.clone(), 64)));
            assert!(tiers.contains_key(&(hash.clone(), 128)));
            assert!(!tiers.contains_key(&(hash.clone(), 256)), "quality tier before idle");
        }

        // Keep ticking until the job drains phase 2.
        let ticker = {
            let idle = Arc::clone(&idle);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    idle.tick();
                }
            })
        };
        let set = handle.await.expect("join").expect("job resolves");
        ticker.abort();

        // 2048 exceeds the 2000px native edge and must be skipped.
        assert_eq!(set.keys().copied().collect::<Vec<_>>(), vec![64, 128, 256, 512, 1024]);
    }

    #[tokio::test]
    async fn parked_quality_work_frees_slots_for_priority_tiers() {
        let sink = Arc::new(MapSink::default());
        let idle = IdleScheduler::new();
        let scheduler = scheduler(Arc::clone(&sink), Arc::clone(&idle));

        // Two large jobs fill both slots, finish phase 1, and park on the
        // idle gate. No tick ever arrives.
        let parked_one = scheduler.ensure(
            ContentHash::new("big-1"),
            Some(raster(2000)),
            GenerationPriority::Normal,
        );
        let parked_two = scheduler.ensure(
            ContentHash::new("big-2"),
            Some(raster(2000)),
            GenerationPriority::Normal,
        );
        let parked_one = tokio::spawn(parked_one);
        let parked_two = tokio::spawn(parked_two);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        // A small job needs only its 64 tier; parked quality work must not
        // hold the slots it needs.
        let set = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.ensure(ContentHash::new("small"), Some(raster(100)), GenerationPriority::Normal),
        )
        .await
        .expect("priority tiers must not wait for an idle tick")
        .expect("job resolves");
        assert_eq!(set.keys().copied().collect::<Vec<_>>(), vec![64]);

        parked_one.abort();
        parked_two.abort();
    }

    #[tokio::test]
    async fn progress_reaches_one_for_observed_jobs() {
        #[derive(Default)]
        struct Last(PlMutex<f32>);
        impl ProgressObserver for Last {
            fn on_progress(&self, _hash: &ContentHash, fraction: f32) {
                *self.0.lock() = fraction;
            }
        }

        let observer = Arc::new(Last::default());
        let sink = Arc::new(MapSink::default());
        let scheduler = GenerationScheduler::new(
            SchedulerConfig { filter: ScaleFilter::Nearest, ..Default::default() },
            sink,
            Arc::new(ResourceCache::new()),
            IdleScheduler::new(),
            None,
            None,
            Some(Arc::clone(&observer) as Arc<dyn ProgressObserver>),
        );

        scheduler
            .ensure(ContentHash::new("p"), Some(raster(100)), GenerationPriority::Normal)
            .await
            .expect("job resolves");
        assert_eq!(*observer.0.lock(), 1.0);
    }

    #[test]
    fn slot_waiters_order_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        let mut parked = Vec::new();
        for (priority, sequence) in [
            (GenerationPriority::Low, 1),
            (GenerationPriority::Normal, 2),
            (GenerationPriority::Normal, 3),
            (GenerationPriority::Low, 4),
        ] {
            let (ready, receiver) = oneshot::channel();
            heap.push(SlotWaiter { priority, sequence, ready });
            parked.push(receiver);
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|w| w.sequence)).collect();
        assert_eq!(order, vec![2, 3, 1, 4]);
    }
}
