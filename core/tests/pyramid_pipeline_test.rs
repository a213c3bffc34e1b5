use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mural_core::cache::pyramid::PyramidConfig;
use mural_core::cache::{ResourceCache, ResourceData, ThumbnailPyramidCache, VisibilitySource};
use mural_core::codec::Raster;
use mural_core::pipeline::idle::IdleScheduler;
use mural_core::pipeline::scheduler::SchedulerConfig;
use mural_core::remote::{RemoteConfig, RemoteFallbackLoader, TierFetcher};
use mural_core::types::{
    ContentHash, GenerationPriority, PixelDimensions, PyramidBudget, Tier,
};

fn raster(width: u32, height: u32) -> Arc<Raster> {
    Arc::new(Raster::new(
        PixelDimensions { width, height },
        vec![128u8; (width * height * 4) as usize],
    ))
}

fn pyramid(
    idle: &Arc<IdleScheduler>,
    resources: &Arc<ResourceCache>,
    remote: Option<Arc<dyn TierFetcher>>,
) -> ThumbnailPyramidCache {
    ThumbnailPyramidCache::new(
        PyramidConfig::default(),
        SchedulerConfig::default(),
        Arc::clone(resources),
        Arc::clone(idle),
        None,
        remote,
        None,
        None,
    )
}

/// Keeps ticking the idle scheduler so parked quality-tier work can run.
fn spawn_ticker(idle: &Arc<IdleScheduler>) -> tokio::task::JoinHandle<()> {
    let idle = Arc::clone(idle);
    tokio::spawn(async move {
        loop {
            tokio::task::yield_now().await;
            idle.tick();
        }
    })
}

#[tokio::test]
async fn priority_tiers_land_before_quality_work() {
    let idle = IdleScheduler::new();
    let resources = Arc::new(ResourceCache::new());
    let cache = pyramid(&idle, &resources, None);
    let hash = ContentHash::of_bytes(b"landscape shot");

    let job = cache.ensure(hash.clone(), Some(raster(2000, 1000)), GenerationPriority::Normal);

    // Let the job run phase 1; without an idle tick, phase 2 stays parked.
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        cache.available_tiers(&hash),
        vec![64, 128],
        "only priority tiers before the first idle window"
    );

    let ticker = spawn_ticker(&idle);
    let tiers = job.await.expect("generation succeeds");
    ticker.abort();

    // 2048 exceeds the 2000px native edge and must never materialize.
    let produced: Vec<Tier> = tiers.keys().copied().collect();
    assert_eq!(produced, vec![64, 128, 256, 512, 1024]);
    assert_eq!(cache.available_tiers(&hash), vec![64, 128, 256, 512, 1024]);
}

#[tokio::test]
async fn concurrent_ensure_calls_share_one_job() {
    let idle = IdleScheduler::new();
    let resources = Arc::new(ResourceCache::new());
    let cache = pyramid(&idle, &resources, None);
    let hash = ContentHash::of_bytes(b"shared asset");

    let first = cache.ensure(hash.clone(), Some(raster(400, 400)), GenerationPriority::Normal);
    let second = cache.ensure(hash.clone(), Some(raster(400, 400)), GenerationPriority::Normal);

    let ticker = spawn_ticker(&idle);
    let (a, b) = tokio::join!(first, second);
    ticker.abort();

    let a = a.expect("first caller resolves");
    let b = b.expect("second caller resolves");
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    assert_eq!(
        cache.scheduler().counters().jobs_started,
        1,
        "same-tick callers must share a single rasterization pass"
    );
}

#[tokio::test]
async fn remote_failure_falls_back_to_local_rasterization() {
    let idle = IdleScheduler::new();
    let resources = Arc::new(ResourceCache::new());
    let hash = ContentHash::of_bytes(b"remote-backed asset");

    // Server name wired so the remote path is actually consulted; the
    // address never answers, so every fetch counts as a miss.
    resources.set(
        hash.clone(),
        ResourceData {
            primary_location: "file:///orig.png".into(),
            server_name: Some("orig-0001".into()),
            original_name: Some("orig.png".into()),
            byte_size: 1,
        },
    );
    let remote = RemoteFallbackLoader::new(RemoteConfig {
        base_url: "http://127.0.0.1:9".into(),
        timeout: Duration::from_millis(200),
        max_retries: 0,
        ..Default::default()
    })
    .expect("loader");

    let cache = pyramid(&idle, &resources, Some(Arc::new(remote)));
    let job = cache.ensure(hash.clone(), Some(raster(300, 300)), GenerationPriority::Normal);

    let ticker = spawn_ticker(&idle);
    let tiers = job.await.expect("local rasterization still succeeds");
    ticker.abort();

    assert_eq!(tiers.keys().copied().collect::<Vec<_>>(), vec![64, 128, 256]);
}

#[derive(Debug)]
struct FixedVisible(HashSet<ContentHash>);

impl VisibilitySource for FixedVisible {
    fn visible_hashes(&self) -> HashSet<ContentHash> {
        self.0.clone()
    }
}

#[tokio::test]
async fn shrinking_max_entries_keeps_visible_hashes() {
    let idle = IdleScheduler::new();
    let resources = Arc::new(ResourceCache::new());
    let cache = pyramid(&idle, &resources, None);

    let hashes: Vec<ContentHash> = (0..30)
        .map(|i| ContentHash::of_bytes(format!("asset {i}").as_bytes()))
        .collect();
    for hash in &hashes {
        cache.set(hash, 64, raster(64, 64));
    }
    assert_eq!(cache.len(), 30);

    // The two oldest hashes are on screen and must survive the shrink.
    let visible: HashSet<ContentHash> = hashes[..2].iter().cloned().collect();
    cache.set_visibility_source(Arc::new(FixedVisible(visible)));

    cache.set_budget(PyramidBudget { max_bytes: usize::MAX, max_entries: 10 });

    assert_eq!(cache.len(), 10);
    assert!(cache.contains(&hashes[0]), "visible hash retained");
    assert!(cache.contains(&hashes[1]), "visible hash retained");
    // The newest eight non-visible hashes fill the rest; older ones are gone.
    for hash in &hashes[22..] {
        assert!(cache.contains(hash));
    }
    for hash in &hashes[2..22] {
        assert!(!cache.contains(hash), "oldest non-visible hashes evicted first");
    }
}
