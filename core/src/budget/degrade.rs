//! Time-sliced degradation passes over canvas nodes.
//!
//! The budget manager only decides; this controller acts. It walks the
//! candidate list produced by [`MemoryBudgetManager::candidates_for`] in
//! short slices, parking on the idle scheduler between slices so a pass
//! never blocks interaction, and stops as soon as usage falls under the
//! recovery line.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::budget::manager::{AssetSnapshot, MemoryBudgetManager};
use crate::cache::ResourceCache;
use crate::pipeline::idle::{IdleScheduler, TimeSlice};
use crate::types::{AssetId, BoundingBox, ContentHash, DegradeAction, ViewRect};

/// Everything the controller needs to know about one canvas node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub id: AssetId,
    pub bbox: BoundingBox,
    /// Content hash of the backing asset, if resolved.
    pub hash: Option<ContentHash>,
    /// Whether the node currently holds a fully-materialized raster.
    pub holds_full_raster: bool,
}

/// A node that can shed its full raster on request.
///
/// Honoring the request is voluntary: a node mid-edit may refuse, in which
/// case it simply remains registered and stays a candidate for later passes.
pub trait Degradable: Send + Sync {
    fn degrade(&self, action: DegradeAction);
}

/// Host-side view of the canvas scene graph.
pub trait NodeRegistry: Send + Sync {
    fn nodes(&self) -> Vec<NodeDescriptor>;
    fn degradable(&self, id: &AssetId) -> Option<Arc<dyn Degradable>>;
    /// Re-read after a degrade request to learn whether the node complied.
    fn holds_full_raster(&self, id: &AssetId) -> bool;
}

/// Host-side view of the current canvas viewport.
pub trait ViewportProvider: Send + Sync {
    fn extent(&self) -> ViewRect;

    fn within_extent(&self, bbox: &BoundingBox, multiplier: f32) -> bool {
        self.extent().expanded(multiplier).intersects(bbox)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Work budget per idle window before the pass parks again.
    pub slice: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { slice: Duration::from_millis(8) }
    }
}

/// Result of one cleanup invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// A bulk import is in progress; nothing was touched.
    Suppressed,
    /// Another pass is already running.
    AlreadyRunning,
    Completed { degraded: usize, recovered: bool },
}

/// Executes degradation passes against the host's node registry.
pub struct DegradationController {
    manager: Arc<MemoryBudgetManager>,
    resources: Arc<ResourceCache>,
    idle: Arc<IdleScheduler>,
    config: CleanupConfig,
    running: AtomicBool,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DegradationController {
    pub fn new(
        manager: Arc<MemoryBudgetManager>,
        resources: Arc<ResourceCache>,
        idle: Arc<IdleScheduler>,
        config: CleanupConfig,
    ) -> Self {
        Self { manager, resources, idle, config, running: AtomicBool::new(false) }
    }

    pub fn manager(&self) -> &Arc<MemoryBudgetManager> {
        &self.manager
    }

    /// Run one cleanup pass.
    ///
    /// At most one pass runs at a time and passes are suppressed entirely
    /// during a bulk import. The pass re-reads the scene between slices so a
    /// node that became visible mid-pass is left alone.
    pub async fn run_cleanup(
        &self,
        registry: &dyn NodeRegistry,
        viewport: &dyn ViewportProvider,
    ) -> CleanupOutcome {
        if self.manager.bulk_import_active() {
            debug!("cleanup suppressed: bulk import in progress");
            return CleanupOutcome::Suppressed;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return CleanupOutcome::AlreadyRunning;
        }
        let outcome = self.cleanup_pass(registry, viewport).await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn cleanup_pass(
        &self,
        registry: &dyn NodeRegistry,
        viewport: &dyn ViewportProvider,
    ) -> CleanupOutcome {
        let mut degraded = 0usize;

        loop {
            if self.manager.below_recovery() {
                break;
            }

            let nodes = registry.nodes();
            let extent = viewport.extent();
            let visible: HashSet<AssetId> = nodes
                .iter()
                .filter(|node| extent.intersects(&node.bbox))
                .map(|node| node.id.clone())
                .collect();
            let assets: Vec<AssetSnapshot> = nodes
                .iter()
                .filter(|node| node.holds_full_raster)
                .map(|node| AssetSnapshot { id: node.id.clone(), bbox: node.bbox })
                .collect();

            let candidates = self.manager.candidates_for(&visible, &assets, &extent);
            if candidates.is_empty() {
                break;
            }

            let mut slice = TimeSlice::new(self.config.slice);
            let mut progressed = false;
            for candidate in candidates {
                if self.manager.below_recovery() {
                    break;
                }
                if slice.expired() {
                    // Park until the next idle window, then continue the pass.
                    self.idle.idle().await;
                    slice = TimeSlice::new(self.config.slice);
                }
                if self.degrade_one(registry, &candidate.id, candidate.action) {
                    degraded += 1;
                    progressed = true;
                }
            }

            // Every remaining candidate refused; retrying immediately would spin.
            if !progressed {
                break;
            }
        }

        let recovered = self.manager.below_recovery();
        info!(degraded, recovered, "budget cleanup pass finished");
        CleanupOutcome::Completed { degraded, recovered }
    }

    /// Ask one node to shed its raster; returns true when it complied.
    fn degrade_one(
        &self,
        registry: &dyn NodeRegistry,
        id: &AssetId,
        action: DegradeAction,
    ) -> bool {
        let Some(target) = registry.degradable(id) else {
            return false;
        };
        target.degrade(action);

        // Compliance is voluntary: only unregister once the raster is gone.
        if registry.holds_full_raster(id) {
            return false;
        }
        self.manager.unregister_asset(id);

        if action == DegradeAction::Unload {
            let hash = registry
                .nodes()
                .into_iter()
                .find(|node| node.id == *id)
                .and_then(|node| node.hash);
            if let Some(hash) = hash {
                self.resources.remove_reference(&hash);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::manager::BudgetConfig;
    use parking_lot::Mutex;

    const MB: u64 = 1024 * 1024;

    struct TestNode {
        descriptor: NodeDescriptor,
        refuses: bool,
    }

    #[derive(Default)]
    struct Scene {
        nodes: Mutex<Vec<TestNode>>,
    }

    impl Scene {
        fn add(&self, id: &str, x: f32, hash: Option<ContentHash>, refuses: bool) {
            self.nodes.lock().push(TestNode {
                descriptor: NodeDescriptor {
                    id: AssetId::new(id),
                    bbox: BoundingBox { x, y: 0.0, width: 10.0, height: 10.0 },
                    hash,
                    holds_full_raster: true,
                },
                refuses,
            });
        }
    }

    struct SceneHandle {
        scene: Arc<Scene>,
        id: AssetId,
    }

    impl Degradable for SceneHandle {
        fn degrade(&self, _action: DegradeAction) {
            let mut nodes = self.scene.nodes.lock();
            if let Some(node) = nodes.iter_mut().find(|n| n.descriptor.id == self.id) {
                if !node.refuses {
                    node.descriptor.holds_full_raster = false;
                }
            }
        }
    }

    impl NodeRegistry for Arc<Scene> {
        fn nodes(&self) -> Vec<NodeDescriptor> {
            self.nodes.lock().iter().map(|n| n.descriptor.clone()).collect()
        }

        fn degradable(&self, id: &AssetId) -> Option<Arc<dyn Degradable>> {
            Some(Arc::new(SceneHandle { scene: Arc::clone(self), id: id.clone() }))
        }

        fn holds_full_raster(&self, id: &AssetId) -> bool {
            self.nodes
                .lock()
                .iter()
                .find(|n| n.descriptor.id == *id)
                .is_some_and(|n| n.descriptor.holds_full_raster)
        }
    }

    struct FixedViewport(ViewRect);

    impl ViewportProvider for FixedViewport {
        fn extent(&self) -> ViewRect {
            self.0
        }
    }

    fn controller(max_bytes: u64) -> (DegradationController, Arc<MemoryBudgetManager>) {
        let manager = Arc::new(MemoryBudgetManager::new(BudgetConfig {
            max_bytes,
            ..Default::default()
        }));
        let controller = DegradationController::new(
            Arc::clone(&manager),
            Arc::new(ResourceCache::new()),
            IdleScheduler::new(),
            CleanupConfig::default(),
        );
        (controller, manager)
    }

    #[tokio::test]
    async fn cleanup_degrades_far_nodes_until_recovery() {
        let (controller, manager) = controller(100 * MB);
        let scene = Arc::new(Scene::default());
        let viewport = FixedViewport(ViewRect { x: 0.0, y: 0.0, width: 100.0, height: 100.0 });

        // One visible node plus nine far ones, 10 MB each: 100% usage.
        scene.add("near", 20.0, None, false);
        manager.register_asset(AssetId::new("near"), 10 * MB);
        for i in 0..9 {
            let id = format!("far-{i}");
            scene.add(&id, 1000.0 + i as f32 * 100.0, None, false);
            manager.register_asset(AssetId::new(id), 10 * MB);
        }

        let outcome = controller.run_cleanup(&scene, &viewport).await;
        match outcome {
            CleanupOutcome::Completed { degraded, recovered } => {
                assert!(recovered, "usage should fall under the recovery line");
                // 100 -> below 70 MB takes exactly four 10 MB nodes.
                assert_eq!(degraded, 4);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(manager.is_registered(&AssetId::new("near")), "visible node untouched");
        // Furthest nodes went first.
        assert!(!manager.is_registered(&AssetId::new("far-8")));
        assert!(manager.is_registered(&AssetId::new("far-0")));
    }

    #[tokio::test]
    async fn refusing_nodes_stay_registered() {
        let (controller, manager) = controller(100);
        let scene = Arc::new(Scene::default());
        let viewport = FixedViewport(ViewRect { x: 0.0, y: 0.0, width: 10.0, height: 10.0 });

        scene.add("stubborn", 1000.0, None, true);
        manager.register_asset(AssetId::new("stubborn"), 90);

        let outcome = controller.run_cleanup(&scene, &viewport).await;
        assert_eq!(outcome, CleanupOutcome::Completed { degraded: 0, recovered: false });
        assert!(manager.is_registered(&AssetId::new("stubborn")));
    }

    #[tokio::test]
    async fn bulk_import_suppresses_cleanup() {
        let (controller, manager) = controller(100);
        let scene = Arc::new(Scene::default());
        let viewport = FixedViewport(ViewRect { x: 0.0, y: 0.0, width: 10.0, height: 10.0 });

        scene.add("far", 1000.0, None, false);
        manager.register_asset(AssetId::new("far"), 99);
        manager.set_bulk_import(true);

        assert_eq!(controller.run_cleanup(&scene, &viewport).await, CleanupOutcome::Suppressed);
        assert!(manager.is_registered(&AssetId::new("far")));

        manager.set_bulk_import(false);
        let outcome = controller.run_cleanup(&scene, &viewport).await;
        assert!(matches!(outcome, CleanupOutcome::Completed { degraded: 1, .. }));
    }

    #[tokio::test]
    async fn emergency_unload_releases_resource_reference() {
        let manager = Arc::new(MemoryBudgetManager::new(BudgetConfig {
            max_bytes: 100,
            ..Default::default()
        }));
        let resources = Arc::new(ResourceCache::new());
        let controller = DegradationController::new(
            Arc::clone(&manager),
            Arc::clone(&resources),
            IdleScheduler::new(),
            CleanupConfig::default(),
        );

        let hash = ContentHash::of_bytes(b"shared payload");
        resources.set(
            hash.clone(),
            crate::cache::ResourceData {
                primary_location: "file:///a.png".into(),
                server_name: None,
                original_name: Some("a.png".into()),
                byte_size: 42,
            },
        );

        let scene = Arc::new(Scene::default());
        let viewport = FixedViewport(ViewRect { x: 0.0, y: 0.0, width: 10.0, height: 10.0 });
        scene.add("far", 1000.0, Some(hash.clone()), false);
        manager.register_asset(AssetId::new("far"), 99); // emergency: unload

        let outcome = controller.run_cleanup(&scene, &viewport).await;
        assert!(matches!(outcome, CleanupOutcome::Completed { degraded: 1, .. }));
        assert!(!resources.has(&hash), "last reference released, entry purged");
    }
}
