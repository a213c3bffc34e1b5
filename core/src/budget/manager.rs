//! Byte ledger and pressure strategy for fully-materialized assets.
//!
//! This ledger is deliberately independent of the pyramid's: the pyramid
//! budget is a soft bound the cache enforces itself by eviction, while this
//! one is a hard bound enforced through collaborating nodes that only the
//! degradation controller may touch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::types::{AssetId, BoundingBox, DegradeAction, ViewRect};

/// Pressure strategy derived from the usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl PressureLevel {
    /// Viewport-extent multiplier for candidate selection; `None` means no
    /// cleanup is warranted.
    pub fn distance_multiplier(self) -> Option<f32> {
        match self {
            PressureLevel::Normal => None,
            PressureLevel::Warning => Some(3.0),
            PressureLevel::Critical => Some(2.0),
            PressureLevel::Emergency => Some(1.0),
        }
    }

    pub fn needs_cleanup(self) -> bool {
        self >= PressureLevel::Warning
    }
}

/// Thresholds and limits for the full-resolution ledger.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub max_bytes: u64,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub emergency_ratio: f64,
    /// Cleanup stops early once usage falls below this ratio.
    pub recovery_ratio: f64,
    /// The pressure notification re-arms below this ratio.
    pub rearm_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024 * 1024,
            warning_ratio: 0.85,
            critical_ratio: 0.92,
            emergency_ratio: 0.96,
            recovery_ratio: 0.70,
            rearm_ratio: 0.75,
        }
    }
}

/// Edge-triggered memory pressure notification. Fired once per upward
/// threshold crossing; never a blocking error.
pub trait PressureObserver: Send + Sync {
    fn on_pressure(&self, level: PressureLevel, ratio: f64);
}

/// Position and identity of one asset considered for degradation.
#[derive(Debug, Clone)]
pub struct AssetSnapshot {
    pub id: AssetId,
    pub bbox: BoundingBox,
}

/// Output of a budget pass: one asset and the action to apply to it.
#[derive(Debug, Clone)]
pub struct DegradeCandidate {
    pub id: AssetId,
    pub distance: f32,
    pub action: DegradeAction,
}

#[derive(Debug, Default)]
struct Ledger {
    assets: HashMap<AssetId, u64>,
    total: u64,
}

#[derive(Debug, Default)]
struct PressureState {
    last_fired: Option<PressureLevel>,
}

/// Tracks estimated bytes of fully-materialized assets and computes
/// degrade/unload candidates from viewport locality.
pub struct MemoryBudgetManager {
    config: BudgetConfig,
    ledger: Mutex<Ledger>,
    pressure: Mutex<PressureState>,
    observer: Mutex<Option<std::sync::Arc<dyn PressureObserver>>>,
    bulk_import: AtomicBool,
}

impl std::fmt::Debug for MemoryBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBudgetManager")
            .field("config", &self.config)
            .field("current_bytes", &self.current_bytes())
            .finish_non_exhaustive()
    }
}

impl MemoryBudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
            pressure: Mutex::new(PressureState::default()),
            observer: Mutex::new(None),
            bulk_import: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn set_observer(&self, observer: std::sync::Arc<dyn PressureObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Track a newly materialized asset. Re-registering an id replaces its
    /// recorded size.
    pub fn register_asset(&self, id: AssetId, bytes: u64) {
        {
            let mut ledger = self.ledger.lock();
            if let Some(previous) = ledger.assets.insert(id, bytes) {
                ledger.total = ledger.total.saturating_sub(previous);
            }
            ledger.total += bytes;
        }
        self.check_pressure();
    }

    /// Stop tracking an asset; no-op for unknown ids.
    pub fn unregister_asset(&self, id: &AssetId) -> bool {
        let removed = {
            let mut ledger = self.ledger.lock();
            match ledger.assets.remove(id) {
                Some(bytes) => {
                    ledger.total = ledger.total.saturating_sub(bytes);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.check_pressure();
        }
        removed
    }

    pub fn is_registered(&self, id: &AssetId) -> bool {
        self.ledger.lock().assets.contains_key(id)
    }

    pub fn current_bytes(&self) -> u64 {
        self.ledger.lock().total
    }

    pub fn usage_ratio(&self) -> f64 {
        self.current_bytes() as f64 / self.config.max_bytes.max(1) as f64
    }

    /// Map a usage ratio onto a pressure strategy.
    pub fn strategy_for(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.config.emergency_ratio {
            PressureLevel::Emergency
        } else if ratio >= self.config.critical_ratio {
            PressureLevel::Critical
        } else if ratio >= self.config.warning_ratio {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    pub fn pressure(&self) -> PressureLevel {
        self.strategy_for(self.usage_ratio())
    }

    /// True once cleanup has brought usage under the recovery line.
    pub fn below_recovery(&self) -> bool {
        self.usage_ratio() < self.config.recovery_ratio
    }

    /// Flag a bulk import; cleanup passes are suppressed while set.
    pub fn set_bulk_import(&self, active: bool) {
        self.bulk_import.store(active, Ordering::SeqCst);
    }

    pub fn bulk_import_active(&self) -> bool {
        self.bulk_import.load(Ordering::SeqCst)
    }

    /// Compute degrade candidates for the current pressure level.
    ///
    /// Selects non-visible assets outside the level's expanded viewport
    /// extent, ranked furthest-from-center first. Only emergency pressure
    /// unloads; warning and critical degrade to thumbnail rendering.
    pub fn candidates_for(
        &self,
        visible: &HashSet<AssetId>,
        assets: &[AssetSnapshot],
        viewport: &ViewRect,
    ) -> Vec<DegradeCandidate> {
        let level = self.pressure();
        let Some(multiplier) = level.distance_multiplier() else {
            return Vec::new();
        };

        let action = if level == PressureLevel::Emergency {
            DegradeAction::Unload
        } else {
            DegradeAction::ThumbnailOnly
        };
        let protected = viewport.expanded(multiplier);

        let mut candidates: Vec<DegradeCandidate> = assets
            .iter()
            .filter(|asset| !visible.contains(&asset.id))
            .filter(|asset| !protected.intersects(&asset.bbox))
            .map(|asset| DegradeCandidate {
                id: asset.id.clone(),
                distance: viewport.distance_to(&asset.bbox),
                action,
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.distance.partial_cmp(&a.distance).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    /// Fire the edge-triggered pressure notification when a new threshold is
    /// crossed upward; re-arm once usage drops well below the warning line.
    fn check_pressure(&self) {
        let ratio = self.usage_ratio();
        let level = self.strategy_for(ratio);
        let mut state = self.pressure.lock();

        if level.needs_cleanup() {
            if state.last_fired.is_none_or(|previous| level > previous) {
                state.last_fired = Some(level);
                drop(state);
                info!(?level, ratio, "memory pressure threshold crossed");
                if let Some(observer) = self.observer.lock().clone() {
                    observer.on_pressure(level, ratio);
                }
            }
        } else if ratio < self.config.rearm_ratio {
            state.last_fired = None;
        }
    }
}

impl Default for MemoryBudgetManager {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
