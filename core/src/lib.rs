//! Multi-resolution asset cache for a pannable, zoomable canvas.
//!
//! The crate keeps every asset renderable at interactive rates by trading
//! resolution for memory: a fixed ladder of downscaled tiers backs rendering
//! at any zoom level while byte budgets bound both the tier store and the
//! fully-materialized originals.

#![deny(missing_debug_implementations)]

pub mod budget;
pub mod cache;
pub mod codec;
pub mod context;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod remote;
pub mod stats;
pub mod types;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

pub use budget::{BudgetConfig, DegradationController, MemoryBudgetManager, PressureLevel};
pub use cache::{ResourceCache, ResourceData, ThumbnailPyramidCache};
pub use context::{CacheContext, ContextConfig};
pub use error::TierSourceError;
pub use types::{
    AssetId, BoundingBox, ContentHash, DegradeAction, GenerationPriority, PixelDimensions,
    PyramidBudget, TIERS, Tier, ViewRect,
};

/// Returns the version of the core crate for telemetry and debugging.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
