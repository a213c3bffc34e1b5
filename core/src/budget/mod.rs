//! Memory budget tracking for fully-materialized assets and the
//! degradation machinery that enforces it through canvas nodes.

pub mod degrade;
pub mod manager;

pub use degrade::{
    CleanupConfig, CleanupOutcome, Degradable, DegradationController, NodeDescriptor,
    NodeRegistry, ViewportProvider,
};
pub use manager::{
    AssetSnapshot, BudgetConfig, DegradeCandidate, MemoryBudgetManager, PressureLevel,
    PressureObserver,
};

pub type Result<T> = crate::Result<T>;
