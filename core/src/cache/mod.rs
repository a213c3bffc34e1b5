//! Resource, pyramid, and persistence cache coordination.

pub mod persist;
pub mod pyramid;
pub mod resource;

pub use persist::{DiskTierStore, TierStore};
pub use pyramid::{ThumbnailPyramidCache, VisibilitySource};
pub use resource::{ResourceCache, ResourceData, ResourceEntry};

pub type Result<T> = crate::Result<T>;
