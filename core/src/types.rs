//! Shared data structures exchanged between the cache core and its collaborators.

use serde::Serialize;

/// Fixed ladder of pyramid resolutions, smallest first.
pub const TIERS: [Tier; 6] = [64, 128, 256, 512, 1024, 2048];

/// Tiers at or below this size are generated eagerly (Phase 1); everything
/// larger waits for an idle slot.
pub const PRIORITY_TIER_MAX: Tier = 128;

/// Target resolution of one pyramid level, in pixels (longest edge).
pub type Tier = u32;

/// Tiers that may materialize for a source whose longest edge is `native_max`.
///
/// A tier larger than the source is never rasterized; consumers fall back to
/// the largest available tier or the original instead of upscaling.
pub fn eligible_tiers(native_max: u32) -> impl Iterator<Item = Tier> {
    TIERS.into_iter().filter(move |tier| *tier <= native_max)
}

/// Content-derived identifier for an asset. Stable for the asset's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Hash raw asset bytes into a hex digest.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a visual node on the canvas that owns an asset instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Width and height of a raster buffer in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDimensions {
    pub width: u32,
    pub height: u32,
}

impl PixelDimensions {
    pub fn longest_edge(self) -> u32 {
        self.width.max(self.height)
    }
}

/// Axis-aligned bounding box of a canvas node, in canvas units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Visible canvas extent in the same units as node bounding boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ViewRect {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow the rect around its center by the given multiplier.
    pub fn expanded(&self, multiplier: f32) -> ViewRect {
        let w = self.width * multiplier;
        let h = self.height * multiplier;
        let (cx, cy) = self.center();
        ViewRect { x: cx - w / 2.0, y: cy - h / 2.0, width: w, height: h }
    }

    pub fn intersects(&self, bbox: &BoundingBox) -> bool {
        bbox.x < self.x + self.width
            && bbox.x + bbox.width > self.x
            && bbox.y < self.y + self.height
            && bbox.y + bbox.height > self.y
    }

    /// Euclidean distance from this rect's center to the box's center.
    pub fn distance_to(&self, bbox: &BoundingBox) -> f32 {
        let (cx, cy) = self.center();
        let (bx, by) = bbox.center();
        let dx = bx - cx;
        let dy = by - cy;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Byte and entry limits for the thumbnail pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidBudget {
    pub max_bytes: usize,
    pub max_entries: usize,
}

impl Default for PyramidBudget {
    fn default() -> Self {
        Self { max_bytes: 512 * 1024 * 1024, max_entries: 5000 }
    }
}

/// Scheduling class for a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GenerationPriority {
    Low,
    Normal,
}

/// What a budget pass asks a node to do with its materialized raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DegradeAction {
    /// Drop the full raster but keep rendering from the thumbnail pyramid.
    ThumbnailOnly,
    /// Release the asset entirely; it will be re-resolved on next view.
    Unload,
}
