//! Aspect-preserving tier downscaling built on `fast_image_resize`.

use anyhow::{anyhow, ensure};
use fast_image_resize as fir;

use crate::codec::Raster;
use crate::error::TierSourceError;
use crate::types::{PixelDimensions, Tier};

use super::Result;

/// Filtering kernels supported by the tier rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleFilter {
    /// Fastest option, used by tests and diagnostic paths.
    Nearest,
    /// Box filter; behaves like area averaging when downscaling.
    Box,
    /// Lanczos3 (default), the quality choice for thumbnail pyramids.
    #[default]
    Lanczos3,
}

impl From<ScaleFilter> for fir::ResizeAlg {
    fn from(value: ScaleFilter) -> Self {
        match value {
            ScaleFilter::Nearest => fir::ResizeAlg::Nearest,
            ScaleFilter::Box => fir::ResizeAlg::Convolution(fir::FilterType::Box),
            ScaleFilter::Lanczos3 => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
        }
    }
}

/// Dimensions of a source scaled so its longest edge equals `tier`,
/// preserving aspect ratio. Both edges stay at least one pixel.
pub fn tier_dimensions(source: PixelDimensions, tier: Tier) -> PixelDimensions {
    let longest = source.longest_edge().max(1);
    let scale = tier as f64 / longest as f64;
    let width = ((source.width as f64 * scale).round() as u32).max(1);
    let height = ((source.height as f64 * scale).round() as u32).max(1);
    if source.width >= source.height {
        PixelDimensions { width: tier, height }
    } else {
        PixelDimensions { width, height: tier }
    }
}

/// Rasterize one pyramid tier from an in-memory source.
///
/// Returns [`TierSourceError::Oversize`] when the tier exceeds the source's
/// native resolution; the pyramid never upscales.
pub fn downscale_to_tier(
    source: &Raster,
    tier: Tier,
    filter: ScaleFilter,
) -> std::result::Result<Raster, TierSourceError> {
    let native = source.longest_edge();
    if tier > native {
        return Err(TierSourceError::Oversize { tier, native });
    }

    let target = tier_dimensions(source.dimensions, tier);
    resize_rgba(source, target, filter)
        .map_err(|err| TierSourceError::RasterizeFailed { tier, reason: err.to_string() })
}

fn resize_rgba(source: &Raster, target: PixelDimensions, filter: ScaleFilter) -> Result<Raster> {
    let src_width = source.width();
    let src_height = source.height();
    ensure!(src_width > 0 && src_height > 0, "source raster has zero dimensions");
    ensure!(
        source.pixels().len() >= src_width as usize * src_height as usize * 4,
        "source buffer smaller than its dimensions claim"
    );

    if target.width == src_width && target.height == src_height {
        return Ok(Raster::new(target, source.pixels().to_vec()));
    }

    let src_view =
        fir::images::ImageRef::new(src_width, src_height, source.pixels(), fir::PixelType::U8x4)
            .map_err(|err| anyhow!("preparing source image: {err}"))?;

    let mut dst = fir::images::Image::new(target.width, target.height, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new().resize_alg(filter.into()).use_alpha(true);

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst, Some(&options))
        .map_err(|err| anyhow!("tier resize failed: {err}"))?;

    Ok(Raster::new(target, dst.into_vec()))
}
