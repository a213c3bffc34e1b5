//! Raster decoding primitives shared by the remote loader and persistence tier.

use std::io::Cursor;

use anyhow::{Context, anyhow};
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::types::PixelDimensions;

use super::Result;

/// Straight-alpha RGBA8888 pixel buffer, row-major from the top-left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub dimensions: PixelDimensions,
    pub pixels: Vec<u8>,
}

impl Raster {
    pub fn new(dimensions: PixelDimensions, pixels: Vec<u8>) -> Self {
        Self { dimensions, pixels }
    }

    pub fn width(&self) -> u32 {
        self.dimensions.width
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Longest edge in pixels; the unit tiers are measured against.
    pub fn longest_edge(&self) -> u32 {
        self.dimensions.longest_edge()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Memory cost charged to the pyramid byte ledger.
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }
}

/// Decode an encoded image body (remote fetch result or persisted tier file)
/// into an RGBA raster.
///
/// Supports JPEG, PNG, WebP, and GIF (first frame). The format is sniffed
/// from the bytes; callers never pass a file name.
pub fn decode_bytes(data: &[u8]) -> Result<Raster> {
    if data.is_empty() {
        return Err(anyhow!("empty image body"));
    }

    let image = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .context("sniffing image format")?
        .decode()
        .context("decoding image body")?;

    let rgba = image.into_rgba8();
    let dimensions = PixelDimensions { width: rgba.width(), height: rgba.height() };
    Ok(Raster { dimensions, pixels: rgba.into_raw() })
}

/// Encode a raster as PNG for durable storage.
pub fn encode_png(raster: &Raster) -> Result<Vec<u8>> {
    let buffer = image::RgbaImage::from_raw(
        raster.width(),
        raster.height(),
        raster.pixels().to_vec(),
    )
    .ok_or_else(|| anyhow!("raster buffer does not match its dimensions"))?;

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut out, ImageFormat::Png)
        .context("encoding tier raster as png")?;
    Ok(out.into_inner())
}
