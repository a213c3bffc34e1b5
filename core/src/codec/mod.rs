//! Raster buffers and byte-level encode/decode helpers.

pub mod raster;

pub use raster::{Raster, decode_bytes, encode_png};

pub type Result<T> = crate::Result<T>;
