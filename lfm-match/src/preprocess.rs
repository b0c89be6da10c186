//! Query Image Normalization
//!
//! Validates the submitted photograph and produces the canonical copy every
//! downstream artifact refers to:
//! 1. Decode (any format the `image` crate reads); failure is `InvalidInput`
//! 2. Downscale so the longest side is at most 768 px, keeping aspect ratio
//! 3. Equalize luma contrast with CLAHE (8x8 tiles, clip limit 2.0)
//! 4. Re-encode as JPEG
//!
//! Decoding is CPU-bound, so the async entry point runs on the blocking pool.

use crate::error::{MatchError, MatchResult};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use tracing::debug;

/// Longest side of the normalized image in pixels
pub const MAX_SIDE: u32 = 768;

/// JPEG quality of the normalized image
pub const JPEG_QUALITY: u8 = 90;

/// CLAHE clip limit, as a multiple of the uniform bin height
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// CLAHE tiles along each axis
pub const CLAHE_GRID: u32 = 8;

/// Normalized JPEG plus its dimensions
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode, bound and re-encode a query image
pub fn normalize_image(data: &[u8]) -> MatchResult<NormalizedImage> {
    if data.is_empty() {
        return Err(MatchError::InvalidInput("query image is empty".to_string()));
    }

    let decoded = image::load_from_memory(data)
        .map_err(|e| MatchError::InvalidInput(format!("query image could not be decoded: {}", e)))?;

    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(MatchError::InvalidInput(
            "query image has zero size".to_string(),
        ));
    }

    let bounded = if width.max(height) > MAX_SIDE {
        decoded.resize(MAX_SIDE, MAX_SIDE, FilterType::Triangle)
    } else {
        decoded
    };

    let mut rgb = bounded.to_rgb8();
    equalize_contrast(&mut rgb);

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| MatchError::InvalidInput(format!("query image could not be re-encoded: {}", e)))?;

    debug!(
        original_width = width,
        original_height = height,
        width = rgb.width(),
        height = rgb.height(),
        bytes = bytes.len(),
        "Normalized query image"
    );

    Ok(NormalizedImage {
        bytes,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Contrast-limited adaptive histogram equalization of luma
///
/// Each tile's luma histogram is clipped at `CLAHE_CLIP_LIMIT` times the
/// uniform bin height with the excess spread over all bins. Per-tile mappings
/// are bilinearly interpolated between tile centers. All three channels are
/// shifted by the luma change, so chroma is kept.
pub fn equalize_contrast(img: &mut RgbImage) {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let grid_x = CLAHE_GRID.min(width) as usize;
    let grid_y = CLAHE_GRID.min(height) as usize;
    let stride = width as usize;

    let luma: Vec<u8> = img.pixels().map(luma_of).collect();

    let mut luts = vec![[0u8; 256]; grid_x * grid_y];
    for ty in 0..grid_y {
        let (y0, y1) = tile_bounds(ty, grid_y, height);
        for tx in 0..grid_x {
            let (x0, x1) = tile_bounds(tx, grid_x, width);
            let mut hist = [0f32; 256];
            for y in y0..y1 {
                for &v in &luma[y * stride + x0..y * stride + x1] {
                    hist[v as usize] += 1.0;
                }
            }
            let area = ((x1 - x0) * (y1 - y0)) as f32;
            luts[ty * grid_x + tx] = clipped_equalization(&mut hist, area);
        }
    }

    let tile_w = width as f32 / grid_x as f32;
    let tile_h = height as f32 / grid_y as f32;
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let v = luma[y as usize * stride + x as usize] as usize;
        let (tx0, tx1, ax) = neighbour_tiles(x, tile_w, grid_x);
        let (ty0, ty1, ay) = neighbour_tiles(y, tile_h, grid_y);
        let lut = |tx: usize, ty: usize| luts[ty * grid_x + tx][v] as f32;

        let top = lut(tx0, ty0) * (1.0 - ax) + lut(tx1, ty0) * ax;
        let bottom = lut(tx0, ty1) * (1.0 - ax) + lut(tx1, ty1) * ax;
        let shift = top * (1.0 - ay) + bottom * ay - v as f32;

        for channel in pixel.0.iter_mut() {
            *channel = (*channel as f32 + shift).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn luma_of(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// Half-open pixel range of tile `index` out of `count` along `len`
fn tile_bounds(index: usize, count: usize, len: u32) -> (usize, usize) {
    let len = len as usize;
    (index * len / count, (index + 1) * len / count)
}

/// Tiles whose centers bracket `pos`, and the weight of the second one
fn neighbour_tiles(pos: u32, tile_len: f32, count: usize) -> (usize, usize, f32) {
    let f = (pos as f32 + 0.5) / tile_len - 0.5;
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let first = f.floor() as usize;
    if first >= count - 1 {
        return (count - 1, count - 1, 0.0);
    }
    (first, first + 1, f - first as f32)
}

/// Clip a histogram, redistribute the excess and return its CDF mapping
fn clipped_equalization(hist: &mut [f32; 256], area: f32) -> [u8; 256] {
    let limit = (CLAHE_CLIP_LIMIT * area / 256.0).max(1.0);
    let mut excess = 0.0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let bonus = excess / 256.0;

    let mut lut = [0u8; 256];
    let mut cdf = 0.0;
    for (value, bin) in hist.iter().enumerate() {
        cdf += bin + bonus;
        lut[value] = (cdf * 255.0 / area).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// `normalize_image` on the blocking thread pool
pub async fn normalize_image_blocking(data: Vec<u8>) -> MatchResult<NormalizedImage> {
    tokio::task::spawn_blocking(move || normalize_image(&data))
        .await
        .map_err(|e| MatchError::CapacityExhausted(format!("image normalization worker: {}", e)))?
}
