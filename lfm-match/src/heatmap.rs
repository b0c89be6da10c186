//! Local saliency overlay renderer
//!
//! A model-free `HeatmapRenderer`: saliency is the Sobel gradient magnitude of
//! the normalized image's luma, normalized to [0, 1], colored with a jet ramp
//! and alpha-blended over the image. The overlay is stored as
//! `heatmaps/<request_id>.jpg` through the configured `ImageStore`.
//!
//! Only `file://` normalized URIs can be read back.

use crate::explain::{HeatmapRenderer, RenderError};
use crate::storage::ImageStore;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Rgb, RgbImage};
use std::sync::Arc;
use tracing::debug;

/// Heatmap opacity over the image
pub const OVERLAY_ALPHA: f32 = 0.45;

/// JPEG quality of stored overlays
pub const OVERLAY_JPEG_QUALITY: u8 = 90;

/// Object path of a request's heatmap
pub fn heatmap_object_path(request_id: &str) -> String {
    format!("heatmaps/{}.jpg", request_id)
}

/// Sobel gradient magnitude per pixel, scaled so the maximum is 1
///
/// Border pixels and flat images are all zero.
pub fn saliency_map(luma: &GrayImage) -> Vec<f32> {
    let (width, height) = luma.dimensions();
    let mut magnitudes = vec![0f32; (width as usize) * (height as usize)];
    if width < 3 || height < 3 {
        return magnitudes;
    }

    let at = |x: u32, y: u32| luma.get_pixel(x, y).0[0] as f32;
    let mut peak = 0f32;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            let magnitude = (gx * gx + gy * gy).sqrt();
            magnitudes[(y * width + x) as usize] = magnitude;
            peak = peak.max(magnitude);
        }
    }

    if peak > 0.0 {
        magnitudes.iter_mut().for_each(|m| *m /= peak);
    }
    magnitudes
}

/// Jet colormap: 0 is dark blue, 0.5 green-ish, 1 dark red
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |center: f32| {
        let level = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (level * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Blend a jet-colored saliency map over an image
pub fn overlay(image: &RgbImage) -> RgbImage {
    let luma = image::imageops::grayscale(image);
    let saliency = saliency_map(&luma);
    let width = image.width();

    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let heat = jet(saliency[(y * width + x) as usize]);
        let base = image.get_pixel(x, y);
        let mut blended = [0u8; 3];
        for (c, out) in blended.iter_mut().enumerate() {
            let mixed = (1.0 - OVERLAY_ALPHA) * base.0[c] as f32 + OVERLAY_ALPHA * heat.0[c] as f32;
            *out = mixed.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(blended)
    })
}

/// Decode an image, overlay its saliency and encode the result as JPEG
pub fn render_overlay_jpeg(data: &[u8]) -> Result<Vec<u8>, RenderError> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| RenderError::Failed(format!("normalized image could not be decoded: {}", e)))?;
    let blended = overlay(&decoded.to_rgb8());

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, OVERLAY_JPEG_QUALITY)
        .encode_image(&blended)
        .map_err(|e| RenderError::Failed(format!("overlay could not be encoded: {}", e)))?;
    Ok(bytes)
}

/// Gradient-saliency renderer writing through an `ImageStore`
#[derive(Clone)]
pub struct SaliencyOverlayRenderer {
    store: Arc<dyn ImageStore>,
}

impl SaliencyOverlayRenderer {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HeatmapRenderer for SaliencyOverlayRenderer {
    async fn render(
        &self,
        request_id: &str,
        normalized_uri: &str,
        object_id: &str,
    ) -> Result<String, RenderError> {
        let path = normalized_uri.strip_prefix("file://").ok_or_else(|| {
            RenderError::Failed(format!("cannot read normalized image at {}", normalized_uri))
        })?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| RenderError::Failed(format!("reading {}: {}", path, e)))?;

        let jpeg = tokio::task::spawn_blocking(move || render_overlay_jpeg(&data))
            .await
            .map_err(|e| RenderError::Failed(format!("overlay worker: {}", e)))??;

        let object_path = heatmap_object_path(request_id);
        self.store.put(&object_path, &jpeg, "image/jpeg").await?;

        debug!(request_id, object_id, path = %object_path, "Stored saliency overlay");
        Ok(object_path)
    }
}
