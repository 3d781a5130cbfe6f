use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// What to do to a captured or exported frame. Both fields unset means the
/// bytes pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transform {
    pub resize: Option<(u32, u32)>,
    pub jpeg_quality: Option<u8>,
}

impl Transform {
    pub fn is_noop(&self) -> bool {
        self.resize.is_none() && self.jpeg_quality.is_none()
    }
}

/// Pixel work lives behind this seam; the scheduling core never decodes
/// an image itself.
pub trait ImageCodec: Send + Sync {
    fn transform(&self, bytes: &[u8], transform: &Transform) -> Result<Vec<u8>>;
}

/// Codec backed by the image crate: decode, optional exact resize,
/// re-encode as JPEG at the requested quality.
#[derive(Debug, Default)]
pub struct RasterCodec;

impl ImageCodec for RasterCodec {
    fn transform(&self, bytes: &[u8], transform: &Transform) -> Result<Vec<u8>> {
        if transform.is_noop() {
            return Ok(bytes.to_vec());
        }
        let mut img = image::load_from_memory(bytes).context("failed to decode image")?;
        if let Some((width, height)) = transform.resize {
            img = img.resize_exact(width, height, FilterType::Lanczos3);
        }
        let quality = transform.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, quality);
        img.to_rgb8()
            .write_with_encoder(encoder)
            .context("failed to encode JPEG")?;
        Ok(out)
    }
}
