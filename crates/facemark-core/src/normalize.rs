//! Image normalization: decode, apply orientation, convert to 8-bit RGB, downscale.

use crate::error::FacemarkError;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const DEFAULT_MAX_WIDTH: u32 = 1000;

/// Normalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Images wider than this are downscaled to exactly this width.
    pub max_width: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
        }
    }
}

/// Upright, 8-bit RGB raster produced by [`Normalizer::normalize`].
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    raster: RgbImage,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    pub fn raster(&self) -> &RgbImage {
        &self.raster
    }

    /// Packed RGB bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.raster.as_raw()
    }

    pub fn into_raster(self) -> RgbImage {
        self.raster
    }
}

/// Decodes untrusted bytes into a [`NormalizedImage`].
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn max_width(&self) -> u32 {
        self.config.max_width
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedImage, FacemarkError> {
        let decoded = decode_oriented(bytes)?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(FacemarkError::Decode("image dimensions are zero".into()));
        }

        // Drops alpha and reduces 16-bit / float samples to 8 bits per channel.
        let rgb = decoded.to_rgb8();
        let raster = downscale(rgb, self.config.max_width);

        tracing::debug!(
            width = raster.width(),
            height = raster.height(),
            "normalized image"
        );

        Ok(NormalizedImage { raster })
    }
}

/// Normalize with the given maximum width.
pub fn normalize(bytes: &[u8], max_width: u32) -> Result<NormalizedImage, FacemarkError> {
    Normalizer::new(NormalizerConfig { max_width }).normalize(bytes)
}

/// Decode and apply embedded orientation metadata (EXIF, etc.).
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, FacemarkError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| FacemarkError::Decode(e.to_string()))?
        .into_decoder()
        .map_err(|e| FacemarkError::Decode(e.to_string()))?;

    // Broken orientation metadata is not worth rejecting an otherwise valid photo.
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut image =
        DynamicImage::from_decoder(decoder).map_err(|e| FacemarkError::Decode(e.to_string()))?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Target dimensions for a downscale to `max_width`, or `None` if it already fits.
fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if max_width == 0 || width <= max_width {
        return None;
    }
    let new_height = (height as f64 * max_width as f64 / width as f64).round() as u32;
    Some((max_width, new_height.max(1)))
}

fn downscale(raster: RgbImage, max_width: u32) -> RgbImage {
    match scaled_dimensions(raster.width(), raster.height(), max_width) {
        Some((w, h)) => image::imageops::resize(&raster, w, h, FilterType::Lanczos3),
        None => raster,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_scaled_dimensions_exact_width() {
        assert_eq!(scaled_dimensions(2000, 1500, 1000), Some((1000, 750)));
    }

    #[test]
    fn test_scaled_dimensions_rounds_height() {
        // 333 * 1000 / 2001 = 166.4 → 166
        assert_eq!(scaled_dimensions(2001, 333, 1000), Some((1000, 166)));
        // 999 * 1000 / 1998 = 500.0
        assert_eq!(scaled_dimensions(1998, 999, 1000), Some((1000, 500)));
    }

    #[test]
    fn test_scaled_dimensions_small_image_untouched() {
        assert_eq!(scaled_dimensions(800, 600, 1000), None);
        assert_eq!(scaled_dimensions(1000, 600, 1000), None);
    }

    #[test]
    fn test_scaled_dimensions_min_height() {
        assert_eq!(scaled_dimensions(5000, 1, 1000), Some((1000, 1)));
    }

    #[test]
    fn test_normalize_downscales_wide_image() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2000, 900, Rgb([10, 20, 30])));
        let n = normalize(&png_bytes(&img), 1000).unwrap();
        assert_eq!(n.width(), 1000);
        assert_eq!(n.height(), 450);
    }

    #[test]
    fn test_normalize_keeps_small_image() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 240, Rgb([1, 2, 3])));
        let n = normalize(&png_bytes(&img), 1000).unwrap();
        assert_eq!((n.width(), n.height()), (320, 240));
        assert_eq!(n.raster().get_pixel(5, 5), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_normalize_converts_rgba_to_rgb() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 4, Rgba([200, 100, 50, 128])));
        let n = normalize(&png_bytes(&img), 1000).unwrap();
        assert_eq!(n.as_raw().len(), 8 * 4 * 3);
        assert_eq!(n.raster().get_pixel(0, 0), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_normalize_converts_16bit() {
        let img = DynamicImage::ImageRgb16(image::ImageBuffer::from_pixel(
            6,
            6,
            Rgb([65535u16, 0, 32896]),
        ));
        let n = normalize(&png_bytes(&img), 1000).unwrap();
        assert_eq!(n.raster().get_pixel(3, 3), &Rgb([255, 0, 128]));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let err = normalize(b"definitely not an image", 1000).unwrap_err();
        assert!(matches!(err, FacemarkError::Decode(_)));
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(matches!(normalize(&[], 1000), Err(FacemarkError::Decode(_))));
    }

    #[test]
    fn test_normalize_idempotent() {
        let mut src = RgbImage::new(1500, 700);
        for (x, y, p) in src.enumerate_pixels_mut() {
            *p = Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
        }
        let first = normalize(&png_bytes(&DynamicImage::ImageRgb8(src)), 1000).unwrap();
        let again = normalize(
            &png_bytes(&DynamicImage::ImageRgb8(first.raster().clone())),
            1000,
        )
        .unwrap();
        assert_eq!(first.raster(), again.raster());
    }
}
