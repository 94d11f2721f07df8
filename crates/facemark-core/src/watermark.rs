//! Tiled, rotated text watermark with face regions cut out of the overlay.

use crate::error::FacemarkError;
use crate::normalize::NormalizedImage;
use crate::types::FaceRegion;
use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageEncoder, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use serde::{Deserialize, Serialize};

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans-Bold.ttf");

const MIN_FONT_PX: f32 = 12.0;

/// Shape cut out of the overlay around each face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskShape {
    Rectangle,
    Ellipse,
}

/// Watermark rendering parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkSpec {
    pub text: String,
    /// Font pixel size as a fraction of the image width (never below 12 px).
    pub font_size_ratio: f32,
    /// Horizontal tile spacing as a multiple of the rendered text width.
    pub step_x_ratio: f32,
    /// Vertical tile spacing as a multiple of the rendered text height.
    pub step_y_ratio: f32,
    /// Overlay rotation in degrees, counter-clockwise positive.
    pub angle_degrees: f32,
    /// Text opacity in [0, 1].
    pub opacity: f32,
    pub color: [u8; 3],
    /// Normalization width for this call. `None` uses the pipeline's
    /// normalizer, so the derivative matches `normalize` and `encode_face`.
    pub max_width: Option<u32>,
    /// Face boxes are grown by this fraction of their height before masking.
    pub face_margin_ratio: f32,
    pub mask_shape: MaskShape,
    pub jpeg_quality: u8,
}

impl Default for WatermarkSpec {
    fn default() -> Self {
        Self {
            text: "WATERMARK".to_string(),
            font_size_ratio: 0.05,
            step_x_ratio: 1.5,
            step_y_ratio: 3.0,
            angle_degrees: -30.0,
            opacity: 0.35,
            color: [255, 255, 255],
            max_width: None,
            face_margin_ratio: 0.25,
            mask_shape: MaskShape::Ellipse,
            jpeg_quality: 90,
        }
    }
}

impl WatermarkSpec {
    /// Reject values that would make rendering degenerate or unbounded.
    pub fn validate(&self) -> Result<(), FacemarkError> {
        let invalid = |msg: String| Err(FacemarkError::InvalidWatermark(msg));

        if !(self.font_size_ratio > 0.0 && self.font_size_ratio <= 1.0) {
            return invalid(format!(
                "font_size_ratio must be in (0, 1], got {}",
                self.font_size_ratio
            ));
        }
        let steps = [
            ("step_x_ratio", self.step_x_ratio),
            ("step_y_ratio", self.step_y_ratio),
        ];
        for (name, ratio) in steps {
            if !(ratio.is_finite() && ratio > 0.0) {
                return invalid(format!("{name} must be finite and positive, got {ratio}"));
            }
        }
        if !self.angle_degrees.is_finite() {
            return invalid(format!("angle_degrees must be finite, got {}", self.angle_degrees));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return invalid(format!("opacity must be in [0, 1], got {}", self.opacity));
        }
        if !(self.face_margin_ratio.is_finite() && self.face_margin_ratio >= 0.0) {
            return invalid(format!(
                "face_margin_ratio must be finite and non-negative, got {}",
                self.face_margin_ratio
            ));
        }
        if self.max_width == Some(0) {
            return invalid("max_width must be positive".to_string());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!("jpeg_quality must be in 1..=100, got {}", self.jpeg_quality));
        }
        Ok(())
    }
}

/// Renders watermark overlays and composites them onto normalized rasters.
pub struct WatermarkCompositor {
    font: FontArc,
}

impl WatermarkCompositor {
    /// Compositor using the bundled DejaVu Sans Bold font.
    pub fn new() -> Result<Self, FacemarkError> {
        let font = FontArc::try_from_slice(BUNDLED_FONT)
            .map_err(|e| FacemarkError::CapabilityUnavailable(format!("bundled font: {e}")))?;
        Ok(Self { font })
    }

    /// Compositor using caller-provided TrueType/OpenType bytes.
    pub fn with_font(font_data: Vec<u8>) -> Result<Self, FacemarkError> {
        let font = FontArc::try_from_vec(font_data)
            .map_err(|e| FacemarkError::CapabilityUnavailable(format!("watermark font: {e}")))?;
        Ok(Self { font })
    }

    /// Build the rotated text overlay for a `width × height` image.
    ///
    /// The pattern is tiled over a square larger than the image diagonal plus
    /// its longest side, rotated, then cropped back to the image so the
    /// corners never show gaps.
    pub fn overlay(&self, width: u32, height: u32, spec: &WatermarkSpec) -> RgbaImage {
        let [r, g, b] = spec.color;
        let clear = Rgba([r, g, b, 0]);

        let font_px = (width as f32 * spec.font_size_ratio.clamp(0.0, 1.0)).max(MIN_FONT_PX);
        let scale = PxScale::from(font_px);
        let (text_w, text_h) = text_size(scale, &self.font, &spec.text);
        if text_w == 0 || text_h == 0 || spec.opacity <= 0.0 {
            return RgbaImage::from_pixel(width, height, clear);
        }

        let diagonal = ((width as f64).hypot(height as f64)).ceil() as u32;
        let side = diagonal + width.max(height);
        let mut canvas = RgbaImage::from_pixel(side, side, clear);

        let alpha = (spec.opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
        let ink = Rgba([r, g, b, alpha]);
        let step_x = tile_step(text_w, spec.step_x_ratio);
        let step_y = tile_step(text_h, spec.step_y_ratio);

        for y in (0..side).step_by(step_y) {
            for x in (0..side).step_by(step_x) {
                draw_text_mut(&mut canvas, ink, x as i32, y as i32, scale, &self.font, &spec.text);
            }
        }

        // imageproc rotates clockwise for positive angles.
        let theta = -spec.angle_degrees.to_radians();
        let rotated = rotate_about_center(&canvas, theta, Interpolation::Bilinear, clear);

        let x0 = (side - width) / 2;
        let y0 = (side - height) / 2;
        image::imageops::crop_imm(&rotated, x0, y0, width, height).to_image()
    }

    /// Composite the watermark onto `image`, keeping `faces` clear.
    ///
    /// Returns the raster before re-encoding.
    pub fn render(
        &self,
        image: &NormalizedImage,
        faces: &[FaceRegion],
        spec: &WatermarkSpec,
    ) -> RgbImage {
        let mut overlay = self.overlay(image.width(), image.height(), spec);
        mask_faces(&mut overlay, faces, spec);
        composite(image.raster(), &overlay)
    }

    /// Validate `spec`, render, and re-encode as JPEG at `spec.jpeg_quality`.
    pub fn apply(
        &self,
        image: &NormalizedImage,
        faces: &[FaceRegion],
        spec: &WatermarkSpec,
    ) -> Result<Vec<u8>, FacemarkError> {
        spec.validate()?;
        let raster = self.render(image, faces, spec);
        encode_jpeg(&raster, spec.jpeg_quality)
    }
}

/// Distance between tile origins along one axis, never shorter than the text.
fn tile_step(text_len: u32, ratio: f32) -> usize {
    let scaled = if ratio.is_finite() {
        (text_len as f32 * ratio).round()
    } else {
        0.0
    };
    (scaled as u32).max(text_len).max(1) as usize
}

/// Clear overlay opacity inside each face's expanded region.
fn mask_faces(overlay: &mut RgbaImage, faces: &[FaceRegion], spec: &WatermarkSpec) {
    let (width, height) = overlay.dimensions();

    for face in faces {
        let region = face.expand(spec.face_margin_ratio, width, height);
        if region.left >= region.right || region.top >= region.bottom {
            continue;
        }

        let cx = (region.left + region.right) as f32 / 2.0;
        let cy = (region.top + region.bottom) as f32 / 2.0;
        let rx = region.width() as f32 / 2.0;
        let ry = region.height() as f32 / 2.0;

        for y in region.top..region.bottom {
            for x in region.left..region.right {
                let inside = match spec.mask_shape {
                    MaskShape::Rectangle => true,
                    MaskShape::Ellipse => {
                        let nx = (x as f32 + 0.5 - cx) / rx;
                        let ny = (y as f32 + 0.5 - cy) / ry;
                        nx * nx + ny * ny <= 1.0
                    }
                };
                if inside {
                    overlay.get_pixel_mut(x, y).0[3] = 0;
                }
            }
        }
    }
}

/// Alpha-blend `overlay` over `base`. Fully transparent overlay pixels leave
/// the base untouched.
fn composite(base: &RgbImage, overlay: &RgbaImage) -> RgbImage {
    let mut out = base.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let [or, og, ob, oa] = overlay.get_pixel(x, y).0;
        if oa == 0 {
            continue;
        }
        let a = oa as f32 / 255.0;
        let blend = |b: u8, o: u8| {
            (b as f32 * (1.0 - a) + o as f32 * a)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        let [br, bg, bb] = pixel.0;
        *pixel = Rgb([blend(br, or), blend(bg, og), blend(bb, ob)]);
    }
    out
}

pub(crate) fn encode_jpeg(raster: &RgbImage, quality: u8) -> Result<Vec<u8>, FacemarkError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .write_image(
            raster.as_raw(),
            raster.width(),
            raster.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| FacemarkError::Encode(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    fn gray_image(width: u32, height: u32) -> NormalizedImage {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 90, 90])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        normalize(buf.get_ref(), 1000).unwrap()
    }

    #[test]
    fn test_overlay_matches_image_size() {
        let compositor = WatermarkCompositor::new().unwrap();
        let overlay = compositor.overlay(200, 120, &WatermarkSpec::default());
        assert_eq!(overlay.dimensions(), (200, 120));
    }

    #[test]
    fn test_overlay_has_visible_text() {
        let compositor = WatermarkCompositor::new().unwrap();
        let overlay = compositor.overlay(300, 200, &WatermarkSpec::default());
        let max_alpha = overlay.pixels().map(|p| p.0[3]).max().unwrap();
        // opacity 0.35 → alpha ≈ 89 at full glyph coverage
        assert!(max_alpha > 40, "max alpha {max_alpha}");
        assert!(max_alpha <= 90, "max alpha {max_alpha}");
    }

    #[test]
    fn test_overlay_empty_text_is_transparent() {
        let compositor = WatermarkCompositor::new().unwrap();
        let spec = WatermarkSpec {
            text: String::new(),
            ..WatermarkSpec::default()
        };
        let overlay = compositor.overlay(64, 64, &spec);
        assert!(overlay.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_overlay_zero_opacity_is_transparent() {
        let compositor = WatermarkCompositor::new().unwrap();
        let spec = WatermarkSpec {
            opacity: 0.0,
            ..WatermarkSpec::default()
        };
        let overlay = compositor.overlay(64, 64, &spec);
        assert!(overlay.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_overlay_corners_are_covered() {
        let compositor = WatermarkCompositor::new().unwrap();
        let spec = WatermarkSpec::default();

        for (width, height) in [(1000, 750), (750, 1000), (1000, 200), (200, 1000)] {
            let overlay = compositor.overlay(width, height, &spec);

            // One tile period along the text row is enough to cross a glyph.
            let font_px = (width as f32 * spec.font_size_ratio).max(MIN_FONT_PX);
            let (text_w, _) = text_size(PxScale::from(font_px), &compositor.font, &spec.text);
            let period = tile_step(text_w, spec.step_x_ratio) as u32;
            let (bw, bh) = (period.min(width), period.min(height));

            let corners = [(0, 0), (width - bw, 0), (0, height - bh), (width - bw, height - bh)];
            for (x0, y0) in corners {
                let max_alpha = (y0..y0 + bh)
                    .flat_map(|y| (x0..x0 + bw).map(move |x| (x, y)))
                    .map(|(x, y)| overlay.get_pixel(x, y).0[3])
                    .max()
                    .unwrap();
                assert!(max_alpha > 0, "{width}x{height} corner ({x0}, {y0}) is bare");
            }
        }
    }

    #[test]
    fn test_tile_step_never_shorter_than_text() {
        assert_eq!(tile_step(80, 1.5), 120);
        assert_eq!(tile_step(80, 0.0), 80);
        assert_eq!(tile_step(80, -2.0), 80);
        assert_eq!(tile_step(80, f32::NAN), 80);
        assert_eq!(tile_step(0, 0.0), 1);
    }

    #[test]
    fn test_overlay_zero_steps_are_floored() {
        let compositor = WatermarkCompositor::new().unwrap();
        let spec = WatermarkSpec {
            step_x_ratio: 0.0,
            step_y_ratio: 0.0,
            ..WatermarkSpec::default()
        };
        let overlay = compositor.overlay(60, 40, &spec);
        assert_eq!(overlay.dimensions(), (60, 40));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        assert!(WatermarkSpec::default().validate().is_ok());

        let bad = [
            WatermarkSpec {
                step_x_ratio: 0.0,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                step_y_ratio: f32::INFINITY,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                font_size_ratio: f32::NAN,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                font_size_ratio: 4.0,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                opacity: 1.5,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                face_margin_ratio: -0.1,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                jpeg_quality: 0,
                ..WatermarkSpec::default()
            },
            WatermarkSpec {
                max_width: Some(0),
                ..WatermarkSpec::default()
            },
        ];
        for spec in bad {
            assert!(
                matches!(spec.validate(), Err(FacemarkError::InvalidWatermark(_))),
                "{spec:?}"
            );
        }
    }

    #[test]
    fn test_apply_rejects_invalid_spec() {
        let compositor = WatermarkCompositor::new().unwrap();
        let spec = WatermarkSpec {
            step_y_ratio: -1.0,
            ..WatermarkSpec::default()
        };
        let result = compositor.apply(&gray_image(60, 40), &[], &spec);
        assert!(matches!(result, Err(FacemarkError::InvalidWatermark(_))));
    }

    #[test]
    fn test_mask_skips_inverted_region() {
        let mut overlay = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 200]));
        let spec = WatermarkSpec::default();
        mask_faces(&mut overlay, &[FaceRegion::new(60, 30, 40, 70)], &spec);
        assert!(overlay.pixels().all(|p| p.0[3] == 200));
    }

    #[test]
    fn test_mask_rectangle_clears_expanded_region() {
        let mut overlay = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 200]));
        let spec = WatermarkSpec {
            mask_shape: MaskShape::Rectangle,
            ..WatermarkSpec::default()
        };
        mask_faces(&mut overlay, &[FaceRegion::new(40, 60, 60, 40)], &spec);

        // height 20 → margin 5 → [35, 65)
        assert_eq!(overlay.get_pixel(35, 35).0[3], 0);
        assert_eq!(overlay.get_pixel(64, 64).0[3], 0);
        assert_eq!(overlay.get_pixel(34, 50).0[3], 200);
        assert_eq!(overlay.get_pixel(65, 50).0[3], 200);
    }

    #[test]
    fn test_mask_ellipse_clears_center_keeps_corners() {
        let mut overlay = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 200]));
        let spec = WatermarkSpec {
            mask_shape: MaskShape::Ellipse,
            ..WatermarkSpec::default()
        };
        mask_faces(&mut overlay, &[FaceRegion::new(30, 70, 70, 30)], &spec);

        // expanded to [20, 80)
        assert_eq!(overlay.get_pixel(50, 50).0[3], 0);
        assert_eq!(overlay.get_pixel(50, 21).0[3], 0);
        assert_eq!(overlay.get_pixel(21, 21).0[3], 200);
        assert_eq!(overlay.get_pixel(10, 10).0[3], 200);
    }

    #[test]
    fn test_composite_transparent_is_identity() {
        let base = RgbImage::from_fn(16, 16, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));
        let overlay = RgbaImage::from_pixel(16, 16, Rgba([255, 255, 255, 0]));
        assert_eq!(composite(&base, &overlay), base);
    }

    #[test]
    fn test_composite_blends() {
        let base = RgbImage::from_pixel(1, 1, Rgb([0, 100, 200]));
        let overlay = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
        assert_eq!(composite(&base, &overlay).get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_render_leaves_face_untouched() {
        let compositor = WatermarkCompositor::new().unwrap();
        let image = gray_image(240, 180);
        let face = FaceRegion::new(60, 140, 120, 100);
        let spec = WatermarkSpec {
            mask_shape: MaskShape::Rectangle,
            ..WatermarkSpec::default()
        };

        let out = compositor.render(&image, std::slice::from_ref(&face), &spec);
        let expanded = face.expand(spec.face_margin_ratio, 240, 180);
        for y in expanded.top..expanded.bottom {
            for x in expanded.left..expanded.right {
                assert_eq!(out.get_pixel(x, y), image.raster().get_pixel(x, y), "({x}, {y})");
            }
        }
        assert_ne!(&out, image.raster(), "watermark should change pixels outside the face");
    }

    #[test]
    fn test_apply_produces_decodable_jpeg() {
        let compositor = WatermarkCompositor::new().unwrap();
        let image = gray_image(160, 90);
        let bytes = compositor.apply(&image, &[], &WatermarkSpec::default()).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 90));
    }

    #[test]
    fn test_with_font_rejects_garbage() {
        let result = WatermarkCompositor::with_font(b"not a font".to_vec());
        assert!(matches!(result, Err(FacemarkError::CapabilityUnavailable(_))));
    }

    #[test]
    fn test_spec_defaults_fill_missing_fields() {
        let spec: WatermarkSpec =
            serde_json::from_str(r#"{"text": "PROOF", "mask_shape": "rectangle"}"#).unwrap();
        assert_eq!(spec.text, "PROOF");
        assert_eq!(spec.mask_shape, MaskShape::Rectangle);
        assert_eq!(spec.angle_degrees, -30.0);
        assert_eq!(spec.jpeg_quality, 90);
        assert_eq!(spec.max_width, None);
    }
}
