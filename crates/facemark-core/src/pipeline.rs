//! The service object tying normalizer, locator, encoder and compositor together.
//!
//! Built once at startup and shared read-only; every call allocates its own
//! rasters, so a single `FacePipeline` can serve any number of threads.

use crate::detector::{FaceLocator, LocatorConfig, ScrfdLocator};
use crate::error::FacemarkError;
use crate::matcher::{Candidate, EuclideanMatcher, Matcher};
use crate::normalize::{NormalizedImage, Normalizer, NormalizerConfig};
use crate::recognizer::{ArcFaceEncoder, FaceEncoder};
use crate::types::{FaceDescriptor, FaceEncoding, FaceRegion, SimilarityMatch};
use crate::watermark::{WatermarkCompositor, WatermarkSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Locations of the ONNX models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    /// Standard model file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            recognizer: dir.join(RECOGNIZER_MODEL_FILE),
        }
    }
}

/// Settings used by [`FacePipeline::load`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    pub locator: LocatorConfig,
    /// TrueType/OpenType font for the watermark; the bundled font when unset.
    pub font_path: Option<PathBuf>,
}

/// What the locator saw while computing a descriptor.
#[derive(Debug, Clone)]
pub struct EncodingReport {
    pub width: u32,
    pub height: u32,
    /// Number of regions the locator returned (0 when it failed).
    pub faces: usize,
    pub encoding: FaceEncoding,
}

/// Both storable outputs for one uploaded photo.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub encoding: FaceEncoding,
    /// JPEG bytes with the same dimensions as the normalized image.
    pub watermarked: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub struct FacePipeline {
    normalizer: Normalizer,
    locator: Box<dyn FaceLocator>,
    encoder: Box<dyn FaceEncoder>,
    compositor: WatermarkCompositor,
}

impl FacePipeline {
    pub fn new(
        normalizer: Normalizer,
        locator: impl FaceLocator + 'static,
        encoder: impl FaceEncoder + 'static,
        compositor: WatermarkCompositor,
    ) -> Self {
        Self {
            normalizer,
            locator: Box::new(locator),
            encoder: Box::new(encoder),
            compositor,
        }
    }

    /// Load both ONNX models and the watermark font.
    ///
    /// Any missing or unusable piece is reported here as
    /// [`FacemarkError::CapabilityUnavailable`] rather than on first use.
    pub fn load(paths: &ModelPaths, config: &PipelineConfig) -> Result<Self, FacemarkError> {
        let locator = ScrfdLocator::load(&paths.detector, config.locator.clone())
            .map_err(|e| FacemarkError::CapabilityUnavailable(format!("face locator: {e}")))?;
        let encoder = ArcFaceEncoder::load(&paths.recognizer)
            .map_err(|e| FacemarkError::CapabilityUnavailable(format!("face encoder: {e}")))?;

        let compositor = match &config.font_path {
            Some(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    FacemarkError::CapabilityUnavailable(format!(
                        "watermark font {}: {e}",
                        path.display()
                    ))
                })?;
                WatermarkCompositor::with_font(data)?
            }
            None => WatermarkCompositor::new()?,
        };

        tracing::info!(
            detector = %paths.detector.display(),
            recognizer = %paths.recognizer.display(),
            max_width = config.normalizer.max_width,
            "face pipeline ready"
        );

        Ok(Self::new(
            Normalizer::new(config.normalizer.clone()),
            locator,
            encoder,
            compositor,
        ))
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedImage, FacemarkError> {
        self.normalizer.normalize(bytes)
    }

    /// Compute a descriptor for the first face in `bytes`.
    ///
    /// Only undecodable input is an error; "no face" and "encoding failed"
    /// come back as [`FaceEncoding`] variants.
    pub fn encode_face(&self, bytes: &[u8]) -> Result<FaceEncoding, FacemarkError> {
        Ok(self.encode_face_with_report(bytes)?.encoding)
    }

    pub fn encode_face_with_report(&self, bytes: &[u8]) -> Result<EncodingReport, FacemarkError> {
        let image = self.normalize(bytes)?;
        let located = self.locate(&image);
        let faces = located.as_ref().map(Vec::len).unwrap_or(0);
        let encoding = self.encode_located(&image, &located);

        Ok(EncodingReport {
            width: image.width(),
            height: image.height(),
            faces,
            encoding,
        })
    }

    /// Produce the watermarked derivative of `bytes`.
    ///
    /// Input goes through the pipeline's normalizer unless `spec.max_width`
    /// overrides it. Face masking is best-effort: a locator failure yields
    /// an unmasked watermark, not an error.
    pub fn watermark(&self, bytes: &[u8], spec: &WatermarkSpec) -> Result<Vec<u8>, FacemarkError> {
        spec.validate()?;
        let image = self.normalize_for(bytes, spec)?;
        let faces = self.locate(&image).unwrap_or_default();
        self.compositor.apply(&image, &faces, spec)
    }

    /// Normalize once, locate once, and return both the descriptor outcome
    /// and the watermarked bytes.
    ///
    /// Always uses the pipeline's normalizer and ignores `spec.max_width`,
    /// so stored descriptors come from the same raster width `encode_face`
    /// uses for search probes.
    pub fn ingest(&self, bytes: &[u8], spec: &WatermarkSpec) -> Result<Ingested, FacemarkError> {
        spec.validate()?;
        let image = self.normalizer.normalize(bytes)?;
        let located = self.locate(&image);
        let faces: &[FaceRegion] = located.as_deref().unwrap_or(&[]);

        let watermarked = self.compositor.apply(&image, faces, spec)?;
        let encoding = self.encode_located(&image, &located);

        Ok(Ingested {
            encoding,
            watermarked,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Stored descriptors within `threshold` of `probe`, nearest first.
    pub fn search<M: Clone>(
        &self,
        probe: &FaceDescriptor,
        candidates: &[Candidate<M>],
        threshold: f64,
    ) -> Vec<SimilarityMatch<M>> {
        EuclideanMatcher.search(probe, candidates, threshold)
    }

    fn normalize_for(
        &self,
        bytes: &[u8],
        spec: &WatermarkSpec,
    ) -> Result<NormalizedImage, FacemarkError> {
        match spec.max_width {
            Some(max_width) if max_width != self.normalizer.max_width() => {
                Normalizer::new(NormalizerConfig { max_width }).normalize(bytes)
            }
            _ => self.normalizer.normalize(bytes),
        }
    }

    /// Run the locator, logging failures instead of propagating them.
    fn locate(&self, image: &NormalizedImage) -> Result<Vec<FaceRegion>, String> {
        self.locator.locate(image).map_err(|e| {
            tracing::warn!(error = %e, "face locator failed; continuing without face regions");
            e.to_string()
        })
    }

    fn encode_located(
        &self,
        image: &NormalizedImage,
        located: &Result<Vec<FaceRegion>, String>,
    ) -> FaceEncoding {
        let faces = match located {
            Ok(faces) => faces,
            Err(reason) => {
                return FaceEncoding::EncodingFailed {
                    reason: reason.clone(),
                }
            }
        };
        let Some(face) = faces.first() else {
            tracing::debug!("no face detected");
            return FaceEncoding::NoFaceDetected;
        };

        match self.encoder.encode(image, face) {
            Ok(descriptor) => {
                tracing::debug!(
                    faces = faces.len(),
                    confidence = face.confidence,
                    len = descriptor.len(),
                    "face encoded"
                );
                FaceEncoding::Found(descriptor)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    model = self.encoder.model_version(),
                    "face encoding failed; storing photo without descriptor"
                );
                FaceEncoding::EncodingFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
