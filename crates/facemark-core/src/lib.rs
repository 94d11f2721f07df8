//! facemark-core: face-indexed watermarking and descriptor search.
//!
//! Normalizes uploaded photos, locates faces with SCRFD, encodes them with
//! ArcFace (both via ONNX Runtime), renders a face-safe tiled watermark and
//! matches probe descriptors against stored ones by Euclidean distance.

pub mod alignment;
pub mod detector;
pub mod error;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod recognizer;
pub mod types;
pub mod watermark;

pub use detector::{FaceLocator, LocatorConfig, ScrfdLocator};
pub use error::FacemarkError;
pub use matcher::{face_distance, Candidate, EuclideanMatcher, Matcher};
pub use normalize::{normalize, NormalizedImage, Normalizer, NormalizerConfig};
pub use pipeline::{EncodingReport, FacePipeline, Ingested, ModelPaths, PipelineConfig};
pub use recognizer::{ArcFaceEncoder, FaceEncoder};
pub use types::{FaceDescriptor, FaceEncoding, FaceRegion, Landmarks, SimilarityMatch};
pub use watermark::{MaskShape, WatermarkCompositor, WatermarkSpec};

use std::path::PathBuf;

/// Default directory holding `det_10g.onnx` and `w600k_r50.onnx`.
///
/// `$XDG_DATA_HOME/facemark/models`, falling back to
/// `$HOME/.local/share/facemark/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facemark")
        .join("models")
}
