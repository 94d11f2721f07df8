//! ArcFace face encoder via ONNX Runtime.
//!
//! Extracts 512-dimensional face descriptors from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::normalize::NormalizedImage;
use crate::types::{FaceDescriptor, FaceRegion};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region could not be aligned")]
    AlignmentFailed,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts one located face into a fixed-length descriptor.
pub trait FaceEncoder: Send + Sync {
    /// Model tag stamped on every descriptor this encoder produces.
    fn model_version(&self) -> &str;

    fn encode(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
    ) -> Result<FaceDescriptor, RecognizerError>;
}

/// ArcFace-based face encoder.
pub struct ArcFaceEncoder {
    session: Mutex<Session>,
}

impl ArcFaceEncoder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Preprocess a 112x112 RGB aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned_face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    /// Align the face to the canonical 112x112 position, then run ArcFace.
    fn encode(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
    ) -> Result<FaceDescriptor, RecognizerError> {
        let aligned =
            alignment::align_face(image, region).ok_or(RecognizerError::AlignmentFailed)?;
        let input = Self::preprocess(&aligned);

        let raw: Vec<f32> = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, raw_data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;
            raw_data.to_vec()
        };

        let values = l2_normalize(&raw)?;
        Ok(FaceDescriptor::with_model(values, ARCFACE_MODEL_VERSION))
    }
}

/// Validate the raw model output and L2-normalize it into `f64` values.
fn l2_normalize(raw: &[f32]) -> Result<Vec<f64>, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed(
            "embedding contains non-finite values".into(),
        ));
    }

    let norm = raw.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    if norm <= 0.0 {
        return Err(RecognizerError::InferenceFailed("embedding has zero norm".into()));
    }
    Ok(raw.iter().map(|&x| x as f64 / norm).collect())
}
