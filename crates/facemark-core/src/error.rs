use thiserror::Error;

/// Errors surfaced to callers of the pipeline.
///
/// "No face" and "descriptor computation failed" are not errors; see
/// [`FaceEncoding`](crate::FaceEncoding).
#[derive(Error, Debug)]
pub enum FacemarkError {
    /// Input bytes are not a recognizable image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The composited raster could not be re-encoded.
    #[error("failed to encode image: {0}")]
    Encode(String),

    /// A model file or font required by the pipeline is missing or unusable.
    #[error("face pipeline unavailable: {0}")]
    CapabilityUnavailable(String),

    /// A caller-supplied [`WatermarkSpec`](crate::WatermarkSpec) is out of range.
    #[error("invalid watermark spec: {0}")]
    InvalidWatermark(String),
}
