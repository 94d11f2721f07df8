//! Face locator backed by the SCRFD detector on ONNX Runtime.
//!
//! The raster is letterboxed into a square tensor; three feature strides are
//! decoded against a fixed anchor grid and merged with NMS.

use crate::normalize::NormalizedImage;
use crate::types::{FaceRegion, Landmarks};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("invalid detector configuration: {0}")]
    InvalidConfig(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a normalized raster.
///
/// An empty result means "no face present" and is not an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &NormalizedImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Detector tuning.
///
/// `input_size` plays the role of an upsampling factor: the image is
/// letterboxed into an `input_size × input_size` square, so larger values
/// resolve smaller faces at a higher CPU cost. It is never derived from the
/// image being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Square detector input resolution, a multiple of 32.
    pub input_size: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            input_size: SCRFD_INPUT_SIZE,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            nms_threshold: SCRFD_NMS_THRESHOLD,
        }
    }
}

impl LocatorConfig {
    fn validate(&self) -> Result<(), DetectorError> {
        let max_stride = SCRFD_STRIDES[SCRFD_STRIDES.len() - 1];
        if self.input_size == 0 || self.input_size % max_stride != 0 {
            return Err(DetectorError::InvalidConfig(format!(
                "input_size must be a positive multiple of {max_stride}, got {}",
                self.input_size
            )));
        }
        Ok(())
    }
}

/// Raw detection in normalized-image coordinates, before clamping.
#[derive(Debug, Clone)]
struct Detection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    landmarks: Option<Landmarks>,
}

/// Scale and padding needed to map tensor coordinates back to the image.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Mutex<Session>,
    config: LocatorConfig,
    /// Output positions for strides 8, 16 and 32, resolved once at load.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdLocator {
    /// Open `det_10g.onnx` (or a compatible SCRFD export) at `model_path`.
    pub fn load(model_path: &Path, config: LocatorConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        config.validate()?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            input_size = config.input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 SCRFD outputs (score, bbox and kps per stride), found {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "detector outputs resolved");

        Ok(Self {
            session: Mutex::new(session),
            config,
            stride_indices,
        })
    }

    /// Preprocess an RGB raster into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, image: &NormalizedImage) -> (Array4<f32>, LetterboxInfo) {
        let size = self.config.input_size;
        let letterbox = letterbox_info(image.width() as usize, image.height() as usize, size);

        let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
        let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
        // Triangle = bilinear, enough for a detector input.
        let resized = image::imageops::resize(image.raster(), new_w, new_h, FilterType::Triangle);

        let pad_x_start = letterbox.pad_x as usize;
        let pad_y_start = letterbox.pad_y as usize;
        let (new_w, new_h) = (new_w as usize, new_h as usize);

        // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            if tx >= size || ty >= size || x as usize >= new_w || y as usize >= new_h {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceLocator for ScrfdLocator {
    /// Detect faces, returning regions sorted by confidence.
    fn locate(&self, image: &NormalizedImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, letterbox) = self.preprocess(image);
        let size = self.config.input_size;

        let mut all_detections = Vec::new();
        {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
                let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

                let (_, scores) = outputs[score_idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
                let (_, bboxes) = outputs[bbox_idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
                let (_, kps) = outputs[kps_idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

                all_detections.extend(decode_stride(
                    scores,
                    bboxes,
                    kps,
                    stride,
                    size,
                    &letterbox,
                    self.config.confidence_threshold,
                ));
            }
        }

        let kept = nms(all_detections, self.config.nms_threshold);
        let regions = to_regions(kept, image.width(), image.height());
        tracing::debug!(faces = regions.len(), "SCRFD located faces");
        Ok(regions)
    }
}

fn letterbox_info(width: usize, height: usize, size: usize) -> LetterboxInfo {
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = (width as f32 * scale).round().min(size as f32);
    let new_h = (height as f32 * scale).round().min(size as f32);
    LetterboxInfo {
        scale,
        // Whole pixels, matching where preprocess places the raster.
        pad_x: ((size as f32 - new_w) / 2.0).floor(),
        pad_y: ((size as f32 - new_h) / 2.0).floor(),
    }
}

/// Clamp detections into image-space regions, keeping confidence order.
fn to_regions(detections: Vec<Detection>, width: u32, height: u32) -> Vec<FaceRegion> {
    detections
        .into_iter()
        .filter_map(|d| {
            let mut region = FaceRegion::from_box(d.x, d.y, d.width, d.height, width, height)?;
            region.confidence = d.confidence;
            region.landmarks = d.landmarks;
            Some(region)
        })
        .collect()
}

/// Map each stride to its output tensors.
///
/// Exports that name their outputs `score_8`, `bbox_16`, ... are matched by
/// name; anything else is assumed to use the insightface order of three
/// score tensors, then three bbox tensors, then three keypoint tensors.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("detector outputs matched by name");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "detector output names not recognized; assuming insightface positional order"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Anchor-decode one stride into image-space detections above `threshold`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let unmap = |v: f32, pad: f32| (v - pad) / letterbox.scale;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid) as f32 * stride as f32;

        // [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = unmap(anchor_cx - bboxes[bbox_off] * stride as f32, letterbox.pad_x);
        let y1 = unmap(anchor_cy - bboxes[bbox_off + 1] * stride as f32, letterbox.pad_y);
        let x2 = unmap(anchor_cx + bboxes[bbox_off + 2] * stride as f32, letterbox.pad_x);
        let y2 = unmap(anchor_cy + bboxes[bbox_off + 3] * stride as f32, letterbox.pad_y);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                (
                    unmap(anchor_cx + kps[kps_off + i * 2] * stride as f32, letterbox.pad_x),
                    unmap(anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32, letterbox.pad_y),
                )
            })
        });

        detections.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Greedy NMS.
///
/// Output is sorted by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two detections.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
