use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Pixel bounding box of a detected face within a normalized image.
///
/// Regions built with [`FaceRegion::from_box`] satisfy `top < bottom <= height`
/// and `left < right <= width`. An inverted region built by hand has zero size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl FaceRegion {
    /// Region with full confidence and no landmarks.
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Clamp a floating-point `x, y, width, height` box to the image bounds.
    ///
    /// Returns `None` when nothing of the box is left inside the image.
    pub fn from_box(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && width.is_finite() && height.is_finite()) {
            return None;
        }
        let left = x.floor().clamp(0.0, image_width as f32) as u32;
        let top = y.floor().clamp(0.0, image_height as f32) as u32;
        let right = (x + width).ceil().clamp(0.0, image_width as f32) as u32;
        let bottom = (y + height).ceil().clamp(0.0, image_height as f32) as u32;

        if left >= right || top >= bottom {
            return None;
        }
        Some(Self::new(top, right, bottom, left))
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Grow the region on every side by `ratio × height`, clamped to the image.
    pub fn expand(&self, ratio: f32, image_width: u32, image_height: u32) -> FaceRegion {
        let margin = (self.height() as f32 * ratio.max(0.0)).round() as u32;
        FaceRegion {
            top: self.top.saturating_sub(margin),
            right: self.right.saturating_add(margin).min(image_width),
            bottom: self.bottom.saturating_add(margin).min(image_height),
            left: self.left.saturating_sub(margin),
            confidence: self.confidence,
            landmarks: self.landmarks,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// Fixed-length face descriptor.
///
/// Descriptors are only comparable when they have the same length and were
/// produced by the same encoding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    pub values: Vec<f64>,
    /// Model that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model(values: Vec<f64>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `other` lives in the same descriptor space as `self`.
    pub fn is_comparable(&self, other: &FaceDescriptor) -> bool {
        self.values.len() == other.values.len() && self.model_version == other.model_version
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Callers are expected to check [`is_comparable`](Self::is_comparable)
    /// first; extra trailing values of the longer vector are ignored.
    pub fn distance(&self, other: &FaceDescriptor) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Outcome of computing a descriptor for one photo.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceEncoding {
    /// A face was found and encoded.
    Found(FaceDescriptor),
    /// The locator returned zero regions.
    NoFaceDetected,
    /// Regions exist but the descriptor could not be computed.
    EncodingFailed { reason: String },
}

impl FaceEncoding {
    pub fn descriptor(&self) -> Option<&FaceDescriptor> {
        match self {
            FaceEncoding::Found(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_descriptor(self) -> Option<FaceDescriptor> {
        match self {
            FaceEncoding::Found(d) => Some(d),
            _ => None,
        }
    }
}

/// A candidate whose descriptor lies within the search threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch<M = ()> {
    pub id: String,
    pub distance: f64,
    /// Caller-supplied reference data carried over from the candidate.
    pub metadata: M,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_box_clamps_to_image() {
        let r = FaceRegion::from_box(-10.0, -5.0, 50.0, 40.0, 30, 30).unwrap();
        assert_eq!((r.top, r.right, r.bottom, r.left), (0, 30, 30, 0));
    }

    #[test]
    fn test_from_box_outside_image() {
        assert!(FaceRegion::from_box(100.0, 100.0, 10.0, 10.0, 50, 50).is_none());
        assert!(FaceRegion::from_box(f32::NAN, 0.0, 10.0, 10.0, 50, 50).is_none());
    }

    #[test]
    fn test_expand_uses_height_ratio() {
        let r = FaceRegion::new(40, 60, 80, 20);
        let e = r.expand(0.25, 200, 200);
        // height 40 → margin 10
        assert_eq!((e.top, e.right, e.bottom, e.left), (30, 70, 90, 10));
    }

    #[test]
    fn test_expand_clamps() {
        let r = FaceRegion::new(2, 98, 98, 2);
        let e = r.expand(0.5, 100, 100);
        assert_eq!((e.top, e.right, e.bottom, e.left), (0, 100, 100, 0));
    }

    #[test]
    fn test_inverted_region_has_zero_size() {
        let r = FaceRegion::new(50, 10, 20, 40);
        assert_eq!((r.width(), r.height()), (0, 0));

        let e = r.expand(0.25, 100, 100);
        assert_eq!((e.top, e.right, e.bottom, e.left), (50, 10, 20, 40));
        assert!(!e.contains(30, 30));
    }

    #[test]
    fn test_descriptor_distance_identity() {
        let a = FaceDescriptor::new(vec![0.3, -1.2, 4.0]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_descriptor_distance_symmetric() {
        let a = FaceDescriptor::new(vec![0.1, 0.7, -0.3]);
        let b = FaceDescriptor::new(vec![-0.4, 0.2, 0.9]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_descriptor_comparable() {
        let a = FaceDescriptor::with_model(vec![0.0; 4], "w600k_r50");
        let b = FaceDescriptor::with_model(vec![0.0; 4], "w600k_r50");
        let c = FaceDescriptor::with_model(vec![0.0; 4], "dlib_128");
        let d = FaceDescriptor::with_model(vec![0.0; 3], "w600k_r50");
        assert!(a.is_comparable(&b));
        assert!(!a.is_comparable(&c));
        assert!(!a.is_comparable(&d));
    }

    #[test]
    fn test_descriptor_serializes_as_array() {
        let a = FaceDescriptor::with_model(vec![0.5, -0.25], "w600k_r50");
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["values"], serde_json::json!([0.5, -0.25]));
        let back: FaceDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_encoding_descriptor_accessor() {
        let d = FaceDescriptor::new(vec![1.0]);
        assert_eq!(FaceEncoding::Found(d.clone()).into_descriptor(), Some(d));
        assert!(FaceEncoding::NoFaceDetected.descriptor().is_none());
        assert!(FaceEncoding::EncodingFailed { reason: "nan".into() }
            .descriptor()
            .is_none());
    }
}
