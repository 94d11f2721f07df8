//! Descriptor search by Euclidean distance.

use crate::types::{FaceDescriptor, SimilarityMatch};
use serde::{Deserialize, Serialize};

/// A stored descriptor together with the caller's reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate<M = ()> {
    pub id: String,
    pub descriptor: FaceDescriptor,
    pub metadata: M,
}

impl Candidate<()> {
    pub fn new(id: impl Into<String>, descriptor: FaceDescriptor) -> Self {
        Self {
            id: id.into(),
            descriptor,
            metadata: (),
        }
    }
}

/// Strategy for finding stored descriptors close to a probe.
pub trait Matcher {
    /// Return every candidate whose distance to `probe` is `<= threshold`.
    fn search<M: Clone>(
        &self,
        probe: &FaceDescriptor,
        candidates: &[Candidate<M>],
        threshold: f64,
    ) -> Vec<SimilarityMatch<M>>;
}

/// Full-scan Euclidean matcher.
///
/// Candidates from a different descriptor space (length or model tag) are
/// skipped, never compared. Matches are sorted by ascending distance; ties
/// keep candidate order. A NaN threshold matches nothing.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn search<M: Clone>(
        &self,
        probe: &FaceDescriptor,
        candidates: &[Candidate<M>],
        threshold: f64,
    ) -> Vec<SimilarityMatch<M>> {
        let mut skipped = 0usize;
        let mut matches: Vec<SimilarityMatch<M>> = candidates
            .iter()
            .filter_map(|candidate| {
                if !probe.is_comparable(&candidate.descriptor) {
                    skipped += 1;
                    return None;
                }
                let distance = probe.distance(&candidate.descriptor);
                (distance <= threshold).then(|| SimilarityMatch {
                    id: candidate.id.clone(),
                    distance,
                    metadata: candidate.metadata.clone(),
                })
            })
            .collect();

        if skipped > 0 {
            tracing::warn!(
                skipped,
                probe_len = probe.len(),
                probe_model = ?probe.model_version,
                "skipped candidates from a different descriptor space"
            );
        }

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        tracing::debug!(
            candidates = candidates.len(),
            matches = matches.len(),
            threshold,
            "descriptor search complete"
        );
        matches
    }
}

/// Euclidean distance between two stored descriptors.
///
/// Returns `None` when the descriptors are not comparable.
pub fn face_distance(a: &FaceDescriptor, b: &FaceDescriptor) -> Option<f64> {
    a.is_comparable(b).then(|| a.distance(b))
}
