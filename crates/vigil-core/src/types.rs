use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Face rectangle in pixel coordinates of the image it was detected in.
///
/// Field order follows the detector contract: (top, right, bottom, left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Map a box found on a frame downscaled by `factor` back onto the
    /// original frame.
    ///
    /// Each coordinate is divided by `factor` and truncated toward zero, in
    /// (top, right, bottom, left) order.
    pub fn rescale(&self, factor: f64) -> BoundingBox {
        let up = |v: i32| (v as f64 / factor) as i32;
        BoundingBox {
            top: up(self.top),
            right: up(self.right),
            bottom: up(self.bottom),
            left: up(self.left),
        }
    }

    /// Clip the box to a `width` × `height` image.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = width as i32;
        let h = height as i32;
        let clipped = BoundingBox {
            top: self.top.clamp(0, h),
            right: self.right.clamp(0, w),
            bottom: self.bottom.clamp(0, h),
            left: self.left.clamp(0, w),
        };
        (clipped.width() > 0 && clipped.height() > 0).then_some(clipped)
    }
}

/// Face embedding vector (512-dimensional for ArcFace, 128 for dlib-style models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean (L2) distance between two embeddings.
    ///
    /// Callers must check dimensions first; extra trailing values are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face located by the external analyzer.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Detector score in [0, 1].
    pub score: f32,
    pub embedding: Embedding,
}

/// One reference embedding owned by an enrolled identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
    /// Reference image the embedding was extracted from.
    pub source: PathBuf,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Identity owning the nearest embedding, if it is under the threshold.
    pub name: Option<String>,
    /// Smallest L2 distance seen; infinite for an empty gallery.
    pub distance: f32,
    /// `max(0, 1 - distance / threshold)` when matched, 0 otherwise.
    pub confidence: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.name.is_some()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: gallery has {expected}, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbour matcher under an L2 distance threshold.
///
/// Visits every gallery entry; on equal distances the earliest entry wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                return Err(MatchError::DimensionMismatch {
                    expected: entry.embedding.dim(),
                    actual: query.dim(),
                });
            }
            let dist = query.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the first of equidistant entries.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                name: Some(gallery[idx].name.clone()),
                distance: best_dist,
                confidence: (1.0 - best_dist / threshold).max(0.0),
            },
            _ => MatchResult {
                name: None,
                distance: best_dist,
                confidence: 0.0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            name: name.into(),
            embedding: Embedding::new(values),
            source: PathBuf::from(format!("{name}.jpg")),
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_rescale_quarter_factor() {
        let small = BoundingBox::new(40, 100, 140, 20);
        assert_eq!(small.rescale(0.25), BoundingBox::new(160, 400, 560, 80));
    }

    #[test]
    fn test_rescale_truncates() {
        // 7 / 0.5 = 14, 5 / 0.3 = 16.67 → 16
        let small = BoundingBox::new(7, 5, 7, 5);
        assert_eq!(small.rescale(0.5), BoundingBox::new(14, 10, 14, 10));
        assert_eq!(small.rescale(0.3).right, 16);
    }

    #[test]
    fn test_clamp_inside_and_outside() {
        let b = BoundingBox::new(-10, 700, 500, 600);
        assert_eq!(b.clamp(640, 480), Some(BoundingBox::new(0, 640, 480, 600)));
        let outside = BoundingBox::new(10, 900, 50, 800);
        assert_eq!(outside.clamp(640, 480), None);
    }

    #[test]
    fn test_exact_match_full_confidence() {
        let gallery = vec![entry("Alice", vec![0.1, 0.2, 0.3])];
        let query = Embedding::new(vec![0.1, 0.2, 0.3]);
        let result = EuclideanMatcher.compare(&query, &gallery, 0.6).unwrap();
        assert_eq!(result.name.as_deref(), Some("Alice"));
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_empty_gallery_no_match() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &[], 0.6).unwrap();
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_distance_is_global_minimum() {
        let gallery = vec![
            entry("far", vec![1.0, 1.0]),
            entry("near", vec![0.1, 0.0]),
            entry("mid", vec![0.5, 0.0]),
        ];
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &gallery, 0.6).unwrap();
        let expected = gallery
            .iter()
            .map(|e| query.euclidean_distance(&e.embedding))
            .fold(f32::INFINITY, f32::min);
        assert_eq!(result.distance, expected);
        assert_eq!(result.name.as_deref(), Some("near"));
    }

    #[test]
    fn test_tie_break_lowest_index() {
        let gallery = vec![
            entry("first", vec![0.0, 0.3]),
            entry("second", vec![0.3, 0.0]),
            entry("third", vec![0.0, -0.3]),
        ];
        let query = Embedding::new(vec![0.0, 0.0]);
        for _ in 0..5 {
            let result = EuclideanMatcher.compare(&query, &gallery, 0.6).unwrap();
            assert_eq!(result.name.as_deref(), Some("first"));
        }
    }

    #[test]
    fn test_confidence_formula() {
        let gallery = vec![entry("Bob", vec![0.3, 0.0])];
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &gallery, 0.6).unwrap();
        let expected = (1.0 - result.distance / 0.6).max(0.0);
        assert_eq!(result.confidence, expected);
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let gallery = vec![entry("edge", vec![0.5, 0.0])];
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &gallery, 0.5).unwrap();
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
        assert!((result.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let gallery = vec![entry("Alice", vec![0.0, 0.0, 0.0])];
        let query = Embedding::new(vec![0.0, 0.0]);
        let err = EuclideanMatcher.compare(&query, &gallery, 0.6).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 });
    }
}
