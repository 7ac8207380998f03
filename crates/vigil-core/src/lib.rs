//! vigil-core: face matching, identity gallery, capture limiting and storage.
//!
//! Detection uses SCRFD and embeddings use ArcFace, both through ONNX Runtime
//! on the CPU. Everything else in this crate is model-agnostic and works on
//! [`Embedding`]s produced by any [`FaceAnalyzer`].

pub mod analyzer;
pub mod detector;
pub mod gallery;
pub mod limiter;
pub mod recognizer;
pub mod storage;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use gallery::{Gallery, GalleryError, IdentitySummary};
pub use limiter::{CaptureLimiter, CapturePolicy, TrackAssignment, UnknownTracker, SHARED_UNKNOWN_KEY};
pub use storage::{Capture, Category, EvictionReport, StorageError, StorageManager, StoragePolicy, StorageUsage};
pub use types::{
    BoundingBox, Embedding, EuclideanMatcher, FaceDetection, GalleryEntry, MatchError, MatchResult, Matcher,
};

/// SCRFD detector model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognizer model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
