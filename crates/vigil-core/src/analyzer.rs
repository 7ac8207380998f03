//! Face analysis seam: image in, located faces with embeddings out.
//!
//! The pipeline and gallery only see [`FaceAnalyzer`]. [`OnnxAnalyzer`] is the
//! production backend, chaining the SCRFD detector and the ArcFace embedder.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceDetection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// External face detector + embedder.
///
/// Boxes are in pixel coordinates of the image passed in, and every
/// embedding returned by one analyzer has the same dimensionality.
pub trait FaceAnalyzer: Send {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, AnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, AnalyzerError> {
        (**self).detect_faces(image)
    }
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(crate::DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(crate::RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, AnalyzerError> {
        let faces = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(faces.len());
        for (bbox, score) in faces {
            let embedding = self.recognizer.extract(image, &bbox)?;
            detections.push(FaceDetection { bbox, score, embedding });
        }
        Ok(detections)
    }
}
