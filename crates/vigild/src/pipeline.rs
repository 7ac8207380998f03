//! Per-frame orchestration: detect, match, rate limit, capture, report.

use crate::events::{DetectionEvent, EventSink, UNKNOWN_LABEL};
use chrono::Local;
use image::{Rgb, RgbImage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use vigil_core::{
    BoundingBox, CaptureLimiter, CapturePolicy, Category, EuclideanMatcher, FaceAnalyzer, Gallery, GalleryError,
    MatchError, Matcher, StorageManager, UnknownTracker, SHARED_UNKNOWN_KEY,
};
use vigil_hw::frame::{self, Frame};

const KNOWN_COLOUR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOUR: Rgb<u8> = Rgb([220, 0, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Query and gallery embeddings disagree on dimensionality; the analyzer
    /// and the enrolled gallery come from different models.
    #[error(transparent)]
    Match(#[from] MatchError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub match_threshold: f32,
    /// Frames are shrunk by this factor before detection; boxes are mapped back.
    pub downscale_factor: f64,
    /// `None` shares one cooldown key between all unknown faces.
    pub unknown_track_threshold: Option<f32>,
    pub capture_known: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            downscale_factor: 0.25,
            unknown_track_threshold: Some(0.6),
            capture_known: false,
        }
    }
}

/// Output of one processed frame.
pub struct ProcessedFrame {
    /// The full-resolution frame with one box drawn per detection.
    pub annotated: RgbImage,
    /// One event per detected face, in detector order.
    pub events: Vec<DetectionEvent>,
}

pub struct FramePipeline {
    analyzer: Box<dyn FaceAnalyzer>,
    matcher: Box<dyn Matcher + Send>,
    gallery: Arc<Gallery>,
    storage: Arc<StorageManager>,
    limiter: CaptureLimiter,
    tracker: Option<UnknownTracker>,
    sink: Box<dyn EventSink>,
    settings: PipelineSettings,
}

impl FramePipeline {
    pub fn new(
        analyzer: Box<dyn FaceAnalyzer>,
        gallery: Arc<Gallery>,
        storage: Arc<StorageManager>,
        capture_policy: CapturePolicy,
        settings: PipelineSettings,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self {
            analyzer,
            matcher: Box::new(EuclideanMatcher),
            gallery,
            storage,
            limiter: CaptureLimiter::new(capture_policy),
            tracker: settings.unknown_track_threshold.map(UnknownTracker::new),
            sink,
            settings,
        }
    }

    /// Start a new capture session: per-session capture caps start over.
    pub fn reset_session(&mut self) {
        self.limiter.reset_session();
    }

    /// Run detection and matching on one frame.
    ///
    /// An analyzer failure yields the unmodified frame and no events. Only an
    /// embedding dimension mismatch is reported as an error.
    pub fn process(&mut self, frame: &Frame) -> Result<ProcessedFrame, PipelineError> {
        let factor = self.settings.downscale_factor;
        let small = frame::downscale(&frame.image, factor);

        let detections = match self.analyzer.detect_faces(&small) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face analysis failed; skipping frame");
                return Ok(ProcessedFrame {
                    annotated: frame.image.clone(),
                    events: Vec::new(),
                });
            }
        };

        let gallery = self.gallery.embeddings();
        let now = Instant::now();
        let mut annotated = frame.image.clone();
        let mut events = Vec::with_capacity(detections.len());
        let mut captured = false;

        for detection in detections {
            let bbox = detection.bbox.rescale(factor);
            let result = self
                .matcher
                .compare(&detection.embedding, &gallery, self.settings.match_threshold)
                .map_err(|e| {
                    tracing::error!(error = %e, "embedding does not fit the gallery");
                    e
                })?;

            let capture = match &result.name {
                Some(name) if self.settings.capture_known => {
                    self.try_capture(name, Category::Known, frame, &bbox, now)
                }
                Some(_) => None,
                None => {
                    let key = self.unknown_key(&detection.embedding, now);
                    self.try_capture(&key, Category::Unknown, frame, &bbox, now)
                }
            };
            captured |= capture.is_some();

            let event = DetectionEvent {
                timestamp: Local::now(),
                frame_sequence: frame.sequence,
                name: result.name.clone().unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
                authorized: result.is_match(),
                confidence: result.confidence,
                distance: result.distance.is_finite().then_some(result.distance),
                bbox,
                capture,
            };

            if event.authorized {
                tracing::info!(name = %event.name, confidence = event.confidence, "recognised face");
            } else {
                tracing::warn!(
                    seq = frame.sequence,
                    distance = ?event.distance,
                    capture = ?event.capture,
                    "unauthorized person detected"
                );
            }

            let colour = if event.authorized { KNOWN_COLOUR } else { UNKNOWN_COLOUR };
            frame::draw_box(&mut annotated, &bbox, colour, BOX_THICKNESS);
            self.sink.record(&event);
            events.push(event);
        }

        if captured {
            self.sink.record_usage(self.storage.usage());
        }

        Ok(ProcessedFrame { annotated, events })
    }

    /// Enroll the face found in `image` under `name`.
    pub fn enroll(&mut self, name: &str, image: &RgbImage) -> Result<PathBuf, GalleryError> {
        self.gallery.enroll(name, image, &mut *self.analyzer)
    }

    fn unknown_key(&mut self, embedding: &vigil_core::Embedding, now: Instant) -> String {
        let Some(tracker) = self.tracker.as_mut() else {
            return SHARED_UNKNOWN_KEY.to_string();
        };
        let assignment = tracker.assign(embedding, now);
        if let Some(retired) = &assignment.retired {
            self.limiter.forget(retired);
        }
        assignment.key
    }

    /// Save a crop of `bbox` from the full-resolution frame if the limiter
    /// allows a capture for `key`. Only a stored capture counts toward the
    /// cooldown and the session cap.
    fn try_capture(
        &mut self,
        key: &str,
        category: Category,
        frame: &Frame,
        bbox: &BoundingBox,
        now: Instant,
    ) -> Option<PathBuf> {
        if !self.limiter.check(key, now) {
            return None;
        }
        let Some(crop) = frame::crop(&frame.image, bbox) else {
            tracing::warn!(key, ?bbox, "face box outside frame; nothing to capture");
            return None;
        };
        match self.storage.save_image(&crop, category, Some(*bbox)) {
            Ok(capture) => {
                self.limiter.commit(key, now);
                Some(capture.path)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to save capture");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{History, SharedHistory};
    use std::sync::Mutex;
    use std::time::Duration;
    use vigil_core::{AnalyzerError, Embedding, FaceDetection, StoragePolicy};

    /// Returns the same detections for every image, or fails when empty-handed.
    struct ScriptedAnalyzer {
        faces: Option<Vec<FaceDetection>>,
        seen_sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, AnalyzerError> {
            self.seen_sizes.lock().unwrap().push(image.dimensions());
            self.faces
                .clone()
                .ok_or_else(|| AnalyzerError::Failed("scripted failure".into()))
        }
    }

    fn face(bbox: BoundingBox, values: Vec<f32>) -> FaceDetection {
        FaceDetection {
            bbox,
            score: 0.9,
            embedding: Embedding::new(values),
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        pipeline: FramePipeline,
        gallery: Arc<Gallery>,
        storage: Arc<StorageManager>,
        history: SharedHistory,
        seen_sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    fn harness(faces: Option<Vec<FaceDetection>>, settings: PipelineSettings) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = Arc::new(Gallery::empty(tmp.path().join("known_faces")));
        let storage = Arc::new(StorageManager::open(tmp.path(), StoragePolicy::new(10_000_000, 7)).unwrap());
        let history: SharedHistory = Arc::new(Mutex::new(History::new(100)));
        let seen_sizes = Arc::new(Mutex::new(Vec::new()));
        let analyzer = ScriptedAnalyzer {
            faces,
            seen_sizes: seen_sizes.clone(),
        };
        let pipeline = FramePipeline::new(
            Box::new(analyzer),
            gallery.clone(),
            storage.clone(),
            CapturePolicy {
                cooldown: Duration::from_secs(5),
                max_per_session: Some(3),
            },
            settings,
            Box::new(history.clone()),
        );
        Harness {
            _tmp: tmp,
            pipeline,
            gallery,
            storage,
            history,
            seen_sizes,
        }
    }

    fn frame(seq: u32) -> Frame {
        Frame::new(RgbImage::from_pixel(640, 480, Rgb([90, 90, 90])), seq)
    }

    fn enroll(gallery: &Gallery, name: &str, values: Vec<f32>) {
        let img = RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]));
        gallery.enroll_embedding(name, Embedding::new(values), &img).unwrap();
    }

    #[test]
    fn test_boxes_rescaled_to_full_frame() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(40, 100, 140, 20), vec![1.0, 0.0])]),
            PipelineSettings::default(),
        );
        let out = h.pipeline.process(&frame(0)).unwrap();

        assert_eq!(h.seen_sizes.lock().unwrap().as_slice(), &[(160, 120)]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].bbox, BoundingBox::new(160, 400, 560, 80));
    }

    #[test]
    fn test_unknown_face_is_captured_from_full_frame() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings::default(),
        );
        let out = h.pipeline.process(&frame(0)).unwrap();

        let event = &out.events[0];
        assert!(!event.authorized);
        assert_eq!(event.name, UNKNOWN_LABEL);
        assert_eq!(event.confidence, 0.0);
        assert_eq!(event.distance, None);

        let path = event.capture.clone().expect("unknown face should be captured");
        let saved = image::open(&path).unwrap();
        // Crop of the rescaled box (40..120, 40..120), not of the 160x120 detector input.
        assert_eq!((saved.width(), saved.height()), (80, 80));
        assert_eq!(h.storage.usage().file_count, 1);
        assert_eq!(h.history.lock().unwrap().last_usage().map(|u| u.file_count), Some(1));
    }

    #[test]
    fn test_known_face_matched_and_not_captured() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings::default(),
        );
        enroll(&h.gallery, "alice", vec![1.0, 0.0]);
        let out = h.pipeline.process(&frame(0)).unwrap();

        let event = &out.events[0];
        assert!(event.authorized);
        assert_eq!(event.name, "alice");
        assert_eq!(event.confidence, 1.0);
        assert!(event.capture.is_none());
        assert_eq!(h.storage.usage().file_count, 0);
    }

    #[test]
    fn test_capture_known_uses_known_category() {
        let settings = PipelineSettings {
            capture_known: true,
            ..PipelineSettings::default()
        };
        let mut h = harness(Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]), settings);
        enroll(&h.gallery, "alice", vec![1.0, 0.0]);
        let out = h.pipeline.process(&frame(0)).unwrap();

        let path = out.events[0].capture.clone().unwrap();
        assert!(path.parent().unwrap().ends_with("known_captures"));
    }

    #[test]
    fn test_every_face_yields_one_event_in_order() {
        let mut h = harness(
            Some(vec![
                face(BoundingBox::new(0, 10, 10, 0), vec![1.0, 0.0]),
                face(BoundingBox::new(20, 30, 30, 20), vec![0.0, 1.0]),
                face(BoundingBox::new(40, 50, 50, 40), vec![5.0, 5.0]),
            ]),
            PipelineSettings::default(),
        );
        enroll(&h.gallery, "alice", vec![1.0, 0.0]);
        enroll(&h.gallery, "bob", vec![0.0, 1.0]);
        let out = h.pipeline.process(&frame(3)).unwrap();

        let names: Vec<&str> = out.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", UNKNOWN_LABEL]);
        assert!(out.events.iter().all(|e| e.frame_sequence == 3));
        assert_eq!(h.history.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_captures_are_rate_limited() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings::default(),
        );
        let first = h.pipeline.process(&frame(0)).unwrap();
        let second = h.pipeline.process(&frame(1)).unwrap();
        assert!(first.events[0].capture.is_some());
        assert!(second.events[0].capture.is_none());
        assert_eq!(second.events.len(), 1);
        assert_eq!(h.storage.usage().file_count, 1);
    }

    #[test]
    fn test_distinct_visitors_have_separate_cooldowns() {
        let mut h = harness(
            Some(vec![
                face(BoundingBox::new(0, 10, 10, 0), vec![1.0, 0.0]),
                face(BoundingBox::new(20, 30, 30, 20), vec![9.0, 9.0]),
            ]),
            PipelineSettings::default(),
        );
        let out = h.pipeline.process(&frame(0)).unwrap();
        assert!(out.events.iter().all(|e| e.capture.is_some()));

        let shared = PipelineSettings {
            unknown_track_threshold: None,
            ..PipelineSettings::default()
        };
        let mut h = harness(
            Some(vec![
                face(BoundingBox::new(0, 10, 10, 0), vec![1.0, 0.0]),
                face(BoundingBox::new(20, 30, 30, 20), vec![9.0, 9.0]),
            ]),
            shared,
        );
        let out = h.pipeline.process(&frame(0)).unwrap();
        assert!(out.events[0].capture.is_some());
        assert!(out.events[1].capture.is_none());
    }

    #[test]
    fn test_analyzer_failure_returns_original_frame() {
        let mut h = harness(None, PipelineSettings::default());
        let input = frame(0);
        let out = h.pipeline.process(&input).unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.annotated, input.image);
        assert_eq!(h.history.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(0, 10, 10, 0), vec![1.0, 0.0, 0.0])]),
            PipelineSettings::default(),
        );
        enroll(&h.gallery, "alice", vec![1.0, 0.0]);
        let err = h.pipeline.process(&frame(0)).err();
        assert!(matches!(
            err,
            Some(PipelineError::Match(MatchError::DimensionMismatch { expected: 2, actual: 3 }))
        ));
    }

    #[test]
    fn test_annotation_draws_boxes() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings::default(),
        );
        let out = h.pipeline.process(&frame(0)).unwrap();
        assert_eq!(out.annotated.get_pixel(40, 40), &UNKNOWN_COLOUR);
        assert_eq!(out.annotated.get_pixel(80, 80), &Rgb([90, 90, 90]));
    }

    #[test]
    fn test_failed_saves_do_not_use_up_captures() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings {
                unknown_track_threshold: None,
                ..PipelineSettings::default()
            },
        );
        h.pipeline.limiter = CaptureLimiter::new(CapturePolicy {
            cooldown: Duration::ZERO,
            max_per_session: Some(3),
        });

        // A plain file where the capture directory should be makes every save fail.
        let dir = h.storage.root().join(Category::Unknown.dir_name());
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"not a directory").unwrap();
        for seq in 0..3 {
            let out = h.pipeline.process(&frame(seq)).unwrap();
            assert!(out.events[0].capture.is_none());
        }

        std::fs::remove_file(&dir).unwrap();
        let out = h.pipeline.process(&frame(3)).unwrap();
        assert!(out.events[0].capture.is_some());
        assert_eq!(h.storage.usage().file_count, 1);
    }

    #[test]
    fn test_box_outside_frame_does_not_use_up_captures() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings {
                unknown_track_threshold: None,
                ..PipelineSettings::default()
            },
        );
        h.pipeline.limiter = CaptureLimiter::new(CapturePolicy {
            cooldown: Duration::ZERO,
            max_per_session: Some(1),
        });

        let offscreen = BoundingBox::new(1000, 1100, 1100, 1000);
        let capture = h
            .pipeline
            .try_capture(SHARED_UNKNOWN_KEY, Category::Unknown, &frame(0), &offscreen, Instant::now());
        assert!(capture.is_none());
        assert!(h.pipeline.process(&frame(1)).unwrap().events[0].capture.is_some());
    }

    #[test]
    fn test_reset_session_restores_capture_cap() {
        let mut h = harness(
            Some(vec![face(BoundingBox::new(10, 30, 30, 10), vec![1.0, 0.0])]),
            PipelineSettings {
                unknown_track_threshold: None,
                ..PipelineSettings::default()
            },
        );
        h.pipeline.limiter = CaptureLimiter::new(CapturePolicy {
            cooldown: Duration::ZERO,
            max_per_session: Some(1),
        });
        assert!(h.pipeline.process(&frame(0)).unwrap().events[0].capture.is_some());
        assert!(h.pipeline.process(&frame(1)).unwrap().events[0].capture.is_none());
        h.pipeline.reset_session();
        assert!(h.pipeline.process(&frame(2)).unwrap().events[0].capture.is_some());
    }
}
