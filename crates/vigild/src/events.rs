//! Detection events and the bounded history that records them.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use vigil_core::{BoundingBox, StorageUsage};

/// Label shown for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "Inconnu";

/// One detected face in one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Local>,
    pub frame_sequence: u32,
    /// Identity name, or [`UNKNOWN_LABEL`].
    pub name: String,
    pub authorized: bool,
    pub confidence: f32,
    /// Distance to the nearest gallery embedding; `None` for an empty gallery.
    pub distance: Option<f32>,
    /// Face box in full-resolution frame coordinates.
    pub bbox: BoundingBox,
    /// Capture file written for this detection, if any.
    pub capture: Option<PathBuf>,
}

/// Receives every detection event and storage usage update.
pub trait EventSink: Send {
    fn record(&mut self, event: &DetectionEvent);

    fn record_usage(&mut self, _usage: StorageUsage) {}
}

/// The most recent detection events, oldest first.
pub struct History {
    capacity: usize,
    events: VecDeque<DetectionEvent>,
    usage: Option<StorageUsage>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
            usage: None,
        }
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DetectionEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Storage usage as of the last capture.
    pub fn last_usage(&self) -> Option<StorageUsage> {
        self.usage
    }
}

impl EventSink for History {
    fn record(&mut self, event: &DetectionEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
    }

    fn record_usage(&mut self, usage: StorageUsage) {
        self.usage = Some(usage);
    }
}

/// History shared between the pipeline and the service surface.
pub type SharedHistory = Arc<Mutex<History>>;

impl EventSink for SharedHistory {
    fn record(&mut self, event: &DetectionEvent) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(event);
    }

    fn record_usage(&mut self, usage: StorageUsage) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record_usage(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u32) -> DetectionEvent {
        DetectionEvent {
            timestamp: Local::now(),
            frame_sequence: seq,
            name: UNKNOWN_LABEL.to_string(),
            authorized: false,
            confidence: 0.0,
            distance: None,
            bbox: BoundingBox::new(0, 10, 10, 0),
            capture: None,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = History::new(3);
        for seq in 0..5 {
            history.record(&event(seq));
        }
        assert_eq!(history.len(), 3);
        let seqs: Vec<u32> = history.recent(10).iter().map(|e| e.frame_sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_recent_limit() {
        let mut history = History::new(100);
        for seq in 0..10 {
            history.record(&event(seq));
        }
        let seqs: Vec<u32> = history.recent(2).iter().map(|e| e.frame_sequence).collect();
        assert_eq!(seqs, vec![8, 9]);
        assert!(history.recent(0).is_empty());
    }

    #[test]
    fn test_shared_history_records_usage() {
        let shared: SharedHistory = Arc::new(Mutex::new(History::new(5)));
        let mut sink = shared.clone();
        sink.record(&event(1));
        sink.record_usage(StorageUsage {
            total_bytes: 10,
            budget_bytes: 100,
            percent_used: 10.0,
            file_count: 1,
        });

        let history = shared.lock().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.last_usage().map(|u| u.file_count), Some(1));
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(7)).unwrap();
        assert_eq!(json["name"], "Inconnu");
        assert_eq!(json["frame_sequence"], 7);
        assert_eq!(json["bbox"]["right"], 10);
        assert!(json["distance"].is_null());
    }
}
