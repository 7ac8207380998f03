//! Capture rate limiting.
//!
//! [`CaptureLimiter`] enforces a per-key cooldown and a per-session cap so a
//! subject standing in front of the camera yields a handful of captures, not
//! one per frame. [`UnknownTracker`] turns unknown embeddings into stable
//! per-visitor keys for the limiter.

use crate::types::Embedding;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Key shared by all unknown faces when per-visitor tracking is disabled.
pub const SHARED_UNKNOWN_KEY: &str = "unknown";

/// Most unknown visitors tracked at once.
const MAX_UNKNOWN_TRACKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturePolicy {
    /// Minimum time between two allowed captures for the same key.
    pub cooldown: Duration,
    /// Captures allowed per key between session resets; `None` is unlimited.
    pub max_per_session: Option<u32>,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            max_per_session: Some(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CooldownRecord {
    last_capture: Instant,
    session_count: u32,
}

pub struct CaptureLimiter {
    policy: CapturePolicy,
    records: HashMap<String, CooldownRecord>,
}

impl CaptureLimiter {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
        }
    }

    /// Whether a capture for `key` may be taken at `now`. A `true` answer
    /// records the capture.
    pub fn allow_capture(&mut self, key: &str, now: Instant) -> bool {
        if !self.check(key, now) {
            return false;
        }
        self.commit(key, now);
        true
    }

    /// Whether a capture for `key` would be allowed at `now`. Records nothing.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        let Some(record) = self.records.get(key) else {
            return true;
        };
        if let Some(max) = self.policy.max_per_session {
            if record.session_count >= max {
                return false;
            }
        }
        now.saturating_duration_since(record.last_capture) >= self.policy.cooldown
    }

    /// Count a capture for `key` taken at `now` toward its cooldown and
    /// session cap. Call only once the capture is actually stored.
    pub fn commit(&mut self, key: &str, now: Instant) {
        let record = self.records.entry(key.to_string()).or_insert(CooldownRecord {
            last_capture: now,
            session_count: 0,
        });
        record.last_capture = now;
        record.session_count += 1;
    }

    /// Start a new capture session: per-session counts go back to zero,
    /// last-capture times are kept.
    pub fn reset_session(&mut self) {
        for record in self.records.values_mut() {
            record.session_count = 0;
        }
    }

    /// Drop the record of a key that can no longer recur.
    pub fn forget(&mut self, key: &str) {
        self.records.remove(key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}

struct Track {
    id: u64,
    embedding: Embedding,
    last_seen: Instant,
}

/// Groups unknown faces into visitors by embedding distance.
pub struct UnknownTracker {
    threshold: f32,
    tracks: Vec<Track>,
    next_id: u64,
}

/// Key assigned to an unknown face, plus the key of a track retired to make
/// room for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackAssignment {
    pub key: String,
    pub retired: Option<String>,
}

impl UnknownTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Assign `embedding` to the nearest live track under the threshold, or
    /// open a new one.
    pub fn assign(&mut self, embedding: &Embedding, now: Instant) -> TrackAssignment {
        let nearest = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.embedding.dim() == embedding.dim())
            .map(|(i, t)| (i, t.embedding.euclidean_distance(embedding)))
            .filter(|&(_, d)| d < self.threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((idx, _)) = nearest {
            let track = &mut self.tracks[idx];
            track.embedding = embedding.clone();
            track.last_seen = now;
            return TrackAssignment {
                key: track_key(track.id),
                retired: None,
            };
        }

        let mut retired = None;
        if self.tracks.len() >= MAX_UNKNOWN_TRACKS {
            if let Some(stale) = self
                .tracks
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.last_seen)
                .map(|(i, _)| i)
            {
                retired = Some(track_key(self.tracks.swap_remove(stale).id));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.tracks.push(Track {
            id,
            embedding: embedding.clone(),
            last_seen: now,
        });
        tracing::debug!(track = id, live = self.tracks.len(), "new unknown visitor track");
        TrackAssignment {
            key: track_key(id),
            retired,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

fn track_key(id: u64) -> String {
    format!("{SHARED_UNKNOWN_KEY}-{id}")
}
