//! Capture storage with a size budget and an age-based retention window.
//!
//! The manager tracks every capture file under its category directories and
//! is the only component that deletes them. All mutations go through one
//! mutex, so interleaved saves and deletes cannot break the budget.
//!
//! Layout under the data root:
//! ```text
//! unknown_faces/unknown_YYYYMMDD_HHMMSS_mmm[_n].jpg
//! known_captures/known_YYYYMMDD_HHMMSS_mmm[_n].jpg
//! exports/export_YYYYMMDD_HHMMSS[_n]/...
//! ```

use crate::types::BoundingBox;
use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use thiserror::Error;

const EXPORT_DIR: &str = "exports";
const CAPTURE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("not a tracked capture: {0}")]
    NotTracked(PathBuf),
    #[error("export range start is after its end")]
    InvalidRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Known,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Unknown, Category::Known];

    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Known => "known_captures",
            Category::Unknown => "unknown_faces",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Category::Known => "known",
            Category::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoragePolicy {
    pub budget_bytes: u64,
    /// Files older than this are deleted; `None` disables the age pass.
    pub retention: Option<Duration>,
}

impl StoragePolicy {
    pub fn new(budget_bytes: u64, retention_days: u32) -> Self {
        Self {
            budget_bytes,
            retention: (retention_days > 0)
                .then(|| Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60)),
        }
    }
}

/// A persisted capture file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capture {
    pub path: PathBuf,
    pub category: Category,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
    /// Face region the capture was cropped from; unknown for files found on disk.
    pub region: Option<BoundingBox>,
    #[serde(skip)]
    pub modified: SystemTime,
}

/// Read-only snapshot of storage consumption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub percent_used: f64,
    pub file_count: usize,
}

/// What one `enforce_limits` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Files removed by the age pass.
    pub expired: usize,
    /// Files removed by the size pass.
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Deletions that failed and will be retried on the next pass.
    pub failures: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.evicted == 0 && self.failures == 0
    }
}

struct Tracked {
    capture: Capture,
    /// Tracking order, breaks modification-time ties.
    seq: u64,
}

#[derive(Default)]
struct Inventory {
    files: Vec<Tracked>,
    total_bytes: u64,
    next_seq: u64,
    /// Every file name handed out by this process.
    issued: HashSet<String>,
}

impl Inventory {
    fn track(&mut self, capture: Capture) {
        self.total_bytes += capture.size_bytes;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.files.push(Tracked { capture, seq });
    }

    fn untrack(&mut self, path: &Path) -> Option<Capture> {
        let idx = self.files.iter().position(|t| t.capture.path == path)?;
        let tracked = self.files.remove(idx);
        self.total_bytes -= tracked.capture.size_bytes;
        Some(tracked.capture)
    }

    /// Paths oldest first: modification time, then tracking order.
    fn oldest_first(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut order: Vec<&Tracked> = self.files.iter().collect();
        order.sort_by(|a, b| {
            a.capture
                .modified
                .cmp(&b.capture.modified)
                .then(a.seq.cmp(&b.seq))
        });
        order
            .into_iter()
            .map(|t| (t.capture.path.clone(), t.capture.modified))
            .collect()
    }
}

pub struct StorageManager {
    root: PathBuf,
    policy: StoragePolicy,
    inventory: Mutex<Inventory>,
}

impl StorageManager {
    /// Open the store under `root`, creating the category directories and
    /// tracking every capture file already present.
    pub fn open(root: impl Into<PathBuf>, policy: StoragePolicy) -> Result<Self, StorageError> {
        let root = root.into();
        let mut found = Vec::new();
        for category in Category::ALL {
            let dir = root.join(category.dir_name());
            std::fs::create_dir_all(&dir)?;
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if !is_capture_file(&path) {
                    continue;
                }
                match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => {
                        let modified = meta.modified()?;
                        found.push(Capture {
                            path,
                            category,
                            size_bytes: meta.len(),
                            created_at: DateTime::from(modified),
                            region: None,
                            modified,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable capture"),
                }
            }
        }
        found.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        let mut inventory = Inventory::default();
        for capture in found {
            if let Some(name) = capture.path.file_name().and_then(|n| n.to_str()) {
                inventory.issued.insert(name.to_string());
            }
            inventory.track(capture);
        }

        tracing::info!(
            root = %root.display(),
            files = inventory.files.len(),
            total_bytes = inventory.total_bytes,
            budget_bytes = policy.budget_bytes,
            "capture store opened"
        );

        Ok(Self {
            root,
            policy,
            inventory: Mutex::new(inventory),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    /// Write `bytes` as a new capture, then enforce the limits.
    ///
    /// The budget holds when this returns, even if that meant evicting the
    /// capture just written (a store already full of newer files).
    pub fn save(
        &self,
        bytes: &[u8],
        category: Category,
        region: Option<BoundingBox>,
    ) -> Result<Capture, StorageError> {
        let mut inv = self.lock();
        let result = self.write_capture(&mut inv, bytes, category, region);
        let report = enforce(&mut inv, &self.policy, SystemTime::now());
        if !report.is_empty() {
            tracing::debug!(?report, "limits enforced after save");
        }
        result
    }

    /// JPEG-encode `image` and save it as a capture.
    pub fn save_image(
        &self,
        image: &RgbImage,
        category: Category,
        region: Option<BoundingBox>,
    ) -> Result<Capture, StorageError> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
        self.save(&buf, category, region)
    }

    /// Delete expired files, then the oldest files until the store fits its
    /// budget. Failed deletions are logged and retried on the next call.
    pub fn enforce_limits(&self) -> EvictionReport {
        self.enforce_limits_at(SystemTime::now())
    }

    pub fn enforce_limits_at(&self, now: SystemTime) -> EvictionReport {
        let mut inv = self.lock();
        let report = enforce(&mut inv, &self.policy, now);
        if !report.is_empty() {
            tracing::info!(
                expired = report.expired,
                evicted = report.evicted,
                freed_bytes = report.freed_bytes,
                failures = report.failures,
                "storage limits enforced"
            );
        }
        report
    }

    pub fn usage(&self) -> StorageUsage {
        let inv = self.lock();
        let budget = self.policy.budget_bytes;
        StorageUsage {
            total_bytes: inv.total_bytes,
            budget_bytes: budget,
            percent_used: if budget > 0 {
                inv.total_bytes as f64 / budget as f64 * 100.0
            } else {
                0.0
            },
            file_count: inv.files.len(),
        }
    }

    /// Tracked captures, oldest first.
    pub fn captures(&self) -> Vec<Capture> {
        let inv = self.lock();
        let mut order: Vec<&Tracked> = inv.files.iter().collect();
        order.sort_by(|a, b| a.capture.modified.cmp(&b.capture.modified).then(a.seq.cmp(&b.seq)));
        order.into_iter().map(|t| t.capture.clone()).collect()
    }

    /// Explicitly delete one tracked capture.
    pub fn delete(&self, path: &Path) -> Result<Capture, StorageError> {
        let mut inv = self.lock();
        if !inv.files.iter().any(|t| t.capture.path == path) {
            return Err(StorageError::NotTracked(path.to_path_buf()));
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "capture already gone from disk");
            }
            Err(e) => return Err(e.into()),
        }
        let capture = inv
            .untrack(path)
            .ok_or_else(|| StorageError::NotTracked(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "capture deleted");
        Ok(capture)
    }

    /// Copy every capture modified within `[start, end]` into a fresh export
    /// directory. Sources are left in place.
    pub fn export(&self, start: DateTime<Local>, end: DateTime<Local>) -> Result<Vec<PathBuf>, StorageError> {
        if start > end {
            return Err(StorageError::InvalidRange);
        }
        let (from, to) = (SystemTime::from(start), SystemTime::from(end));

        let inv = self.lock();
        let selected: Vec<PathBuf> = inv
            .oldest_first()
            .into_iter()
            .filter(|(_, modified)| *modified >= from && *modified <= to)
            .map(|(path, _)| path)
            .collect();
        if selected.is_empty() {
            tracing::info!(%start, %end, "nothing to export");
            return Ok(Vec::new());
        }

        let dest_dir = unique_export_dir(&self.root.join(EXPORT_DIR));
        std::fs::create_dir_all(&dest_dir)?;

        let mut exported = Vec::with_capacity(selected.len());
        for src in selected {
            let Some(name) = src.file_name() else { continue };
            let dest = dest_dir.join(name);
            match std::fs::copy(&src, &dest) {
                Ok(_) => exported.push(dest),
                Err(e) => tracing::warn!(path = %src.display(), error = %e, "failed to export capture"),
            }
        }

        tracing::info!(dir = %dest_dir.display(), files = exported.len(), "captures exported");
        Ok(exported)
    }

    fn write_capture(
        &self,
        inv: &mut Inventory,
        bytes: &[u8],
        category: Category,
        region: Option<BoundingBox>,
    ) -> Result<Capture, StorageError> {
        let now = Local::now();
        let dir = self.root.join(category.dir_name());
        std::fs::create_dir_all(&dir)?;
        let name = unique_capture_name(inv, &dir, category, &now);
        let path = dir.join(&name);
        inv.issued.insert(name);

        if let Err(e) = std::fs::write(&path, bytes) {
            let _ = std::fs::remove_file(&path);
            tracing::warn!(path = %path.display(), error = %e, "failed to write capture");
            return Err(e.into());
        }
        let meta = std::fs::metadata(&path)?;
        let capture = Capture {
            path,
            category,
            size_bytes: meta.len(),
            created_at: now,
            region,
            modified: meta.modified()?,
        };
        tracing::info!(path = %capture.path.display(), bytes = capture.size_bytes, "capture saved");
        inv.track(capture.clone());
        Ok(capture)
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn enforce(inv: &mut Inventory, policy: &StoragePolicy, now: SystemTime) -> EvictionReport {
    let mut report = EvictionReport::default();

    if let Some(cutoff) = policy.retention.and_then(|r| now.checked_sub(r)) {
        let expired: Vec<PathBuf> = inv
            .oldest_first()
            .into_iter()
            .filter(|(_, modified)| *modified < cutoff)
            .map(|(path, _)| path)
            .collect();
        for path in expired {
            match evict(inv, &path) {
                Some(freed) => {
                    report.expired += 1;
                    report.freed_bytes += freed;
                }
                None => report.failures += 1,
            }
        }
    }

    if inv.total_bytes > policy.budget_bytes {
        for (path, _) in inv.oldest_first() {
            if inv.total_bytes <= policy.budget_bytes {
                break;
            }
            match evict(inv, &path) {
                Some(freed) => {
                    report.evicted += 1;
                    report.freed_bytes += freed;
                }
                None => report.failures += 1,
            }
        }
    }

    report
}

/// Delete one tracked file. A file already gone from disk is untracked too.
fn evict(inv: &mut Inventory, path: &Path) -> Option<u64> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "capture evicted"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "capture vanished before eviction");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to evict capture");
            return None;
        }
    }
    inv.untrack(path).map(|c| c.size_bytes)
}

fn is_capture_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CAPTURE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn unique_capture_name(inv: &Inventory, dir: &Path, category: Category, now: &DateTime<Local>) -> String {
    let stem = format!("{}_{}", category.prefix(), now.format("%Y%m%d_%H%M%S_%3f"));
    let taken = |name: &str| inv.issued.contains(name) || dir.join(name).exists();
    let base = format!("{stem}.jpg");
    if !taken(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{stem}_{n}.jpg"))
        .find(|name| !taken(name))
        .unwrap_or(base)
}

fn unique_export_dir(parent: &Path) -> PathBuf {
    let stem = format!("export_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let base = parent.join(&stem);
    if !base.exists() {
        return base;
    }
    (1u32..)
        .map(|n| parent.join(format!("{stem}_{n}")))
        .find(|p| !p.exists())
        .unwrap_or(base)
}
