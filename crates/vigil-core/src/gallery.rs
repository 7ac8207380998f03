//! Enrolled identities and their reference embeddings.
//!
//! Reference images live under one directory, either flat (`<name>.jpg`) or
//! one subdirectory per identity (`<name>/*.jpg`) for multi-photo identities.
//! Matching reads a copy-on-write snapshot, so enroll/remove never block a
//! frame already being matched.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::{Embedding, GalleryEntry};
use chrono::Local;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("reference directory not found: {0}")]
    DirectoryMissing(PathBuf),
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("embedding dimension mismatch: gallery has {expected}, new embedding has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("analyzer: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-identity summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub embeddings: usize,
}

pub struct Gallery {
    dir: PathBuf,
    entries: RwLock<Arc<Vec<GalleryEntry>>>,
}

impl Gallery {
    /// An empty gallery backed by `dir`, without scanning it.
    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Scan `dir` and embed every reference image.
    ///
    /// Images that fail to decode, or that hold zero or several faces, are
    /// skipped with a warning.
    pub fn load(dir: &Path, analyzer: &mut dyn FaceAnalyzer) -> Result<Self, GalleryError> {
        if !dir.is_dir() {
            return Err(GalleryError::DirectoryMissing(dir.to_path_buf()));
        }

        let mut entries: Vec<GalleryEntry> = Vec::new();
        for (name, path) in reference_images(dir)? {
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable reference image");
                    continue;
                }
            };
            let faces = match analyzer.detect_faces(&image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping reference image: analysis failed");
                    continue;
                }
            };
            if faces.len() != 1 {
                tracing::warn!(
                    path = %path.display(),
                    faces = faces.len(),
                    "skipping reference image: expected exactly one face"
                );
                continue;
            }
            let Some(embedding) = faces.into_iter().next().map(|f| f.embedding) else {
                continue;
            };
            if let Some(first) = entries.first() {
                if first.embedding.dim() != embedding.dim() {
                    tracing::warn!(
                        path = %path.display(),
                        expected = first.embedding.dim(),
                        actual = embedding.dim(),
                        "skipping reference image: embedding dimension mismatch"
                    );
                    continue;
                }
            }
            tracing::debug!(name = %name, path = %path.display(), "reference face loaded");
            entries.push(GalleryEntry { name, embedding, source: path });
        }

        let gallery = Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(Arc::new(entries)),
        };
        tracing::info!(
            dir = %dir.display(),
            identities = gallery.identities().len(),
            embeddings = gallery.len(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Detect the face in `image` and enroll it under `name`.
    ///
    /// When several faces are present the first one reported is used.
    pub fn enroll(
        &self,
        name: &str,
        image: &RgbImage,
        analyzer: &mut dyn FaceAnalyzer,
    ) -> Result<PathBuf, GalleryError> {
        validate_name(name)?;
        let faces = analyzer.detect_faces(image)?;
        if faces.len() > 1 {
            tracing::warn!(name, faces = faces.len(), "several faces in enrollment image; using the first");
        }
        let face = faces.into_iter().next().ok_or(GalleryError::NoFaceDetected)?;
        self.enroll_embedding(name, face.embedding, image)
    }

    /// Append `embedding` under `name` and persist `source_image` as its
    /// reference photo. Existing names gain an additional embedding.
    pub fn enroll_embedding(
        &self,
        name: &str,
        embedding: Embedding,
        source_image: &RgbImage,
    ) -> Result<PathBuf, GalleryError> {
        validate_name(name)?;
        let mut guard = self.write();
        if let Some(first) = guard.first() {
            if first.embedding.dim() != embedding.dim() {
                return Err(GalleryError::DimensionMismatch {
                    expected: first.embedding.dim(),
                    actual: embedding.dim(),
                });
            }
        }

        let identity_dir = self.dir.join(name);
        std::fs::create_dir_all(&identity_dir)?;
        let path = unique_reference_path(&identity_dir, name);
        source_image.save_with_format(&path, ImageFormat::Jpeg)?;

        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(GalleryEntry {
            name: name.to_string(),
            embedding,
            source: path.clone(),
        });
        *guard = Arc::new(next);

        tracing::info!(name, path = %path.display(), embeddings = guard.len(), "identity enrolled");
        Ok(path)
    }

    /// Remove every embedding of `name` and delete its reference images.
    /// Returns how many embeddings were removed.
    pub fn remove(&self, name: &str) -> Result<usize, GalleryError> {
        let removed: Vec<GalleryEntry> = {
            let mut guard = self.write();
            let (removed, kept): (Vec<_>, Vec<_>) =
                guard.iter().cloned().partition(|e| e.name == name);
            if removed.is_empty() {
                return Err(GalleryError::NotFound(name.to_string()));
            }
            *guard = Arc::new(kept);
            removed
        };

        for entry in &removed {
            if let Err(e) = std::fs::remove_file(&entry.source) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %entry.source.display(), error = %e, "failed to delete reference image");
                }
            }
        }
        let identity_dir = self.dir.join(name);
        if validate_name(name).is_ok() && identity_dir.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&identity_dir) {
                tracing::warn!(path = %identity_dir.display(), error = %e, "failed to delete identity directory");
            }
        }

        tracing::info!(name, removed = removed.len(), "identity removed");
        Ok(removed.len())
    }

    /// Snapshot of all (name, embedding) entries in insertion order.
    pub fn embeddings(&self) -> Arc<Vec<GalleryEntry>> {
        Arc::clone(&self.read())
    }

    /// Identities in order of first enrollment, with their embedding counts.
    pub fn identities(&self) -> Vec<IdentitySummary> {
        let snapshot = self.embeddings();
        let mut out: Vec<IdentitySummary> = Vec::new();
        for entry in snapshot.iter() {
            match out.iter_mut().find(|s| s.name == entry.name) {
                Some(summary) => summary.embeddings += 1,
                None => out.push(IdentitySummary {
                    name: entry.name.clone(),
                    embeddings: 1,
                }),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Vec<GalleryEntry>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Vec<GalleryEntry>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Names end up as directory and file names.
fn validate_name(name: &str) -> Result<(), GalleryError> {
    let bad = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(GalleryError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn sorted_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

/// (identity name, image path) pairs in a stable order.
fn reference_images(dir: &Path) -> Result<Vec<(String, PathBuf)>, GalleryError> {
    let mut out = Vec::new();
    for path in sorted_dir(dir)? {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if path.is_dir() {
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .unwrap_or(name);
            match sorted_dir(&path) {
                Ok(files) => out.extend(files.into_iter().filter(|p| is_image(p)).map(|p| (name.clone(), p))),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable identity directory"),
            }
        } else if is_image(&path) {
            out.push((name, path));
        }
    }
    Ok(out)
}

fn unique_reference_path(dir: &Path, name: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
    let base = dir.join(format!("{name}_{stamp}.jpg"));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| dir.join(format!("{name}_{stamp}_{n}.jpg")))
        .find(|p| !p.exists())
        .unwrap_or(base)
}
