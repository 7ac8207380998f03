use crate::engine::{EngineHandle, EnrollSource};
use crate::events::SharedHistory;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};
use vigil_core::{Gallery, StorageManager};
use zbus::interface;

pub const BUS_NAME: &str = "org.vigil.Surveillance1";
pub const OBJECT_PATH: &str = "/org/vigil/Surveillance1";

/// D-Bus interface for the Vigil surveillance daemon.
///
/// Bus name: org.vigil.Surveillance1
/// Object path: /org/vigil/Surveillance1
///
/// Structured replies are JSON strings.
pub struct SurveillanceService {
    engine: EngineHandle,
    gallery: Arc<Gallery>,
    storage: Arc<StorageManager>,
    history: SharedHistory,
}

impl SurveillanceService {
    pub fn new(
        engine: EngineHandle,
        gallery: Arc<Gallery>,
        storage: Arc<StorageManager>,
        history: SharedHistory,
    ) -> Self {
        Self {
            engine,
            gallery,
            storage,
            history,
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, crate::events::History> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Run storage work on the blocking pool, off the bus executor.
async fn blocking<T, F>(work: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(failed)
}

fn parse_time(value: &str) -> zbus::fdo::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{value:?} is not an RFC 3339 timestamp: {e}")))
}

#[interface(name = "org.vigil.Surveillance1")]
impl SurveillanceService {
    /// Open the camera and start processing frames.
    async fn start_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_camera requested");
        self.engine.start_camera().await.map_err(failed)
    }

    /// Stop processing and release the camera. Returns whether it was running.
    async fn stop_camera(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_camera requested");
        self.engine.stop_camera().await.map_err(failed)
    }

    /// Enroll a face under `name` from an image file, or from the current
    /// camera frame when `image_path` is empty. Returns the stored reference path.
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "enroll requested");
        let source = if image_path.is_empty() {
            EnrollSource::CurrentFrame
        } else {
            EnrollSource::File(PathBuf::from(image_path))
        };
        let path = self.engine.enroll(name, source).await.map_err(failed)?;
        Ok(path.display().to_string())
    }

    /// Remove an identity and its reference images. Returns the number of
    /// embeddings removed.
    async fn remove_identity(&self, name: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(name, "remove_identity requested");
        let removed = self.gallery.remove(name).map_err(failed)?;
        Ok(removed as u32)
    }

    /// List enrolled identities with their embedding counts.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.identities())
    }

    /// Write the latest annotated frame to `path` (format from the extension).
    async fn snapshot(&self, path: &str) -> zbus::fdo::Result<()> {
        self.engine.snapshot(PathBuf::from(path)).await.map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self.engine.status().await.map_err(failed)?;
        let history_events = self.lock_history().len();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": engine,
            "identities": self.gallery.identities().len(),
            "embeddings": self.gallery.len(),
            "storage": self.storage.usage(),
            "history_events": history_events,
        })
        .to_string())
    }

    /// Current storage consumption. Never evicts anything.
    async fn storage_usage(&self) -> zbus::fdo::Result<String> {
        to_json(&self.storage.usage())
    }

    /// Run the age and size passes now.
    async fn enforce_limits(&self) -> zbus::fdo::Result<String> {
        let storage = self.storage.clone();
        let report = blocking(move || storage.enforce_limits()).await?;
        to_json(&report)
    }

    /// Copy captures modified within `[start, end]` (RFC 3339) into a new
    /// export directory. Returns the exported paths.
    async fn export(&self, start: &str, end: &str) -> zbus::fdo::Result<Vec<String>> {
        let (start, end) = (parse_time(start)?, parse_time(end)?);
        tracing::info!(%start, %end, "export requested");
        let storage = self.storage.clone();
        let exported = blocking(move || storage.export(start, end)).await?.map_err(failed)?;
        Ok(exported.iter().map(|p| p.display().to_string()).collect())
    }

    /// List tracked captures, oldest first.
    async fn list_captures(&self) -> zbus::fdo::Result<String> {
        let storage = self.storage.clone();
        let captures = blocking(move || storage.captures()).await?;
        to_json(&captures)
    }

    /// Delete one tracked capture.
    async fn delete_capture(&self, path: &str) -> zbus::fdo::Result<()> {
        tracing::info!(path, "delete_capture requested");
        let storage = self.storage.clone();
        let path = PathBuf::from(path);
        blocking(move || storage.delete(&path)).await?.map(|_| ()).map_err(failed)
    }

    /// The `limit` most recent detection events, oldest first.
    async fn history(&self, limit: u32) -> zbus::fdo::Result<String> {
        let events = self.lock_history().recent(limit as usize);
        to_json(&events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_accepts_offsets() {
        let t = parse_time("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(t.with_timezone(&chrono::Utc).to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(matches!(parse_time("yesterday"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_blocking_storage_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::open(tmp.path(), vigil_core::StoragePolicy::new(1_000_000, 0)).unwrap());
        let saved = storage.save(&[0u8; 64], vigil_core::Category::Unknown, None).unwrap();

        let listed = {
            let storage = storage.clone();
            blocking(move || storage.captures()).await.unwrap()
        };
        assert_eq!(listed.len(), 1);

        let path = saved.path.clone();
        let deleted = {
            let storage = storage.clone();
            blocking(move || storage.delete(&path)).await.unwrap()
        };
        assert!(deleted.is_ok());
        assert!(!saved.path.exists());
        assert_eq!(storage.usage().file_count, 0);
    }
}
