use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use vigil_core::{Gallery, OnnxAnalyzer, StorageManager};
use vigil_hw::{Camera, FrameSource};

mod capture;
mod config;
mod dbus_interface;
mod engine;
mod events;
mod pipeline;

use capture::SourceFactory;
use config::Config;
use dbus_interface::{SurveillanceService, BUS_NAME, OBJECT_PATH};
use events::{History, SharedHistory};
use pipeline::FramePipeline;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        camera = %config.camera_device,
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let known_faces = config.known_faces_dir();
    std::fs::create_dir_all(&known_faces)
        .with_context(|| format!("failed to create {}", known_faces.display()))?;

    let mut analyzer = OnnxAnalyzer::load(&config.model_dir).context("failed to load face models")?;
    let gallery = Arc::new(Gallery::load(&known_faces, &mut analyzer).context("failed to load gallery")?);

    let storage = Arc::new(
        StorageManager::open(&config.data_dir, config.storage_policy()).context("failed to open capture store")?,
    );
    let report = storage.enforce_limits();
    tracing::info!(
        expired = report.expired,
        evicted = report.evicted,
        failures = report.failures,
        "startup storage check done"
    );

    let history: SharedHistory = Arc::new(Mutex::new(History::new(config.history_capacity)));
    let pipeline = FramePipeline::new(
        Box::new(analyzer),
        gallery.clone(),
        storage.clone(),
        config.capture_policy(),
        config.pipeline_settings(),
        Box::new(history.clone()),
    );

    let open_camera: SourceFactory = {
        let device = config.camera_device.clone();
        let (width, height) = (config.frame_width, config.frame_height);
        Arc::new(move || Camera::open(&device, width, height).map(|camera| Box::new(camera) as Box<dyn FrameSource>))
    };
    let engine = engine::spawn_engine(pipeline, open_camera, config.queue_capacity)?;

    let service = SurveillanceService::new(engine.clone(), gallery, storage, history);
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, "vigild ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine already gone");
    }

    Ok(())
}
