use crate::capture::{FrameProducer, SourceFactory};
use crate::pipeline::{FramePipeline, PipelineError};
use serde::Serialize;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::GalleryError;
use vigil_hw::Frame;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] vigil_hw::CameraError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("no frame captured yet; start the camera first")]
    NoFrame,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    pub camera_running: bool,
    /// Frames read from the camera, including dropped ones.
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub last_message: Option<String>,
    pub last_error: Option<String>,
}

/// Where an enrollment image comes from.
#[derive(Debug, Clone)]
pub enum EnrollSource {
    /// The most recent camera frame.
    CurrentFrame,
    File(PathBuf),
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartCamera {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StopCamera {
        reply: oneshot::Sender<bool>,
    },
    Enroll {
        name: String,
        source: EnrollSource,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    Snapshot {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Open the camera and start processing frames. Starting a running camera
    /// is a no-op.
    pub async fn start_camera(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::StartCamera { reply }).await?
    }

    /// Stop processing and release the camera. Returns whether it was running.
    /// No frame is processed after this returns.
    pub async fn stop_camera(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::StopCamera { reply }).await
    }

    /// Enroll the face in `source` under `name`.
    pub async fn enroll(&self, name: &str, source: EnrollSource) -> Result<PathBuf, EngineError> {
        let name = name.to_string();
        self.request(|reply| EngineRequest::Enroll { name, source, reply })
            .await?
    }

    /// Write the most recent annotated frame to `path`.
    pub async fn snapshot(&self, path: PathBuf) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Snapshot { path, reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Stop the camera and end the engine thread.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and, while the camera runs, the frame queue.
/// Requests and frames are served in arrival order on one task, so a stop
/// request can never race a frame in flight.
pub fn spawn_engine(
    pipeline: FramePipeline,
    open_camera: SourceFactory,
    queue_capacity: usize,
) -> Result<EngineHandle, EngineError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);

    let engine = Engine {
        pipeline,
        open_camera,
        queue_capacity,
        producer: None,
        frames: None,
        last_frame: None,
        last_annotated: None,
        status: EngineStatus::default(),
    };

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            runtime.block_on(engine.run(rx));
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

struct Engine {
    pipeline: FramePipeline,
    open_camera: SourceFactory,
    queue_capacity: usize,
    producer: Option<FrameProducer>,
    frames: Option<mpsc::Receiver<Frame>>,
    /// Most recent full-resolution frame, for "enroll current frame".
    last_frame: Option<Frame>,
    last_annotated: Option<RgbImage>,
    status: EngineStatus,
}

enum Wake {
    Request(Option<EngineRequest>),
    Frame(Option<Frame>),
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        loop {
            let wake = tokio::select! {
                biased;
                req = rx.recv() => Wake::Request(req),
                frame = next_frame(&mut self.frames) => Wake::Frame(frame),
            };

            match wake {
                Wake::Request(None) => break,
                Wake::Request(Some(EngineRequest::Shutdown { reply })) => {
                    self.stop_camera();
                    let _ = reply.send(());
                    break;
                }
                Wake::Request(Some(req)) => self.handle(req).await,
                Wake::Frame(Some(frame)) => self.process(frame),
                Wake::Frame(None) => {
                    tracing::warn!("camera stream ended");
                    self.stop_camera();
                    self.status.last_error = Some("camera stream ended".into());
                }
            }
        }
        self.stop_camera();
    }

    async fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartCamera { reply } => {
                let result = self.start_camera().await;
                let _ = reply.send(result);
            }
            EngineRequest::StopCamera { reply } => {
                let _ = reply.send(self.stop_camera());
            }
            EngineRequest::Enroll { name, source, reply } => {
                let _ = reply.send(self.enroll(&name, source));
            }
            EngineRequest::Snapshot { path, reply } => {
                let _ = reply.send(self.snapshot(&path));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start_camera(&mut self) -> Result<(), EngineError> {
        if self.producer.is_some() {
            tracing::debug!("camera already running");
            return Ok(());
        }
        match FrameProducer::start(self.open_camera.clone(), self.queue_capacity).await {
            Ok((producer, frames)) => {
                self.producer = Some(producer);
                self.frames = Some(frames);
                self.pipeline.reset_session();
                self.status.camera_running = true;
                self.status.last_message = Some("camera started".into());
                self.status.last_error = None;
                tracing::info!("camera started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start camera");
                self.status.last_error = Some(format!("camera unavailable: {e}"));
                Err(e.into())
            }
        }
    }

    fn stop_camera(&mut self) -> bool {
        // Dropping the receiver discards queued frames.
        self.frames = None;
        let Some(mut producer) = self.producer.take() else {
            return false;
        };
        producer.stop();
        self.status.frames_captured += producer.produced();
        self.status.frames_dropped += producer.dropped();
        self.status.camera_running = false;
        self.status.last_message = Some("camera stopped".into());
        tracing::info!("camera stopped");
        true
    }

    fn process(&mut self, frame: Frame) {
        match self.pipeline.process(&frame) {
            Ok(out) => {
                self.status.frames_processed += 1;
                if !out.events.is_empty() {
                    self.status.last_message = Some(format!(
                        "{} face(s) in frame {}",
                        out.events.len(),
                        frame.sequence
                    ));
                }
                self.last_frame = Some(frame);
                self.last_annotated = Some(out.annotated);
            }
            Err(e) => {
                tracing::error!(error = %e, "pipeline invariant violated; stopping camera");
                self.stop_camera();
                self.status.last_error = Some(e.to_string());
            }
        }
    }

    fn enroll(&mut self, name: &str, source: EnrollSource) -> Result<PathBuf, EngineError> {
        let image = match source {
            EnrollSource::CurrentFrame => self.last_frame.as_ref().ok_or(EngineError::NoFrame)?.image.clone(),
            EnrollSource::File(path) => image::open(&path)?.to_rgb8(),
        };
        let path = self.pipeline.enroll(name, &image)?;
        self.status.last_message = Some(format!("enrolled {name}"));
        Ok(path)
    }

    fn snapshot(&self, path: &Path) -> Result<(), EngineError> {
        let image = self.last_annotated.as_ref().ok_or(EngineError::NoFrame)?;
        image.save(path)?;
        tracing::info!(path = %path.display(), "snapshot written");
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        let mut status = self.status.clone();
        if let Some(producer) = &self.producer {
            status.frames_captured += producer.produced();
            status.frames_dropped += producer.dropped();
            status.camera_running = producer.is_running();
        }
        status
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
