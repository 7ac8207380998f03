//! Camera producer thread feeding a bounded frame queue.
//!
//! When the queue is full the newest frame is dropped rather than blocking
//! the camera: a live feed wants the freshest frames, not every frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use vigil_hw::{CameraError, Frame, FrameSource};

/// Opens the frame source. Called on the producer thread.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

/// Consecutive capture failures after which the producer gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Counters {
    produced: AtomicU64,
    dropped: AtomicU64,
}

pub struct FrameProducer {
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl FrameProducer {
    /// Open the source on a new thread and start pushing frames into a queue
    /// of `capacity` frames. Fails if the source cannot be opened.
    pub async fn start(open: SourceFactory, capacity: usize) -> Result<(Self, mpsc::Receiver<Frame>), CameraError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let thread = {
            let stop = stop.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("vigil-capture".into())
                .spawn(move || {
                    let source = match open() {
                        Ok(source) => {
                            let _ = ready_tx.send(Ok(()));
                            source
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    produce(source, tx, &stop, &counters);
                })
                .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?
        };

        let mut producer = Self {
            stop,
            counters,
            thread: Some(thread),
        };
        let opened = ready_rx
            .await
            .unwrap_or_else(|_| Err(CameraError::CaptureFailed("capture thread exited".into())));
        if let Err(e) = opened {
            producer.stop();
            return Err(e);
        }
        tracing::info!(capacity, "frame producer started");
        Ok((producer, rx))
    }

    /// Frames read from the source, queued or not.
    pub fn produced(&self) -> u64 {
        self.counters.produced.load(Ordering::Relaxed)
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the thread and wait for it to release the source. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::info!(
                produced = self.produced(),
                dropped = self.dropped(),
                "frame producer stopped"
            );
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(mut source: Box<dyn FrameSource>, tx: mpsc::Sender<Frame>, stop: &AtomicBool, counters: &Counters) {
    let mut sequence = 0u32;
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::Relaxed) {
        let mut frame = match source.next_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                frame
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(error = %e, consecutive_errors, "frame capture failed");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!("too many capture failures; stopping producer");
                    break;
                }
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        frame.sequence = sequence;
        sequence = sequence.wrapping_add(1);
        counters.produced.fetch_add(1, Ordering::Relaxed);

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(seq = dropped.sequence, "frame queue full; dropping frame");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    // `source` drops here, releasing the device before `stop()` returns.
}
