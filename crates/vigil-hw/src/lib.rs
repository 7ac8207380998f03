//! vigil-hw: camera capture and frame processing.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] trait, plus
//! the RGB frame type and the image helpers the pipeline runs on it.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
