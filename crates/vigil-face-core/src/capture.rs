//! Camera lifecycle: acquire, stream frames, release.
//!
//! The engine only sees the [`CaptureSource`] trait. Hardware access lives in
//! [`device`]; tests inject scripted sources.

pub mod device;

use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

pub use device::{
    convert_frame_to_image, DeviceLocator, V4lCaptureConfig, V4lCaptureSource,
    DEFAULT_PIXEL_FORMAT,
};

/// Failures reported by a capture source.
///
/// Acquisition failures are retryable by the user. During streaming only
/// [`CaptureError::Disconnected`] is fatal; the rest are per-frame hiccups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("no camera found: {0}")]
    NotFound(String),

    #[error("camera is already in use: {0}")]
    Busy(String),

    #[error("camera not supported: {0}")]
    Unsupported(String),

    #[error("camera disconnected: {0}")]
    Disconnected(String),

    #[error("failed processing frame data: {0}")]
    Frame(String),

    #[error("camera has not been acquired")]
    NotAcquired,
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::Disconnected(_) | CaptureError::NotAcquired
        )
    }

    /// Classify an OS error raised while opening or streaming a device.
    pub fn from_io(device: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let detail = format!("{device}: {err}");
        match err.kind() {
            ErrorKind::PermissionDenied => CaptureError::PermissionDenied(detail),
            ErrorKind::NotFound => CaptureError::NotFound(detail),
            _ => match err.raw_os_error() {
                // EBUSY
                Some(16) => CaptureError::Busy(detail),
                // ENODEV, ENXIO
                Some(19) | Some(6) => CaptureError::Disconnected(detail),
                _ => CaptureError::Unsupported(detail),
            },
        }
    }
}

#[async_trait]
pub trait CaptureSource: Send {
    /// Human-readable device description used in logs.
    fn describe(&self) -> String;

    async fn acquire(&mut self) -> Result<(), CaptureError>;

    async fn next_frame(&mut self) -> Result<RgbImage, CaptureError>;

    /// Release the device. Called at most once per successful `acquire`.
    fn release(&mut self);
}

/// Scoped ownership of a capture source.
///
/// The device is released exactly once: by [`CaptureLease::release`] or, if
/// that never happens, on drop.
pub struct CaptureLease {
    source: Box<dyn CaptureSource>,
    acquired: bool,
}

impl CaptureLease {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self {
            source,
            acquired: false,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub async fn acquire(&mut self) -> Result<(), CaptureError> {
        if self.acquired {
            return Ok(());
        }
        self.source.acquire().await?;
        self.acquired = true;
        debug!(device = %self.source.describe(), "camera acquired");
        Ok(())
    }

    pub async fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if !self.acquired {
            return Err(CaptureError::NotAcquired);
        }
        self.source.next_frame().await
    }

    pub fn release(&mut self) {
        if self.acquired {
            self.acquired = false;
            self.source.release();
            debug!(device = %self.source.describe(), "camera released");
        }
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        if self.acquired {
            warn!(device = %self.source.describe(), "camera lease dropped while acquired");
            self.release();
        }
    }
}
