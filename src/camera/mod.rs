//! Camera pipeline
//!
//! All camera access goes through the [`Camera`] trait so the orchestration
//! logic can be exercised without hardware. The hardware implementation
//! drives the libcamera command-line tools as child processes; nothing in
//! this crate touches the sensor except through a granted
//! [`arbiter::CameraLease`].

pub mod arbiter;
mod libcamera;
mod mjpeg;
#[cfg(any(test, feature = "test-source"))]
mod test_source;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::sync::mpsc;

use crate::config::{CaptureSettings, Resolution};

pub use libcamera::LibcameraCamera;
pub use mjpeg::JpegAssembler;
#[cfg(any(test, feature = "test-source"))]
pub use test_source::TestCamera;

/// Handle to a running low-res encode.
///
/// Dropping the handle (or calling [`FrameStream::stop`]) tears the pipeline
/// down; for the hardware implementation that kills the encoder child.
pub struct FrameStream {
    rx: mpsc::Receiver<Bytes>,
    stopper: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameStream {
    pub fn new(rx: mpsc::Receiver<Bytes>, stopper: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            stopper: Some(Box::new(stopper)),
        }
    }

    /// Next encoded JPEG frame. `None` once the pipeline has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The physical camera, behind a trait seam.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Power on the sensor and start the continuous low-res JPEG encode.
    async fn open_stream(&self, settings: &CaptureSettings) -> Result<FrameStream>;

    /// One still at the given resolution. Powers the sensor on and off
    /// around the exposure when no stream is running.
    async fn capture_still(&self, settings: &CaptureSettings, res: Resolution) -> Result<Bytes>;

    /// Record a fixed-length clip directly to `out`.
    async fn record_video(
        &self,
        settings: &CaptureSettings,
        res: Resolution,
        seconds: u32,
        out: &Path,
    ) -> Result<()>;
}
