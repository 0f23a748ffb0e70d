//! Motion-triggered capture worker
//!
//! Keeps the camera powered off and waits on PIR sensor edges. A pulse must
//! stay active for the configured threshold before it counts as a sighting;
//! anything shorter is filtered as a false positive. On a confirmed event
//! the worker captures the configured artifact at full resolution and queues
//! it for upload.

pub mod sensor;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactKind, UploadQueue};
use crate::camera::arbiter::CameraLease;
use crate::camera::Camera;
use crate::config::{CaptureMode, CaptureSettings};

pub use sensor::{GpioMotionSensor, MotionEdge, MotionSensor};
#[cfg(any(test, feature = "test-source"))]
pub use sensor::ChannelMotionSensor;

/// Everything the motion worker needs for one run.
pub struct MotionWorker {
    pub camera: Arc<dyn Camera>,
    pub sensor: Arc<dyn MotionSensor>,
    pub queue: UploadQueue,
    /// Live settings; threshold and mode are re-read per event
    pub settings: watch::Receiver<CaptureSettings>,
    pub lease: CameraLease,
    pub cancel: CancellationToken,
    pub ready: oneshot::Sender<()>,
}

impl MotionWorker {
    /// Worker entry point. Returns `Ok` on an ordered stop (cancellation or
    /// lease revocation); an `Err` is a crash the supervisor restarts.
    pub async fn run(self) -> Result<()> {
        let MotionWorker {
            camera,
            sensor,
            queue,
            settings,
            lease,
            cancel,
            ready,
        } = self;

        let mut edges = sensor
            .subscribe()
            .await
            .context("subscribing to motion sensor")?;
        let revoked = lease.revoked().clone();
        let _ = ready.send(());
        info!("motion capture worker ready, camera off");

        loop {
            // Idle: camera off, wait for an active edge
            let edge = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = revoked.cancelled() => {
                    info!("camera lease revoked, motion worker stopping");
                    return Ok(());
                }
                e = edges.recv() => e.context("motion sensor stream ended")?,
            };
            if edge != MotionEdge::Active {
                continue;
            }

            // Pending: debounce timer, restarted on re-detection
            let threshold = settings.borrow().motion_threshold();
            debug!(?threshold, "motion detected, debounce timer started");
            let mut deadline = Instant::now() + threshold;
            let confirmed = loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = revoked.cancelled() => return Ok(()),
                    () = tokio::time::sleep_until(deadline) => break true,
                    e = edges.recv() => match e.context("motion sensor stream ended")? {
                        MotionEdge::Inactive => {
                            debug!("motion stopped early, false positive filtered");
                            break false;
                        }
                        MotionEdge::Active => {
                            debug!("motion re-detected, timer restarted");
                            deadline = Instant::now() + threshold;
                        }
                    },
                }
            };
            if !confirmed {
                continue;
            }

            // Confirmed: capture with the bundle as of this event
            info!("sustained motion confirmed, capturing");
            let current = settings.borrow().clone();
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("capture cancelled by shutdown");
                    return Ok(());
                }
                () = revoked.cancelled() => {
                    info!("capture cancelled, camera lease revoked");
                    return Ok(());
                }
                result = capture_event(&*camera, &queue, &current) => {
                    // A failed capture is logged and the worker keeps
                    // monitoring; hardware escalation is the supervisor's
                    // call based on repeated crashes, not one bad exposure.
                    if let Err(e) = result {
                        error!(error = %e, "motion capture failed");
                    }
                }
            }

            // Drop edges that queued up during the capture so a stale pulse
            // does not immediately re-trigger.
            while edges.try_recv().is_ok() {}
        }
    }
}

/// Produce the configured artifact(s) for one confirmed event.
async fn capture_event(
    camera: &dyn Camera,
    queue: &UploadQueue,
    settings: &CaptureSettings,
) -> Result<()> {
    let res = settings.capture_resolution;
    match settings.capture_mode {
        CaptureMode::Photo => {
            let data = camera.capture_still(settings, res).await?;
            queue.enqueue(&data, ArtifactKind::MotionPhoto, res).await?;
        }
        CaptureMode::Burst { count } => {
            for shot in 0..count.max(1) {
                let data = camera.capture_still(settings, res).await?;
                queue.enqueue(&data, ArtifactKind::MotionPhoto, res).await?;
                debug!(shot, "burst frame queued");
            }
        }
        CaptureMode::Video { seconds } => {
            let path = queue.reserve_path(ArtifactKind::MotionVideo, chrono::Utc::now());
            camera
                .record_video(settings, res, seconds.max(1), &path)
                .await?;
            queue
                .enqueue_file(path, ArtifactKind::MotionVideo, res)
                .await?;
        }
    }
    Ok(())
}
