//! Perchcam orchestrator binary
//!
//! One process per device. Watches the remote control document, supervises
//! the stream and motion workers, and heartbeats back.
//!
//! ## Usage
//!
//! ```bash
//! # Run against the real camera and PIR sensor
//! perchcam
//!
//! # Development without hardware (requires the test-source feature)
//! perchcam --test-source
//! ```
//!
//! Configuration comes from `PERCHCAM_*` environment variables; see
//! `Config::from_env`. The control document and heartbeat paths default to
//! `control.json` / `heartbeat.json` in the working directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use perchcam::control::ControlState;
use perchcam::{
    Camera, Config, ControlPlane, FileControlPlane, GpioMotionSensor, HeartbeatTask,
    LibcameraCamera, LockFile, MotionSensor, Supervisor, UploadQueue, Watcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("perchcam=info".parse().expect("static directive")),
        )
        .init();

    let config = Config::from_env();
    let args: Vec<String> = std::env::args().collect();
    let test_source = args.iter().any(|arg| arg == "--test-source");

    info!("perchcam starting");
    info!(
        "  stream: {} @ {}fps on {}",
        config.settings.stream_resolution, config.settings.stream_fps, config.bind_addr
    );
    info!("  captures: {} -> {}", config.settings.capture_resolution, config.queue_dir.display());
    info!("  test source: {test_source}");

    // One orchestrator per device; clears markers left by a crashed run
    let _lock = LockFile::acquire(&config.lock_dir, "perchcam")?;

    // Startup failures (no camera, bad bind dir) exit nonzero so the service
    // manager sees them
    let camera = build_camera(&config, test_source)?;
    let sensor = build_sensor(&config, test_source)?;
    let queue = UploadQueue::open(&config.queue_dir)?;

    let control_doc = env_path("PERCHCAM_CONTROL_DOC", "control.json");
    let heartbeat_doc = env_path("PERCHCAM_HEARTBEAT_DOC", "heartbeat.json");
    let plane: Arc<dyn ControlPlane> = Arc::new(FileControlPlane::new(control_doc, heartbeat_doc));

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let supervisor = Supervisor::new(config.clone(), camera, sensor, queue, cancel.clone());
    let status_rx = supervisor.status_watch();
    let (watcher, control_rx) = Watcher::spawn(
        Arc::clone(&plane),
        ControlState::default(),
        cancel.clone(),
    );

    tracker.spawn(
        HeartbeatTask {
            plane,
            interval: config.heartbeat_interval,
            port: config.bind_addr.port(),
            status: status_rx,
            cancel: cancel.clone(),
        }
        .run(),
    );

    let mut supervisor_task = tokio::spawn(supervisor.run(control_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        result = &mut supervisor_task => {
            // The supervisor only returns after cancellation; getting here
            // without a signal means it died
            cancel.cancel();
            tracker.close();
            tracker.wait().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("supervisor task failed: {e}")),
            };
        }
    }

    cancel.cancel();
    match supervisor_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "supervisor ended with error during shutdown"),
        Err(e) => error!(error = %e, "supervisor task failed during shutdown"),
    }
    watcher.join().await;
    tracker.close();
    tracker.wait().await;
    info!("perchcam stopped");
    Ok(())
}

fn build_camera(config: &Config, test_source: bool) -> Result<Arc<dyn Camera>> {
    if test_source {
        return test_camera();
    }
    LibcameraCamera::probe().context("camera probe failed")?;
    Ok(Arc::new(LibcameraCamera::new(config.camera_warmup)))
}

fn build_sensor(config: &Config, test_source: bool) -> Result<Arc<dyn MotionSensor>> {
    if test_source {
        return test_sensor();
    }
    Ok(Arc::new(GpioMotionSensor::new(
        config.motion_gpio_chip.clone(),
        config.motion_gpio_line,
    )))
}

#[cfg(feature = "test-source")]
fn test_camera() -> Result<Arc<dyn Camera>> {
    info!("using in-memory test camera");
    Ok(Arc::new(perchcam::camera::TestCamera::new()))
}

#[cfg(not(feature = "test-source"))]
fn test_camera() -> Result<Arc<dyn Camera>> {
    anyhow::bail!("--test-source requires a build with the test-source feature")
}

#[cfg(feature = "test-source")]
fn test_sensor() -> Result<Arc<dyn MotionSensor>> {
    Ok(Arc::new(perchcam::motion::ChannelMotionSensor::new()))
}

#[cfg(not(feature = "test-source"))]
fn test_sensor() -> Result<Arc<dyn MotionSensor>> {
    anyhow::bail!("--test-source requires a build with the test-source feature")
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}
