//! Perchcam - on-device orchestrator for a solar-powered wildlife camera
//!
//! The device sits on a battery budget, so the camera is powered only while
//! something actually needs it. This crate is the controller that decides
//! what that something is:
//!
//! - **Control plane** - watches remote flags and settings, writes heartbeats
//! - **Supervisor** - converges running workers on the flag state, with
//!   crash backoff
//! - **Arbiter** - at most one camera consumer; live view outranks motion
//! - **Stream** - length-prefixed JPEG stream over TCP, single client,
//!   in-band snapshot command
//! - **Motion** - PIR-triggered captures behind a sustained-motion debounce
//!
//! Captures land in a local queue directory for the upload collaborator.
//!
//! # Example
//!
//! ```ignore
//! use perchcam::{Config, Supervisor, Watcher};
//!
//! let config = Config::from_env();
//! let supervisor = Supervisor::new(config, camera, sensor, queue, cancel.clone());
//! let (_watcher, control_rx) = Watcher::spawn(plane, ControlState::default(), cancel);
//! supervisor.run(control_rx).await?;
//! ```

// Deployment config and operator-adjustable capture settings
pub mod config;

// Remote flags, heartbeat, and the watcher task
pub mod control;

// Camera trait, hardware pipeline, and the access arbiter
pub mod camera;

// Worker lifecycle and crash backoff
pub mod supervisor;

// Live view TCP server
pub mod stream;

// PIR sensor and motion capture worker
pub mod motion;

// Local capture queue for the upload collaborator
pub mod artifact;

// Pid lock markers
pub mod lockfile;

pub use artifact::{ArtifactKind, CaptureArtifact, UploadQueue};
pub use camera::arbiter::{AcquireOutcome, CameraArbiter, CameraLease, WorkerKind};
pub use camera::{Camera, FrameStream, LibcameraCamera};
pub use config::{CaptureMode, CaptureSettings, Config, Resolution};
pub use control::{ControlPlane, ControlState, FileControlPlane, Heartbeat, Watcher};
pub use lockfile::LockFile;
pub use motion::{GpioMotionSensor, MotionSensor, MotionWorker};
pub use stream::StreamWorker;
pub use supervisor::{HeartbeatTask, Supervisor, SupervisorStatus, WorkerState};
