//! Orchestrator configuration
//!
//! Runtime settings come from two places:
//! - Fixed deployment config from environment variables (`Config::from_env`)
//! - Operator-adjustable capture settings pushed through the control plane
//!   (`CaptureSettings`), re-read by workers on each use rather than cached.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A width x height pixel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What the motion worker produces on a confirmed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    /// Single full-resolution photo
    Photo,
    /// Burst of photos
    Burst { count: u32 },
    /// Fixed-length video clip
    Video { seconds: u32 },
}

/// Sensor tuning applied when the camera pipeline is opened.
///
/// Mirrors the controls the operator app exposes; `None` means leave the
/// camera's automatic behavior alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraControls {
    /// Fixed exposure time in microseconds (None = auto exposure)
    pub exposure_us: Option<u32>,
    /// Fixed analog gain (None = auto)
    pub gain: Option<f32>,
    /// Continuous autofocus
    pub autofocus: bool,
    /// Auto white balance
    pub awb: bool,
    pub sharpness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub brightness: f32,
}

impl Default for CameraControls {
    fn default() -> Self {
        Self {
            exposure_us: None,
            gain: None,
            autofocus: true,
            awb: true,
            sharpness: 1.0,
            contrast: 1.0,
            saturation: 1.0,
            brightness: 0.0,
        }
    }
}

/// Operator-adjustable capture settings, delivered as one bundle through the
/// control plane settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Low-res stream for live viewing
    pub stream_resolution: Resolution,
    /// High-res on-demand snapshots
    pub snapshot_resolution: Resolution,
    /// Full-res motion captures
    pub capture_resolution: Resolution,
    /// Encoder framerate for the live stream
    pub stream_fps: u32,
    /// Seconds of sustained motion before a capture is confirmed
    pub motion_threshold_secs: f64,
    /// What to produce on a confirmed motion event
    pub capture_mode: CaptureMode,
    pub controls: CameraControls,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            stream_resolution: Resolution::new(640, 360),
            snapshot_resolution: Resolution::new(2560, 1440),
            capture_resolution: Resolution::new(4608, 2592),
            stream_fps: 10,
            motion_threshold_secs: 6.5,
            capture_mode: CaptureMode::Photo,
            controls: CameraControls::default(),
        }
    }
}

impl CaptureSettings {
    pub fn motion_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.motion_threshold_secs.max(0.0))
    }
}

/// Fixed deployment configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the stream server binds
    pub bind_addr: SocketAddr,
    /// Heartbeat publish interval
    pub heartbeat_interval: Duration,
    /// How long a lease request waits for the holder to let go
    pub lease_wait: Duration,
    /// A worker that has not reported ready within this window is a crash
    pub startup_timeout: Duration,
    /// Close a stream client that cannot consume a frame within this window
    pub client_idle_timeout: Duration,
    /// Sensor settle time after powering the camera for a still
    pub camera_warmup: Duration,
    /// Directory for captures awaiting the upload collaborator
    pub queue_dir: PathBuf,
    /// Directory for worker lock markers
    pub lock_dir: PathBuf,
    /// GPIO chip and line the PIR sensor is wired to
    pub motion_gpio_chip: String,
    pub motion_gpio_line: u32,
    /// Initial capture settings, until the control plane supplies a bundle
    pub settings: CaptureSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().expect("static addr"),
            heartbeat_interval: Duration::from_secs(60),
            lease_wait: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(15),
            client_idle_timeout: Duration::from_secs(30),
            camera_warmup: Duration::from_secs(1),
            queue_dir: PathBuf::from("upload_queue"),
            lock_dir: PathBuf::from("/tmp"),
            motion_gpio_chip: "gpiochip0".to_string(),
            motion_gpio_line: 4,
            settings: CaptureSettings::default(),
        }
    }
}

impl Config {
    /// Build configuration from `PERCHCAM_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env_parse("PERCHCAM_BIND", defaults.bind_addr),
            heartbeat_interval: env_secs("PERCHCAM_HEARTBEAT_SECS", defaults.heartbeat_interval),
            lease_wait: env_secs("PERCHCAM_LEASE_WAIT_SECS", defaults.lease_wait),
            startup_timeout: env_secs("PERCHCAM_STARTUP_TIMEOUT_SECS", defaults.startup_timeout),
            client_idle_timeout: env_secs("PERCHCAM_IDLE_TIMEOUT_SECS", defaults.client_idle_timeout),
            camera_warmup: env_secs("PERCHCAM_WARMUP_SECS", defaults.camera_warmup),
            queue_dir: std::env::var("PERCHCAM_QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue_dir),
            lock_dir: std::env::var("PERCHCAM_LOCK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.lock_dir),
            motion_gpio_chip: std::env::var("PERCHCAM_GPIO_CHIP")
                .unwrap_or(defaults.motion_gpio_chip),
            motion_gpio_line: env_parse("PERCHCAM_GPIO_LINE", defaults.motion_gpio_line),
            settings: defaults.settings,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
