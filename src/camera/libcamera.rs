//! Hardware camera via the libcamera command-line apps
//!
//! The stream pipeline spawns `rpicam-vid` encoding MJPEG to stdout and a
//! blocking reader task splits it into frames. Stills and clips shell out to
//! `rpicam-still` / `rpicam-vid` per capture, so the sensor is only powered
//! while a capture is actually in flight.

use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::mjpeg::JpegAssembler;
use super::{Camera, FrameStream};
use crate::config::{CameraControls, CaptureSettings, Resolution};

/// Camera implementation backed by the rpicam apps.
pub struct LibcameraCamera {
    warmup: Duration,
}

impl LibcameraCamera {
    pub fn new(warmup: Duration) -> Self {
        Self { warmup }
    }

    /// Probe for the camera at boot. Failure here is unrecoverable for the
    /// whole orchestrator.
    pub fn probe() -> Result<()> {
        let out = std::process::Command::new("rpicam-still")
            .args(["--list-cameras"])
            .output()
            .context("running rpicam-still --list-cameras. Are the rpicam apps installed?")?;
        anyhow::ensure!(
            out.status.success(),
            "no camera detected: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
        Ok(())
    }

    fn control_args(controls: &CameraControls) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(shutter) = controls.exposure_us {
            args.push("--shutter".into());
            args.push(shutter.to_string());
        }
        if let Some(gain) = controls.gain {
            args.push("--gain".into());
            args.push(gain.to_string());
        }
        if controls.autofocus {
            args.push("--autofocus-mode".into());
            args.push("continuous".into());
        }
        if !controls.awb {
            args.push("--awb".into());
            args.push("custom".into());
        }
        for (flag, value) in [
            ("--sharpness", controls.sharpness),
            ("--contrast", controls.contrast),
            ("--saturation", controls.saturation),
            ("--brightness", controls.brightness),
        ] {
            args.push(flag.into());
            args.push(value.to_string());
        }
        args
    }

    fn geometry_args(res: Resolution) -> [String; 4] {
        [
            "--width".into(),
            res.width.to_string(),
            "--height".into(),
            res.height.to_string(),
        ]
    }
}

#[async_trait]
impl Camera for LibcameraCamera {
    async fn open_stream(&self, settings: &CaptureSettings) -> Result<FrameStream> {
        let res = settings.stream_resolution;
        let mut args: Vec<String> = vec![
            "-t".into(),
            "0".into(), // run until killed
            "--codec".into(),
            "mjpeg".into(),
            "--framerate".into(),
            settings.stream_fps.to_string(),
            "-o".into(),
            "-".into(),
            "--flush".into(),
            "-n".into(),
        ];
        args.extend(Self::geometry_args(res));
        args.extend(Self::control_args(&settings.controls));

        info!("starting rpicam-vid MJPEG encode: {res} @ {}fps", settings.stream_fps);
        debug!(?args, "rpicam-vid args");

        let mut child = std::process::Command::new("rpicam-vid")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning rpicam-vid. Are the rpicam apps installed?")?;

        let stdout = child
            .stdout
            .take()
            .context("capturing stdout from rpicam-vid")?;

        // Roughly one second of frames buffered between reader and consumer
        let (tx, rx) = mpsc::channel(settings.stream_fps.max(1) as usize);
        tokio::task::spawn_blocking(move || read_mjpeg_stream(stdout, tx));

        Ok(FrameStream::new(rx, move || {
            debug!("stopping rpicam-vid");
            let _ = child.kill();
            let _ = child.wait();
        }))
    }

    async fn capture_still(&self, settings: &CaptureSettings, res: Resolution) -> Result<Bytes> {
        let mut args: Vec<String> = vec![
            "-t".into(),
            self.warmup.as_millis().to_string(),
            "-e".into(),
            "jpg".into(),
            "-o".into(),
            "-".into(),
            "-n".into(),
        ];
        args.extend(Self::geometry_args(res));
        args.extend(Self::control_args(&settings.controls));

        debug!(%res, "capturing still via rpicam-still");
        let out = tokio::process::Command::new("rpicam-still")
            .args(&args)
            .stderr(Stdio::null())
            // A cancelled capture must not keep holding the sensor
            .kill_on_drop(true)
            .output()
            .await
            .context("running rpicam-still")?;
        anyhow::ensure!(out.status.success(), "rpicam-still exited with {}", out.status);
        anyhow::ensure!(!out.stdout.is_empty(), "captured frame was empty");
        Ok(Bytes::from(out.stdout))
    }

    async fn record_video(
        &self,
        settings: &CaptureSettings,
        res: Resolution,
        seconds: u32,
        out: &Path,
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "-t".into(),
            (u64::from(seconds) * 1000).to_string(),
            "--codec".into(),
            "h264".into(),
            "-o".into(),
            out.display().to_string(),
            "-n".into(),
        ];
        args.extend(Self::geometry_args(res));
        args.extend(Self::control_args(&settings.controls));

        info!(%res, seconds, path = %out.display(), "recording clip via rpicam-vid");
        let status = tokio::process::Command::new("rpicam-vid")
            .args(&args)
            .stderr(Stdio::null())
            // A cancelled capture must not keep holding the sensor
            .kill_on_drop(true)
            .status()
            .await
            .context("running rpicam-vid for clip")?;
        anyhow::ensure!(status.success(), "rpicam-vid exited with {status}");
        Ok(())
    }
}

/// Blocking read loop splitting encoder stdout into JPEG frames.
fn read_mjpeg_stream<R: Read>(mut reader: R, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut assembler = JpegAssembler::new();
    let mut frame_count = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("MJPEG stream ended (EOF)");
                break;
            }
            Ok(n) => {
                for frame in assembler.push(&buf[..n]) {
                    frame_count += 1;
                    if frame_count % 500 == 0 {
                        debug!(frame_count, "MJPEG frames read");
                    }
                    if tx.blocking_send(frame).is_err() {
                        info!("frame receiver dropped, stopping MJPEG reader");
                        return;
                    }
                }
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("error reading MJPEG stream: {e}");
                break;
            }
        }
    }

    if assembler.buffered() > 0 {
        warn!(bytes = assembler.buffered(), "discarding partial frame at stream end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Dead, or a zombie awaiting reaping.
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[tokio::test]
    async fn cancelled_clip_recording_kills_the_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("encoder.pid");

        // Stand-in encoder that records its pid and holds the camera
        let fake = dir.path().join("rpicam-vid");
        std::fs::write(&fake, "#!/bin/sh\necho $$ > \"$ENCODER_PID_FILE\"\nexec sleep 30\n")
            .unwrap();
        let mut perms = std::fs::metadata(&fake).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake, perms).unwrap();

        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{path}", dir.path().display()));
        std::env::set_var("ENCODER_PID_FILE", &pid_file);

        let camera = LibcameraCamera::new(Duration::from_millis(10));
        let settings = CaptureSettings::default();
        let out = dir.path().join("clip.h264");

        // Drop the in-flight capture, as a revoked lease does
        let record = camera.record_video(&settings, Resolution::new(640, 360), 30, &out);
        let _ = tokio::time::timeout(Duration::from_millis(500), record).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let pid: u32 = loop {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse() {
                    break pid;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "encoder never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        loop {
            if process_gone(pid) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "encoder survived the dropped capture"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
