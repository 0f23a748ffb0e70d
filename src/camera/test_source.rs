//! Fake camera for development and tests
//!
//! Generates JPEG-framed payloads at the configured rate with no hardware.
//! Failure knobs let tests drive the supervisor's crash and fatal paths.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Camera, FrameStream};
use crate::config::{CaptureSettings, Resolution};

/// In-memory stand-in for the hardware camera.
#[derive(Default)]
pub struct TestCamera {
    /// Remaining `open_stream` calls that fail before succeeding again
    fail_opens: AtomicU32,
    /// End each stream after this many frames (0 = run until stopped)
    frames_per_stream: AtomicU64,
    stills_taken: AtomicU64,
    streams_opened: AtomicU64,
}

impl TestCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` stream opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// End every stream after `n` frames, simulating an encoder crash.
    pub fn end_streams_after(&self, n: u64) {
        self.frames_per_stream.store(n, Ordering::SeqCst);
    }

    pub fn stills_taken(&self) -> u64 {
        self.stills_taken.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> u64 {
        self.streams_opened.load(Ordering::SeqCst)
    }

    fn fake_jpeg(res: Resolution, seq: u64) -> Bytes {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&res.width.to_be_bytes());
        data.extend_from_slice(&res.height.to_be_bytes());
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&[0xFF, 0xD9]);
        Bytes::from(data)
    }
}

#[async_trait]
impl Camera for TestCamera {
    async fn open_stream(&self, settings: &CaptureSettings) -> Result<FrameStream> {
        if self.fail_opens.load(Ordering::SeqCst) > 0 {
            self.fail_opens.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("test camera: simulated open failure");
        }
        self.streams_opened.fetch_add(1, Ordering::SeqCst);

        let res = settings.stream_resolution;
        let fps = settings.stream_fps.max(1);
        let limit = self.frames_per_stream.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(fps as usize);

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_micros(1_000_000 / u64::from(fps)));
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                if tx.send(Self::fake_jpeg(res, seq)).await.is_err() {
                    break;
                }
                seq += 1;
                if limit > 0 && seq >= limit {
                    debug!(seq, "test stream ending at frame limit");
                    break;
                }
            }
        });

        Ok(FrameStream::new(rx, move || handle.abort()))
    }

    async fn capture_still(&self, _settings: &CaptureSettings, res: Resolution) -> Result<Bytes> {
        let n = self.stills_taken.fetch_add(1, Ordering::SeqCst);
        Ok(Self::fake_jpeg(res, n))
    }

    async fn record_video(
        &self,
        _settings: &CaptureSettings,
        res: Resolution,
        seconds: u32,
        out: &Path,
    ) -> Result<()> {
        tokio::fs::write(out, format!("clip {res} {seconds}s")).await?;
        Ok(())
    }
}
