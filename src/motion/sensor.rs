//! PIR motion sensor input
//!
//! Edge-triggered: implementations deliver a message per transition, never a
//! polled level. The hardware implementation tails `gpiomon` from libgpiod,
//! the same spawn-a-CLI shape as the camera pipeline.

use std::io::{BufRead, BufReader};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// One sensor transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEdge {
    /// Sensor went active (motion started)
    Active,
    /// Sensor went inactive (motion stopped)
    Inactive,
}

/// Edge-event source. `subscribe` may be called again after a worker
/// restart; each call yields an independent stream.
#[async_trait]
pub trait MotionSensor: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<MotionEdge>>;
}

/// Hardware sensor reading edges from `gpiomon`.
pub struct GpioMotionSensor {
    chip: String,
    line: u32,
}

impl GpioMotionSensor {
    pub fn new(chip: impl Into<String>, line: u32) -> Self {
        Self {
            chip: chip.into(),
            line,
        }
    }
}

#[async_trait]
impl MotionSensor for GpioMotionSensor {
    async fn subscribe(&self) -> Result<mpsc::Receiver<MotionEdge>> {
        let mut child = std::process::Command::new("gpiomon")
            .args([&self.chip, &self.line.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning gpiomon. Is libgpiod installed?")?;

        let stdout = child
            .stdout
            .take()
            .context("capturing stdout from gpiomon")?;

        info!(chip = %self.chip, line = self.line, "motion sensor monitoring started");

        let (tx, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        error!("gpiomon read error: {e}");
                        break;
                    }
                };
                let edge = if line.contains("RISING") {
                    MotionEdge::Active
                } else if line.contains("FALLING") {
                    MotionEdge::Inactive
                } else {
                    continue;
                };
                debug!(?edge, "sensor edge");
                if tx.blocking_send(edge).is_err() {
                    break;
                }
            }
            let _ = child.kill();
            let _ = child.wait();
        });

        Ok(rx)
    }
}

/// Test sensor driven by explicit edge injection.
#[cfg(any(test, feature = "test-source"))]
pub struct ChannelMotionSensor {
    tx: broadcast::Sender<MotionEdge>,
}

#[cfg(any(test, feature = "test-source"))]
impl ChannelMotionSensor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn emit(&self, edge: MotionEdge) {
        let _ = self.tx.send(edge);
    }
}

#[cfg(any(test, feature = "test-source"))]
impl Default for ChannelMotionSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-source"))]
#[async_trait]
impl MotionSensor for ChannelMotionSensor {
    async fn subscribe(&self) -> Result<mpsc::Receiver<MotionEdge>> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(edge) = source.recv().await {
                if tx.send(edge).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
