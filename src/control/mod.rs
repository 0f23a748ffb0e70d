//! Control plane boundary
//!
//! The device reads a handful of externally-owned flags and a settings
//! bundle, and writes back a heartbeat document. The store itself is someone
//! else's problem; this module defines the vendor-neutral [`ControlPlane`]
//! seam plus the in-memory and local-file implementations.

mod file;
pub mod watcher;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::config::CaptureSettings;

pub use file::FileControlPlane;
pub use watcher::Watcher;

/// One flag document change, as delivered by the store. Delivery may be
/// duplicated or reordered; each flag is last-value-wins.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagUpdate {
    StreamingEnabled(bool),
    ClientAttached(bool),
    MotionCaptureEnabled(bool),
    Settings(CaptureSettings),
}

/// Immutable snapshot of everything the control plane currently says.
///
/// Produced by the watcher and passed by value; no component reads shared
/// mutable flag state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlState {
    pub streaming_enabled: bool,
    pub client_attached: bool,
    pub motion_capture_enabled: bool,
    pub settings: CaptureSettings,
}

impl ControlState {
    /// Apply one update. Returns false when the update changed nothing
    /// (duplicate delivery).
    pub fn apply(&mut self, update: &FlagUpdate) -> bool {
        match update {
            FlagUpdate::StreamingEnabled(v) => replace(&mut self.streaming_enabled, *v),
            FlagUpdate::ClientAttached(v) => replace(&mut self.client_attached, *v),
            FlagUpdate::MotionCaptureEnabled(v) => replace(&mut self.motion_capture_enabled, *v),
            FlagUpdate::Settings(s) => {
                if &self.settings == s {
                    false
                } else {
                    self.settings = s.clone();
                    true
                }
            }
        }
    }
}

fn replace(slot: &mut bool, value: bool) -> bool {
    let changed = *slot != value;
    *slot = value;
    changed
}

/// Liveness/status document written on a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: String,
    pub address: String,
    pub last_seen_at: DateTime<Utc>,
    /// Restart counters per worker, for remote crash observability
    pub restarts: HashMap<String, u32>,
}

impl Heartbeat {
    pub fn online(address: String, restarts: HashMap<String, u32>) -> Self {
        Self {
            status: "online".to_string(),
            address,
            last_seen_at: Utc::now(),
            restarts,
        }
    }
}

/// The externally-owned document store, at its boundary.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Open a subscription yielding raw flag updates. The receiver closing
    /// means transport loss; the caller re-subscribes with backoff.
    async fn subscribe(&self) -> Result<mpsc::Receiver<FlagUpdate>>;

    /// Publish the heartbeat document. Failures are logged, never fatal.
    async fn publish_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
}

/// In-process control plane for tests and wiring experiments.
pub struct MemoryControlPlane {
    tx: broadcast::Sender<FlagUpdate>,
    last_heartbeat: Mutex<Option<Heartbeat>>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            last_heartbeat: Mutex::new(None),
        }
    }

    /// Push a flag change to all subscribers, as the remote store would.
    pub fn set(&self, update: FlagUpdate) {
        // No subscribers yet is fine; last-known values apply
        let _ = self.tx.send(update);
    }

    pub fn last_heartbeat(&self) -> Option<Heartbeat> {
        self.last_heartbeat.lock().expect("heartbeat lock").clone()
    }
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FlagUpdate>> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(update) => {
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn publish_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Some(heartbeat.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_reports_change_and_dedupes() {
        let mut state = ControlState::default();

        assert!(state.apply(&FlagUpdate::StreamingEnabled(true)));
        assert!(state.streaming_enabled);
        // Duplicate delivery
        assert!(!state.apply(&FlagUpdate::StreamingEnabled(true)));

        assert!(state.apply(&FlagUpdate::StreamingEnabled(false)));
        assert!(!state.streaming_enabled);
    }

    #[test]
    fn settings_apply_compares_whole_bundle() {
        let mut state = ControlState::default();
        assert!(!state.apply(&FlagUpdate::Settings(CaptureSettings::default())));

        let mut changed = CaptureSettings::default();
        changed.stream_fps = 20;
        assert!(state.apply(&FlagUpdate::Settings(changed.clone())));
        assert_eq!(state.settings, changed);
    }

    #[tokio::test]
    async fn memory_plane_delivers_updates_in_order() {
        let plane = MemoryControlPlane::new();
        let mut rx = plane.subscribe().await.unwrap();

        plane.set(FlagUpdate::MotionCaptureEnabled(true));
        plane.set(FlagUpdate::StreamingEnabled(true));

        assert_eq!(rx.recv().await.unwrap(), FlagUpdate::MotionCaptureEnabled(true));
        assert_eq!(rx.recv().await.unwrap(), FlagUpdate::StreamingEnabled(true));
    }

    #[tokio::test]
    async fn memory_plane_records_heartbeats() {
        let plane = MemoryControlPlane::new();
        assert!(plane.last_heartbeat().is_none());

        let hb = Heartbeat::online("10.0.0.5".into(), HashMap::new());
        plane.publish_heartbeat(&hb).await.unwrap();
        assert_eq!(plane.last_heartbeat().unwrap().address, "10.0.0.5");
    }
}
