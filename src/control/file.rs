//! Local-file control plane
//!
//! Watches a JSON control document on disk and mirrors the heartbeat to a
//! sibling file. Stands in for the hosted document store on deployments that
//! sync these files by other means, and doubles as the local override path
//! (the operator can edit the document over SSH).

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ControlPlane, FlagUpdate, Heartbeat};
use crate::config::CaptureSettings;

/// On-disk shape of the control document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControlDoc {
    streaming_enabled: bool,
    client_attached: bool,
    motion_capture_enabled: bool,
    settings: CaptureSettings,
}

/// Control plane backed by a polled JSON file.
pub struct FileControlPlane {
    doc_path: PathBuf,
    heartbeat_path: PathBuf,
    poll_interval: Duration,
}

impl FileControlPlane {
    pub fn new(doc_path: impl Into<PathBuf>, heartbeat_path: impl Into<PathBuf>) -> Self {
        Self {
            doc_path: doc_path.into(),
            heartbeat_path: heartbeat_path.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn read_doc(path: &PathBuf) -> Result<ControlDoc> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading control document {}", path.display()))?;
        serde_json::from_slice(&bytes).context("parsing control document")
    }
}

#[async_trait]
impl ControlPlane for FileControlPlane {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FlagUpdate>> {
        let (tx, rx) = mpsc::channel(16);
        let path = self.doc_path.clone();
        let poll = self.poll_interval;

        tokio::spawn(async move {
            let mut last_mtime: Option<SystemTime> = None;
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(t) => t,
                    Err(e) => {
                        // Absent document: flags keep their last-known values
                        debug!(path = %path.display(), error = %e, "control document unavailable");
                        continue;
                    }
                };
                if last_mtime == Some(mtime) {
                    continue;
                }

                match Self::read_doc(&path) {
                    Ok(doc) => {
                        last_mtime = Some(mtime);
                        // Full-document delivery; the watcher dedupes
                        let updates = [
                            FlagUpdate::StreamingEnabled(doc.streaming_enabled),
                            FlagUpdate::ClientAttached(doc.client_attached),
                            FlagUpdate::MotionCaptureEnabled(doc.motion_capture_enabled),
                            FlagUpdate::Settings(doc.settings),
                        ];
                        for update in updates {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring unreadable control document"),
                }
            }
        });

        Ok(rx)
    }

    async fn publish_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let json = serde_json::to_vec_pretty(heartbeat)?;
        let tmp = self.heartbeat_path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("writing heartbeat {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.heartbeat_path)
            .await
            .context("publishing heartbeat document")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn document_edits_are_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("control.json");
        let hb = dir.path().join("heartbeat.json");
        std::fs::write(&doc, r#"{"streaming_enabled": true}"#).unwrap();

        let plane =
            FileControlPlane::new(&doc, &hb).with_poll_interval(Duration::from_millis(10));
        let mut rx = plane.subscribe().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), FlagUpdate::StreamingEnabled(true));
        assert_eq!(rx.recv().await.unwrap(), FlagUpdate::ClientAttached(false));
    }

    #[tokio::test]
    async fn heartbeat_lands_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let hb_path = dir.path().join("heartbeat.json");
        let plane = FileControlPlane::new(dir.path().join("control.json"), &hb_path);

        plane
            .publish_heartbeat(&Heartbeat::online("192.168.1.7".into(), HashMap::new()))
            .await
            .unwrap();

        let back: Heartbeat =
            serde_json::from_slice(&std::fs::read(&hb_path).unwrap()).unwrap();
        assert_eq!(back.status, "online");
        assert_eq!(back.address, "192.168.1.7");
    }

    #[tokio::test]
    async fn malformed_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("control.json");
        std::fs::write(&doc, "not json").unwrap();

        let plane = FileControlPlane::new(&doc, dir.path().join("hb.json"))
            .with_poll_interval(Duration::from_millis(10));
        let mut rx = plane.subscribe().await.unwrap();

        // Nothing delivered for the bad document; a later fix goes through
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&doc, r#"{"motion_capture_enabled": true}"#).unwrap();

        loop {
            match rx.recv().await.unwrap() {
                FlagUpdate::MotionCaptureEnabled(true) => break,
                _ => continue,
            }
        }
    }
}
