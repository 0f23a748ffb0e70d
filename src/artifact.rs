//! Local capture queue
//!
//! Captures land in a queue directory as `<data file> + <sidecar .json>`
//! pairs and wait there for the upload collaborator. Files are only deleted
//! once that collaborator confirms persistence, so an offline stretch never
//! loses captures.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Resolution;

/// What produced a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    MotionPhoto,
    MotionVideo,
    ManualSnapshot,
}

impl ArtifactKind {
    fn file_stem(self) -> &'static str {
        match self {
            ArtifactKind::MotionPhoto => "motion",
            ArtifactKind::MotionVideo => "clip",
            ArtifactKind::ManualSnapshot => "snapshot",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::MotionVideo => "h264",
            _ => "jpg",
        }
    }
}

/// One capture awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureArtifact {
    pub local_path: PathBuf,
    pub resolution: Resolution,
    pub captured_at: DateTime<Utc>,
    pub kind: ArtifactKind,
}

impl CaptureArtifact {
    fn sidecar_path(&self) -> PathBuf {
        self.local_path.with_extension("json")
    }
}

/// Queue directory of captures pending handoff.
#[derive(Debug, Clone)]
pub struct UploadQueue {
    dir: PathBuf,
}

impl UploadQueue {
    /// Open (creating if needed) the queue directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating upload queue dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a queue path for a capture that will be written directly by
    /// the camera pipeline (video clips stream to disk, not through memory).
    /// A per-process sequence number keeps burst captures landing within the
    /// same millisecond from clobbering each other.
    pub fn reserve_path(&self, kind: ArtifactKind, at: DateTime<Utc>) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{}_{seq:04}.{}",
            kind.file_stem(),
            at.format("%Y%m%d-%H%M%S%3f"),
            kind.extension()
        );
        self.dir.join(name)
    }

    /// Enqueue in-memory capture data.
    pub async fn enqueue(
        &self,
        data: &[u8],
        kind: ArtifactKind,
        resolution: Resolution,
    ) -> Result<CaptureArtifact> {
        let captured_at = Utc::now();
        let path = self.reserve_path(kind, captured_at);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing capture {}", path.display()))?;
        self.finish(path, kind, resolution, captured_at).await
    }

    /// Enqueue a capture already written at a reserved path.
    pub async fn enqueue_file(
        &self,
        path: PathBuf,
        kind: ArtifactKind,
        resolution: Resolution,
    ) -> Result<CaptureArtifact> {
        anyhow::ensure!(path.exists(), "capture file missing: {}", path.display());
        self.finish(path, kind, resolution, Utc::now()).await
    }

    async fn finish(
        &self,
        local_path: PathBuf,
        kind: ArtifactKind,
        resolution: Resolution,
        captured_at: DateTime<Utc>,
    ) -> Result<CaptureArtifact> {
        let artifact = CaptureArtifact {
            local_path,
            resolution,
            captured_at,
            kind,
        };
        let sidecar = serde_json::to_vec_pretty(&artifact)?;
        tokio::fs::write(artifact.sidecar_path(), sidecar)
            .await
            .context("writing artifact sidecar")?;
        info!(
            path = %artifact.local_path.display(),
            kind = ?kind,
            "capture queued for upload"
        );
        Ok(artifact)
    }

    /// All queued artifacts, oldest first.
    pub fn pending(&self) -> Result<Vec<CaptureArtifact>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir).context("reading upload queue dir")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|b| serde_json::from_slice::<CaptureArtifact>(&b).map_err(Into::into))
            {
                Ok(artifact) if artifact.local_path.exists() => out.push(artifact),
                Ok(orphan) => {
                    debug!(sidecar = %path.display(), "sidecar without data file, dropping");
                    let _ = std::fs::remove_file(&path);
                    let _ = orphan;
                }
                Err(e) => debug!(sidecar = %path.display(), error = %e, "unreadable sidecar"),
            }
        }
        out.sort_by_key(|a| a.captured_at);
        Ok(out)
    }

    /// Remove an artifact after the upload collaborator confirms persistence.
    pub fn confirm(&self, artifact: &CaptureArtifact) -> Result<()> {
        std::fs::remove_file(&artifact.local_path)
            .with_context(|| format!("removing {}", artifact.local_path.display()))?;
        let _ = std::fs::remove_file(artifact.sidecar_path());
        debug!(path = %artifact.local_path.display(), "upload confirmed, local copy removed");
        Ok(())
    }
}
