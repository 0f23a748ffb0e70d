//! Process lock markers
//!
//! One pid file per orchestrator instance. A crash leaves the marker behind,
//! so acquisition checks `/proc` and clears markers whose owner is gone
//! rather than refusing to start.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Take the named lock, clearing a stale marker left by a dead process.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating lock dir {}", dir.display()))?;
        let path = dir.join(format!("{name}.pid"));

        match read_pid(&path) {
            Some(pid) if pid != std::process::id() && process_alive(pid) => {
                bail!("{name} is already running with pid {pid}");
            }
            Some(pid) => {
                warn!(pid, lock = %path.display(), "clearing stale lock of dead process");
                let _ = std::fs::remove_file(&path);
            }
            None if path.exists() => {
                warn!(lock = %path.display(), "clearing unreadable lock marker");
                let _ = std::fs::remove_file(&path);
            }
            None => {}
        }

        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("writing lock {}", path.display()))?;
        debug!(lock = %path.display(), "lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::acquire(dir.path(), "orchestrator").unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn live_foreign_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 always exists
        std::fs::write(dir.path().join("orchestrator.pid"), "1").unwrap();
        assert!(LockFile::acquire(dir.path(), "orchestrator").is_err());
    }

    #[test]
    fn stale_pid_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        // Beyond the kernel pid space, so never alive
        std::fs::write(dir.path().join("orchestrator.pid"), "999999999").unwrap();

        let lock = LockFile::acquire(dir.path(), "orchestrator").unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn unreadable_marker_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orchestrator.pid"), "not a pid").unwrap();
        assert!(LockFile::acquire(dir.path(), "orchestrator").is_ok());
    }

    #[test]
    fn reacquire_by_same_process_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let first = LockFile::acquire(dir.path(), "orchestrator").unwrap();
        // Our own pid is not a conflict (restart within one process image)
        let second = LockFile::acquire(dir.path(), "orchestrator");
        assert!(second.is_ok());
        drop(first);
    }
}
