//! Remote state watcher
//!
//! Consumes raw flag updates from the control plane, dedupes them against a
//! last-known-value cache, and emits immutable [`ControlState`] snapshots in
//! delivery order. On transport loss it re-subscribes with jittered
//! exponential backoff while last-known values stay in effect.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlPlane, ControlState};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Flag subscription task handle.
pub struct Watcher {
    handle: JoinHandle<()>,
}

impl Watcher {
    /// Spawn the watcher. Snapshots arrive on the returned channel in the
    /// order the changes were observed.
    pub fn spawn(
        plane: Arc<dyn ControlPlane>,
        initial: ControlState,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<ControlState>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(run(plane, initial, tx, cancel));
        (Self { handle }, rx)
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn run(
    plane: Arc<dyn ControlPlane>,
    mut state: ControlState,
    tx: mpsc::Sender<ControlState>,
    cancel: CancellationToken,
) {
    let mut backoff = BACKOFF_BASE;

    loop {
        let mut updates = tokio::select! {
            () = cancel.cancelled() => return,
            sub = plane.subscribe() => match sub {
                Ok(rx) => {
                    info!("control plane subscription established");
                    backoff = BACKOFF_BASE;
                    rx
                }
                Err(e) => {
                    warn!(error = %e, "control plane subscribe failed");
                    if sleep_backoff(&mut backoff, &cancel).await {
                        return;
                    }
                    continue;
                }
            },
        };

        loop {
            let update = tokio::select! {
                () = cancel.cancelled() => return,
                update = updates.recv() => update,
            };
            match update {
                Some(update) => {
                    if state.apply(&update) {
                        debug!(?update, "flag changed");
                        if tx.send(state.clone()).await.is_err() {
                            return;
                        }
                    }
                }
                None => {
                    // Transport loss: keep last-known values, re-subscribe
                    warn!("control plane subscription lost, reconnecting");
                    break;
                }
            }
        }

        if sleep_backoff(&mut backoff, &cancel).await {
            return;
        }
    }
}

/// Jittered exponential backoff sleep. Returns true when cancelled.
async fn sleep_backoff(backoff: &mut Duration, cancel: &CancellationToken) -> bool {
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    let delay = backoff.mul_f64(jitter).min(BACKOFF_CAP.mul_f64(1.2));
    debug!(?delay, "backing off before re-subscribe");
    *backoff = (*backoff * 2).min(BACKOFF_CAP);

    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}
