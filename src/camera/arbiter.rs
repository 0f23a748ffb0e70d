//! Camera access arbiter
//!
//! Single authority over the camera lease. At most one worker holds the
//! lease at any instant; live streaming outranks motion capture, so a stream
//! request revokes a motion holder and waits for it to let go, while a
//! motion request against a streaming holder is simply denied.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The two camera consumers, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Stream,
    Motion,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Stream => write!(f, "stream"),
            WorkerKind::Motion => write!(f, "motion"),
        }
    }
}

struct Holder {
    kind: WorkerKind,
    revoke: CancellationToken,
}

/// Exclusive, revocable right to drive the camera.
///
/// Released on drop, so the lease cannot leak past its worker even on an
/// error path. Holders must watch [`CameraLease::revoked`] and stop promptly
/// when it fires.
pub struct CameraLease {
    kind: WorkerKind,
    revoked: CancellationToken,
    arbiter: Arc<CameraArbiter>,
}

impl CameraLease {
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Fires when a higher-priority consumer needs the camera.
    pub fn revoked(&self) -> &CancellationToken {
        &self.revoked
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.arbiter.release(self.kind);
    }
}

/// Outcome of a lease request. Denial is a scheduling outcome, not an error.
pub enum AcquireOutcome {
    Granted(CameraLease),
    Denied,
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted(_))
    }
}

/// Single source of truth for camera exclusivity.
pub struct CameraArbiter {
    slot: Mutex<Option<Holder>>,
    holder_tx: watch::Sender<Option<WorkerKind>>,
    lease_wait: Duration,
}

impl CameraArbiter {
    pub fn new(lease_wait: Duration) -> Arc<Self> {
        let (holder_tx, _) = watch::channel(None);
        Arc::new(Self {
            slot: Mutex::new(None),
            holder_tx,
            lease_wait,
        })
    }

    /// Current lease holder, if any.
    pub fn current_holder(&self) -> Option<WorkerKind> {
        *self.holder_tx.borrow()
    }

    /// Observe holder transitions. The supervisor re-evaluates blocked
    /// workers when this changes to `None` instead of polling.
    pub fn holder_watch(&self) -> watch::Receiver<Option<WorkerKind>> {
        self.holder_tx.subscribe()
    }

    /// Request the lease for `kind`, applying the priority rule.
    ///
    /// A stream request against a motion holder revokes the motion lease and
    /// waits (bounded by the configured lease wait) for the release before
    /// granting. A motion request against a stream holder is denied
    /// immediately.
    pub async fn acquire(self: &Arc<Self>, kind: WorkerKind) -> AcquireOutcome {
        let deadline = Instant::now() + self.lease_wait;
        let mut rx = self.holder_tx.subscribe();

        loop {
            {
                let mut slot = self.slot.lock().expect("arbiter lock poisoned");
                match slot.as_ref() {
                    None => {
                        let revoke = CancellationToken::new();
                        *slot = Some(Holder {
                            kind,
                            revoke: revoke.clone(),
                        });
                        self.holder_tx.send_replace(Some(kind));
                        debug!(%kind, "camera lease granted");
                        return AcquireOutcome::Granted(CameraLease {
                            kind,
                            revoked: revoke,
                            arbiter: Arc::clone(self),
                        });
                    }
                    Some(holder) if holder.kind == kind => {
                        warn!(%kind, "lease requested while already held by same kind");
                        return AcquireOutcome::Denied;
                    }
                    Some(holder) => match (kind, holder.kind) {
                        (WorkerKind::Motion, WorkerKind::Stream) => {
                            // Streaming outranks motion capture; wait for
                            // the stream to end, never preempt it.
                            debug!("motion lease denied, stream holds the camera");
                            return AcquireOutcome::Denied;
                        }
                        (WorkerKind::Stream, WorkerKind::Motion) => {
                            debug!("revoking motion lease for stream");
                            holder.revoke.cancel();
                        }
                        _ => unreachable!("same-kind handled above"),
                    },
                }
            }

            // Motion holder has been told to stop; wait for the release.
            let released = tokio::time::timeout_at(deadline, rx.wait_for(|h| h.is_none())).await;
            match released {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return AcquireOutcome::Denied,
                Err(_) => {
                    warn!(%kind, "gave up waiting for lease release");
                    return AcquireOutcome::Denied;
                }
            }
        }
    }

    /// Release the lease held by `kind`. A no-op if `kind` is not the
    /// current holder (a revoked holder may race its own release).
    pub fn release(&self, kind: WorkerKind) {
        let mut slot = self.slot.lock().expect("arbiter lock poisoned");
        if slot.as_ref().is_some_and(|h| h.kind == kind) {
            *slot = None;
            self.holder_tx.send_replace(None);
            debug!(%kind, "camera lease released");
        }
    }
}
