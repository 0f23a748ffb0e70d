//! Process supervisor
//!
//! Owns the two camera workers (live stream, motion capture) and keeps the
//! running set converged on what the control flags ask for. Workers run as
//! tasks; the supervisor watches their exits, applies the crash backoff
//! ladder, and gates every start on a camera lease from the arbiter.

pub mod backoff;
pub mod heartbeat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::UploadQueue;
use crate::camera::arbiter::{AcquireOutcome, CameraArbiter, WorkerKind};
use crate::camera::Camera;
use crate::config::{CaptureSettings, Config};
use crate::control::ControlState;
use crate::motion::{MotionSensor, MotionWorker};
use crate::stream::StreamWorker;

use backoff::RestartBackoff;

pub use heartbeat::HeartbeatTask;

/// Consecutive failed starts (never reaching ready) before a worker is
/// declared fatal and left down until its flag cycles.
const FATAL_START_FAILURES: u32 = 5;

/// Hard slack for worker teardown at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Stopped,
    /// Lease granted, task spawned, not yet reported ready
    Starting,
    Running,
    /// Asked to stop, waiting for the task to exit
    Stopping,
    /// Crashed; restart pending after the backoff delay
    CrashedBackoff,
    /// Gave up restarting until the worker's flag is cycled
    Fatal,
}

/// Snapshot published on every supervisor transition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupervisorStatus {
    pub stream: WorkerState,
    pub motion: WorkerState,
    pub stream_restarts: u32,
    pub motion_restarts: u32,
}

impl SupervisorStatus {
    /// Restart counters keyed by worker name, for the heartbeat document.
    pub fn restart_counts(&self) -> HashMap<String, u32> {
        HashMap::from([
            (WorkerKind::Stream.to_string(), self.stream_restarts),
            (WorkerKind::Motion.to_string(), self.motion_restarts),
        ])
    }
}

enum WorkerEvent {
    Ready {
        kind: WorkerKind,
        addr: Option<SocketAddr>,
    },
    Exited {
        kind: WorkerKind,
        result: Result<()>,
    },
}

struct ManagedWorker {
    kind: WorkerKind,
    state: WorkerState,
    /// Per-run stop token, child of the supervisor root
    stop: Option<CancellationToken>,
    /// Startup timeout, backoff end, or healthy-reset point
    deadline: Option<Instant>,
    backoff: RestartBackoff,
    start_failures: u32,
    restarts: u32,
}

impl ManagedWorker {
    fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            state: WorkerState::Stopped,
            stop: None,
            deadline: None,
            backoff: RestartBackoff::new(),
            start_failures: 0,
            restarts: 0,
        }
    }
}

pub struct Supervisor {
    config: Config,
    camera: Arc<dyn Camera>,
    sensor: Arc<dyn MotionSensor>,
    arbiter: Arc<CameraArbiter>,
    queue: UploadQueue,
    cancel: CancellationToken,
    settings_tx: watch::Sender<CaptureSettings>,
    status_tx: watch::Sender<SupervisorStatus>,
    stream_addr_tx: watch::Sender<Option<SocketAddr>>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    stream: ManagedWorker,
    motion: ManagedWorker,
    /// Last control snapshot; desired worker set derives from this alone
    state: ControlState,
}

impl Supervisor {
    pub fn new(
        config: Config,
        camera: Arc<dyn Camera>,
        sensor: Arc<dyn MotionSensor>,
        queue: UploadQueue,
        cancel: CancellationToken,
    ) -> Self {
        let arbiter = CameraArbiter::new(config.lease_wait);
        let (settings_tx, _) = watch::channel(config.settings.clone());
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        let (stream_addr_tx, _) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(16);
        Self {
            config,
            camera,
            sensor,
            arbiter,
            queue,
            cancel,
            settings_tx,
            status_tx,
            stream_addr_tx,
            events_tx,
            events_rx,
            stream: ManagedWorker::new(WorkerKind::Stream),
            motion: ManagedWorker::new(WorkerKind::Motion),
            state: ControlState::default(),
        }
    }

    pub fn status_watch(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Live capture settings, re-read by workers on each use.
    pub fn settings_watch(&self) -> watch::Receiver<CaptureSettings> {
        self.settings_tx.subscribe()
    }

    /// Bound address of the stream server while it is up.
    pub fn stream_addr_watch(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.stream_addr_tx.subscribe()
    }

    pub fn arbiter(&self) -> Arc<CameraArbiter> {
        Arc::clone(&self.arbiter)
    }

    /// Supervision loop. Consumes control snapshots from the watcher until
    /// cancelled; workers are torn down before returning.
    pub async fn run(mut self, mut control_rx: mpsc::Receiver<ControlState>) -> Result<()> {
        let mut holder_rx = self.arbiter.holder_watch();
        info!("supervisor started");
        loop {
            self.publish_status();
            let deadline = self.next_deadline();
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return Ok(());
                }
                snapshot = control_rx.recv() => match snapshot {
                    Some(s) => self.on_control(s),
                    None => {
                        warn!("control watcher ended, shutting down");
                        self.cancel.cancel();
                        continue;
                    }
                },
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.on_event(event);
                    }
                }
                // A lease release may unblock a deferred start
                _ = holder_rx.changed() => {}
                () = async { tokio::time::sleep_until(deadline.expect("guarded")).await },
                    if deadline.is_some() => self.on_deadline(),
            }
            self.reconcile().await;
        }
    }

    fn on_control(&mut self, snapshot: ControlState) {
        if snapshot.client_attached != self.state.client_attached {
            // Tracked for the dashboard collaborator; drives no worker here
            info!(attached = snapshot.client_attached, "viewer presence changed");
        }
        self.settings_tx.send_if_modified(|cur| {
            if *cur == snapshot.settings {
                false
            } else {
                *cur = snapshot.settings.clone();
                true
            }
        });
        self.state = snapshot;
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { kind, addr } => self.on_ready(kind, addr),
            WorkerEvent::Exited { kind, result } => self.on_exited(kind, result),
        }
    }

    fn on_ready(&mut self, kind: WorkerKind, addr: Option<SocketAddr>) {
        if let Some(addr) = addr {
            self.stream_addr_tx.send_replace(Some(addr));
        }
        let worker = self.worker_mut(kind);
        if worker.state == WorkerState::Starting {
            info!(%kind, "worker running");
            worker.state = WorkerState::Running;
            worker.start_failures = 0;
            // Earn a backoff reset by staying up
            worker.deadline = Some(Instant::now() + backoff::HEALTHY_AFTER);
        }
    }

    fn on_exited(&mut self, kind: WorkerKind, result: Result<()>) {
        if kind == WorkerKind::Stream {
            self.stream_addr_tx.send_replace(None);
        }
        let worker = self.worker_mut(kind);
        worker.stop = None;
        match (worker.state, result) {
            // Failure already accounted (startup timeout) or terminal
            (WorkerState::CrashedBackoff | WorkerState::Fatal, _) => {}
            (WorkerState::Stopping, _) | (_, Ok(())) => {
                debug!(%kind, "worker stopped");
                worker.state = WorkerState::Stopped;
                worker.deadline = None;
            }
            (WorkerState::Starting, Err(e)) => {
                worker.restarts += 1;
                worker.start_failures += 1;
                if worker.start_failures >= FATAL_START_FAILURES {
                    error!(%kind, error = %e, "worker failed to start repeatedly, giving up");
                    worker.state = WorkerState::Fatal;
                    worker.deadline = None;
                } else {
                    let delay = worker.backoff.next_delay();
                    warn!(%kind, error = %e, ?delay, "worker failed during startup");
                    worker.state = WorkerState::CrashedBackoff;
                    worker.deadline = Some(Instant::now() + delay);
                }
            }
            (_, Err(e)) => {
                worker.restarts += 1;
                let delay = worker.backoff.next_delay();
                warn!(%kind, error = %e, ?delay, "worker crashed, restart pending");
                worker.state = WorkerState::CrashedBackoff;
                worker.deadline = Some(Instant::now() + delay);
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        for kind in [WorkerKind::Stream, WorkerKind::Motion] {
            let worker = self.worker_mut(kind);
            let due = worker.deadline.is_some_and(|d| d <= now);
            if !due {
                continue;
            }
            match worker.state {
                WorkerState::Starting => {
                    worker.restarts += 1;
                    worker.start_failures += 1;
                    if let Some(stop) = worker.stop.take() {
                        stop.cancel();
                    }
                    if worker.start_failures >= FATAL_START_FAILURES {
                        error!(%kind, "worker repeatedly missed startup timeout, giving up");
                        worker.state = WorkerState::Fatal;
                        worker.deadline = None;
                    } else {
                        let delay = worker.backoff.next_delay();
                        warn!(%kind, ?delay, "worker did not become ready in time");
                        worker.state = WorkerState::CrashedBackoff;
                        worker.deadline = Some(now + delay);
                    }
                }
                WorkerState::CrashedBackoff => {
                    worker.state = WorkerState::Stopped;
                    worker.deadline = None;
                }
                WorkerState::Running => {
                    debug!(%kind, "worker healthy, backoff ladder and restart count reset");
                    worker.backoff.reset();
                    worker.restarts = 0;
                    worker.start_failures = 0;
                    worker.deadline = None;
                }
                _ => worker.deadline = None,
            }
        }
    }

    async fn reconcile(&mut self) {
        let desired_stream = self.state.streaming_enabled;
        // Streaming outranks motion capture outright
        let desired_motion = self.state.motion_capture_enabled && !self.state.streaming_enabled;

        // Stops first, so leases free up before any start
        self.stop_if_undesired(WorkerKind::Motion, desired_motion);
        self.stop_if_undesired(WorkerKind::Stream, desired_stream);

        if desired_stream && self.stream.state == WorkerState::Stopped {
            self.try_start(WorkerKind::Stream).await;
        }
        if desired_motion && self.motion.state == WorkerState::Stopped {
            self.try_start(WorkerKind::Motion).await;
        }
    }

    fn stop_if_undesired(&mut self, kind: WorkerKind, desired: bool) {
        if desired {
            return;
        }
        let worker = self.worker_mut(kind);
        match worker.state {
            WorkerState::Starting | WorkerState::Running => {
                info!(%kind, "stopping worker");
                if let Some(stop) = &worker.stop {
                    stop.cancel();
                }
                worker.state = WorkerState::Stopping;
                worker.deadline = None;
            }
            // Flag cycling clears crash history, including fatal
            WorkerState::CrashedBackoff | WorkerState::Fatal => {
                worker.state = WorkerState::Stopped;
                worker.deadline = None;
                worker.backoff.reset();
                worker.start_failures = 0;
            }
            _ => {}
        }
    }

    async fn try_start(&mut self, kind: WorkerKind) {
        let lease = match self.arbiter.acquire(kind).await {
            AcquireOutcome::Granted(lease) => lease,
            AcquireOutcome::Denied => {
                debug!(%kind, "camera lease unavailable, start deferred");
                return;
            }
        };

        let stop = self.cancel.child_token();
        let events = self.events_tx.clone();
        match kind {
            WorkerKind::Stream => {
                let (ready_tx, ready_rx) = oneshot::channel();
                let worker = StreamWorker {
                    camera: Arc::clone(&self.camera),
                    queue: self.queue.clone(),
                    settings: self.settings_tx.subscribe(),
                    bind_addr: self.config.bind_addr,
                    idle_timeout: self.config.client_idle_timeout,
                    lease,
                    cancel: stop.clone(),
                    ready: ready_tx,
                };
                let ready_events = events.clone();
                tokio::spawn(async move {
                    if let Ok(addr) = ready_rx.await {
                        let _ = ready_events
                            .send(WorkerEvent::Ready {
                                kind,
                                addr: Some(addr),
                            })
                            .await;
                    }
                });
                tokio::spawn(async move {
                    let result = worker.run().await;
                    let _ = events.send(WorkerEvent::Exited { kind, result }).await;
                });
            }
            WorkerKind::Motion => {
                let (ready_tx, ready_rx) = oneshot::channel();
                let worker = MotionWorker {
                    camera: Arc::clone(&self.camera),
                    sensor: Arc::clone(&self.sensor),
                    queue: self.queue.clone(),
                    settings: self.settings_tx.subscribe(),
                    lease,
                    cancel: stop.clone(),
                    ready: ready_tx,
                };
                let ready_events = events.clone();
                tokio::spawn(async move {
                    if ready_rx.await.is_ok() {
                        let _ = ready_events
                            .send(WorkerEvent::Ready { kind, addr: None })
                            .await;
                    }
                });
                tokio::spawn(async move {
                    let result = worker.run().await;
                    let _ = events.send(WorkerEvent::Exited { kind, result }).await;
                });
            }
        }

        let startup = self.config.startup_timeout;
        let worker = self.worker_mut(kind);
        info!(%kind, "starting worker");
        worker.stop = Some(stop);
        worker.state = WorkerState::Starting;
        worker.deadline = Some(Instant::now() + startup);
    }

    async fn shutdown(&mut self) {
        info!("supervisor shutting down");
        for worker in [&mut self.stream, &mut self.motion] {
            if let Some(stop) = &worker.stop {
                stop.cancel();
            }
        }
        let grace = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(grace);
        while self.live_workers() > 0 {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(WorkerEvent::Exited { kind, result }) => self.on_exited(kind, result),
                    Some(WorkerEvent::Ready { .. }) => {}
                    None => break,
                },
                () = &mut grace => {
                    warn!("workers did not stop within grace window");
                    break;
                }
            }
        }
        self.publish_status();
    }

    fn live_workers(&self) -> usize {
        [&self.stream, &self.motion]
            .iter()
            .filter(|w| {
                matches!(
                    w.state,
                    WorkerState::Starting | WorkerState::Running | WorkerState::Stopping
                )
            })
            .count()
    }

    fn worker_mut(&mut self, kind: WorkerKind) -> &mut ManagedWorker {
        match kind {
            WorkerKind::Stream => &mut self.stream,
            WorkerKind::Motion => &mut self.motion,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.stream.deadline, self.motion.deadline]
            .into_iter()
            .flatten()
            .min()
    }

    fn publish_status(&self) {
        let status = SupervisorStatus {
            stream: self.stream.state,
            motion: self.motion.state,
            stream_restarts: self.stream.restarts,
            motion_restarts: self.motion.restarts,
        };
        self.status_tx.send_if_modified(|cur| {
            if *cur == status {
                false
            } else {
                *cur = status;
                true
            }
        });
    }
}
