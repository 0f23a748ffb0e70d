//! End-to-end orchestration: in-memory control plane, test camera, real
//! TCP clients against the stream server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use perchcam::camera::TestCamera;
use perchcam::control::{ControlState, FlagUpdate, MemoryControlPlane};
use perchcam::motion::{ChannelMotionSensor, MotionEdge};
use perchcam::stream::protocol;
use perchcam::supervisor::SupervisorStatus;
use perchcam::{
    ArtifactKind, CaptureSettings, Config, ControlPlane, HeartbeatTask, Supervisor, UploadQueue,
    Watcher, WorkerState,
};

const WAIT: Duration = Duration::from_secs(10);

struct Device {
    plane: Arc<MemoryControlPlane>,
    camera: Arc<TestCamera>,
    sensor: Arc<ChannelMotionSensor>,
    queue: UploadQueue,
    status: watch::Receiver<SupervisorStatus>,
    addr: watch::Receiver<Option<SocketAddr>>,
    cancel: CancellationToken,
    supervisor: JoinHandle<Result<()>>,
    _dir: tempfile::TempDir,
}

impl Device {
    async fn boot() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            queue_dir: dir.path().to_path_buf(),
            heartbeat_interval: Duration::from_millis(500),
            settings: CaptureSettings {
                // Short debounce so sustained motion fits a test
                motion_threshold_secs: 0.3,
                ..Default::default()
            },
            ..Default::default()
        };

        let plane = Arc::new(MemoryControlPlane::new());
        let camera = Arc::new(TestCamera::new());
        let sensor = Arc::new(ChannelMotionSensor::new());
        let queue = UploadQueue::open(dir.path()).unwrap();
        let cancel = CancellationToken::new();

        let supervisor = Supervisor::new(
            config.clone(),
            camera.clone(),
            sensor.clone(),
            queue.clone(),
            cancel.clone(),
        );
        let status = supervisor.status_watch();
        let addr = supervisor.stream_addr_watch();

        let (_watcher, control_rx) = Watcher::spawn(
            Arc::clone(&plane) as Arc<dyn ControlPlane>,
            ControlState::default(),
            cancel.clone(),
        );
        tokio::spawn(
            HeartbeatTask {
                plane: Arc::clone(&plane) as Arc<dyn ControlPlane>,
                interval: config.heartbeat_interval,
                port: config.bind_addr.port(),
                status: status.clone(),
                cancel: cancel.clone(),
            }
            .run(),
        );
        let supervisor = tokio::spawn(supervisor.run(control_rx));

        // Let the watcher's subscription land before flags are published
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            plane,
            camera,
            sensor,
            queue,
            status,
            addr,
            cancel,
            supervisor,
            _dir: dir,
        }
    }

    async fn wait_stream(&mut self, state: WorkerState) {
        timeout(WAIT, self.status.wait_for(|s| s.stream == state))
            .await
            .expect("stream state within deadline")
            .unwrap();
    }

    async fn wait_motion(&mut self, state: WorkerState) {
        timeout(WAIT, self.status.wait_for(|s| s.motion == state))
            .await
            .expect("motion state within deadline")
            .unwrap();
    }

    async fn connect(&mut self) -> TcpStream {
        let addr = timeout(WAIT, self.addr.wait_for(|a| a.is_some()))
            .await
            .expect("stream address within deadline")
            .unwrap()
            .unwrap();
        TcpStream::connect(addr).await.unwrap()
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        timeout(WAIT, self.supervisor)
            .await
            .expect("shutdown within deadline")
            .unwrap()
            .unwrap();
    }
}

async fn read_frame(socket: &mut TcpStream) -> bytes::Bytes {
    timeout(WAIT, protocol::read_packet(socket))
        .await
        .expect("packet within deadline")
        .expect("valid packet")
}

#[tokio::test]
async fn remote_flag_drives_live_view_and_snapshot() {
    let mut device = Device::boot().await;

    device.plane.set(FlagUpdate::StreamingEnabled(true));
    device.wait_stream(WorkerState::Running).await;

    let mut client = device.connect().await;
    let frame = read_frame(&mut client).await;
    assert_eq!(&frame[..2], &[0xFF, 0xD8], "JPEG SOI marker");

    // In-band snapshot command; ack arrives among frame packets
    client.write_all(&protocol::CMD_SNAPSHOT).await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no snapshot ack");
        let packet = read_frame(&mut client).await;
        if packet.len() == 1 {
            assert_eq!(packet[0], protocol::ACK_SUCCESS);
            break;
        }
    }
    let pending = device.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ArtifactKind::ManualSnapshot);

    device.plane.set(FlagUpdate::StreamingEnabled(false));
    device.wait_stream(WorkerState::Stopped).await;

    device.shutdown().await;
}

#[tokio::test]
async fn motion_captures_and_stream_takes_over() {
    let mut device = Device::boot().await;

    device.plane.set(FlagUpdate::MotionCaptureEnabled(true));
    device.wait_motion(WorkerState::Running).await;

    // Sustained pulse past the 0.3s debounce
    device.sensor.emit(MotionEdge::Active);
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let pending = device.queue.pending().unwrap();
        if pending.iter().any(|a| a.kind == ArtifactKind::MotionPhoto) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no motion capture");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    device.sensor.emit(MotionEdge::Inactive);

    // Live view preempts the motion worker outright
    device.plane.set(FlagUpdate::StreamingEnabled(true));
    device.wait_stream(WorkerState::Running).await;
    assert_eq!(device.status.borrow().motion, WorkerState::Stopped);
    let mut client = device.connect().await;
    read_frame(&mut client).await;

    // And motion resumes once streaming is done
    device.plane.set(FlagUpdate::StreamingEnabled(false));
    device.wait_motion(WorkerState::Running).await;
    assert_eq!(device.status.borrow().stream, WorkerState::Stopped);

    device.shutdown().await;
}

#[tokio::test]
async fn crashed_stream_worker_restarts_with_backoff() {
    let mut device = Device::boot().await;
    device.camera.end_streams_after(3);

    device.plane.set(FlagUpdate::StreamingEnabled(true));
    device.wait_stream(WorkerState::Running).await;

    // Pipeline dies after 3 frames; supervisor backs off then restarts
    device.wait_stream(WorkerState::CrashedBackoff).await;
    device.camera.end_streams_after(0);
    device.wait_stream(WorkerState::Running).await;

    assert!(device.status.borrow().stream_restarts >= 1);
    assert!(device.camera.streams_opened() >= 2);

    device.shutdown().await;
}

#[tokio::test]
async fn heartbeat_reports_online_with_restart_counters() {
    let mut device = Device::boot().await;

    let deadline = tokio::time::Instant::now() + WAIT;
    let heartbeat = loop {
        if let Some(hb) = device.plane.last_heartbeat() {
            break hb;
        }
        assert!(tokio::time::Instant::now() < deadline, "no heartbeat");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(heartbeat.status, "online");
    assert!(heartbeat.restarts.contains_key("stream"));
    assert!(heartbeat.restarts.contains_key("motion"));

    // Heartbeat keeps flowing regardless of worker activity
    device.plane.set(FlagUpdate::StreamingEnabled(true));
    device.wait_stream(WorkerState::Running).await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    let later = device.plane.last_heartbeat().unwrap();
    assert!(later.last_seen_at >= heartbeat.last_seen_at);

    device.shutdown().await;
}
