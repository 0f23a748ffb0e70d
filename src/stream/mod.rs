//! Live view stream server
//!
//! Serves the low-res JPEG stream to a single TCP client and handles the
//! in-band snapshot command. The camera pipeline is opened for the worker's
//! whole lifetime; clients come and go without restarting the encoder.

pub mod buffer;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactKind, CaptureArtifact, UploadQueue};
use crate::camera::arbiter::CameraLease;
use crate::camera::{Camera, FrameStream};
use crate::config::CaptureSettings;

pub use buffer::{BufferStats, FrameBuffer};

/// Writer cadence cap (~20 Hz); the camera produces at most 10 fps so this
/// only matters when a backlog is draining.
const WRITE_INTERVAL: Duration = Duration::from_millis(50);

/// Outbound frames held for a slow client before drop-oldest kicks in
const FRAME_BUFFER_CAP: usize = 32;

enum ClientEnd {
    /// Client gone; go back to accepting
    Disconnected,
    /// Worker-level stop (cancellation or lease revocation)
    Stopped,
}

pub struct StreamWorker {
    pub camera: Arc<dyn Camera>,
    pub queue: UploadQueue,
    pub settings: watch::Receiver<CaptureSettings>,
    pub bind_addr: SocketAddr,
    /// Close a client that cannot take a frame within this window
    pub idle_timeout: Duration,
    pub lease: CameraLease,
    pub cancel: CancellationToken,
    /// Fires with the bound address once the listener and pipeline are up
    pub ready: oneshot::Sender<SocketAddr>,
}

impl StreamWorker {
    /// Worker entry point. `Ok` on an ordered stop; `Err` is a crash the
    /// supervisor restarts (bind failure, camera failure, pipeline end).
    pub async fn run(self) -> Result<()> {
        let StreamWorker {
            camera,
            queue,
            settings,
            bind_addr,
            idle_timeout,
            lease,
            cancel,
            ready,
        } = self;

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("binding stream listener on {bind_addr}"))?;
        let local = listener.local_addr().context("listener local addr")?;

        let open_settings = settings.borrow().clone();
        let mut frames = camera
            .open_stream(&open_settings)
            .await
            .context("opening camera pipeline")?;

        let _ = ready.send(local);
        info!(addr = %local, fps = open_settings.stream_fps, "stream server listening");
        let revoked = lease.revoked().clone();

        let server = StreamServer {
            camera,
            queue,
            settings,
            idle_timeout,
            cancel,
        };

        loop {
            // Idle: no client. Keep draining the pipeline so it never stalls.
            let socket = tokio::select! {
                () = server.cancel.cancelled() => return Ok(()),
                () = revoked.cancelled() => {
                    info!("stream lease revoked, stopping");
                    return Ok(());
                }
                frame = frames.recv() => {
                    anyhow::ensure!(frame.is_some(), "camera pipeline ended");
                    continue;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.context("accepting stream client")?;
                    info!(%peer, "stream client connected");
                    socket
                }
            };

            match server.serve_client(socket, &listener, &mut frames, &revoked).await? {
                ClientEnd::Disconnected => continue,
                ClientEnd::Stopped => return Ok(()),
            }
        }
    }
}

/// Server state that persists across client sessions, split off from
/// [`StreamWorker`] once the one-shot startup fields are consumed.
struct StreamServer {
    camera: Arc<dyn Camera>,
    queue: UploadQueue,
    settings: watch::Receiver<CaptureSettings>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl StreamServer {
    async fn serve_client(
        &self,
        socket: TcpStream,
        listener: &TcpListener,
        frames: &mut FrameStream,
        revoked: &CancellationToken,
    ) -> Result<ClientEnd> {
        let (read_half, mut write_half) = socket.into_split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let reader = tokio::spawn(read_commands(read_half, cmd_tx));

        let mut buffer = FrameBuffer::new(FRAME_BUFFER_CAP);
        let mut ticker = tokio::time::interval(WRITE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ok(ClientEnd::Stopped),
                () = revoked.cancelled() => {
                    info!("stream lease revoked, dropping client");
                    break Ok(ClientEnd::Stopped);
                }
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        buffer.push(frame);
                    }
                    None => break Err(anyhow::anyhow!("camera pipeline ended")),
                },
                command = cmd_rx.recv() => match command {
                    Some(()) => {
                        if !self.handle_snapshot(&mut write_half).await {
                            break Ok(ClientEnd::Disconnected);
                        }
                    }
                    // Reader ended: disconnect or protocol violation
                    None => break Ok(ClientEnd::Disconnected),
                },
                _ = ticker.tick(), if !buffer.is_empty() => {
                    let frame = buffer.pop().expect("guarded nonempty");
                    let write = protocol::write_packet(&mut write_half, &frame);
                    match tokio::time::timeout(self.idle_timeout, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "client write failed");
                            break Ok(ClientEnd::Disconnected);
                        }
                        Err(_) => {
                            warn!("client stalled past idle timeout, closing");
                            break Ok(ClientEnd::Disconnected);
                        }
                    }
                }
                // One client at a time; refuse latecomers by closing
                extra = listener.accept() => {
                    if let Ok((extra_socket, peer)) = extra {
                        debug!(%peer, "refusing second stream client");
                        drop(extra_socket);
                    }
                }
            }
        };

        reader.abort();
        let stats = buffer.stats();
        info!(
            received = stats.frames_received,
            dropped = stats.frames_dropped,
            "stream client session ended"
        );
        end
    }

    /// Out-of-band high-res capture. Returns false when the ack could not be
    /// delivered (client gone).
    async fn handle_snapshot(&self, write_half: &mut OwnedWriteHalf) -> bool {
        info!("snapshot requested");
        let settings = self.settings.borrow().clone();
        let ack = match snapshot(&*self.camera, &self.queue, &settings).await {
            Ok(artifact) => {
                info!(path = %artifact.local_path.display(), "snapshot queued");
                protocol::ACK_SUCCESS
            }
            Err(e) => {
                error!(error = %e, "snapshot failed");
                protocol::ACK_FAILURE
            }
        };
        protocol::write_packet(write_half, &[ack]).await.is_ok()
    }
}

async fn snapshot(
    camera: &dyn Camera,
    queue: &UploadQueue,
    settings: &CaptureSettings,
) -> Result<CaptureArtifact> {
    let res = settings.snapshot_resolution;
    let data = camera.capture_still(settings, res).await?;
    queue.enqueue(&data, ArtifactKind::ManualSnapshot, res).await
}

async fn read_commands(mut read_half: OwnedReadHalf, commands: mpsc::Sender<()>) {
    loop {
        match protocol::read_command(&mut read_half).await {
            Ok(Some(protocol::CMD_SNAPSHOT)) => {
                if commands.send(()).await.is_err() {
                    return;
                }
            }
            Ok(Some(other)) => {
                warn!(command = ?other, "unknown command, closing client");
                return;
            }
            Ok(None) => {
                debug!("stream client disconnected");
                return;
            }
            Err(e) => {
                debug!(error = %e, "command read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::arbiter::{AcquireOutcome, CameraArbiter, WorkerKind};
    use crate::camera::TestCamera;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        camera: Arc<TestCamera>,
        queue: UploadQueue,
        arbiter: Arc<CameraArbiter>,
        cancel: CancellationToken,
        addr: SocketAddr,
        task: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    async fn start(camera: Arc<TestCamera>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = UploadQueue::open(dir.path()).unwrap();
        let arbiter = CameraArbiter::new(Duration::from_secs(10));
        let lease = match arbiter.acquire(WorkerKind::Stream).await {
            AcquireOutcome::Granted(l) => l,
            AcquireOutcome::Denied => panic!("lease denied in test"),
        };
        let cancel = CancellationToken::new();
        let (settings_tx, _) = watch::channel(CaptureSettings::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = StreamWorker {
            camera: camera.clone(),
            queue: queue.clone(),
            settings: settings_tx.subscribe(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            idle_timeout: Duration::from_secs(30),
            lease,
            cancel: cancel.clone(),
            ready: ready_tx,
        };
        let task = tokio::spawn(worker.run());
        let addr = tokio::time::timeout(WAIT, ready_rx).await.unwrap().unwrap();
        Harness {
            camera,
            queue,
            arbiter,
            cancel,
            addr,
            task,
            _dir: dir,
        }
    }

    async fn read_frame(socket: &mut TcpStream) -> bytes::Bytes {
        tokio::time::timeout(WAIT, protocol::read_packet(socket))
            .await
            .expect("frame within deadline")
            .expect("valid packet")
    }

    #[tokio::test]
    async fn client_receives_framed_jpegs() {
        let h = start(Arc::new(TestCamera::new())).await;
        let mut client = TcpStream::connect(h.addr).await.unwrap();

        for _ in 0..3 {
            let frame = read_frame(&mut client).await;
            assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        }

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(h.arbiter.current_holder(), None);
    }

    #[tokio::test]
    async fn snapshot_command_acks_and_enqueues() {
        let h = start(Arc::new(TestCamera::new())).await;
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut client).await;

        client.write_all(&protocol::CMD_SNAPSHOT).await.unwrap();

        // The ack is in-band among frame packets
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no ack received");
            let packet = read_frame(&mut client).await;
            if packet.len() == 1 {
                assert_eq!(packet[0], protocol::ACK_SUCCESS);
                break;
            }
        }

        assert_eq!(h.camera.stills_taken(), 1);
        let pending = h.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ArtifactKind::ManualSnapshot);

        // Stream continues after the snapshot
        let frame = read_frame(&mut client).await;
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_client_is_refused() {
        let h = start(Arc::new(TestCamera::new())).await;
        let mut first = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut first).await;

        let mut second = TcpStream::connect(h.addr).await.unwrap();
        let refused = tokio::time::timeout(WAIT, protocol::read_packet(&mut second)).await;
        assert!(refused.expect("refusal within deadline").is_err());

        // First client is undisturbed
        read_frame(&mut first).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_command_closes_the_connection() {
        let h = start(Arc::new(TestCamera::new())).await;
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut client).await;

        client.write_all(&[0xFF, 0xFF]).await.unwrap();

        // Server closes; reads run out within the deadline
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            assert!(tokio::time::Instant::now() < deadline, "connection stayed open");
            match tokio::time::timeout(WAIT, protocol::read_packet(&mut client)).await {
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }

        // A new client can connect after the violation
        let mut next = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut next).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pipeline_end_is_a_crash() {
        let camera = Arc::new(TestCamera::new());
        camera.end_streams_after(2);
        let h = start(camera).await;

        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(result.is_err());
        // Lease released on the error path
        assert_eq!(h.arbiter.current_holder(), None);
    }

    #[tokio::test]
    async fn disconnect_returns_to_accepting() {
        let h = start(Arc::new(TestCamera::new())).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut client).await;
        drop(client);

        let mut next = TcpStream::connect(h.addr).await.unwrap();
        read_frame(&mut next).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }
}
