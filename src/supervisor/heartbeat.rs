//! Liveness heartbeat
//!
//! Publishes the device status document on a fixed interval, independent of
//! worker health. A device with a fatal worker still heartbeats; the restart
//! counters in the document are how the far side notices trouble.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SupervisorStatus;
use crate::control::{ControlPlane, Heartbeat};

pub struct HeartbeatTask {
    pub plane: Arc<dyn ControlPlane>,
    pub interval: Duration,
    /// Port the stream server binds, advertised alongside the local IP
    pub port: u16,
    pub status: watch::Receiver<SupervisorStatus>,
    pub cancel: CancellationToken,
}

impl HeartbeatTask {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let address = match local_ip() {
                Some(ip) => format!("{}:{}", ip, self.port),
                None => "unknown".to_string(),
            };
            let restarts = self.status.borrow_and_update().restart_counts();
            let heartbeat = Heartbeat::online(address, restarts);
            // Publish failures are expected during connectivity gaps
            match self.plane.publish_heartbeat(&heartbeat).await {
                Ok(()) => debug!(address = %heartbeat.address, "heartbeat published"),
                Err(e) => warn!(error = %e, "heartbeat publish failed"),
            }
        }
    }
}

/// Local address discovery via a UDP connect probe. Nothing is sent; the
/// kernel just picks the interface it would route through.
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}
