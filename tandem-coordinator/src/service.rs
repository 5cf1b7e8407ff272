//! Coordinator service core logic.
//!
//! Owns the device TCP listener and the periodic workers (clock probe
//! rounds, heartbeat sweeps) around the coordination core. Each
//! accepted connection runs its own read loop: the first
//! `device_status` message is the registration handshake, everything
//! after it is routed to the coordinator.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tandem_core::{Connection, Coordinator, Decoded, Payload};

use crate::config::CoordinatorConfig;

// ── CoordinatorService ───────────────────────────────────────────

/// The top-level coordinator service.
pub struct CoordinatorService {
    config: CoordinatorConfig,
    coordinator: Coordinator,
    shutdown: CancellationToken,
}

impl CoordinatorService {
    pub fn new(config: CoordinatorConfig) -> Self {
        let coordinator = Coordinator::new(config.to_core_config());
        Self {
            config,
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }

    /// The shared coordination core, for control surfaces built on
    /// top of this service.
    pub fn coordinator(&self) -> Coordinator {
        self.coordinator.clone()
    }

    /// Handle that stops the service from another task or a signal
    /// handler.
    pub fn stop_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the service until stopped.
    ///
    /// 1. Binds the device TCP listener.
    /// 2. Starts the clock-probe and heartbeat-sweep workers.
    /// 3. Accepts device connections, one read loop each.
    /// 4. Shuts down cleanly when the stop handle fires.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.network.listen_host, self.config.network.listen_port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("coordinator listening on {addr}");

        self.spawn_workers();

        loop {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            info!("device connected from {peer}");

            let coordinator = self.coordinator.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = serve_device(coordinator, stream) => {}
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        info!("coordinator stopped");
        Ok(())
    }

    fn spawn_workers(&self) {
        let core = self.coordinator.config();
        let probe_interval = core.clock_probe_interval();
        let sweep_interval = core.heartbeat_interval();

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.clock_probe_tick().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.heartbeat_tick().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

// ── Per-device read loop ─────────────────────────────────────────

/// Drive one device connection: registration handshake, then routing.
async fn serve_device(coordinator: Coordinator, stream: TcpStream) {
    let mut conn = Connection::new(stream);

    // Handshake: the first well-formed `device_status` names the
    // device and declares its capabilities.
    let device_id = loop {
        match conn.recv().await {
            Some(Decoded::Known(msg)) => {
                if let Payload::DeviceStatus {
                    device_id,
                    capabilities,
                    ..
                } = msg.payload
                {
                    coordinator
                        .register_device(
                            &device_id,
                            capabilities.unwrap_or_default(),
                            conn.sender(),
                        )
                        .await;
                    info!(device = %device_id, "device registered");
                    break device_id;
                }
                warn!(kind = msg.payload.kind(), "message before registration ignored");
            }
            Some(Decoded::Unknown { kind, .. }) => {
                warn!(kind, "unknown message before registration ignored");
            }
            Some(Decoded::Malformed(err)) => {
                warn!(error = %err, "malformed frame before registration");
            }
            None => return,
        }
    };

    while let Some(item) = conn.recv().await {
        coordinator.handle_message(&device_id, item).await;
    }
    coordinator.device_disconnected(&device_id).await;
}
