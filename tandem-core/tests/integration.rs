//! Integration tests — device registration, the full session
//! lifecycle, and fault scenarios over real TCP connections on
//! localhost.

use std::time::Duration;

use tandem_core::{
    Capability, Connection, ConnectionInfo, Coordinator, CoreConfig, Decoded, MemberState,
    Message, Payload, SessionPhase,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ── Helpers ──────────────────────────────────────────────────────

fn fast_config() -> CoreConfig {
    CoreConfig {
        ack_timeout_ms: 500,
        start_guard_ms: 100,
        start_grace_ms: 500,
        finalize_timeout_ms: 2_000,
        heartbeat_interval_ms: 100,
        heartbeat_miss_limit: 3,
        ..CoreConfig::default()
    }
}

/// Spin up the coordinator's accept loop on an OS-assigned port and
/// return the endpoint devices should dial.
async fn spawn_coordinator(coordinator: Coordinator) -> ConnectionInfo {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_device(coordinator.clone(), stream));
        }
    });
    info
}

/// Per-connection loop: handshake on the first `device_status`, then
/// route everything else. Mirrors the service binary.
async fn serve_device(coordinator: Coordinator, stream: TcpStream) {
    let mut conn = Connection::new(stream);

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
                    break device_id;
                }
            }
            Some(_) => continue,
            None => return,
        }
    };

    while let Some(item) = conn.recv().await {
        coordinator.handle_message(&device_id, item).await;
    }
    coordinator.device_disconnected(&device_id).await;
}

/// How a simulated device behaves.
#[derive(Clone, Copy)]
struct DeviceBehavior {
    /// Acknowledge commands that expect an ack.
    acks: bool,
    /// Deliver a file record and a final "done" status after stop.
    finalizes: bool,
}

const COOPERATIVE: DeviceBehavior = DeviceBehavior {
    acks: true,
    finalizes: true,
};

const SILENT: DeviceBehavior = DeviceBehavior {
    acks: false,
    finalizes: false,
};

/// Connect a simulated device, register it, and run its command loop
/// until the shutdown channel fires or the coordinator hangs up.
async fn run_device(
    info: ConnectionInfo,
    device_id: &str,
    behavior: DeviceBehavior,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut conn = Connection::connect(&info).await.unwrap();
    conn.send(Message::now(Payload::DeviceStatus {
        device_id: device_id.to_string(),
        status: "ready".into(),
        capabilities: Some(vec![Capability::RgbVideo]),
    }))
    .await
    .unwrap();

    loop {
        let item = tokio::select! {
            _ = shutdown.recv() => return,
            item = conn.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let Decoded::Known(msg) = item else { continue };

        if behavior.acks && msg.payload.expects_ack() {
            let message_id = msg.correlation_id().unwrap();
            conn.send(Message::now(Payload::Ack {
                message_id,
                success: true,
                error: None,
            }))
            .await
            .unwrap();
        }

        match msg.payload {
            Payload::SyncProbe { probe_id } => {
                conn.send(Message::now(Payload::SyncResponse {
                    probe_id,
                    device_time: chrono::Utc::now().timestamp_millis(),
                }))
                .await
                .unwrap();
            }
            Payload::StopRecord { .. } if behavior.finalizes => {
                conn.send(Message::now(Payload::FileChunk {
                    file_id: format!("{device_id}_rgb"),
                    chunk_index: 0,
                    total_chunks: 1,
                    chunk_data: "AA==".into(),
                    chunk_size: 1,
                    file_type: "rgb_video".into(),
                }))
                .await
                .unwrap();
                conn.send(Message::now(Payload::DeviceStatus {
                    device_id: device_id.to_string(),
                    status: "done".into(),
                    capabilities: None,
                }))
                .await
                .unwrap();
            }
            _ => {}
        }
    }
}

fn spawn_device(
    info: &ConnectionInfo,
    device_id: &str,
    behavior: DeviceBehavior,
) -> mpsc::Sender<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let info = info.clone();
    let id = device_id.to_string();
    tokio::spawn(async move { run_device(info, &id, behavior, shutdown_rx).await });
    shutdown_tx
}

/// Poll until the registry knows `count` devices (registration is
/// asynchronous relative to the device's connect).
async fn wait_for_devices(coordinator: &Coordinator, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if coordinator.devices().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("devices never registered");
}

// ── Full lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_two_devices_record_to_completion() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    let _a = spawn_device(&info, "phone_1", COOPERATIVE);
    let _b = spawn_device(&info, "phone_2", COOPERATIVE);
    wait_for_devices(&coordinator, 2).await;

    // Give every device a confirmed offset first.
    coordinator.clock_probe_tick().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session_id = coordinator.create_session("pilot", None).await.unwrap();
    assert!(session_id.starts_with("pilot_"));

    coordinator.arm_all().await.unwrap();
    coordinator.start_all().await.unwrap();
    assert_eq!(coordinator.session_phase().await, SessionPhase::Recording);

    let phase = coordinator.stop_all().await.unwrap();
    assert_eq!(phase, SessionPhase::Completed);

    let report = coordinator.session_report().await.unwrap();
    for id in ["phone_1", "phone_2"] {
        let member = report.member(id).unwrap();
        assert_eq!(member.state, MemberState::Active);
        assert!(member.finalized);
        assert_eq!(member.files.len(), 1);
        assert!(!member.sync_unconfirmed, "{id} should have a confirmed offset");
    }
}

// ── Partial participation ────────────────────────────────────────

#[tokio::test]
async fn test_silent_device_dropped_without_blocking_others() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    let _a = spawn_device(&info, "phone_1", COOPERATIVE);
    let _b = spawn_device(&info, "phone_2", SILENT);
    wait_for_devices(&coordinator, 2).await;

    coordinator.create_session("pilot", None).await.unwrap();
    coordinator.arm_all().await.unwrap();

    let report = coordinator.session_report().await.unwrap();
    assert_eq!(report.phase(), SessionPhase::Armed);
    assert_eq!(report.member("phone_1").unwrap().state, MemberState::Active);
    assert_eq!(
        report.member("phone_2").unwrap().state,
        MemberState::NotStarted
    );

    // The session runs to completion on the remaining device.
    coordinator.start_all().await.unwrap();
    let phase = coordinator.stop_all().await.unwrap();
    assert_eq!(phase, SessionPhase::Completed);
}

// ── Disconnect mid-session ───────────────────────────────────────

#[tokio::test]
async fn test_disconnect_during_recording_demotes_member() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    let _a = spawn_device(&info, "phone_1", COOPERATIVE);
    let b = spawn_device(&info, "phone_2", COOPERATIVE);
    wait_for_devices(&coordinator, 2).await;

    coordinator.create_session("pilot", None).await.unwrap();
    coordinator.arm_all().await.unwrap();
    coordinator.start_all().await.unwrap();

    // phone_2 drops its connection mid-recording.
    b.send(()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = coordinator.session_report().await.unwrap();
            if report.member("phone_2").unwrap().state == MemberState::Failed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect never demoted the member");

    // Recording continues for the survivor.
    assert_eq!(coordinator.session_phase().await, SessionPhase::Recording);
    let phase = coordinator.stop_all().await.unwrap();
    assert_eq!(phase, SessionPhase::Completed);
}

// ── Malformed traffic ────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_frame_does_not_kill_connection() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    // Raw socket so we can write garbage between valid frames.
    let mut stream = TcpStream::connect(info.to_socket_string()).await.unwrap();
    use tokio::io::AsyncWriteExt;
    let registration = serde_json::json!({
        "type": "device_status",
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "device_id": "phone_1",
        "status": "ready",
        "capabilities": ["rgb_video"],
    });
    stream
        .write_all(format!("{registration}\n").as_bytes())
        .await
        .unwrap();
    wait_for_devices(&coordinator, 1).await;

    stream.write_all(b"{not json at all\n").await.unwrap();
    stream
        .write_all(b"{\"type\": \"heartbeat\", \"timestamp\": 1}\n")
        .await
        .unwrap();

    // The heartbeat after the garbage still lands.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let devices = coordinator.devices();
            if devices[0].last_heartbeat.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("heartbeat after malformed frame never processed");
}

// ── Unknown message types ────────────────────────────────────────

#[tokio::test]
async fn test_unknown_message_type_tolerated_on_the_wire() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    let mut stream = TcpStream::connect(info.to_socket_string()).await.unwrap();
    use tokio::io::AsyncWriteExt;
    let registration = serde_json::json!({
        "type": "device_status",
        "timestamp": 1,
        "device_id": "phone_1",
        "status": "ready",
    });
    stream
        .write_all(format!("{registration}\n").as_bytes())
        .await
        .unwrap();
    wait_for_devices(&coordinator, 1).await;

    stream
        .write_all(b"{\"type\": \"hologram_feed\", \"timestamp\": 2, \"payload\": []}\n")
        .await
        .unwrap();
    stream
        .write_all(b"{\"type\": \"heartbeat\", \"timestamp\": 3}\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if coordinator.devices()[0].last_heartbeat.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("traffic after unknown type never processed");
}

// ── Clock sync over the wire ─────────────────────────────────────

#[tokio::test]
async fn test_probe_round_confirms_device_offsets() {
    let coordinator = Coordinator::new(fast_config());
    let info = spawn_coordinator(coordinator.clone()).await;

    let _a = spawn_device(&info, "phone_1", COOPERATIVE);
    wait_for_devices(&coordinator, 1).await;

    coordinator.clock_probe_tick().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if coordinator.devices()[0].sync_confirmed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("probe never confirmed an offset");

    // Localhost round trip: the offset estimate should be near zero.
    let estimate = coordinator.devices()[0].offset.unwrap();
    assert!(
        estimate.offset_ms.abs() < 100.0,
        "offset {} too large for localhost",
        estimate.offset_ms
    );
}

// ── Heartbeat sweep ──────────────────────────────────────────────

#[tokio::test]
async fn test_heartbeat_silence_marks_device_disconnected() {
    let coordinator = Coordinator::new(fast_config()); // 300ms window
    let info = spawn_coordinator(coordinator.clone()).await;

    let _a = spawn_device(&info, "phone_1", COOPERATIVE);
    wait_for_devices(&coordinator, 1).await;

    // The device never sends heartbeats; after the window the sweep
    // must flag it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    coordinator.heartbeat_tick().await;

    let devices = coordinator.devices();
    assert_eq!(
        devices[0].status,
        tandem_core::DeviceStatus::Disconnected
    );
}
