//! Protocol message types for the device wire protocol.
//!
//! Every frame is a JSON object carrying `type` (tag), `timestamp`
//! (sender-local milliseconds), and the type-specific required fields.
//! Unknown `type` values are accepted and surfaced as
//! [`Decoded::Unknown`] for forward compatibility — only structurally
//! broken frames are classified as malformed, and even those never
//! tear down the connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::MalformedMessage;

// ── Capability ───────────────────────────────────────────────────

/// A recording capability a device declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// RGB video camera.
    RgbVideo,
    /// Thermal camera.
    ThermalVideo,
    /// Galvanic skin response sensor.
    GsrData,
    /// Microphone audio.
    Audio,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::RgbVideo => write!(f, "rgb_video"),
            Capability::ThermalVideo => write!(f, "thermal_video"),
            Capability::GsrData => write!(f, "gsr_data"),
            Capability::Audio => write!(f, "audio"),
        }
    }
}

// ── Message envelope ─────────────────────────────────────────────

/// One protocol message: envelope fields plus the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender-local wall clock, milliseconds. Monotonically
    /// increasing per sender.
    pub timestamp: i64,

    /// Per-connection sequence number stamped by the dispatcher on
    /// outbound commands. Devices echo it back inside `ack.message_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    /// The type-tagged payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// Build a message stamped with the coordinator's current wall
    /// clock.
    pub fn now(payload: Payload) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            seq: None,
            payload,
        }
    }

    /// Same as [`Message::now`] with a dispatcher sequence number.
    pub fn with_seq(payload: Payload, seq: u64) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            seq: Some(seq),
            payload,
        }
    }

    /// The correlation id a device must echo in `ack.message_id`:
    /// the message `type` plus the dispatcher sequence number.
    ///
    /// Returns `None` for messages sent without a sequence number.
    pub fn correlation_id(&self) -> Option<String> {
        self.seq.map(|s| format!("{}:{}", self.payload.kind(), s))
    }
}

// ── Payload ──────────────────────────────────────────────────────

/// Calibration pattern dimensions (inner corners for chessboard,
/// circle grid otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub rows: u32,
    pub cols: u32,
}

/// All message payloads understood by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Command: prepare device resources for an imminent recording.
    Prepare { session_id: String },

    /// Command: begin capture, optionally at a scheduled device-local
    /// instant (`start_at`, device-local milliseconds).
    StartRecord {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_at: Option<i64>,
    },

    /// Command: end capture.
    StopRecord { session_id: String },

    /// Report: device liveness/health. Doubles as the registration
    /// handshake when `capabilities` is present.
    DeviceStatus {
        device_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Vec<Capability>>,
    },

    /// Acknowledge a prior command, correlated by `message_id`
    /// (`"<type>:<seq>"`).
    Ack {
        message_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Liveness ping. Carries no fields.
    Heartbeat,

    /// Command: begin calibration capture.
    CalibrationStart {
        pattern_type: String,
        pattern_size: PatternSize,
    },

    /// Report: calibration outcome.
    CalibrationResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rms_error: Option<f64>,
    },

    /// Low-rate preview frame. Consumed opaquely; the coordinator
    /// only meters its rate.
    PreviewFrame {
        frame_id: u64,
        image_data: String,
        width: u32,
        height: u32,
    },

    /// Bulk file transfer chunk. Consumed opaquely; the coordinator
    /// records the file descriptor for the session manifest.
    FileChunk {
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
        chunk_data: String,
        chunk_size: u32,
        file_type: String,
    },

    /// Command: clock-offset probe. Device answers with
    /// `sync_response` echoing `probe_id`.
    SyncProbe { probe_id: u64 },

    /// Report: probe answer carrying the device's local clock at
    /// receipt (milliseconds).
    SyncResponse { probe_id: u64, device_time: i64 },

    /// Command: offer a reconnected device rejoin into the running
    /// session at the given elapsed offset.
    SessionRejoin { session_id: String, elapsed_ms: i64 },
}

impl Payload {
    /// The wire `type` tag for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Prepare { .. } => "prepare",
            Payload::StartRecord { .. } => "start_record",
            Payload::StopRecord { .. } => "stop_record",
            Payload::DeviceStatus { .. } => "device_status",
            Payload::Ack { .. } => "ack",
            Payload::Heartbeat => "heartbeat",
            Payload::CalibrationStart { .. } => "calibration_start",
            Payload::CalibrationResult { .. } => "calibration_result",
            Payload::PreviewFrame { .. } => "preview_frame",
            Payload::FileChunk { .. } => "file_chunk",
            Payload::SyncProbe { .. } => "sync_probe",
            Payload::SyncResponse { .. } => "sync_response",
            Payload::SessionRejoin { .. } => "session_rejoin",
        }
    }

    /// Returns `true` if the device must acknowledge this command.
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Payload::Prepare { .. }
                | Payload::StartRecord { .. }
                | Payload::StopRecord { .. }
                | Payload::CalibrationStart { .. }
        )
    }
}

/// Every `type` tag the coordinator decodes into a [`Payload`].
const KNOWN_KINDS: &[&str] = &[
    "prepare",
    "start_record",
    "stop_record",
    "device_status",
    "ack",
    "heartbeat",
    "calibration_start",
    "calibration_result",
    "preview_frame",
    "file_chunk",
    "sync_probe",
    "sync_response",
    "session_rejoin",
];

// ── Decoding ─────────────────────────────────────────────────────

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed message of a known type.
    Known(Message),

    /// A structurally valid message whose `type` the coordinator does
    /// not understand. Accepted (logged by the caller), never
    /// rejected — deliberate extensibility policy.
    Unknown { kind: String, raw: serde_json::Value },

    /// A structurally broken frame. Logged and discarded by the
    /// caller; the connection continues.
    Malformed(MalformedMessage),
}

/// Classify one frame of bytes into a [`Decoded`].
///
/// This is the single validation boundary: past this point every
/// known message has all its required fields.
pub fn decode_frame(frame: &[u8]) -> Decoded {
    let value: serde_json::Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => return Decoded::Malformed(MalformedMessage::InvalidJson(e.to_string())),
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return Decoded::Malformed(MalformedMessage::NotAnObject),
    };

    let kind = match obj.get("type").and_then(|t| t.as_str()) {
        Some(k) => k.to_string(),
        None => return Decoded::Malformed(MalformedMessage::MissingType),
    };

    if !obj.get("timestamp").is_some_and(|t| t.is_i64() || t.is_u64()) {
        return Decoded::Malformed(MalformedMessage::MissingTimestamp);
    }

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Decoded::Unknown { kind, raw: value };
    }

    match serde_json::from_value::<Message>(value) {
        Ok(msg) => Decoded::Known(msg),
        Err(e) => Decoded::Malformed(MalformedMessage::InvalidShape {
            kind,
            detail: e.to_string(),
        }),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str(s: &str) -> Decoded {
        decode_frame(s.as_bytes())
    }

    #[test]
    fn roundtrip_start_record() {
        let msg = Message::with_seq(
            Payload::StartRecord {
                session_id: "pilot_20250101_120000".into(),
                start_at: Some(1_700_000_002_000),
            },
            7,
        );
        let json = serde_json::to_vec(&msg).unwrap();
        match decode_frame(&json) {
            Decoded::Known(decoded) => assert_eq!(decoded, msg),
            other => panic!("expected Known, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_has_no_extra_fields() {
        let msg = Message::now(Payload::Heartbeat);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
        assert!(!json.contains("seq"));
    }

    #[test]
    fn missing_type_is_malformed() {
        let d = decode_str(r#"{"timestamp": 123, "session_id": "x"}"#);
        assert_eq!(d, Decoded::Malformed(MalformedMessage::MissingType));
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        let d = decode_str(r#"{"type": "heartbeat"}"#);
        assert_eq!(d, Decoded::Malformed(MalformedMessage::MissingTimestamp));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        // start_record without session_id
        let d = decode_str(r#"{"type": "start_record", "timestamp": 123}"#);
        assert!(matches!(
            d,
            Decoded::Malformed(MalformedMessage::InvalidShape { kind, .. }) if kind == "start_record"
        ));
    }

    #[test]
    fn unknown_type_is_accepted() {
        let d = decode_str(r#"{"type": "future_feature", "timestamp": 123, "blob": 1}"#);
        match d {
            Decoded::Unknown { kind, .. } => assert_eq!(kind, "future_feature"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed_not_panic() {
        assert!(matches!(
            decode_str("not json at all"),
            Decoded::Malformed(MalformedMessage::InvalidJson(_))
        ));
        assert!(matches!(
            decode_str("[1, 2, 3]"),
            Decoded::Malformed(MalformedMessage::NotAnObject)
        ));
    }

    #[test]
    fn ack_correlation_id_format() {
        let msg = Message::with_seq(
            Payload::Prepare {
                session_id: "s".into(),
            },
            42,
        );
        assert_eq!(msg.correlation_id().unwrap(), "prepare:42");

        let unstamped = Message::now(Payload::Heartbeat);
        assert!(unstamped.correlation_id().is_none());
    }

    #[test]
    fn expects_ack_classification() {
        assert!(
            Payload::Prepare {
                session_id: "s".into()
            }
            .expects_ack()
        );
        assert!(!Payload::Heartbeat.expects_ack());
        assert!(
            !Payload::Ack {
                message_id: "x:1".into(),
                success: true,
                error: None,
            }
            .expects_ack()
        );
    }

    #[test]
    fn device_status_with_capabilities() {
        let d = decode_str(
            r#"{"type": "device_status", "timestamp": 5,
                "device_id": "phone_1", "status": "idle",
                "capabilities": ["rgb_video", "thermal_video"]}"#,
        );
        match d {
            Decoded::Known(Message {
                payload:
                    Payload::DeviceStatus {
                        device_id,
                        capabilities: Some(caps),
                        ..
                    },
                ..
            }) => {
                assert_eq!(device_id, "phone_1");
                assert_eq!(caps, vec![Capability::RgbVideo, Capability::ThermalVideo]);
            }
            other => panic!("expected device_status, got {other:?}"),
        }
    }

    #[test]
    fn file_chunk_requires_all_fields() {
        let d = decode_str(
            r#"{"type": "file_chunk", "timestamp": 1,
                "file_id": "f", "chunk_index": 0, "total_chunks": 2,
                "chunk_data": "AA==", "chunk_size": 1}"#,
        );
        // file_type missing
        assert!(matches!(
            d,
            Decoded::Malformed(MalformedMessage::InvalidShape { .. })
        ));
    }
}
