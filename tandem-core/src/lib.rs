//! # tandem-core
//!
//! Coordination core for multi-device recording sessions.
//!
//! This crate contains:
//! - **Messages**: `Message`/`Payload` — the typed JSON wire vocabulary,
//!   plus tolerant classification of inbound frames via `decode_frame`
//! - **Codec**: `WireCodec` for newline-framed TCP I/O via `tokio_util`
//! - **Network**: `Connection` for managed device TCP connections
//! - **Registry**: `DeviceRegistry` — every device ever seen, with
//!   capabilities, liveness, and clock state
//! - **Clock**: `ClockSync` — probe bookkeeping and smoothed per-device
//!   offset estimation
//! - **Dispatch**: `Dispatcher` — seq-stamped commands, ack correlation,
//!   and the single-deadline group barrier
//! - **Session**: the validated session lifecycle state machine
//! - **Fault**: heartbeat overdue detection, reconnection backoff, and
//!   the rejoin policy
//! - **Quality**: advisory per-device link classification
//! - **Coordinator**: the single-instance facade tying it all together
//! - **Error**: `TandemError` — typed, `thiserror`-based error hierarchy

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod message;
pub mod net;
pub mod quality;
pub mod registry;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use clock::{ClockSync, OffsetEstimate, SampleVerdict};
pub use codec::{MAX_FRAME_SIZE, WireCodec};
pub use config::CoreConfig;
pub use coordinator::Coordinator;
pub use dispatch::{AckOutcome, Dispatcher};
pub use error::{MalformedMessage, SessionError, TandemError};
pub use fault::{BackoffSchedule, FaultManager, HeartbeatMonitor, RejoinOutcome};
pub use message::{Capability, Decoded, Message, PatternSize, Payload, decode_frame};
pub use net::{Connection, ConnectionInfo, ConnectionSender};
pub use quality::{LinkQuality, QualityMonitor};
pub use registry::{Device, DeviceRegistry, DeviceStatus};
pub use session::{
    FileRecord, MemberState, RecordingGap, Session, SessionMember, SessionPhase,
};
