//! The authoritative session lifecycle.
//!
//! ```text
//!  Idle ──► Configuring ──► Armed ──► Recording ──► Stopping ──► Finalizing ──► Completed
//!               │             │           │            │             │
//!               └─────────────┴───────────┴────────────┴─────────────┴──────► Error
//! ```
//!
//! The session state machine is the single writer of session state;
//! every other component requests transitions through it. A session's
//! device set is fixed at creation — members can be demoted to
//! `not_started`/`failed` or rejoined with a recorded gap, but the
//! set itself never gains members. `Completed` and `Error` are
//! terminal: no transition leaves them, and a new session requires a
//! new identifier.

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::error::{SessionError, TandemError};

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle phase of the (single) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session exists.
    #[default]
    Idle,
    /// Created; device set fixed; devices not yet prepared.
    Configuring,
    /// Every still-active device acknowledged `prepare`.
    Armed,
    /// Devices are capturing.
    Recording,
    /// Stop commands issued.
    Stopping,
    /// Waiting for final per-device manifests.
    Finalizing,
    /// Terminal: at least one device produced data.
    Completed,
    /// Terminal: session-level failure.
    Error,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Error)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Configuring => "Configuring",
            SessionPhase::Armed => "Armed",
            SessionPhase::Recording => "Recording",
            SessionPhase::Stopping => "Stopping",
            SessionPhase::Finalizing => "Finalizing",
            SessionPhase::Completed => "Completed",
            SessionPhase::Error => "Error",
        };
        write!(f, "{s}")
    }
}

// ── Members ──────────────────────────────────────────────────────

/// Per-session standing of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Participating normally.
    Active,
    /// Never acknowledged `prepare`; dropped before arming.
    NotStarted,
    /// Demoted mid-session (no ack, disconnect, error status).
    Failed,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Active => write!(f, "active"),
            MemberState::NotStarted => write!(f, "not_started"),
            MemberState::Failed => write!(f, "failed"),
        }
    }
}

/// Descriptor of one file a device reported recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub file_type: String,
    pub total_chunks: u32,
}

/// An interval a rejoined device did not record, wall-clock ms.
/// Never backfilled — recorded so downstream analysis can mask it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingGap {
    pub from_ms: i64,
    pub to_ms: i64,
}

/// One device's session membership record.
#[derive(Debug, Clone)]
pub struct SessionMember {
    pub device_id: String,
    pub state: MemberState,
    /// Set at the start barrier when the device's start instant was
    /// translated without a reliable clock sample: its timeline
    /// carries a degraded-precision guarantee.
    pub sync_unconfirmed: bool,
    /// Files the device reported during finalization.
    pub files: Vec<FileRecord>,
    /// Omitted intervals from reconnection rejoin events.
    pub gaps: Vec<RecordingGap>,
    /// Session-scoped resync attempts consumed by this device.
    pub resync_attempts: u32,
    /// Device sent its final report during Finalizing.
    pub finalized: bool,
    /// Wall-clock ms of the most recent demotion to `Failed`.
    failed_at_ms: Option<i64>,
}

impl SessionMember {
    fn new(device_id: String) -> Self {
        Self {
            device_id,
            state: MemberState::Active,
            sync_unconfirmed: false,
            files: Vec::new(),
            gaps: Vec::new(),
            resync_attempts: 0,
            finalized: false,
            failed_at_ms: None,
        }
    }

    /// Whether this member counts toward the `Completed` criterion.
    pub fn produced_data(&self) -> bool {
        self.finalized || !self.files.is_empty()
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One bounded recording activity over a fixed device set.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    name: String,
    phase: SessionPhase,
    members: Vec<SessionMember>,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
    /// The common wall-clock start instant of the barrier.
    scheduled_start_ms: Option<i64>,
    /// Reason code when `phase` is `Error`.
    error: Option<SessionError>,
}

impl Session {
    /// Create a session over a non-empty device set.
    ///
    /// The identifier is `name_YYYYMMDD_HHMMSS` from `created_at_ms`.
    pub fn create(
        name: &str,
        device_ids: &[String],
        created_at_ms: i64,
    ) -> Result<Self, SessionError> {
        if device_ids.is_empty() {
            return Err(SessionError::NoDevices);
        }
        let stamp = Utc
            .timestamp_millis_opt(created_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d_%H%M%S");
        let id = format!("{name}_{stamp}");
        info!(session = %id, devices = device_ids.len(), "session created");

        Ok(Self {
            id,
            name: name.to_string(),
            phase: SessionPhase::Configuring,
            members: device_ids
                .iter()
                .map(|d| SessionMember::new(d.clone()))
                .collect(),
            created_at_ms,
            started_at_ms: None,
            ended_at_ms: None,
            scheduled_start_ms: None,
            error: None,
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        self.started_at_ms
    }

    pub fn ended_at_ms(&self) -> Option<i64> {
        self.ended_at_ms
    }

    pub fn scheduled_start_ms(&self) -> Option<i64> {
        self.scheduled_start_ms
    }

    /// The reason code when the session ended in `Error`.
    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn members(&self) -> &[SessionMember] {
        &self.members
    }

    pub fn member(&self, device_id: &str) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.device_id == device_id)
    }

    fn member_mut(&mut self, device_id: &str) -> Option<&mut SessionMember> {
        self.members.iter_mut().find(|m| m.device_id == device_id)
    }

    /// Ids of members still active, in membership order.
    pub fn active_ids(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.state == MemberState::Active)
            .map(|m| m.device_id.clone())
            .collect()
    }

    // ── Transitions ──────────────────────────────────────────────

    fn guard(&self, expected: SessionPhase, operation: &'static str) -> Result<(), TandemError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(TandemError::InvalidTransition {
                from: self.phase,
                operation,
            })
        }
    }

    /// `Configuring → Armed`, after prepare acks were applied.
    ///
    /// Fails the whole session when no active member remains.
    pub fn arm(&mut self) -> Result<(), TandemError> {
        self.guard(SessionPhase::Configuring, "arm")?;
        if self.active_ids().is_empty() {
            self.enter_error(SessionError::NoViableDevices);
            return Err(SessionError::NoViableDevices.into());
        }
        self.phase = SessionPhase::Armed;
        info!(session = %self.id, active = self.active_ids().len(), "session armed");
        Ok(())
    }

    /// `Armed → Recording`, after the start barrier resolved.
    pub fn begin_recording(
        &mut self,
        scheduled_start_ms: i64,
        started_at_ms: i64,
    ) -> Result<(), TandemError> {
        self.guard(SessionPhase::Armed, "begin_recording")?;
        if self.active_ids().is_empty() {
            self.enter_error(SessionError::NoViableDevices);
            return Err(SessionError::NoViableDevices.into());
        }
        self.scheduled_start_ms = Some(scheduled_start_ms);
        self.started_at_ms = Some(started_at_ms);
        self.phase = SessionPhase::Recording;
        info!(session = %self.id, scheduled_start_ms, "session recording");
        Ok(())
    }

    /// `Recording → Stopping`.
    pub fn begin_stopping(&mut self) -> Result<(), TandemError> {
        self.guard(SessionPhase::Recording, "begin_stopping")?;
        self.phase = SessionPhase::Stopping;
        Ok(())
    }

    /// `Stopping → Finalizing`.
    pub fn begin_finalizing(&mut self) -> Result<(), TandemError> {
        self.guard(SessionPhase::Stopping, "begin_finalizing")?;
        self.phase = SessionPhase::Finalizing;
        Ok(())
    }

    /// `Finalizing → Completed | Error`, depending on whether any
    /// device produced data.
    pub fn finish(&mut self, ended_at_ms: i64) -> Result<SessionPhase, TandemError> {
        self.guard(SessionPhase::Finalizing, "finish")?;
        self.ended_at_ms = Some(ended_at_ms);
        if self.members.iter().any(|m| m.produced_data()) {
            self.phase = SessionPhase::Completed;
            info!(session = %self.id, "session completed");
        } else {
            self.enter_error(SessionError::NoDeviceData);
        }
        Ok(self.phase)
    }

    /// Abort from any non-terminal phase.
    pub fn abort(&mut self, reason: SessionError, ended_at_ms: i64) -> Result<(), TandemError> {
        if self.phase.is_terminal() {
            return Err(TandemError::InvalidTransition {
                from: self.phase,
                operation: "abort",
            });
        }
        self.ended_at_ms = Some(ended_at_ms);
        self.enter_error(reason);
        Ok(())
    }

    fn enter_error(&mut self, reason: SessionError) {
        warn!(session = %self.id, %reason, "session entered error state");
        self.phase = SessionPhase::Error;
        self.error = Some(reason);
    }

    // ── Member bookkeeping ───────────────────────────────────────

    fn guard_mutable(&self, operation: &'static str) -> Result<(), TandemError> {
        if self.phase.is_terminal() {
            return Err(TandemError::InvalidTransition {
                from: self.phase,
                operation,
            });
        }
        Ok(())
    }

    /// Drop a member that never acknowledged `prepare`. It stays in
    /// session metadata as `not_started`.
    pub fn mark_not_started(&mut self, device_id: &str) -> Result<(), TandemError> {
        self.guard_mutable("mark_not_started")?;
        match self.member_mut(device_id) {
            Some(m) => {
                m.state = MemberState::NotStarted;
                debug!(device = device_id, "member dropped: not_started");
            }
            None => warn!(device = device_id, "not_started for non-member"),
        }
        Ok(())
    }

    /// Demote a member mid-session. Other members are unaffected.
    pub fn mark_failed(&mut self, device_id: &str, at_ms: i64) -> Result<(), TandemError> {
        self.guard_mutable("mark_failed")?;
        match self.member_mut(device_id) {
            Some(m) if m.state == MemberState::Active => {
                m.state = MemberState::Failed;
                m.failed_at_ms = Some(at_ms);
                debug!(device = device_id, "member demoted: failed");
            }
            Some(_) => {}
            None => warn!(device = device_id, "failure for non-member"),
        }
        Ok(())
    }

    /// Record whether a member's start instant was translated through
    /// a confirmed clock offset. Judged at the start barrier, so a
    /// sample arriving after creation still counts.
    pub fn set_sync_unconfirmed(&mut self, device_id: &str, unconfirmed: bool) {
        if let Some(m) = self.member_mut(device_id) {
            m.sync_unconfirmed = unconfirmed;
        }
    }

    /// Count one resync attempt; returns the new total.
    pub fn count_resync_attempt(&mut self, device_id: &str) -> u32 {
        match self.member_mut(device_id) {
            Some(m) => {
                m.resync_attempts += 1;
                m.resync_attempts
            }
            None => 0,
        }
    }

    /// Re-admit a previously failed member. The omitted interval is
    /// recorded as a gap — it is never retroactively caught up.
    pub fn rejoin(&mut self, device_id: &str, at_ms: i64) -> Result<(), TandemError> {
        self.guard_mutable("rejoin")?;
        match self.member_mut(device_id) {
            Some(m) if m.state == MemberState::Failed => {
                let from_ms = m.failed_at_ms.unwrap_or(at_ms);
                m.gaps.push(RecordingGap {
                    from_ms,
                    to_ms: at_ms,
                });
                m.state = MemberState::Active;
                m.failed_at_ms = None;
                info!(device = device_id, gap_ms = at_ms - from_ms, "member rejoined with gap");
                Ok(())
            }
            Some(_) => Err(TandemError::Other(format!(
                "rejoin for member not in failed state: {device_id}"
            ))),
            None => Err(TandemError::UnknownDevice(device_id.to_string())),
        }
    }

    /// Append a file descriptor to a member's manifest.
    pub fn record_file(&mut self, device_id: &str, file: FileRecord) {
        if let Some(m) = self.member_mut(device_id) {
            if !m.files.iter().any(|f| f.file_id == file.file_id) {
                m.files.push(file);
            }
        }
    }

    /// Mark that a member delivered its final report.
    pub fn mark_finalized(&mut self, device_id: &str) {
        if let Some(m) = self.member_mut(device_id) {
            m.finalized = true;
        }
    }

    /// True once every still-active member has finalized.
    pub fn all_active_finalized(&self) -> bool {
        self.members
            .iter()
            .filter(|m| m.state == MemberState::Active)
            .all(|m| m.finalized)
    }
}

// ── Tests ────────────────────────────────────────────────────────
