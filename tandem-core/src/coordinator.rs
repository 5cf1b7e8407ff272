//! The coordinator: single-instance owner of every coordination
//! component.
//!
//! Constructed once at process start and passed by handle to the
//! network layer — explicit state, no globals. All session mutations
//! funnel through the session slot's async mutex, so the state
//! machine never observes interleaved transitions; registry, clock,
//! and quality state are independently locked and never held across
//! suspension points. Barrier waits (arm, scheduled start, stop)
//! hold the session owner for their duration: they are the session
//! transition in progress. Inbound read loops therefore never take
//! the session owner inline — demotions and finalize marks are
//! spawned, and manifests are buffered and folded in during
//! finalization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::{ClockSync, SampleVerdict};
use crate::config::CoreConfig;
use crate::dispatch::{AckOutcome, Dispatcher};
use crate::error::{SessionError, TandemError};
use crate::fault::{BackoffSchedule, FaultManager, RejoinOutcome};
use crate::message::{Capability, Decoded, PatternSize, Payload};
use crate::net::ConnectionSender;
use crate::quality::{LinkQuality, QualityMonitor};
use crate::registry::{Device, DeviceRegistry, DeviceStatus};
use crate::session::{FileRecord, MemberState, Session, SessionPhase};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Cadence of the finalization progress check.
const FINALIZE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct SessionSlot {
    active: Option<Session>,
    history: Vec<Session>,
}

/// Single-instance coordination core. Cheap to clone; clones share
/// state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: CoreConfig,
    registry: Arc<RwLock<DeviceRegistry>>,
    clock: Arc<Mutex<ClockSync>>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<tokio::sync::Mutex<SessionSlot>>,
    faults: Arc<Mutex<FaultManager>>,
    quality: Arc<Mutex<QualityMonitor>>,
    /// Manifest records buffered off the session owner; read loops
    /// push here without awaiting, and they are folded into the
    /// session during finalization.
    pending_files: Arc<Mutex<Vec<(String, FileRecord)>>>,
    /// Abort token for the current session's barrier waits.
    abort_token: Arc<Mutex<CancellationToken>>,
}

impl Coordinator {
    pub fn new(config: CoreConfig) -> Self {
        let faults = FaultManager::new(
            config.heartbeat_window(),
            BackoffSchedule::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_cap_ms),
                config.reconnect_jitter,
            ),
            config.max_resync_attempts,
        );
        let clock = ClockSync::new(Duration::from_millis(config.rtt_ceiling_ms));
        Self {
            config,
            registry: Arc::new(RwLock::new(DeviceRegistry::new())),
            clock: Arc::new(Mutex::new(clock)),
            dispatcher: Arc::new(Dispatcher::new()),
            session: Arc::new(tokio::sync::Mutex::new(SessionSlot::default())),
            faults: Arc::new(Mutex::new(faults)),
            quality: Arc::new(Mutex::new(QualityMonitor::new())),
            pending_files: Arc::new(Mutex::new(Vec::new())),
            abort_token: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Device lifecycle ─────────────────────────────────────────

    /// Register a device on handshake (idempotent) and, when it
    /// matches a failed member of a recording session, offer rejoin.
    pub async fn register_device(
        &self,
        device_id: &str,
        capabilities: Vec<Capability>,
        sender: ConnectionSender,
    ) {
        {
            let mut registry = self.registry.write().unwrap();
            registry.register(device_id, capabilities, sender);
        }
        self.faults
            .lock()
            .unwrap()
            .heartbeats()
            .observe(device_id, Instant::now());

        self.offer_rejoin(device_id).await;
    }

    /// Evaluate rejoin for a (re)connected device and send the offer
    /// if granted.
    async fn offer_rejoin(&self, device_id: &str) {
        let outcome = {
            let mut slot = self.session.lock().await;
            let Some(session) = slot.active.as_mut().filter(|s| !s.phase().is_terminal())
            else {
                return;
            };
            if session.member(device_id).map(|m| m.state) != Some(MemberState::Failed) {
                return;
            }
            self.faults
                .lock()
                .unwrap()
                .evaluate_rejoin(session, device_id, now_ms())
        };

        match outcome {
            RejoinOutcome::Granted {
                session_id,
                elapsed_ms,
            } => {
                info!(device = device_id, session = %session_id, elapsed_ms, "rejoin offered");
                if let Some(sender) = self.sender_for(device_id) {
                    self.dispatcher
                        .send_to(
                            device_id,
                            &sender,
                            Payload::SessionRejoin {
                                session_id,
                                elapsed_ms,
                            },
                        )
                        .await;
                }
            }
            RejoinOutcome::TemporarilyDenied { attempt } => {
                debug!(device = device_id, attempt, "rejoin deferred");
            }
            RejoinOutcome::PermanentlyDenied => {
                info!(device = device_id, "rejoin permanently denied for this session");
            }
        }
    }

    /// Handle a dropped connection: mark the device disconnected and
    /// demote it in the active session.
    pub async fn device_disconnected(&self, device_id: &str) {
        info!(device = device_id, "device disconnected");
        {
            let mut registry = self.registry.write().unwrap();
            registry.mark_status(device_id, DeviceStatus::Disconnected);
        }
        self.clock.lock().unwrap().abandon_probes_for(device_id);
        self.faults.lock().unwrap().heartbeats().forget(device_id);
        self.demote_in_session(device_id).await;
    }

    async fn demote_in_session(&self, device_id: &str) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.active.as_mut().filter(|s| !s.phase().is_terminal()) {
            let _ = session.mark_failed(device_id, now_ms());
        }
    }

    fn sender_for(&self, device_id: &str) -> Option<ConnectionSender> {
        self.registry.read().unwrap().sender_for(device_id)
    }

    // ── Inbound traffic ──────────────────────────────────────────

    /// Route one decoded inbound item from `device_id`'s read loop.
    pub async fn handle_message(&self, device_id: &str, decoded: Decoded) {
        let message = match decoded {
            Decoded::Known(m) => m,
            Decoded::Unknown { kind, .. } => {
                // Accepted for forward compatibility, never rejected.
                info!(device = device_id, kind, "unknown message type accepted");
                return;
            }
            Decoded::Malformed(err) => {
                warn!(device = device_id, error = %err, "malformed message discarded");
                return;
            }
        };

        // Any inbound traffic proves liveness.
        self.faults
            .lock()
            .unwrap()
            .heartbeats()
            .observe(device_id, Instant::now());

        match message.payload {
            Payload::Heartbeat => {
                self.registry
                    .write()
                    .unwrap()
                    .record_heartbeat(device_id, Instant::now());
                trace!(device = device_id, "heartbeat");
            }

            Payload::Ack {
                message_id,
                success,
                error,
            } => {
                self.dispatcher
                    .resolve_ack(device_id, &message_id, success, error);
            }

            Payload::DeviceStatus { status, .. } => {
                self.handle_status_report(device_id, &status);
            }

            Payload::SyncResponse {
                probe_id,
                device_time,
            } => {
                self.handle_sync_response(probe_id, device_time);
            }

            Payload::CalibrationResult { success, rms_error } => {
                info!(device = device_id, success, ?rms_error, "calibration result");
            }

            Payload::PreviewFrame { frame_id, .. } => {
                // Opaque to the core; only metered.
                trace!(device = device_id, frame_id, "preview frame");
            }

            Payload::FileChunk {
                file_id,
                total_chunks,
                file_type,
                chunk_index,
                ..
            } => {
                trace!(device = device_id, %file_id, chunk_index, "file chunk");
                // Buffered, not recorded inline: a manifest arriving
                // ahead of its stop ack must not stall that ack
                // behind the session owner held by the stop barrier.
                self.pending_files.lock().unwrap().push((
                    device_id.to_string(),
                    FileRecord {
                        file_id,
                        file_type,
                        total_chunks,
                    },
                ));
            }

            Payload::SessionRejoin { .. } => {
                // Device-initiated rejoin request.
                self.offer_rejoin(device_id).await;
            }

            other => {
                debug!(device = device_id, kind = other.kind(), "unexpected command from device");
            }
        }
    }

    /// Session mutations here are spawned, never inline: a read loop
    /// must not wait behind a barrier holding the session owner, or
    /// the ack the barrier is waiting for gets stuck in that loop.
    fn handle_status_report(&self, device_id: &str, status: &str) {
        debug!(device = device_id, status, "device status");
        if matches!(status, "error" | "storage_full") {
            self.registry
                .write()
                .unwrap()
                .mark_status(device_id, DeviceStatus::Error);
            let this = self.clone();
            let id = device_id.to_string();
            tokio::spawn(async move { this.demote_in_session(&id).await });
            return;
        }

        if matches!(status, "done" | "stopped" | "completed") {
            let this = self.clone();
            let id = device_id.to_string();
            tokio::spawn(async move { this.mark_finalized_in_session(&id).await });
        }
    }

    /// Fold buffered manifest records into the session. Called only
    /// while the session owner is already held.
    fn drain_pending_files(&self, session: &mut Session) {
        let drained: Vec<_> = self.pending_files.lock().unwrap().drain(..).collect();
        for (device_id, file) in drained {
            session.record_file(&device_id, file);
        }
    }

    async fn mark_finalized_in_session(&self, device_id: &str) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot
            .active
            .as_mut()
            .filter(|s| s.phase() == SessionPhase::Finalizing)
        {
            session.mark_finalized(device_id);
        }
    }

    fn handle_sync_response(&self, probe_id: u64, device_time: i64) {
        let completed = self
            .clock
            .lock()
            .unwrap()
            .complete_probe(probe_id, device_time);
        match completed {
            Some((device_id, SampleVerdict::Accepted(estimate))) => {
                self.registry
                    .write()
                    .unwrap()
                    .set_offset(&device_id, estimate);
            }
            Some((device_id, SampleVerdict::RejectedRtt { rtt })) => {
                debug!(device = %device_id, ?rtt, "noisy probe discarded");
                self.quality.lock().unwrap().record_loss(&device_id);
            }
            None => debug!(probe_id, "sync response for unknown probe"),
        }
    }

    // ── Session operations ───────────────────────────────────────

    /// Create a session over `device_ids` (or every connected device
    /// when `None`). Returns the new session identifier.
    pub async fn create_session(
        &self,
        name: &str,
        device_ids: Option<Vec<String>>,
    ) -> Result<String, TandemError> {
        let mut slot = self.session.lock().await;
        if slot
            .active
            .as_ref()
            .is_some_and(|s| !s.phase().is_terminal())
        {
            return Err(SessionError::AlreadyActive.into());
        }

        let devices = match device_ids {
            Some(ids) => ids,
            None => self.registry.read().unwrap().connected_ids(),
        };
        let session = Session::create(name, &devices, now_ms())?;

        let id = session.id().to_string();
        if let Some(old) = slot.active.replace(session) {
            slot.history.push(old);
        }
        self.pending_files.lock().unwrap().clear();
        *self.abort_token.lock().unwrap() = CancellationToken::new();
        Ok(id)
    }

    /// `Configuring → Armed`: send `prepare` to every member and
    /// drop non-ackers from the working set as `not_started`.
    pub async fn arm_all(&self) -> Result<(), TandemError> {
        let mut slot = self.session.lock().await;
        let session = slot.active.as_mut().ok_or(SessionError::NotActive)?;
        if session.phase() != SessionPhase::Configuring {
            return Err(TandemError::InvalidTransition {
                from: session.phase(),
                operation: "arm_all",
            });
        }

        let session_id = session.id().to_string();
        let (targets, unreachable) = self.resolve_targets(&session.active_ids());
        for device_id in unreachable {
            session.mark_not_started(&device_id)?;
        }

        let cancel = self.abort_token.lock().unwrap().clone();
        let outcomes = self
            .dispatcher
            .send_to_all_await_ack(
                &targets,
                |_| Payload::Prepare {
                    session_id: session_id.clone(),
                },
                self.config.ack_timeout(),
                &cancel,
            )
            .await;

        if cancel.is_cancelled() {
            session.abort(SessionError::Aborted, now_ms())?;
            return Err(SessionError::Aborted.into());
        }

        self.record_outcomes(&outcomes);
        for (device_id, outcome) in &outcomes {
            if !outcome.is_success() {
                warn!(device = %device_id, ?outcome, "prepare not acknowledged");
                session.mark_not_started(device_id)?;
            }
        }
        session.arm()
    }

    /// `Armed → Recording`: the start barrier. Every armed device is
    /// told to begin at a common wall-clock instant translated into
    /// its own clock; late/absent acks demote that device without
    /// blocking the rest.
    pub async fn start_all(&self) -> Result<(), TandemError> {
        let mut slot = self.session.lock().await;
        let session = slot.active.as_mut().ok_or(SessionError::NotActive)?;
        if session.phase() != SessionPhase::Armed {
            return Err(TandemError::InvalidTransition {
                from: session.phase(),
                operation: "start_all",
            });
        }

        let session_id = session.id().to_string();
        let t_start = now_ms() + self.config.start_guard_ms as i64;
        let (targets, unreachable) = self.resolve_targets(&session.active_ids());
        for device_id in unreachable {
            session.mark_failed(&device_id, now_ms())?;
        }

        // Snapshot offsets once so the factory stays lock-free. This
        // is where each start instant is translated, so the degraded
        // guarantee is judged here: a member starting without a
        // confirmed offset is admitted but flagged.
        let offsets: HashMap<String, i64> = {
            let clock = self.clock.lock().unwrap();
            for (id, _) in &targets {
                session.set_sync_unconfirmed(id, !clock.is_confirmed(id));
            }
            targets
                .iter()
                .map(|(id, _)| (id.clone(), clock.offset_for(id)))
                .collect()
        };

        let cancel = self.abort_token.lock().unwrap().clone();
        let outcomes = self
            .dispatcher
            .send_to_all_await_ack(
                &targets,
                |device_id| Payload::StartRecord {
                    session_id: session_id.clone(),
                    start_at: Some(t_start + offsets.get(device_id).copied().unwrap_or(0)),
                },
                self.config.start_grace(),
                &cancel,
            )
            .await;

        if cancel.is_cancelled() {
            session.abort(SessionError::Aborted, now_ms())?;
            return Err(SessionError::Aborted.into());
        }

        self.record_outcomes(&outcomes);
        for (device_id, outcome) in &outcomes {
            if !outcome.is_success() {
                warn!(device = %device_id, ?outcome, "scheduled start not acknowledged");
                session.mark_failed(device_id, now_ms())?;
            }
        }
        session.begin_recording(t_start, now_ms())
    }

    /// `Recording → Stopping → Finalizing → {Completed, Error}`.
    ///
    /// Mirrors start: stop every still-active device, then wait for
    /// each one's final manifest (or the finalize timeout) and
    /// aggregate. Returns the terminal phase.
    pub async fn stop_all(&self) -> Result<SessionPhase, TandemError> {
        let session_id;
        {
            let mut slot = self.session.lock().await;
            let session = slot.active.as_mut().ok_or(SessionError::NotActive)?;
            session.begin_stopping()?;
            session_id = session.id().to_string();

            let (targets, unreachable) = self.resolve_targets(&session.active_ids());
            for device_id in unreachable {
                session.mark_failed(&device_id, now_ms())?;
            }

            let cancel = self.abort_token.lock().unwrap().clone();
            let outcomes = self
                .dispatcher
                .send_to_all_await_ack(
                    &targets,
                    |_| Payload::StopRecord {
                        session_id: session_id.clone(),
                    },
                    self.config.ack_timeout(),
                    &cancel,
                )
                .await;

            if cancel.is_cancelled() {
                session.abort(SessionError::Aborted, now_ms())?;
                return Err(SessionError::Aborted.into());
            }

            self.record_outcomes(&outcomes);
            for (device_id, outcome) in &outcomes {
                if !outcome.is_success() {
                    warn!(device = %device_id, ?outcome, "stop not acknowledged");
                    session.mark_failed(device_id, now_ms())?;
                }
            }
            session.begin_finalizing()?;
        }
        // The session owner is released while devices stream their
        // manifests, so the read loops can record them.
        self.await_finalization().await
    }

    async fn await_finalization(&self) -> Result<SessionPhase, TandemError> {
        let cancel = self.abort_token.lock().unwrap().clone();
        let deadline = Instant::now() + self.config.finalize_timeout();

        loop {
            {
                let mut slot = self.session.lock().await;
                let session = slot.active.as_mut().ok_or(SessionError::NotActive)?;
                match session.phase() {
                    SessionPhase::Finalizing => {
                        self.drain_pending_files(session);
                        if session.all_active_finalized() || Instant::now() >= deadline {
                            return session.finish(now_ms());
                        }
                    }
                    // Aborted underneath us.
                    phase => return Ok(phase),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(FINALIZE_POLL) => {}
            }
        }
    }

    /// Send `calibration_start` to one device and await its ack.
    /// Calibration itself happens on the device; the coordinator only
    /// routes the command and later records the reported outcome.
    pub async fn start_calibration(
        &self,
        device_id: &str,
        pattern_type: &str,
        pattern_size: PatternSize,
    ) -> Result<AckOutcome, TandemError> {
        let sender = self
            .sender_for(device_id)
            .ok_or_else(|| TandemError::DeviceNotConnected(device_id.to_string()))?;
        let cancel = self.abort_token.lock().unwrap().clone();
        let outcome = self
            .dispatcher
            .send_await_ack(
                device_id,
                &sender,
                Payload::CalibrationStart {
                    pattern_type: pattern_type.to_string(),
                    pattern_size,
                },
                Instant::now() + self.config.ack_timeout(),
                &cancel,
            )
            .await;
        if let AckOutcome::Acked { rtt, .. } = &outcome {
            self.quality.lock().unwrap().record_latency(device_id, *rtt);
        }
        Ok(outcome)
    }

    /// Abort the current session from any state. Releases in-flight
    /// barrier waiters immediately.
    pub async fn abort(&self) -> Result<(), TandemError> {
        self.abort_token.lock().unwrap().cancel();
        let mut slot = self.session.lock().await;
        match slot.active.as_mut() {
            Some(session) if !session.phase().is_terminal() => {
                session.abort(SessionError::Aborted, now_ms())
            }
            // Nothing to abort (or the barrier already applied it).
            _ => Ok(()),
        }
    }

    fn resolve_targets(
        &self,
        device_ids: &[String],
    ) -> (Vec<(String, ConnectionSender)>, Vec<String>) {
        let registry = self.registry.read().unwrap();
        let mut targets = Vec::new();
        let mut unreachable = Vec::new();
        for id in device_ids {
            match registry.sender_for(id) {
                Some(sender) => targets.push((id.clone(), sender)),
                None => unreachable.push(id.clone()),
            }
        }
        (targets, unreachable)
    }

    fn record_outcomes(&self, outcomes: &HashMap<String, AckOutcome>) {
        let mut quality = self.quality.lock().unwrap();
        for (device_id, outcome) in outcomes {
            match outcome {
                AckOutcome::Acked { rtt, .. } => quality.record_latency(device_id, *rtt),
                AckOutcome::TimedOut => quality.record_loss(device_id),
                AckOutcome::SendFailed | AckOutcome::Cancelled => {}
            }
        }
    }

    // ── Periodic workers ─────────────────────────────────────────

    /// One clock-probe round: send `sync_probe` to every connected
    /// device. Driven by the service's probe interval.
    pub async fn clock_probe_tick(&self) {
        let targets = {
            let registry = self.registry.read().unwrap();
            registry
                .connected_ids()
                .into_iter()
                .filter_map(|id| registry.sender_for(&id).map(|s| (id, s)))
                .collect::<Vec<_>>()
        };
        for (device_id, sender) in targets {
            let probe_id = self.clock.lock().unwrap().begin_probe(&device_id);
            self.dispatcher
                .send_to(&device_id, &sender, Payload::SyncProbe { probe_id })
                .await;
        }
    }

    /// One heartbeat sweep: devices silent beyond the window are
    /// marked disconnected and demoted in the active session.
    pub async fn heartbeat_tick(&self) {
        let overdue = self
            .faults
            .lock()
            .unwrap()
            .heartbeats()
            .sweep_overdue(Instant::now());
        for device_id in overdue {
            warn!(device = %device_id, "heartbeats missed; marking disconnected");
            {
                let mut registry = self.registry.write().unwrap();
                registry.mark_status(&device_id, DeviceStatus::Disconnected);
            }
            self.clock.lock().unwrap().abandon_probes_for(&device_id);
            self.demote_in_session(&device_id).await;
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Current session phase (`Idle` when none exists).
    pub async fn session_phase(&self) -> SessionPhase {
        self.session
            .lock()
            .await
            .active
            .as_ref()
            .map(|s| s.phase())
            .unwrap_or(SessionPhase::Idle)
    }

    /// Snapshot of the active or most recent session.
    pub async fn session_report(&self) -> Option<Session> {
        let slot = self.session.lock().await;
        slot.active
            .as_ref()
            .cloned()
            .or_else(|| slot.history.last().cloned())
    }

    /// Snapshot of every known device, insertion order.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.read().unwrap().all().cloned().collect()
    }

    /// Link classification for a device (advisory).
    pub fn link_quality(&self, device_id: &str) -> LinkQuality {
        self.quality.lock().unwrap().classify(device_id)
    }

    /// Suggested reconnect delay for attempt `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.faults.lock().unwrap().backoff().delay(attempt)
    }
}

// ── Tests ────────────────────────────────────────────────────────
