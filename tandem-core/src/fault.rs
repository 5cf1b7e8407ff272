//! Fault detection and reconnection policy.
//!
//! Three concerns live here: heartbeat overdue detection, the
//! exponential reconnection backoff schedule, and the rejoin decision
//! for devices that come back while a session is in flight. Rejoin
//! returns an explicit [`RejoinOutcome`] — retry state is carried in
//! the session member record, not in any callback-held counter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::session::{MemberState, Session, SessionPhase};

// ── HeartbeatMonitor ─────────────────────────────────────────────

/// Tracks heartbeat arrival times and flags devices whose silence
/// exceeds the configured window (interval × miss limit).
#[derive(Debug)]
pub struct HeartbeatMonitor {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl HeartbeatMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Record a liveness signal (heartbeat or any inbound traffic
    /// counts — a device streaming preview frames is alive).
    pub fn observe(&mut self, device_id: &str, at: Instant) {
        self.last_seen.insert(device_id.to_string(), at);
    }

    /// Stop tracking a device (it disconnected explicitly).
    pub fn forget(&mut self, device_id: &str) {
        self.last_seen.remove(device_id);
    }

    /// Devices silent for longer than the window, as of `now`.
    /// The overdue devices are dropped from tracking so each silence
    /// is reported once.
    pub fn sweep_overdue(&mut self, now: Instant) -> Vec<String> {
        let window = self.window;
        let overdue: Vec<String> = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| now.duration_since(seen) > window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &overdue {
            debug!(device = %id, "heartbeat overdue");
            self.last_seen.remove(id);
        }
        overdue
    }

    pub fn is_tracked(&self, device_id: &str) -> bool {
        self.last_seen.contains_key(device_id)
    }
}

// ── BackoffSchedule ──────────────────────────────────────────────

/// Exponential backoff with jitter for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    base: Duration,
    cap: Duration,
    /// Jitter fraction: each delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]`.
    jitter: f64,
}

impl BackoffSchedule {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// Delay before reconnection attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);
        if self.jitter <= 0.0 {
            return exp;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(exp.as_secs_f64() * factor)
    }
}

// ── RejoinOutcome ────────────────────────────────────────────────

/// Decision for a reconnected device asking back into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinOutcome {
    /// Re-admitted: resume status reporting at `elapsed_ms` into the
    /// session. The missed interval is already recorded as a gap.
    Granted {
        session_id: String,
        elapsed_ms: i64,
    },
    /// Not possible right now (barrier in flight, session winding
    /// down); the device may ask again.
    TemporarilyDenied { attempt: u32 },
    /// This device will not rejoin this session: retry budget
    /// exhausted, never a member, or the session ended.
    PermanentlyDenied,
}

// ── FaultManager ─────────────────────────────────────────────────

/// Owns heartbeat bookkeeping and the rejoin policy.
#[derive(Debug)]
pub struct FaultManager {
    heartbeats: HeartbeatMonitor,
    backoff: BackoffSchedule,
    max_resync_attempts: u32,
}

impl FaultManager {
    pub fn new(
        heartbeat_window: Duration,
        backoff: BackoffSchedule,
        max_resync_attempts: u32,
    ) -> Self {
        Self {
            heartbeats: HeartbeatMonitor::new(heartbeat_window),
            backoff,
            max_resync_attempts,
        }
    }

    pub fn heartbeats(&mut self) -> &mut HeartbeatMonitor {
        &mut self.heartbeats
    }

    pub fn backoff(&self) -> &BackoffSchedule {
        &self.backoff
    }

    /// Decide whether a reconnected device may rejoin `session`.
    ///
    /// On `Granted` the session member is re-activated and its gap
    /// recorded; attempts are counted against the session-scoped cap
    /// in every case.
    pub fn evaluate_rejoin(
        &self,
        session: &mut Session,
        device_id: &str,
        now_ms: i64,
    ) -> RejoinOutcome {
        if session.phase().is_terminal() || session.member(device_id).is_none() {
            return RejoinOutcome::PermanentlyDenied;
        }

        let attempt = session.count_resync_attempt(device_id);
        if attempt > self.max_resync_attempts {
            info!(device = device_id, attempt, "rejoin permanently denied: resync cap");
            return RejoinOutcome::PermanentlyDenied;
        }

        let member_state = session
            .member(device_id)
            .map(|m| m.state)
            .unwrap_or(MemberState::NotStarted);

        match (session.phase(), member_state) {
            // Devices dropped at arming never started; there is
            // nothing to resume into.
            (_, MemberState::NotStarted) => RejoinOutcome::PermanentlyDenied,

            (SessionPhase::Recording, MemberState::Failed) => {
                if session.rejoin(device_id, now_ms).is_err() {
                    return RejoinOutcome::TemporarilyDenied { attempt };
                }
                let elapsed_ms = session
                    .started_at_ms()
                    .map(|s| now_ms - s)
                    .unwrap_or(0);
                RejoinOutcome::Granted {
                    session_id: session.id().to_string(),
                    elapsed_ms,
                }
            }

            // Still active: nothing to do, but not an error.
            (SessionPhase::Recording, MemberState::Active) => {
                RejoinOutcome::TemporarilyDenied { attempt }
            }

            // Mid-barrier or winding down: ask again later.
            _ => RejoinOutcome::TemporarilyDenied { attempt },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
