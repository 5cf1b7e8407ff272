//! Per-device clock-offset estimation.
//!
//! For each probe the coordinator records its send instant, the device
//! echoes its local clock, and the offset is estimated as
//! `T_remote + RTT/2 - T_local_send`. Estimates are smoothed with an
//! exponentially-weighted moving average and a drift rate is derived
//! from successive estimates. Probes whose round trip exceeds the
//! configured ceiling are discarded outright — a single slow probe
//! must not corrupt the synchronized timeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

/// Smoothing factor for the offset EWMA. Higher reacts faster,
/// lower resists network noise.
const EWMA_ALPHA: f64 = 0.2;

/// Pending probes older than this are dropped as abandoned.
const PENDING_EXPIRY: Duration = Duration::from_secs(60);

// ── OffsetEstimate ───────────────────────────────────────────────

/// The smoothed clock model for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetEstimate {
    /// Estimated `remote - local` clock difference, milliseconds.
    pub offset_ms: f64,
    /// Rate of change of the offset, milliseconds per second.
    pub drift_ms_per_s: f64,
    /// Half-width of the confidence interval, milliseconds. Derived
    /// from the RTTs of accepted samples (the offset cannot be pinned
    /// down tighter than half the round trip).
    pub confidence_ms: f64,
    /// Number of accepted samples folded into this estimate.
    pub samples: u32,
}

// ── Probe bookkeeping ────────────────────────────────────────────

/// Verdict on one completed probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleVerdict {
    /// Sample folded into the estimate.
    Accepted(OffsetEstimate),
    /// Round trip exceeded the ceiling; sample discarded.
    RejectedRtt { rtt: Duration },
}

#[derive(Debug)]
struct PendingProbe {
    device_id: String,
    sent_wall_ms: i64,
    sent_at: Instant,
}

#[derive(Debug)]
struct EstimatorState {
    estimate: OffsetEstimate,
    last_update: Instant,
}

// ── ClockSync ────────────────────────────────────────────────────

/// Offset estimator for every known device.
#[derive(Debug)]
pub struct ClockSync {
    rtt_ceiling: Duration,
    estimates: HashMap<String, EstimatorState>,
    pending: HashMap<u64, PendingProbe>,
    next_probe_id: u64,
}

impl ClockSync {
    pub fn new(rtt_ceiling: Duration) -> Self {
        Self {
            rtt_ceiling,
            estimates: HashMap::new(),
            pending: HashMap::new(),
            next_probe_id: 1,
        }
    }

    /// Start a probe round trip for `device_id`.
    ///
    /// Returns the probe id to embed in the `sync_probe` message.
    pub fn begin_probe(&mut self, device_id: &str) -> u64 {
        let now = Instant::now();
        self.pending
            .retain(|_, p| now.duration_since(p.sent_at) < PENDING_EXPIRY);

        let probe_id = self.next_probe_id;
        self.next_probe_id += 1;
        self.pending.insert(
            probe_id,
            PendingProbe {
                device_id: device_id.to_string(),
                sent_wall_ms: Utc::now().timestamp_millis(),
                sent_at: now,
            },
        );
        probe_id
    }

    /// Complete a probe with the device's echoed local time.
    ///
    /// Returns `None` for unknown/expired probe ids (a late answer to
    /// a probe already abandoned), otherwise the owning device id and
    /// the verdict.
    pub fn complete_probe(
        &mut self,
        probe_id: u64,
        device_time_ms: i64,
    ) -> Option<(String, SampleVerdict)> {
        let probe = self.pending.remove(&probe_id)?;
        let rtt = probe.sent_at.elapsed();
        let verdict = self.record_sample(
            &probe.device_id,
            rtt,
            device_time_ms,
            probe.sent_wall_ms,
        );
        Some((probe.device_id, verdict))
    }

    /// Fold one raw sample into the device's estimate.
    ///
    /// `remote_ms` is the device's reported local clock, and
    /// `local_send_ms` the coordinator's wall clock at probe send.
    pub fn record_sample(
        &mut self,
        device_id: &str,
        rtt: Duration,
        remote_ms: i64,
        local_send_ms: i64,
    ) -> SampleVerdict {
        if rtt > self.rtt_ceiling {
            debug!(device = device_id, ?rtt, ceiling = ?self.rtt_ceiling, "probe rejected: rtt above ceiling");
            return SampleVerdict::RejectedRtt { rtt };
        }

        let half_rtt_ms = rtt.as_secs_f64() * 1_000.0 / 2.0;
        let raw_offset_ms = remote_ms as f64 + half_rtt_ms - local_send_ms as f64;
        let now = Instant::now();

        let updated = match self.estimates.get_mut(device_id) {
            Some(state) => {
                let prev_offset = state.estimate.offset_ms;
                let dt_s = now.duration_since(state.last_update).as_secs_f64();

                let est = &mut state.estimate;
                est.offset_ms += EWMA_ALPHA * (raw_offset_ms - est.offset_ms);
                est.confidence_ms += EWMA_ALPHA * (half_rtt_ms - est.confidence_ms);
                if dt_s > 0.0 {
                    let drift = (est.offset_ms - prev_offset) / dt_s;
                    est.drift_ms_per_s += EWMA_ALPHA * (drift - est.drift_ms_per_s);
                }
                est.samples += 1;
                state.last_update = now;
                state.estimate
            }
            None => {
                let estimate = OffsetEstimate {
                    offset_ms: raw_offset_ms,
                    drift_ms_per_s: 0.0,
                    confidence_ms: half_rtt_ms,
                    samples: 1,
                };
                self.estimates.insert(
                    device_id.to_string(),
                    EstimatorState {
                        estimate,
                        last_update: now,
                    },
                );
                estimate
            }
        };

        debug!(
            device = device_id,
            offset_ms = updated.offset_ms,
            confidence_ms = updated.confidence_ms,
            samples = updated.samples,
            "clock sample accepted"
        );
        SampleVerdict::Accepted(updated)
    }

    /// The offset to add to a coordinator wall-clock instant to get
    /// the device-local instant. Zero when no reliable sample exists
    /// (the caller must treat such devices as `sync_unconfirmed`).
    pub fn offset_for(&self, device_id: &str) -> i64 {
        self.estimates
            .get(device_id)
            .map(|s| s.estimate.offset_ms.round() as i64)
            .unwrap_or(0)
    }

    /// The full estimate, if any reliable sample has been obtained.
    pub fn estimate_for(&self, device_id: &str) -> Option<OffsetEstimate> {
        self.estimates.get(device_id).map(|s| s.estimate)
    }

    /// Whether at least one reliable sample exists for this device.
    pub fn is_confirmed(&self, device_id: &str) -> bool {
        self.estimates.contains_key(device_id)
    }

    /// Drop pending probes for a device that disconnected.
    pub fn abandon_probes_for(&mut self, device_id: &str) {
        self.pending.retain(|_, p| p.device_id != device_id);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_millis(200);

    #[test]
    fn sample_above_ceiling_is_rejected() {
        let mut clock = ClockSync::new(CEILING);
        let verdict =
            clock.record_sample("phone_1", Duration::from_millis(201), 1_000_000, 1_000_000);
        assert!(matches!(verdict, SampleVerdict::RejectedRtt { .. }));
        assert!(!clock.is_confirmed("phone_1"));
        assert_eq!(clock.offset_for("phone_1"), 0);
    }

    #[test]
    fn sample_at_ceiling_is_accepted() {
        let mut clock = ClockSync::new(CEILING);
        let verdict =
            clock.record_sample("phone_1", Duration::from_millis(200), 1_000_000, 1_000_000);
        assert!(matches!(verdict, SampleVerdict::Accepted(_)));
        assert!(clock.is_confirmed("phone_1"));
    }

    #[test]
    fn rejection_boundary_property() {
        // Synthetic samples straddling the ceiling: below accepted,
        // above rejected, estimate only ever built from accepted ones.
        let mut clock = ClockSync::new(CEILING);
        let mut accepted = 0;
        for rtt_ms in [10u64, 150, 199, 200, 201, 500, 40, 1_000] {
            let verdict = clock.record_sample(
                "phone_1",
                Duration::from_millis(rtt_ms),
                2_000_000,
                1_000_000,
            );
            match verdict {
                SampleVerdict::Accepted(est) => {
                    accepted += 1;
                    assert_eq!(est.samples, accepted);
                }
                SampleVerdict::RejectedRtt { rtt } => {
                    assert!(rtt > CEILING);
                }
            }
        }
        assert_eq!(accepted, 5);
    }

    #[test]
    fn offset_formula_first_sample() {
        let mut clock = ClockSync::new(CEILING);
        // Device clock 1000ms ahead, 100ms round trip:
        // offset = remote + rtt/2 - local_send = 1000 + 50.
        clock.record_sample("phone_1", Duration::from_millis(100), 2_000, 1_000);
        assert_eq!(clock.offset_for("phone_1"), 1_050);

        let est = clock.estimate_for("phone_1").unwrap();
        assert_eq!(est.confidence_ms, 50.0);
        assert_eq!(est.samples, 1);
    }

    #[test]
    fn ewma_smooths_toward_new_samples() {
        let mut clock = ClockSync::new(CEILING);
        clock.record_sample("phone_1", Duration::ZERO, 1_000, 0); // offset 1000
        clock.record_sample("phone_1", Duration::ZERO, 2_000, 0); // raw 2000

        let est = clock.estimate_for("phone_1").unwrap();
        // Moved a fraction of the way, not all of it.
        assert!(est.offset_ms > 1_000.0);
        assert!(est.offset_ms < 2_000.0);
        assert_eq!(est.samples, 2);
    }

    #[test]
    fn probe_roundtrip_bookkeeping() {
        let mut clock = ClockSync::new(Duration::from_secs(10));
        let probe_id = clock.begin_probe("phone_1");

        let (device, verdict) = clock
            .complete_probe(probe_id, Utc::now().timestamp_millis())
            .unwrap();
        assert_eq!(device, "phone_1");
        assert!(matches!(verdict, SampleVerdict::Accepted(_)));

        // Completing the same probe twice yields nothing.
        assert!(clock.complete_probe(probe_id, 0).is_none());
    }

    #[test]
    fn unknown_probe_id_is_ignored() {
        let mut clock = ClockSync::new(CEILING);
        assert!(clock.complete_probe(999, 123).is_none());
    }

    #[test]
    fn abandon_probes_on_disconnect() {
        let mut clock = ClockSync::new(CEILING);
        let probe_id = clock.begin_probe("phone_1");
        clock.abandon_probes_for("phone_1");
        assert!(clock.complete_probe(probe_id, 0).is_none());
    }
}
