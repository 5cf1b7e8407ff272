//! Configuration surface consumed by the coordination core.
//!
//! Every knob has a documented default; the coordinator binary loads
//! these from a TOML file and the defaults apply per-field via
//! `#[serde(default)]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Core timing and network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Address devices connect to.
    pub listen_host: String,
    /// Well-known coordinator port.
    pub listen_port: u16,

    /// Expected heartbeat interval per device, milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a device is declared
    /// disconnected.
    pub heartbeat_miss_limit: u32,

    /// How long to wait for command acknowledgements, milliseconds.
    pub ack_timeout_ms: u64,
    /// Lead time between issuing `start_record` and the scheduled
    /// capture instant, milliseconds.
    pub start_guard_ms: u64,
    /// Grace period for start-barrier acks before a device is demoted,
    /// milliseconds. A tunable, not a constant: size it to the worst
    /// RTT observed on the deployment network.
    pub start_grace_ms: u64,
    /// How long finalization waits for per-device manifests,
    /// milliseconds.
    pub finalize_timeout_ms: u64,

    /// Clock probe cadence per device, milliseconds.
    pub clock_probe_interval_ms: u64,
    /// Probes with a round-trip above this ceiling are discarded as
    /// too noisy to trust, milliseconds.
    pub rtt_ceiling_ms: u64,

    /// Reconnection backoff base delay, milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnection backoff cap, milliseconds.
    pub reconnect_cap_ms: u64,
    /// Jitter applied to each backoff delay, as a fraction (0.2 = ±20%).
    pub reconnect_jitter: f64,
    /// Session-scoped resync attempts before a device is permanently
    /// denied rejoin for that session.
    pub max_resync_attempts: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 9000,
            heartbeat_interval_ms: 5_000,
            heartbeat_miss_limit: 3,
            ack_timeout_ms: 10_000,
            start_guard_ms: 2_000,
            start_grace_ms: 5_000,
            finalize_timeout_ms: 10_000,
            clock_probe_interval_ms: 5_000,
            rtt_ceiling_ms: 200,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            reconnect_jitter: 0.2,
            max_resync_attempts: 3,
        }
    }
}

impl CoreConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence window after which a device counts as disconnected.
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * self.heartbeat_miss_limit as u64)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn start_guard(&self) -> Duration {
        Duration::from_millis(self.start_guard_ms)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn clock_probe_interval(&self) -> Duration {
        Duration::from_millis(self.clock_probe_interval_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_miss_limit, 3);
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.start_guard(), Duration::from_secs(2));
        assert_eq!(cfg.rtt_ceiling_ms, 200);
        assert_eq!(cfg.max_resync_attempts, 3);
    }

    #[test]
    fn heartbeat_window_is_interval_times_misses() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.heartbeat_window(), Duration::from_secs(15));
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"listen_port": 9100}"#).unwrap();
        assert_eq!(cfg.listen_port, 9100);
        assert_eq!(cfg.rtt_ceiling_ms, 200);
    }
}
