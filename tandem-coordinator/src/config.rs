//! Configuration for the coordinator service.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tandem_core::CoreConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Session timing (barriers, grace windows).
    pub timing: TimingConfig,
    /// Clock synchronization.
    pub clock: ClockConfig,
    /// Fault handling and reconnection.
    pub fault: FaultConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind the device listener on.
    pub listen_host: String,
    /// TCP port devices connect to.
    pub listen_port: u16,
}

/// Session timing configuration, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for a command acknowledgement.
    pub ack_timeout_ms: u64,
    /// Lead time between issuing start and the common start instant.
    pub start_guard_ms: u64,
    /// Group deadline for start acknowledgements.
    pub start_grace_ms: u64,
    /// How long to wait for final device manifests.
    pub finalize_timeout_ms: u64,
}

/// Clock synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Interval between probe rounds, milliseconds.
    pub probe_interval_ms: u64,
    /// Probes with a round trip above this are discarded, milliseconds.
    pub rtt_ceiling_ms: u64,
}

/// Fault handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Expected heartbeat cadence, milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a device is flagged.
    pub heartbeat_miss_limit: u32,
    /// First reconnection backoff delay, milliseconds.
    pub reconnect_base_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub reconnect_cap_ms: u64,
    /// Jitter fraction applied to backoff delays.
    pub reconnect_jitter: f64,
    /// Per-device resync attempts allowed within one session.
    pub max_resync_attempts: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            clock: ClockConfig::default(),
            fault: FaultConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            listen_host: core.listen_host,
            listen_port: core.listen_port,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            ack_timeout_ms: core.ack_timeout_ms,
            start_guard_ms: core.start_guard_ms,
            start_grace_ms: core.start_grace_ms,
            finalize_timeout_ms: core.finalize_timeout_ms,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            probe_interval_ms: core.clock_probe_interval_ms,
            rtt_ceiling_ms: core.rtt_ceiling_ms,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            heartbeat_interval_ms: core.heartbeat_interval_ms,
            heartbeat_miss_limit: core.heartbeat_miss_limit,
            reconnect_base_ms: core.reconnect_base_ms,
            reconnect_cap_ms: core.reconnect_cap_ms,
            reconnect_jitter: core.reconnect_jitter,
            max_resync_attempts: core.max_resync_attempts,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CoordinatorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Flatten the sectioned file schema into the core's config.
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            listen_host: self.network.listen_host.clone(),
            listen_port: self.network.listen_port,
            heartbeat_interval_ms: self.fault.heartbeat_interval_ms,
            heartbeat_miss_limit: self.fault.heartbeat_miss_limit,
            ack_timeout_ms: self.timing.ack_timeout_ms,
            start_guard_ms: self.timing.start_guard_ms,
            start_grace_ms: self.timing.start_grace_ms,
            finalize_timeout_ms: self.timing.finalize_timeout_ms,
            clock_probe_interval_ms: self.clock.probe_interval_ms,
            rtt_ceiling_ms: self.clock.rtt_ceiling_ms,
            reconnect_base_ms: self.fault.reconnect_base_ms,
            reconnect_cap_ms: self.fault.reconnect_cap_ms,
            reconnect_jitter: self.fault.reconnect_jitter,
            max_resync_attempts: self.fault.max_resync_attempts,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
