//! Device registry: the coordinator's view of every device it has
//! ever seen.
//!
//! Devices are created on first successful handshake and never
//! deleted — a lost device is marked [`DeviceStatus::Disconnected`]
//! so sessions that reference it keep a stable record. Iteration is
//! in insertion order for deterministic logging and tests.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::clock::OffsetEstimate;
use crate::message::Capability;
use crate::net::ConnectionSender;

// ── DeviceStatus ─────────────────────────────────────────────────

/// Coordinator-side device liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    #[default]
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Connected => write!(f, "connected"),
            DeviceStatus::Disconnected => write!(f, "disconnected"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

// ── Device ───────────────────────────────────────────────────────

/// Everything the coordinator knows about one device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable identifier, chosen by the device.
    pub id: String,
    /// Capabilities declared at registration.
    pub capabilities: Vec<Capability>,
    /// Current liveness.
    pub status: DeviceStatus,
    /// Latest accepted clock-offset estimate, if any reliable probe
    /// ever completed.
    pub offset: Option<OffsetEstimate>,
    /// When the last heartbeat arrived.
    pub last_heartbeat: Option<Instant>,
    /// Write handle to the device's live connection.
    sender: Option<ConnectionSender>,
}

impl Device {
    /// Whether a reliable clock sample has ever been obtained.
    ///
    /// Devices without one run with an assumed zero offset and the
    /// degraded guarantee is recorded in session metadata.
    pub fn sync_confirmed(&self) -> bool {
        self.offset.is_some()
    }

    /// The live write handle, if connected.
    pub fn sender(&self) -> Option<&ConnectionSender> {
        self.sender.as_ref()
    }
}

// ── DeviceRegistry ───────────────────────────────────────────────

/// Insertion-ordered registry of known devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    /// Insertion order of device ids.
    order: Vec<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, idempotently.
    ///
    /// Re-registering an already-known id replaces its connection and
    /// capability declaration but preserves its history (offset
    /// estimate, heartbeat record, insertion position).
    pub fn register(
        &mut self,
        device_id: &str,
        capabilities: Vec<Capability>,
        sender: ConnectionSender,
    ) -> &Device {
        match self.devices.get_mut(device_id) {
            Some(existing) => {
                debug!(device = device_id, "re-registering known device");
                existing.capabilities = capabilities;
                existing.sender = Some(sender);
                existing.status = DeviceStatus::Connected;
            }
            None => {
                debug!(device = device_id, ?capabilities, "registering new device");
                self.order.push(device_id.to_string());
                self.devices.insert(
                    device_id.to_string(),
                    Device {
                        id: device_id.to_string(),
                        capabilities,
                        status: DeviceStatus::Connected,
                        offset: None,
                        last_heartbeat: None,
                        sender: Some(sender),
                    },
                );
            }
        }
        &self.devices[device_id]
    }

    /// Update a device's liveness. Unknown ids are logged, not an
    /// error — registration races are expected in discovery.
    pub fn mark_status(&mut self, device_id: &str, status: DeviceStatus) {
        match self.devices.get_mut(device_id) {
            Some(device) => {
                if device.status != status {
                    debug!(device = device_id, from = %device.status, to = %status, "device status change");
                }
                device.status = status;
                if status != DeviceStatus::Connected {
                    device.sender = None;
                }
            }
            None => warn!(device = device_id, "status update for unknown device"),
        }
    }

    /// Record a heartbeat arrival time.
    pub fn record_heartbeat(&mut self, device_id: &str, at: Instant) {
        match self.devices.get_mut(device_id) {
            Some(device) => device.last_heartbeat = Some(at),
            None => warn!(device = device_id, "heartbeat from unknown device"),
        }
    }

    /// Store an accepted clock-offset estimate.
    pub fn set_offset(&mut self, device_id: &str, estimate: OffsetEstimate) {
        match self.devices.get_mut(device_id) {
            Some(device) => device.offset = Some(estimate),
            None => warn!(device = device_id, "offset update for unknown device"),
        }
    }

    pub fn lookup(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Write handle for a device, if it is currently connected.
    pub fn sender_for(&self, device_id: &str) -> Option<ConnectionSender> {
        self.devices
            .get(device_id)
            .and_then(|d| d.sender.clone())
    }

    /// All known devices in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Device> {
        self.order.iter().filter_map(|id| self.devices.get(id))
    }

    /// Ids of devices currently connected, in insertion order.
    pub fn connected_ids(&self) -> Vec<String> {
        self.all()
            .filter(|d| d.status == DeviceStatus::Connected)
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────
