//! Per-device network quality sampling.
//!
//! Fed from ack round trips and timeouts. Purely advisory: the
//! classification drives adaptive behavior such as the suggested
//! preview frame rate, never correctness decisions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Samples kept per device.
const WINDOW: usize = 20;

/// Link quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Good,
    Degraded,
    Poor,
}

impl LinkQuality {
    /// Suggested preview frame rate for this link class.
    pub fn preview_fps(&self) -> u32 {
        match self {
            LinkQuality::Good => 15,
            LinkQuality::Degraded => 5,
            LinkQuality::Poor => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sample {
    Latency(Duration),
    Lost,
}

/// Sliding-window latency/loss monitor for every device.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    windows: HashMap<String, VecDeque<Sample>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, device_id: &str, sample: Sample) {
        let window = self.windows.entry(device_id.to_string()).or_default();
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    /// Record a measured round trip (an answered command or probe).
    pub fn record_latency(&mut self, device_id: &str, rtt: Duration) {
        self.push(device_id, Sample::Latency(rtt));
    }

    /// Record a lost exchange (ack timeout).
    pub fn record_loss(&mut self, device_id: &str) {
        self.push(device_id, Sample::Lost);
    }

    /// Classify a device's link from its recent window.
    ///
    /// A device with no samples yet is assumed `Good` — adaptation
    /// kicks in once evidence accumulates.
    pub fn classify(&self, device_id: &str) -> LinkQuality {
        let window = match self.windows.get(device_id) {
            Some(w) if !w.is_empty() => w,
            _ => return LinkQuality::Good,
        };

        let total = window.len() as f64;
        let lost = window
            .iter()
            .filter(|s| matches!(s, Sample::Lost))
            .count() as f64;
        let loss_rate = lost / total;

        let latencies: Vec<Duration> = window
            .iter()
            .filter_map(|s| match s {
                Sample::Latency(d) => Some(*d),
                Sample::Lost => None,
            })
            .collect();
        let avg_ms = if latencies.is_empty() {
            // All losses.
            f64::INFINITY
        } else {
            latencies.iter().map(|d| d.as_secs_f64() * 1_000.0).sum::<f64>()
                / latencies.len() as f64
        };

        if loss_rate > 0.25 || avg_ms > 250.0 {
            LinkQuality::Poor
        } else if loss_rate > 0.05 || avg_ms > 100.0 {
            LinkQuality::Degraded
        } else {
            LinkQuality::Good
        }
    }

    /// Drop a device's window (device disconnected for good).
    pub fn forget(&mut self, device_id: &str) {
        self.windows.remove(device_id);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_is_good() {
        let monitor = QualityMonitor::new();
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Good);
    }

    #[test]
    fn low_latency_no_loss_is_good() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..10 {
            monitor.record_latency("phone_1", Duration::from_millis(20));
        }
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Good);
        assert_eq!(monitor.classify("phone_1").preview_fps(), 15);
    }

    #[test]
    fn elevated_latency_is_degraded() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..10 {
            monitor.record_latency("phone_1", Duration::from_millis(150));
        }
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Degraded);
    }

    #[test]
    fn heavy_loss_is_poor() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..6 {
            monitor.record_latency("phone_1", Duration::from_millis(20));
        }
        for _ in 0..4 {
            monitor.record_loss("phone_1");
        }
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Poor);
        assert_eq!(monitor.classify("phone_1").preview_fps(), 1);
    }

    #[test]
    fn window_slides_old_samples_out() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..WINDOW {
            monitor.record_loss("phone_1");
        }
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Poor);

        // A full window of healthy samples displaces the losses.
        for _ in 0..WINDOW {
            monitor.record_latency("phone_1", Duration::from_millis(10));
        }
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Good);
    }

    #[test]
    fn forget_resets_to_good() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..WINDOW {
            monitor.record_loss("phone_1");
        }
        monitor.forget("phone_1");
        assert_eq!(monitor.classify("phone_1"), LinkQuality::Good);
    }
}
