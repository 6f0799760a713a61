//! Run metrics accumulator and immutable snapshot publishing.
//!
//! A single writer (the orchestrator) owns a `MetricsRecorder`; every
//! mutation publishes a cloned `MetricsSnapshot` on the bus so observers
//! never read shared mutable state. Finalizing computes the aggregate
//! ratios and freezes the snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bus::{BlastEvent, SharedBus};
use crate::device::{ControlResult, Device, DeviceKey, DiscoveryMethod, DiscoveryMethodStats};
use crate::orchestrator::BlastState;

/// One control attempt, retained for per-device timing views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAttempt {
    pub device: DeviceKey,
    pub friendly_name: String,
    pub manufacturer: String,
    pub duration_ms: u64,
    pub succeeded: bool,
}

/// Attempt/success counters for one manufacturer label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuccessRatio {
    pub attempts: usize,
    pub successes: usize,
}

impl SuccessRatio {
    pub fn ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Cumulative counters for one blast run. Published as immutable copies;
/// `finalized` flips once on SUMMARIZING and the snapshot never changes
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub state: BlastState,
    pub started_at: DateTime<Utc>,
    /// Time from start until the serving component reported ready.
    pub serve_start_ms: Option<u64>,
    /// Wall-clock spent in the discovery phase.
    pub discovery_ms: Option<u64>,
    pub devices_found: usize,
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    /// Set at finalization.
    pub success_rate: Option<f64>,
    pub per_device: Vec<DeviceAttempt>,
    pub per_manufacturer: HashMap<String, SuccessRatio>,
    pub per_method: Vec<DiscoveryMethodStats>,
    pub most_effective_method: Option<DiscoveryMethod>,
    pub finalized: bool,
}

impl MetricsSnapshot {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: BlastState::Idle,
            started_at,
            serve_start_ms: None,
            discovery_ms: None,
            devices_found: 0,
            attempts: 0,
            successes: 0,
            failures: 0,
            success_rate: None,
            per_device: Vec::new(),
            per_manufacturer: HashMap::new(),
            per_method: Vec::new(),
            most_effective_method: None,
            finalized: false,
        }
    }
}

/// Single-writer accumulator. Owned by the orchestrator; never shared.
pub struct MetricsRecorder {
    bus: SharedBus,
    current: MetricsSnapshot,
}

impl MetricsRecorder {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            bus,
            current: MetricsSnapshot::new(Utc::now()),
        }
    }

    /// Copy-on-read view of the running counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.current.clone()
    }

    /// Reset all counters for a fresh run.
    pub fn reset(&mut self) {
        self.current = MetricsSnapshot::new(Utc::now());
    }

    pub fn set_state(&mut self, state: BlastState) {
        self.current.state = state;
    }

    pub fn record_serve_started(&mut self, elapsed_ms: u64) {
        self.current.serve_start_ms = Some(elapsed_ms);
        self.publish();
    }

    /// A new identity arrived from the discovery bus.
    pub fn record_device_found(&mut self, _device: &Device) {
        self.current.devices_found += 1;
        self.publish();
    }

    /// One control attempt settled.
    pub fn record_control(&mut self, device: &Device, result: &ControlResult) {
        let label = device.classify().label().to_string();

        self.current.attempts += 1;
        if result.succeeded {
            self.current.successes += 1;
        } else {
            self.current.failures += 1;
        }

        self.current.per_device.push(DeviceAttempt {
            device: result.device.clone(),
            friendly_name: device.friendly_name.clone(),
            manufacturer: label.clone(),
            duration_ms: result.duration_ms,
            succeeded: result.succeeded,
        });

        let entry = self.current.per_manufacturer.entry(label).or_default();
        entry.attempts += 1;
        if result.succeeded {
            entry.successes += 1;
        }

        self.publish();
    }

    /// Discovery phase ended; attach per-method stats.
    pub fn record_discovery(&mut self, elapsed_ms: u64, stats: Vec<DiscoveryMethodStats>) {
        self.current.discovery_ms = Some(elapsed_ms);
        self.current.per_method = stats;
        self.publish();
    }

    /// Compute aggregates and freeze. Returns the final snapshot.
    pub fn finalize(&mut self) -> MetricsSnapshot {
        self.current.success_rate = if self.current.attempts == 0 {
            None
        } else {
            Some(self.current.successes as f64 / self.current.attempts as f64)
        };
        self.current.most_effective_method = most_effective(&self.current.per_method);
        self.current.finalized = true;
        self.publish();
        self.current.clone()
    }

    fn publish(&self) {
        self.bus.publish(BlastEvent::MetricsUpdated {
            snapshot: self.current.clone(),
        });
    }
}

/// Method that first attributed the most devices; ties break toward the
/// one that finished sooner. `None` when nothing was found at all.
fn most_effective(stats: &[DiscoveryMethodStats]) -> Option<DiscoveryMethod> {
    stats
        .iter()
        .filter(|s| s.devices_found > 0)
        .min_by(|a, b| {
            b.devices_found
                .cmp(&a.devices_found)
                .then(a.elapsed_ms.cmp(&b.elapsed_ms))
        })
        .map(|s| s.method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::device::DiscoveryMethod;

    fn device(ip: &str, port: u16) -> Device {
        Device::new(ip, port, DiscoveryMethod::Ssdp)
    }

    #[test]
    fn test_success_ratio() {
        let ratio = SuccessRatio {
            attempts: 4,
            successes: 3,
        };
        assert!((ratio.ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(SuccessRatio::default().ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_counters_and_finalize() {
        let bus = create_bus();
        let mut recorder = MetricsRecorder::new(bus);

        let dev_a = device("10.0.0.1", 1400);
        let dev_b = device("10.0.0.2", 8009);

        recorder.record_device_found(&dev_a);
        recorder.record_device_found(&dev_b);
        recorder.record_control(&dev_a, &ControlResult::ok(dev_a.key(), 120));
        recorder.record_control(&dev_b, &ControlResult::failed(dev_b.key(), 5000, "timeout"));

        let snapshot = recorder.finalize();
        assert_eq!(snapshot.devices_found, 2);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.success_rate, Some(0.5));
        assert!(snapshot.finalized);
        assert_eq!(snapshot.per_device.len(), 2);
        // Both devices are Unknown class
        assert_eq!(snapshot.per_manufacturer["Unknown"].attempts, 2);
        assert_eq!(snapshot.per_manufacturer["Unknown"].successes, 1);
    }

    #[test]
    fn test_zero_attempts_has_no_rate() {
        let bus = create_bus();
        let mut recorder = MetricsRecorder::new(bus);
        let snapshot = recorder.finalize();
        assert_eq!(snapshot.success_rate, None);
        assert_eq!(snapshot.most_effective_method, None);
    }

    #[test]
    fn test_most_effective_prefers_count_then_speed() {
        let mut ssdp = DiscoveryMethodStats::new(DiscoveryMethod::Ssdp);
        ssdp.devices_found = 2;
        ssdp.elapsed_ms = 3000;
        let mut mdns = DiscoveryMethodStats::new(DiscoveryMethod::Mdns);
        mdns.devices_found = 2;
        mdns.elapsed_ms = 1500;
        let mut scan = DiscoveryMethodStats::new(DiscoveryMethod::PortScan);
        scan.devices_found = 5;
        scan.elapsed_ms = 8000;

        assert_eq!(
            most_effective(&[ssdp.clone(), mdns.clone(), scan]),
            Some(DiscoveryMethod::PortScan)
        );
        // Tie on count falls back to elapsed
        assert_eq!(most_effective(&[ssdp, mdns]), Some(DiscoveryMethod::Mdns));
    }

    #[tokio::test]
    async fn test_every_mutation_publishes_snapshot() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let mut recorder = MetricsRecorder::new(bus);

        let dev = device("10.0.0.1", 1400);
        recorder.record_device_found(&dev);
        recorder.record_control(&dev, &ControlResult::ok(dev.key(), 90));

        let mut snapshots = 0;
        while let Ok(event) = rx.try_recv() {
            if let BlastEvent::MetricsUpdated { snapshot } = event {
                snapshots += 1;
                assert!(!snapshot.finalized);
            }
        }
        assert_eq!(snapshots, 2);
    }
}
