//! Event bus for inter-component communication
//!
//! Uses tokio::sync::broadcast for pub/sub pattern.
//! Events are typed and can carry payloads. Discoverers, the control
//! fan-out and the orchestrator publish here; progress UIs subscribe.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::device::{ControlResult, Device, DeviceKey, DeviceStatus};
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::BlastState;

/// Event types that can be published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BlastEvent {
    /// Orchestrator state machine transition
    PhaseChanged { state: BlastState },

    /// First (or re-merged) emission of a device during discovery
    DeviceDiscovered { device: Device },
    /// Late enrichment merged into an already-emitted device
    DeviceUpdated { device: Device },
    /// Per-device lifecycle for list rendering
    DeviceStatusChanged {
        device: DeviceKey,
        status: DeviceStatus,
    },
    /// Description-XML fetch counters, for progress bars only
    XmlFetchProgress { in_flight: usize, completed: usize },

    /// One control attempt settled
    ControlCompleted { result: ControlResult },
    /// Running metrics, published on every device-found and control event
    MetricsUpdated { snapshot: MetricsSnapshot },

    /// Run is being torn down
    ShuttingDown { reason: Option<String> },
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BlastEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create with default capacity (256 events)
    pub fn default() -> Self {
        Self::new(256)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: BlastEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<BlastEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
