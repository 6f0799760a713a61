//! Multi-method discovery bus
//!
//! Runs the SSDP, mDNS and port-scan discoverers concurrently under one
//! shared deadline, merges their output into a single deduplicated device
//! stream keyed by `(ip, port)`, and reports per-method statistics.
//!
//! Late description-XML enrichment keeps arriving after the deadline on a
//! separate update channel; those updates are merged into the retained
//! registry and re-published as `DeviceUpdated` events. That is defined
//! behavior, not a race - only a run-level stop silences them.

pub mod mdns;
pub mod portscan;
pub mod ssdp;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BlastEvent, SharedBus};
use crate::config::DiscoveryConfig;
use crate::device::{
    Device, DeviceKey, DiscoveryMethod, DiscoveryMethodStats, DEFAULT_CONTROL_URL,
    META_VENDOR_HEURISTIC,
};

/// Channel depth for device/update streams.
const CHANNEL_CAPACITY: usize = 64;
/// Grace period for discoverer tasks to acknowledge the deadline cut.
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Late enrichment for an already-emitted device, delivered out-of-band
/// by the SSDP description fetch. Consumers merge by identity.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub key: DeviceKey,
    pub friendly_name: Option<String>,
    pub device_type: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub control_url: Option<String>,
    pub uuid: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl DeviceUpdate {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            friendly_name: None,
            device_type: None,
            manufacturer: None,
            model_name: None,
            control_url: None,
            uuid: None,
            metadata: HashMap::new(),
        }
    }
}

/// Everything a discoverer needs to run: where to emit, how to learn the
/// run is over.
pub struct DiscoveryContext {
    pub devices: mpsc::Sender<Device>,
    pub updates: mpsc::Sender<DeviceUpdate>,
    pub bus: SharedBus,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl DiscoveryContext {
    /// Time left before the shared deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// One discovery strategy. Implementations publish devices as they find
/// them and return when done or cancelled; a returned error marks the
/// method as failed for this run without affecting siblings.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn method(&self) -> DiscoveryMethod;

    async fn discover(&self, ctx: DiscoveryContext) -> Result<()>;
}

/// Generic-name detection policy. Names produced by our own heuristics
/// ("Sonos at 192.168.1.40") must lose to anything a device said about
/// itself; the marker list is configuration, not logic.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    markers: Vec<String>,
}

impl MergePolicy {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }

    pub fn is_generic(&self, name: &str) -> bool {
        name.is_empty() || self.markers.iter().any(|m| name.contains(m.as_str()))
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            markers: vec![" at ".to_string()],
        }
    }
}

/// Whether `incoming` should replace the core fields (name/type/
/// manufacturer/model) of `existing`. Method precedence first, then
/// non-generic beats generic within the same method.
fn should_replace_core(existing: &Device, incoming: &Device, policy: &MergePolicy) -> bool {
    let existing_rank = existing.discovery_method.precedence();
    let incoming_rank = incoming.discovery_method.precedence();
    if incoming_rank != existing_rank {
        return incoming_rank > existing_rank;
    }
    policy.is_generic(&existing.friendly_name) && !policy.is_generic(&incoming.friendly_name)
}

/// Merge `incoming` into `existing` per the bus rules. Metadata is always
/// unioned (incoming wins on conflict); core fields follow
/// `should_replace_core`; uuid and control URL backfill regardless.
pub fn merge_into(existing: &mut Device, incoming: Device, policy: &MergePolicy) {
    let replace_core = should_replace_core(existing, &incoming, policy);

    for (key, value) in &incoming.metadata {
        existing.metadata.insert(key.clone(), value.clone());
    }

    if replace_core {
        if !incoming.friendly_name.is_empty() {
            existing.friendly_name = incoming.friendly_name.clone();
        }
        if !incoming.device_type.is_empty() {
            existing.device_type = incoming.device_type.clone();
        }
        if !incoming.manufacturer.is_empty() {
            existing.manufacturer = incoming.manufacturer.clone();
            // A higher-precedence manufacturer is no longer a port guess
            if !incoming.metadata.contains_key(META_VENDOR_HEURISTIC) {
                existing.metadata.remove(META_VENDOR_HEURISTIC);
            }
        }
        if !incoming.model_name.is_empty() {
            existing.model_name = incoming.model_name.clone();
        }
        existing.discovery_method = incoming.discovery_method;
    }

    if existing.uuid.is_empty() && !incoming.uuid.is_empty() {
        existing.uuid = incoming.uuid;
    }
    if existing.control_url == DEFAULT_CONTROL_URL && incoming.control_url != DEFAULT_CONTROL_URL {
        existing.control_url = incoming.control_url;
    }
}

/// Apply a description-XML update. The description is authoritative for
/// whatever fields it carries, so this overwrites unconditionally and is
/// idempotent by construction.
pub fn apply_update(existing: &mut Device, update: &DeviceUpdate) {
    if let Some(name) = &update.friendly_name {
        existing.friendly_name = name.clone();
    }
    if let Some(device_type) = &update.device_type {
        existing.device_type = device_type.clone();
    }
    if let Some(manufacturer) = &update.manufacturer {
        existing.manufacturer = manufacturer.clone();
        existing.metadata.remove(META_VENDOR_HEURISTIC);
    }
    if let Some(model) = &update.model_name {
        existing.model_name = model.clone();
    }
    if let Some(control_url) = &update.control_url {
        existing.control_url = control_url.clone();
    }
    if let Some(uuid) = &update.uuid {
        existing.uuid = uuid.clone();
    }
    for (key, value) in &update.metadata {
        existing.metadata.insert(key.clone(), value.clone());
    }
}

/// Final word on one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    /// Registry contents at the deadline (late updates keep refining the
    /// bus-published view afterwards).
    pub devices: Vec<Device>,
    pub stats: Vec<DiscoveryMethodStats>,
}

/// Handle on a running discovery: a merged device stream that closes at
/// the deadline, and a one-shot report with stats.
pub struct DiscoverySession {
    pub devices: ReceiverStream<Device>,
    pub report: oneshot::Receiver<DiscoveryReport>,
}

/// Per-discoverer completion record collected by the merge task.
struct MethodOutcome {
    method: DiscoveryMethod,
    elapsed_ms: u64,
    error: Option<String>,
}

/// Fans out to the configured discoverers and owns the merge step.
pub struct DiscoveryBus {
    bus: SharedBus,
    policy: MergePolicy,
    discoverers: Vec<Arc<dyn Discoverer>>,
}

impl DiscoveryBus {
    /// Standard bus with all three discovery methods.
    pub fn from_config(bus: SharedBus, config: &DiscoveryConfig) -> Self {
        let discoverers: Vec<Arc<dyn Discoverer>> = vec![
            Arc::new(ssdp::SsdpDiscoverer::new(config.ssdp_mx)),
            Arc::new(mdns::MdnsDiscoverer::new(config.mdns_service_types.clone())),
            Arc::new(portscan::PortScanDiscoverer::new(config.scan.clone())),
        ];
        Self {
            bus,
            policy: MergePolicy::new(config.generic_name_markers.clone()),
            discoverers,
        }
    }

    /// Bus over caller-supplied discoverers (fixtures in tests).
    pub fn with_discoverers(
        bus: SharedBus,
        policy: MergePolicy,
        discoverers: Vec<Arc<dyn Discoverer>>,
    ) -> Self {
        Self {
            bus,
            policy,
            discoverers,
        }
    }

    /// Start a discovery run with a hard deadline. The returned device
    /// stream closes at the deadline; enrichment updates continue on the
    /// bus until `run_token` is cancelled.
    pub fn start(&self, timeout: Duration, run_token: CancellationToken) -> DiscoverySession {
        let deadline = Instant::now() + timeout;
        let discover_token = run_token.child_token();

        let (device_tx, device_rx) = mpsc::channel::<Device>(CHANNEL_CAPACITY);
        let (update_tx, update_rx) = mpsc::channel::<DeviceUpdate>(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<Device>(CHANNEL_CAPACITY);
        let (report_tx, report_rx) = oneshot::channel::<DiscoveryReport>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<MethodOutcome>(self.discoverers.len().max(1));

        info!(
            "Discovery starting: {} method(s), deadline in {:?}",
            self.discoverers.len(),
            timeout
        );

        for discoverer in &self.discoverers {
            let ctx = DiscoveryContext {
                devices: device_tx.clone(),
                updates: update_tx.clone(),
                bus: self.bus.clone(),
                cancel: discover_token.clone(),
                deadline,
            };
            let discoverer = discoverer.clone();
            let outcome_tx = outcome_tx.clone();
            let token = discover_token.clone();

            tokio::spawn(async move {
                let method = discoverer.method();
                let started = Instant::now();
                let result = tokio::select! {
                    result = discoverer.discover(ctx) => result,
                    _ = token.cancelled() => Ok(()),
                };
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let error = match result {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("{} discovery failed: {:#}", method, e);
                        Some(format!("{:#}", e))
                    }
                };
                let _ = outcome_tx
                    .send(MethodOutcome {
                        method,
                        elapsed_ms,
                        error,
                    })
                    .await;
            });
        }
        // Merge task holds the only remaining senders
        drop(device_tx);
        drop(outcome_tx);

        let bus = self.bus.clone();
        let policy = self.policy.clone();
        let expected = self.discoverers.len();

        tokio::spawn(Self::run_merge(
            bus,
            policy,
            deadline,
            discover_token,
            run_token,
            device_rx,
            update_rx,
            out_tx,
            report_tx,
            outcome_rx,
            expected,
        ));
        // update_tx is dropped here; discoverer-spawned fetch tasks keep
        // their own clones alive until enrichment settles

        DiscoverySession {
            devices: ReceiverStream::new(out_rx),
            report: report_rx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_merge(
        bus: SharedBus,
        policy: MergePolicy,
        deadline: Instant,
        discover_token: CancellationToken,
        run_token: CancellationToken,
        mut device_rx: mpsc::Receiver<Device>,
        mut update_rx: mpsc::Receiver<DeviceUpdate>,
        out_tx: mpsc::Sender<Device>,
        report_tx: oneshot::Sender<DiscoveryReport>,
        mut outcome_rx: mpsc::Receiver<MethodOutcome>,
        expected_outcomes: usize,
    ) {
        let mut registry: HashMap<DeviceKey, Device> = HashMap::new();
        let mut first_attribution: HashMap<DiscoveryMethod, usize> = HashMap::new();
        let mut outcomes: Vec<MethodOutcome> = Vec::new();
        let mut devices_open = true;
        let mut updates_open = true;
        let mut outcomes_open = true;

        // Phase 1: merge until the deadline (or stop, or all methods done)
        loop {
            if !devices_open && (outcomes.len() >= expected_outcomes || !outcomes_open) {
                debug!("All discoverers completed before deadline");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Discovery deadline reached");
                    break;
                }
                _ = run_token.cancelled() => {
                    debug!("Discovery stopped before deadline");
                    break;
                }
                device = device_rx.recv(), if devices_open => {
                    match device {
                        Some(device) => {
                            let merged = Self::absorb_device(
                                &mut registry,
                                &mut first_attribution,
                                &policy,
                                &bus,
                                device,
                            );
                            // Re-emit the chosen record downstream
                            let _ = out_tx.send(merged).await;
                        }
                        None => devices_open = false,
                    }
                }
                outcome = outcome_rx.recv(), if outcomes_open && outcomes.len() < expected_outcomes => {
                    match outcome {
                        Some(outcome) => outcomes.push(outcome),
                        None => outcomes_open = false,
                    }
                }
                update = update_rx.recv(), if updates_open => {
                    match update {
                        Some(update) => {
                            if let Some(merged) =
                                Self::absorb_update(&mut registry, &bus, &update)
                            {
                                let _ = out_tx.send(merged).await;
                            }
                        }
                        None => updates_open = false,
                    }
                }
            }
        }

        // Cut off in-flight discoverer work
        discover_token.cancel();
        drop(out_tx);

        // Collect stragglers, bounded by a short grace period
        let grace = Instant::now() + JOIN_GRACE;
        while outcomes_open && outcomes.len() < expected_outcomes {
            match tokio::time::timeout_at(grace, outcome_rx.recv()).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => outcomes_open = false,
                Err(_) => {
                    warn!("Discoverer did not acknowledge deadline within grace period");
                    break;
                }
            }
        }

        let stats: Vec<DiscoveryMethodStats> = outcomes
            .into_iter()
            .map(|outcome| {
                let mut entry = DiscoveryMethodStats::new(outcome.method);
                entry.elapsed_ms = outcome.elapsed_ms;
                entry.error = outcome.error;
                entry.devices_found =
                    first_attribution.get(&outcome.method).copied().unwrap_or(0);
                entry
            })
            .collect();

        let report = DiscoveryReport {
            devices: registry.values().cloned().collect(),
            stats,
        };
        info!(
            "Discovery complete: {} device(s), {} method outcome(s)",
            report.devices.len(),
            report.stats.len()
        );
        let _ = report_tx.send(report);

        // Phase 2: keep merging late enrichment until the run ends
        loop {
            tokio::select! {
                _ = run_token.cancelled() => {
                    debug!("Run over, discarding further enrichment updates");
                    break;
                }
                update = update_rx.recv() => {
                    match update {
                        Some(update) => {
                            Self::absorb_update(&mut registry, &bus, &update);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Merge one incoming device into the registry, publish, and return
    /// the merged record for downstream emission.
    fn absorb_device(
        registry: &mut HashMap<DeviceKey, Device>,
        first_attribution: &mut HashMap<DiscoveryMethod, usize>,
        policy: &MergePolicy,
        bus: &SharedBus,
        device: Device,
    ) -> Device {
        let key = device.key();
        match registry.get_mut(&key) {
            Some(existing) => {
                merge_into(existing, device, policy);
                let merged = existing.clone();
                bus.publish(BlastEvent::DeviceUpdated {
                    device: merged.clone(),
                });
                merged
            }
            None => {
                *first_attribution.entry(device.discovery_method).or_insert(0) += 1;
                debug!(
                    "Discovered {} via {} ({})",
                    key, device.discovery_method, device.friendly_name
                );
                registry.insert(key, device.clone());
                bus.publish(BlastEvent::DeviceDiscovered {
                    device: device.clone(),
                });
                device
            }
        }
    }

    /// Merge one enrichment update. Updates for identities we never saw
    /// are dropped (the description fetch outlived its device).
    fn absorb_update(
        registry: &mut HashMap<DeviceKey, Device>,
        bus: &SharedBus,
        update: &DeviceUpdate,
    ) -> Option<Device> {
        let existing = registry.get_mut(&update.key)?;
        apply_update(existing, update);
        let merged = existing.clone();
        bus.publish(BlastEvent::DeviceUpdated {
            device: merged.clone(),
        });
        Some(merged)
    }
}
