//! Blast orchestrator - sequences serving, discovery and control
//!
//! A single observable state machine: IDLE -> SERVING -> DISCOVERING ->
//! CONTROLLING -> SUMMARIZING -> DONE, with `stop` forcing IDLE from any
//! non-idle state and a discover-only variant that returns to IDLE
//! directly so a later blast can reuse what it found. Control attempts
//! run under a shared concurrency limiter; a running metrics snapshot is
//! published on every device-found and control-completion event.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BlastEvent, SharedBus};
use crate::config::{Config, ControlConfig};
use crate::control::ControlClient;
use crate::device::{
    Device, DeviceKey, DeviceStatus, DiscoveryMethod, DiscoveryMethodStats,
};
use crate::discovery::{DiscoveryBus, DiscoveryReport};
use crate::metrics::{MetricsRecorder, MetricsSnapshot, SuccessRatio};

/// How long to wait for the discovery report after the device stream
/// closes.
const REPORT_GRACE: Duration = Duration::from_secs(2);

/// Orchestrator phases. Transitions are monotonic forward, except
/// DONE -> IDLE on reset and any state -> IDLE on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlastState {
    Idle,
    Serving,
    Discovering,
    Controlling,
    Summarizing,
    Done,
}

impl BlastState {
    pub fn as_str(self) -> &'static str {
        match self {
            BlastState::Idle => "IDLE",
            BlastState::Serving => "SERVING",
            BlastState::Discovering => "DISCOVERING",
            BlastState::Controlling => "CONTROLLING",
            BlastState::Summarizing => "SUMMARIZING",
            BlastState::Done => "DONE",
        }
    }
}

impl fmt::Display for BlastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level failures. Device-level failures are data (`ControlResult`),
/// never errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no media URL configured for the control phase")]
    NoMediaUrl,
    #[error("media source failed to start: {0}")]
    MediaSource(String),
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("run stopped")]
    Stopped,
}

/// The external media-serving collaborator. The orchestrator only needs a
/// URL that stays valid while the source runs.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    async fn start(&self) -> Result<String, RunError>;
    async fn stop(&self);
}

/// Media source backed by a preconfigured URL (the serving component runs
/// out-of-process). Missing configuration is a run-level failure before
/// any control attempt is made.
pub struct ConfiguredMediaSource {
    url: Option<String>,
}

impl ConfiguredMediaSource {
    pub fn new(url: Option<String>) -> Self {
        Self { url }
    }
}

#[async_trait::async_trait]
impl MediaSource for ConfiguredMediaSource {
    async fn start(&self) -> Result<String, RunError> {
        self.url.clone().ok_or(RunError::NoMediaUrl)
    }

    async fn stop(&self) {}
}

/// Terminal summary produced on SUMMARIZING.
#[derive(Debug, Clone, Serialize)]
pub struct BlastSummary {
    pub devices_found: usize,
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: Option<f64>,
    pub per_manufacturer: HashMap<String, SuccessRatio>,
    pub per_method: Vec<DiscoveryMethodStats>,
    pub most_effective_method: Option<DiscoveryMethod>,
    pub elapsed_ms: u64,
}

impl BlastSummary {
    fn from_snapshot(snapshot: &MetricsSnapshot, elapsed_ms: u64) -> Self {
        Self {
            devices_found: snapshot.devices_found,
            attempts: snapshot.attempts,
            successes: snapshot.successes,
            failures: snapshot.failures,
            success_rate: snapshot.success_rate,
            per_manufacturer: snapshot.per_manufacturer.clone(),
            per_method: snapshot.per_method.clone(),
            most_effective_method: snapshot.most_effective_method,
            elapsed_ms,
        }
    }
}

struct OrchState {
    phase: BlastState,
    run_token: CancellationToken,
    /// Devices retained across discover-only -> blast. Cleared on reset.
    devices: HashMap<DeviceKey, Device>,
}

pub struct BlastOrchestrator {
    bus: SharedBus,
    discovery: DiscoveryBus,
    control: ControlClient,
    media: Arc<dyn MediaSource>,
    discovery_timeout: Duration,
    control_cfg: ControlConfig,
    state: Arc<RwLock<OrchState>>,
}

impl BlastOrchestrator {
    pub fn new(bus: SharedBus, config: &Config, media: Arc<dyn MediaSource>) -> Self {
        Self::with_parts(
            bus.clone(),
            DiscoveryBus::from_config(bus, &config.discovery),
            ControlClient::from_config(&config.control),
            media,
            config.control.clone(),
            Duration::from_millis(config.discovery.timeout_ms),
        )
    }

    /// Assemble from explicit parts (fixtures in tests).
    pub fn with_parts(
        bus: SharedBus,
        discovery: DiscoveryBus,
        control: ControlClient,
        media: Arc<dyn MediaSource>,
        control_cfg: ControlConfig,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            discovery,
            control,
            media,
            discovery_timeout,
            control_cfg,
            state: Arc::new(RwLock::new(OrchState {
                phase: BlastState::Idle,
                run_token: CancellationToken::new(),
                devices: HashMap::new(),
            })),
        }
    }

    pub async fn current_state(&self) -> BlastState {
        self.state.read().await.phase
    }

    /// Devices retained from the last discovery (empty after reset).
    pub async fn known_devices(&self) -> Vec<Device> {
        self.state.read().await.devices.values().cloned().collect()
    }

    /// Force IDLE from any state, cancelling in-flight discovery and
    /// control work and discarding pending results.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if state.phase == BlastState::Idle {
            return;
        }
        info!("Stop requested from state {}", state.phase);
        self.bus.publish(BlastEvent::ShuttingDown {
            reason: Some("stop requested".to_string()),
        });
        state.run_token.cancel();
        state.phase = BlastState::Idle;
        drop(state);
        self.bus.publish(BlastEvent::PhaseChanged {
            state: BlastState::Idle,
        });
    }

    /// Explicit DONE -> IDLE, clearing retained devices.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.devices.clear();
        if state.phase == BlastState::Done {
            state.phase = BlastState::Idle;
            drop(state);
            self.bus.publish(BlastEvent::PhaseChanged {
                state: BlastState::Idle,
            });
        }
    }

    /// Full blast: serve, discover (or reuse), control fan-out, summary.
    pub async fn run_blast(&self) -> Result<BlastSummary, RunError> {
        let run_token = self.begin_run(BlastState::Serving).await?;
        let mut metrics = MetricsRecorder::new(self.bus.clone());
        let run_started = Instant::now();

        match self
            .blast_phases(&run_token, &mut metrics, run_started)
            .await
        {
            Ok(summary) => Ok(summary),
            Err(RunError::Stopped) => {
                // stop() already forced IDLE; re-assert it in case a
                // transition raced the stop between phases
                self.transition(BlastState::Idle, &mut metrics).await;
                Err(RunError::Stopped)
            }
            Err(e) => {
                // Run-level failure: back to IDLE, no partial control work
                warn!("Blast run failed: {}", e);
                self.transition(BlastState::Idle, &mut metrics).await;
                Err(e)
            }
        }
    }

    /// Discovery without control. Ends in IDLE (not DONE) so a subsequent
    /// blast can reuse the devices without re-discovering.
    pub async fn run_discover_only(&self) -> Result<Vec<Device>, RunError> {
        let run_token = self.begin_run(BlastState::Discovering).await?;
        let mut metrics = MetricsRecorder::new(self.bus.clone());

        self.transition(BlastState::Discovering, &mut metrics).await;
        self.discovery_phase(&run_token, &mut metrics).await?;

        let devices = self.known_devices().await;
        self.transition(BlastState::Idle, &mut metrics).await;
        info!("Discover-only complete: {} device(s) retained", devices.len());
        Ok(devices)
    }

    /// Claim the machine for a new run. The first phase is set under the
    /// lock so a concurrent caller cannot also pass the busy check.
    async fn begin_run(&self, first: BlastState) -> Result<CancellationToken, RunError> {
        let mut state = self.state.write().await;
        if !matches!(state.phase, BlastState::Idle | BlastState::Done) {
            return Err(RunError::AlreadyRunning);
        }
        state.phase = first;
        // Fresh token for this run (previous token may be cancelled)
        state.run_token = CancellationToken::new();
        Ok(state.run_token.clone())
    }

    async fn transition(&self, next: BlastState, metrics: &mut MetricsRecorder) {
        {
            let mut state = self.state.write().await;
            state.phase = next;
        }
        metrics.set_state(next);
        self.bus.publish(BlastEvent::PhaseChanged { state: next });
        info!("Blast state -> {}", next);
    }

    async fn blast_phases(
        &self,
        run_token: &CancellationToken,
        metrics: &mut MetricsRecorder,
        run_started: Instant,
    ) -> Result<BlastSummary, RunError> {
        // SERVING
        self.transition(BlastState::Serving, metrics).await;
        let serve_started = Instant::now();
        let media_url = tokio::select! {
            result = self.media.start() => result?,
            _ = run_token.cancelled() => return Err(RunError::Stopped),
        };
        metrics.record_serve_started(serve_started.elapsed().as_millis() as u64);
        info!("Media source ready: {}", media_url);

        // DISCOVERING, unless a discover-only run already filled the map
        let reuse = self.control_cfg.reuse_discovered
            && !self.state.read().await.devices.is_empty();
        if reuse {
            let count = self.state.read().await.devices.len();
            info!("Reusing {} previously discovered device(s)", count);
            for device in self.known_devices().await {
                metrics.record_device_found(&device);
            }
        } else {
            self.transition(BlastState::Discovering, metrics).await;
            self.discovery_phase(run_token, metrics).await?;
        }

        // CONTROLLING
        self.transition(BlastState::Controlling, metrics).await;
        self.control_phase(run_token, metrics, &media_url).await?;

        // SUMMARIZING
        self.transition(BlastState::Summarizing, metrics).await;
        let snapshot = metrics.finalize();
        let summary =
            BlastSummary::from_snapshot(&snapshot, run_started.elapsed().as_millis() as u64);

        self.transition(BlastState::Done, metrics).await;
        self.media.stop().await;
        Ok(summary)
    }

    /// Consume the merged discovery stream into the retained device map.
    async fn discovery_phase(
        &self,
        run_token: &CancellationToken,
        metrics: &mut MetricsRecorder,
    ) -> Result<(), RunError> {
        let discovery_started = Instant::now();
        let mut session = self
            .discovery
            .start(self.discovery_timeout, run_token.clone());

        loop {
            tokio::select! {
                _ = run_token.cancelled() => return Err(RunError::Stopped),
                device = session.devices.next() => {
                    let Some(device) = device else { break };
                    let key = device.key();
                    let is_new = {
                        let mut state = self.state.write().await;
                        state.devices.insert(key.clone(), device.clone()).is_none()
                    };
                    if is_new {
                        metrics.record_device_found(&device);
                        self.bus.publish(BlastEvent::DeviceStatusChanged {
                            device: key,
                            status: DeviceStatus::Discovered,
                        });
                    }
                }
            }
        }

        if run_token.is_cancelled() {
            return Err(RunError::Stopped);
        }

        let report = match tokio::time::timeout(REPORT_GRACE, session.report).await {
            Ok(Ok(report)) => report,
            _ => {
                debug!("Discovery report not delivered; continuing without stats");
                DiscoveryReport {
                    devices: Vec::new(),
                    stats: Vec::new(),
                }
            }
        };
        metrics.record_discovery(
            discovery_started.elapsed().as_millis() as u64,
            report.stats,
        );
        Ok(())
    }

    /// Fan control attempts out under the shared concurrency limiter and
    /// aggregate their results as they settle.
    async fn control_phase(
        &self,
        run_token: &CancellationToken,
        metrics: &mut MetricsRecorder,
        media_url: &str,
    ) -> Result<(), RunError> {
        let devices = self.known_devices().await;
        if devices.is_empty() {
            // Zero devices found is a valid, non-crashing outcome
            info!("No devices to control");
            return Ok(());
        }

        let limiter = Arc::new(Semaphore::new(self.control_cfg.concurrency.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel(devices.len());

        info!(
            "Controlling {} device(s), concurrency {}",
            devices.len(),
            self.control_cfg.concurrency.max(1)
        );

        for device in devices {
            let limiter = limiter.clone();
            let client = self.control.clone();
            let bus = self.bus.clone();
            let token = run_token.clone();
            let media_url = media_url.to_string();
            let result_tx = result_tx.clone();

            tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = limiter.acquire_owned() => permit,
                    _ = token.cancelled() => return,
                };
                let Ok(_permit) = permit else { return };

                bus.publish(BlastEvent::DeviceStatusChanged {
                    device: device.key(),
                    status: DeviceStatus::Connecting,
                });

                // push_clip is internally time-bounded; cancellation just
                // abandons the attempt and discards its result
                let result = tokio::select! {
                    result = client.push_clip(&device, &media_url) => result,
                    _ = token.cancelled() => return,
                };

                bus.publish(BlastEvent::DeviceStatusChanged {
                    device: device.key(),
                    status: if result.succeeded {
                        DeviceStatus::Success
                    } else {
                        DeviceStatus::Failed
                    },
                });
                let _ = result_tx.send((device, result)).await;
            });
        }
        drop(result_tx);

        while let Some((device, result)) = result_rx.recv().await {
            debug!(
                "Control {} for {}: {}",
                if result.succeeded { "ok" } else { "failed" },
                result.device,
                result.error_detail.as_deref().unwrap_or("clip playing")
            );
            metrics.record_control(&device, &result);
            self.bus
                .publish(BlastEvent::ControlCompleted { result });
        }

        if run_token.is_cancelled() {
            return Err(RunError::Stopped);
        }
        Ok(())
    }
}
