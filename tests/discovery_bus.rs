//! Discovery bus integration tests
//!
//! Exercise the fan-out/merge pipeline with scripted discoverers: dedup
//! and precedence invariants, metadata union, deadline behavior, method
//! failure isolation and late enrichment delivery.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use clipblast::bus::{create_bus, BlastEvent};
use clipblast::device::{Device, DeviceKey, DiscoveryMethod, META_VENDOR_HEURISTIC};
use clipblast::discovery::{
    DeviceUpdate, Discoverer, DiscoveryBus, DiscoveryContext, MergePolicy,
};

/// Emits devices and updates on a fixed schedule, then completes (or
/// hangs until cancelled, or fails immediately).
struct ScriptedDiscoverer {
    method: DiscoveryMethod,
    emissions: Vec<(Duration, Device)>,
    late_updates: Vec<(Duration, DeviceUpdate)>,
    hang: bool,
    fail: bool,
}

impl ScriptedDiscoverer {
    fn emitting(method: DiscoveryMethod, emissions: Vec<(Duration, Device)>) -> Arc<Self> {
        Arc::new(Self {
            method,
            emissions,
            late_updates: Vec::new(),
            hang: false,
            fail: false,
        })
    }

    fn hanging(method: DiscoveryMethod) -> Arc<Self> {
        Arc::new(Self {
            method,
            emissions: Vec::new(),
            late_updates: Vec::new(),
            hang: true,
            fail: false,
        })
    }

    fn failing(method: DiscoveryMethod) -> Arc<Self> {
        Arc::new(Self {
            method,
            emissions: Vec::new(),
            late_updates: Vec::new(),
            hang: false,
            fail: true,
        })
    }
}

#[async_trait]
impl Discoverer for ScriptedDiscoverer {
    fn method(&self) -> DiscoveryMethod {
        self.method
    }

    async fn discover(&self, ctx: DiscoveryContext) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("could not bind multicast socket (scripted)");
        }

        let start = tokio::time::Instant::now();

        if !self.late_updates.is_empty() {
            // Updates outlive the discoverer, like real description fetches
            let updates = ctx.updates.clone();
            let script = self.late_updates.clone();
            tokio::spawn(async move {
                for (delay, update) in script {
                    tokio::time::sleep_until(start + delay).await;
                    if updates.send(update).await.is_err() {
                        break;
                    }
                }
            });
        }

        for (delay, device) in self.emissions.clone() {
            tokio::time::sleep_until(start + delay).await;
            if ctx.devices.send(device).await.is_err() {
                return Ok(());
            }
        }

        if self.hang {
            ctx.cancel.cancelled().await;
        }
        Ok(())
    }
}

fn ssdp_device(ip: &str, port: u16, name: &str) -> Device {
    let mut device = Device::new(ip, port, DiscoveryMethod::Ssdp);
    device.friendly_name = name.to_string();
    device.manufacturer = "Sonos, Inc.".to_string();
    device
        .metadata
        .insert("ssdp.server".to_string(), "Linux UPnP/1.0 Sonos/57".to_string());
    device
}

fn scan_device(ip: &str, port: u16) -> Device {
    let mut device = Device::new(ip, port, DiscoveryMethod::PortScan);
    device.friendly_name = format!("Sonos at {}", ip);
    device.manufacturer = "Sonos".to_string();
    device
        .metadata
        .insert(META_VENDOR_HEURISTIC.to_string(), "true".to_string());
    device
        .metadata
        .insert("portscan.port".to_string(), port.to_string());
    device
}

/// Drain the merged stream until it closes, returning every emission.
async fn collect_stream(session: &mut clipblast::discovery::DiscoverySession) -> Vec<Device> {
    let mut emissions = Vec::new();
    while let Some(device) = session.devices.next().await {
        emissions.push(device);
    }
    emissions
}

#[tokio::test]
async fn ssdp_and_port_scan_merge_into_one_device() {
    // One SSDP device at t=100ms and one port-scan hit for the same
    // ip:port (generic name) at t=1500ms, 2s deadline.
    let bus = create_bus();
    let discovery = DiscoveryBus::with_discoverers(
        bus,
        MergePolicy::default(),
        vec![
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::Ssdp,
                vec![(
                    Duration::from_millis(100),
                    ssdp_device("192.168.1.40", 1400, "Living Room"),
                )],
            ),
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::PortScan,
                vec![(Duration::from_millis(1500), scan_device("192.168.1.40", 1400))],
            ),
        ],
    );

    let started = std::time::Instant::now();
    let mut session = discovery.start(Duration::from_millis(2000), CancellationToken::new());
    let emissions = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(2600));

    // Two emissions (initial + re-merge), one logical device
    assert_eq!(emissions.len(), 2);
    assert!(emissions
        .iter()
        .all(|d| d.key() == DeviceKey::new("192.168.1.40", 1400)));
    assert_eq!(report.devices.len(), 1);

    let merged = &report.devices[0];
    // SSDP core fields won even though the scan arrived later
    assert_eq!(merged.friendly_name, "Living Room");
    assert_eq!(merged.manufacturer, "Sonos, Inc.");
    assert_eq!(merged.discovery_method, DiscoveryMethod::Ssdp);
    // Metadata is the union of both methods' maps
    assert_eq!(merged.metadata["ssdp.server"], "Linux UPnP/1.0 Sonos/57");
    assert_eq!(merged.metadata["portscan.port"], "1400");

    // The device is attributed to the method that found it first
    let ssdp_stats = report
        .stats
        .iter()
        .find(|s| s.method == DiscoveryMethod::Ssdp)
        .unwrap();
    assert_eq!(ssdp_stats.devices_found, 1);
    let scan_stats = report
        .stats
        .iter()
        .find(|s| s.method == DiscoveryMethod::PortScan)
        .unwrap();
    assert_eq!(scan_stats.devices_found, 0);
}

#[tokio::test]
async fn precedence_holds_regardless_of_arrival_order() {
    // Port scan first, SSDP second: merged core fields still SSDP's
    let bus = create_bus();
    let discovery = DiscoveryBus::with_discoverers(
        bus,
        MergePolicy::default(),
        vec![
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::PortScan,
                vec![(Duration::from_millis(50), scan_device("192.168.1.40", 1400))],
            ),
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::Ssdp,
                vec![(
                    Duration::from_millis(150),
                    ssdp_device("192.168.1.40", 1400, "Living Room"),
                )],
            ),
        ],
    );

    let mut session = discovery.start(Duration::from_millis(600), CancellationToken::new());
    let _ = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();

    assert_eq!(report.devices.len(), 1);
    assert_eq!(report.devices[0].friendly_name, "Living Room");
    assert_eq!(report.devices[0].manufacturer, "Sonos, Inc.");
    // The heuristic marker was cleared by the authoritative manufacturer
    assert!(!report.devices[0]
        .metadata
        .contains_key(META_VENDOR_HEURISTIC));
}

#[tokio::test]
async fn same_identity_metadata_union_across_many_records() {
    let key_ip = "10.0.0.7";
    let mut first = Device::new(key_ip, 8009, DiscoveryMethod::Mdns);
    first
        .metadata
        .insert("mdns.fullname".to_string(), "TV._googlecast._tcp.local.".to_string());
    let mut second = Device::new(key_ip, 8009, DiscoveryMethod::Mdns);
    second
        .metadata
        .insert("mdns.id".to_string(), "abc123".to_string());
    let mut third = Device::new(key_ip, 8009, DiscoveryMethod::PortScan);
    third
        .metadata
        .insert("portscan.port".to_string(), "8009".to_string());

    let bus = create_bus();
    let discovery = DiscoveryBus::with_discoverers(
        bus,
        MergePolicy::default(),
        vec![
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::Mdns,
                vec![
                    (Duration::from_millis(20), first),
                    (Duration::from_millis(60), second),
                ],
            ),
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::PortScan,
                vec![(Duration::from_millis(40), third)],
            ),
        ],
    );

    let mut session = discovery.start(Duration::from_millis(400), CancellationToken::new());
    let _ = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();

    // Exactly one logical record with the union of all metadata maps
    assert_eq!(report.devices.len(), 1);
    let merged = &report.devices[0];
    assert_eq!(merged.metadata["mdns.fullname"], "TV._googlecast._tcp.local.");
    assert_eq!(merged.metadata["mdns.id"], "abc123");
    assert_eq!(merged.metadata["portscan.port"], "8009");
}

#[tokio::test]
async fn deadline_is_respected_with_hanging_discoverer() {
    let bus = create_bus();
    let discovery = DiscoveryBus::with_discoverers(
        bus,
        MergePolicy::default(),
        vec![ScriptedDiscoverer::hanging(DiscoveryMethod::Ssdp)],
    );

    let started = std::time::Instant::now();
    let mut session = discovery.start(Duration::from_millis(300), CancellationToken::new());
    let emissions = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();
    let elapsed = started.elapsed();

    assert!(emissions.is_empty());
    assert!(report.devices.is_empty());
    // Control returns within timeout + scheduling slack, zero devices or not
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);

    let stats = &report.stats[0];
    assert_eq!(stats.method, DiscoveryMethod::Ssdp);
    assert_eq!(stats.devices_found, 0);
    assert!(stats.error.is_none());
}

#[tokio::test]
async fn failed_method_does_not_take_down_siblings() {
    let bus = create_bus();
    let discovery = DiscoveryBus::with_discoverers(
        bus,
        MergePolicy::default(),
        vec![
            ScriptedDiscoverer::failing(DiscoveryMethod::Mdns),
            ScriptedDiscoverer::emitting(
                DiscoveryMethod::Ssdp,
                vec![(
                    Duration::from_millis(50),
                    ssdp_device("192.168.1.41", 49152, "Kitchen"),
                )],
            ),
        ],
    );

    let mut session = discovery.start(Duration::from_millis(400), CancellationToken::new());
    let emissions = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();

    assert_eq!(emissions.len(), 1);
    assert_eq!(report.devices.len(), 1);

    let mdns_stats = report
        .stats
        .iter()
        .find(|s| s.method == DiscoveryMethod::Mdns)
        .unwrap();
    assert!(mdns_stats.error.as_deref().unwrap().contains("multicast"));
    let ssdp_stats = report
        .stats
        .iter()
        .find(|s| s.method == DiscoveryMethod::Ssdp)
        .unwrap();
    assert_eq!(ssdp_stats.devices_found, 1);
}

#[tokio::test]
async fn late_updates_merge_after_deadline_and_are_idempotent() {
    let key = DeviceKey::new("192.168.1.40", 1400);
    let mut update = DeviceUpdate::new(key.clone());
    update.friendly_name = Some("Living Room".to_string());
    update.manufacturer = Some("Sonos, Inc.".to_string());
    update.control_url = Some("http://192.168.1.40:1400/MediaRenderer/AVTransport/Control".to_string());
    update
        .metadata
        .insert("xml.model_number".to_string(), "S18".to_string());

    let discoverer = Arc::new(ScriptedDiscoverer {
        method: DiscoveryMethod::Ssdp,
        emissions: vec![(
            Duration::from_millis(50),
            Device::new("192.168.1.40", 1400, DiscoveryMethod::Ssdp),
        )],
        // Same enrichment delivered twice, both after the 300ms deadline
        late_updates: vec![
            (Duration::from_millis(700), update.clone()),
            (Duration::from_millis(800), update),
        ],
        hang: false,
        fail: false,
    });

    let bus = create_bus();
    let mut events = bus.subscribe();
    let run_token = CancellationToken::new();
    let discovery =
        DiscoveryBus::with_discoverers(bus, MergePolicy::default(), vec![discoverer]);

    let mut session = discovery.start(Duration::from_millis(300), run_token.clone());
    let emissions = collect_stream(&mut session).await;
    let report = session.report.await.unwrap();

    // At the deadline the device is still heuristic
    assert_eq!(emissions.len(), 1);
    assert_eq!(report.devices[0].friendly_name, "Renderer at 192.168.1.40");

    // Both late updates surface as DeviceUpdated events with the same
    // final merged record (applying twice == applying once)
    let mut updated = Vec::new();
    while updated.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for late updates")
            .unwrap();
        if let BlastEvent::DeviceUpdated { device } = event {
            if device.friendly_name == "Living Room" {
                updated.push(device);
            }
        }
    }

    let first = serde_json::to_value(&updated[0]).unwrap();
    let second = serde_json::to_value(&updated[1]).unwrap();
    assert_eq!(first, second);
    assert_eq!(updated[1].manufacturer, "Sonos, Inc.");
    assert_eq!(
        updated[1].control_url,
        "http://192.168.1.40:1400/MediaRenderer/AVTransport/Control"
    );
    assert_eq!(updated[1].metadata["xml.model_number"], "S18");

    // A stopped run discards anything still in flight
    run_token.cancel();
}
