//! SSDP discoverer - UDP multicast M-SEARCH for UPnP renderers
//!
//! Sends M-SEARCH to 239.255.255.250:1900 (MediaRenderer URN first, then
//! an ssdp:all sweep for devices that only answer the wildcard) and parses
//! the unicast responses. The LOCATION host:port is the provisional
//! identity; the description XML behind it is fetched in spawned tasks and
//! delivered as out-of-band `DeviceUpdate`s, possibly after the discovery
//! deadline. Devices whose fetch fails stay discovered with heuristic
//! defaults.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use quick_xml::de::from_str as xml_from_str;
use reqwest::Client;
use serde::Deserialize;
use ssdp_client::SearchTarget;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::{BlastEvent, SharedBus};
use crate::device::{Device, DeviceKey, DiscoveryMethod};
use crate::discovery::{DeviceUpdate, Discoverer, DiscoveryContext};

const MEDIA_RENDERER_URN: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";
/// Per-search receive window; clamped to the remaining deadline.
const SEARCH_WINDOW: Duration = Duration::from_secs(3);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Description-XML fetch counters, for progress bars only.
struct FetchProgress {
    in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl FetchProgress {
    fn started(&self, bus: &SharedBus) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.publish(bus);
    }

    fn finished(&self, bus: &SharedBus) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.publish(bus);
    }

    fn publish(&self, bus: &SharedBus) {
        bus.publish(BlastEvent::XmlFetchProgress {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        });
    }
}

pub struct SsdpDiscoverer {
    mx: usize,
    http: Client,
    progress: Arc<FetchProgress>,
}

impl SsdpDiscoverer {
    pub fn new(mx: usize) -> Self {
        Self {
            mx,
            http: Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            progress: Arc::new(FetchProgress {
                in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
        }
    }

    async fn search_target(
        &self,
        target: &SearchTarget,
        ctx: &DiscoveryContext,
        seen: &mut std::collections::HashSet<DeviceKey>,
    ) -> Result<()> {
        let window = SEARCH_WINDOW.min(ctx.remaining());
        if window.is_zero() {
            return Ok(());
        }

        let responses = ssdp_client::search(target, window, self.mx, None).await?;
        futures::pin_mut!(responses);

        while let Some(response) = responses.next().await {
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!("SSDP response error: {}", e);
                    continue;
                }
            };

            let location = response.location().to_string();
            let Some(key) = key_from_location(&location) else {
                debug!("SSDP response with unparseable LOCATION: {}", location);
                continue;
            };

            // Devices answer once per search type; suppress duplicates by
            // provisional identity before emission
            if !seen.insert(key.clone()) {
                continue;
            }

            let mut device = Device::new(key.ip.clone(), key.port, DiscoveryMethod::Ssdp);
            device.device_type = response.search_target().to_string();
            if let Some(uuid) = uuid_from_usn(response.usn()) {
                device.uuid = uuid;
            }
            device
                .metadata
                .insert("ssdp.location".to_string(), location.clone());
            device
                .metadata
                .insert("ssdp.st".to_string(), response.search_target().to_string());
            device
                .metadata
                .insert("ssdp.usn".to_string(), response.usn().to_string());
            device
                .metadata
                .insert("ssdp.server".to_string(), response.server().to_string());

            if ctx.devices.send(device).await.is_err() {
                // Merge side is gone, stop producing
                return Ok(());
            }

            self.spawn_description_fetch(ctx, key, location);
        }

        Ok(())
    }

    /// Fetch the device description asynchronously. The result does not
    /// re-enter the discovery stream; it goes out on the update channel,
    /// possibly after the deadline.
    fn spawn_description_fetch(&self, ctx: &DiscoveryContext, key: DeviceKey, location: String) {
        let http = self.http.clone();
        let updates = ctx.updates.clone();
        let bus = ctx.bus.clone();
        let progress = self.progress.clone();

        tokio::spawn(async move {
            progress.started(&bus);
            match fetch_description(&http, &location).await {
                Ok(xml) => match parse_description(&xml, &location, key.clone()) {
                    Ok(update) => {
                        if updates.send(update).await.is_err() {
                            debug!("Update channel closed, dropping enrichment for {}", key);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse device description for {}: {:#}", key, e);
                    }
                },
                Err(e) => {
                    warn!("Failed to fetch device description for {}: {:#}", key, e);
                }
            }
            progress.finished(&bus);
        });
    }
}

#[async_trait]
impl Discoverer for SsdpDiscoverer {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Ssdp
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<()> {
        let renderer_urn = MEDIA_RENDERER_URN
            .parse()
            .map(SearchTarget::URN)
            .map_err(|e| anyhow::anyhow!("invalid search URN: {}", e))?;
        let targets = [renderer_urn, SearchTarget::All];

        let mut seen = std::collections::HashSet::new();
        let mut last_error = None;
        let mut any_search_succeeded = false;

        for target in &targets {
            if ctx.cancel.is_cancelled() || ctx.remaining().is_zero() {
                break;
            }
            match self.search_target(target, &ctx, &mut seen).await {
                Ok(()) => any_search_succeeded = true,
                Err(e) => {
                    warn!("SSDP search for {} failed: {:#}", target, e);
                    last_error = Some(e);
                }
            }
        }

        match (any_search_succeeded, last_error) {
            // Could not even open the multicast socket: the method is out
            // for this run, siblings continue
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Provisional identity from a LOCATION header.
fn key_from_location(location: &str) -> Option<DeviceKey> {
    let url = url::Url::parse(location).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(80);
    Some(DeviceKey::new(host, port))
}

/// Extract the uuid from a USN like `uuid:abc::urn:schemas-upnp-org:...`.
fn uuid_from_usn(usn: &str) -> Option<String> {
    match usn.split("::").next() {
        Some(s) if s.starts_with("uuid:") => Some(s.trim_start_matches("uuid:").to_string()),
        _ => None,
    }
}

/// Scheme://host:port prefix for resolving relative control URLs.
fn base_url(location: &str) -> Result<String> {
    let url = url::Url::parse(location)?;
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    Ok(format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or("localhost"),
        port
    ))
}

fn join_control_url(base: &str, control: &str) -> String {
    if control.starts_with("http://") || control.starts_with("https://") {
        control.to_string()
    } else if control.starts_with('/') {
        format!("{}{}", base, control)
    } else {
        format!("{}/{}", base, control)
    }
}

async fn fetch_description(http: &Client, location: &str) -> Result<String> {
    let response = http.get(location).send().await?;
    Ok(response.text().await?)
}

/// Parse a UPnP device description into an enrichment update.
fn parse_description(xml: &str, location: &str, key: DeviceKey) -> Result<DeviceUpdate> {
    #[derive(Deserialize)]
    struct Root {
        device: DeviceDesc,
    }

    #[derive(Deserialize)]
    struct DeviceDesc {
        #[serde(rename = "deviceType")]
        device_type: Option<String>,
        #[serde(rename = "friendlyName")]
        friendly_name: Option<String>,
        manufacturer: Option<String>,
        #[serde(rename = "modelName")]
        model_name: Option<String>,
        #[serde(rename = "modelNumber")]
        model_number: Option<String>,
        #[serde(rename = "UDN")]
        udn: Option<String>,
        #[serde(rename = "serviceList")]
        service_list: Option<ServiceList>,
    }

    #[derive(Deserialize)]
    struct ServiceList {
        service: Vec<ServiceDesc>,
    }

    #[derive(Deserialize)]
    struct ServiceDesc {
        #[serde(rename = "serviceType")]
        service_type: String,
        #[serde(rename = "controlURL")]
        control_url: Option<String>,
    }

    let root: Root = xml_from_str(xml)?;
    let base = base_url(location)?;

    let mut update = DeviceUpdate::new(key);
    update.friendly_name = root.device.friendly_name;
    update.device_type = root.device.device_type;
    update.manufacturer = root.device.manufacturer;
    update.model_name = root.device.model_name;
    update.uuid = root
        .device
        .udn
        .map(|udn| udn.trim_start_matches("uuid:").to_string());

    if let Some(number) = root.device.model_number {
        update
            .metadata
            .insert("xml.model_number".to_string(), number);
    }

    if let Some(services) = root.device.service_list {
        for service in services.service {
            if service.service_type.contains("AVTransport") {
                if let Some(path) = service.control_url {
                    update.control_url = Some(join_control_url(&base, &path));
                }
            }
        }
    }

    Ok(update)
}
