//! Shared value types for discovered renderers and control outcomes.
//!
//! Everything that crosses a component boundary (discoverers, merge bus,
//! control client, orchestrator) is defined here so the rest of the crate
//! agrees on one vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Control path assumed until a device description tells us better.
pub const DEFAULT_CONTROL_URL: &str = "/AVTransport/control";

/// How a device was found. Precedence matters during merge: SSDP results
/// carry real device descriptions, mDNS carries advertised names, a port
/// scan only proves something is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMethod {
    Ssdp,
    Mdns,
    PortScan,
}

impl DiscoveryMethod {
    /// Merge precedence, higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            DiscoveryMethod::Ssdp => 3,
            DiscoveryMethod::Mdns => 2,
            DiscoveryMethod::PortScan => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMethod::Ssdp => "SSDP",
            DiscoveryMethod::Mdns => "MDNS",
            DiscoveryMethod::PortScan => "PORT_SCAN",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a device for deduplication. Always `(ip, port)` - uuids are
/// missing from everything except a successful SSDP description fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub ip: String,
    pub port: u16,
}

impl DeviceKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Manufacturer classification. Port-scan and name-substring guesses are
/// explicitly `Heuristic`; devices we know nothing about stay `Unknown`
/// instead of being forced into a named bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name")]
pub enum DeviceClass {
    Named(String),
    Heuristic(String),
    Unknown,
}

impl DeviceClass {
    /// Label used for per-manufacturer breakdowns.
    pub fn label(&self) -> &str {
        match self {
            DeviceClass::Named(name) | DeviceClass::Heuristic(name) => name,
            DeviceClass::Unknown => "Unknown",
        }
    }
}

/// Metadata key marking `manufacturer` as a guess rather than a value read
/// from a device description or advertisement.
pub const META_VENDOR_HEURISTIC: &str = "vendor.heuristic";

/// A discovered renderer. Created by a discoverer, refined by the merge
/// step and by late description-XML updates; dropped when the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ip_address: String,
    pub port: u16,
    /// Device type URN, empty until something advertises one.
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    /// Path on the device where AVTransport SOAP actions are POSTed.
    pub control_url: String,
    /// Stable identity when known (SSDP USN), empty otherwise.
    pub uuid: String,
    pub discovery_method: DiscoveryMethod,
    /// Enrichment fields, unioned across discovery methods.
    pub metadata: HashMap<String, String>,
}

impl Device {
    /// Minimal device as a discoverer first sees it.
    pub fn new(ip: impl Into<String>, port: u16, method: DiscoveryMethod) -> Self {
        let ip = ip.into();
        Self {
            friendly_name: format!("Renderer at {}", ip),
            ip_address: ip,
            port,
            device_type: String::new(),
            manufacturer: String::new(),
            model_name: String::new(),
            control_url: DEFAULT_CONTROL_URL.to_string(),
            uuid: String::new(),
            discovery_method: method,
            metadata: HashMap::new(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.ip_address.clone(), self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip_address, self.port)
    }

    /// Full URL for AVTransport control. Tolerates enrichment having stored
    /// either an absolute URL or a bare path.
    pub fn control_endpoint(&self) -> String {
        if self.control_url.starts_with("http://") || self.control_url.starts_with("https://") {
            self.control_url.clone()
        } else if self.control_url.starts_with('/') {
            format!("{}{}", self.base_url(), self.control_url)
        } else {
            format!("{}/{}", self.base_url(), self.control_url)
        }
    }

    /// Manufacturer classification for breakdowns.
    pub fn classify(&self) -> DeviceClass {
        if self.manufacturer.is_empty() {
            return DeviceClass::Unknown;
        }
        if self.metadata.contains_key(META_VENDOR_HEURISTIC) {
            DeviceClass::Heuristic(self.manufacturer.clone())
        } else {
            DeviceClass::Named(self.manufacturer.clone())
        }
    }
}

/// Per-device status transitions published for list rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Discovered,
    Connecting,
    Success,
    Failed,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Discovered => "DISCOVERED",
            DeviceStatus::Connecting => "CONNECTING",
            DeviceStatus::Success => "SUCCESS",
            DeviceStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of one control attempt. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResult {
    pub device: DeviceKey,
    pub succeeded: bool,
    pub duration_ms: u64,
    /// Present iff the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ControlResult {
    pub fn ok(device: DeviceKey, duration_ms: u64) -> Self {
        Self {
            device,
            succeeded: true,
            duration_ms,
            error_detail: None,
        }
    }

    pub fn failed(device: DeviceKey, duration_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            device,
            succeeded: false,
            duration_ms,
            error_detail: Some(detail.into()),
        }
    }
}

/// Per-method counters for one discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMethodStats {
    pub method: DiscoveryMethod,
    /// Devices first attributed to this method by the merge step.
    pub devices_found: usize,
    pub elapsed_ms: u64,
    /// Resource-class failure that took this method out of the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiscoveryMethodStats {
    pub fn new(method: DiscoveryMethod) -> Self {
        Self {
            method,
            devices_found: 0,
            elapsed_ms: 0,
            error: None,
        }
    }
}
