//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Clip URL handed to renderers. Supplied by the serving component;
    /// only valid while that component is running.
    #[serde(default)]
    pub media_url: Option<String>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Hard deadline for one discovery run.
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,

    /// MX value sent with M-SEARCH requests.
    #[serde(default = "default_ssdp_mx")]
    pub ssdp_mx: usize,

    /// DNS-SD service types to browse.
    #[serde(default = "default_mdns_service_types")]
    pub mdns_service_types: Vec<String>,

    /// Substrings marking a friendly name as heuristic. Policy data, not
    /// load-bearing logic - real device naming won't match any fixed list.
    #[serde(default = "default_generic_name_markers")]
    pub generic_name_markers: Vec<String>,

    #[serde(default)]
    pub scan: ScanConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            ssdp_mx: default_ssdp_mx(),
            mdns_service_types: default_mdns_service_types(),
            generic_name_markers: default_generic_name_markers(),
            scan: ScanConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Hosts to probe. When unset, the local /24 is derived from the
    /// default route interface.
    #[serde(default)]
    pub hosts: Option<Vec<String>>,

    /// Cap on concurrent sockets across the whole scan.
    #[serde(default = "default_scan_max_sockets")]
    pub max_sockets: usize,

    /// Per-connect timeout.
    #[serde(default = "default_scan_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            hosts: None,
            max_sockets: default_scan_max_sockets(),
            connect_timeout_ms: default_scan_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Concurrent control attempts (min 1).
    #[serde(default = "default_control_concurrency")]
    pub concurrency: usize,

    /// Delay between SetAVTransportURI and Play.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Per-request bound on SOAP round-trips.
    #[serde(default = "default_soap_timeout_ms")]
    pub soap_timeout_ms: u64,

    /// Whether a blast reuses devices retained from a discover-only run.
    #[serde(default = "default_reuse_discovered")]
    pub reuse_discovered: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            concurrency: default_control_concurrency(),
            settle_ms: default_settle_ms(),
            soap_timeout_ms: default_soap_timeout_ms(),
            reuse_discovered: default_reuse_discovered(),
        }
    }
}

fn default_discovery_timeout_ms() -> u64 {
    8000
}

fn default_ssdp_mx() -> usize {
    2
}

fn default_mdns_service_types() -> Vec<String> {
    [
        "_googlecast._tcp.local.",
        "_airplay._tcp.local.",
        "_raop._tcp.local.",
        "_sonos._tcp.local.",
        "_spotify-connect._tcp.local.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_generic_name_markers() -> Vec<String> {
    vec![" at ".to_string()]
}

fn default_scan_max_sockets() -> usize {
    128
}

fn default_scan_connect_timeout_ms() -> u64 {
    300
}

fn default_control_concurrency() -> usize {
    3
}

fn default_settle_ms() -> u64 {
    200
}

fn default_soap_timeout_ms() -> u64 {
    5000
}

fn default_reuse_discovered() -> bool {
    true
}

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("CLIPBLAST_CONFIG_DIR") {
        return std::path::PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join("Library/Application Support/clipblast");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return std::path::PathBuf::from(xdg).join("clipblast");
        }
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join(".config/clipblast");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return std::path::PathBuf::from(appdata).join("clipblast");
        }
    }

    // Fallback to current directory
    std::path::PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables
        // (CLIPBLAST_MEDIA_URL, CLIPBLAST_DISCOVERY__TIMEOUT_MS, etc.)
        .add_source(
            ::config::Environment::with_prefix("CLIPBLAST")
                .separator("__")
                .try_parsing(true),
        );

    // Support MEDIA_URL with explicit precedence: CLIPBLAST_MEDIA_URL > MEDIA_URL > config
    if let Ok(media_url) = std::env::var("CLIPBLAST_MEDIA_URL") {
        builder = builder.set_override("media_url", media_url)?;
    } else if let Ok(media_url) = std::env::var("MEDIA_URL") {
        builder = builder.set_override("media_url", media_url)?;
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.discovery.timeout_ms, 8000);
        assert_eq!(config.control.concurrency, 3);
        assert_eq!(config.control.settle_ms, 200);
        assert_eq!(config.discovery.scan.max_sockets, 128);
        assert!(config.control.reuse_discovered);
        assert!(config.media_url.is_none());
    }

    #[test]
    fn test_defaults_from_empty_source() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.discovery.timeout_ms, 8000);
        assert!(!config.discovery.mdns_service_types.is_empty());
        assert_eq!(config.discovery.generic_name_markers, vec![" at "]);
    }

    #[test]
    fn test_partial_override() {
        let config: Config = serde_json::from_str(
            r#"{"media_url": "http://10.0.0.2:8080/clip.mp3", "control": {"concurrency": 8}}"#,
        )
        .unwrap();
        assert_eq!(
            config.media_url.as_deref(),
            Some("http://10.0.0.2:8080/clip.mp3")
        );
        assert_eq!(config.control.concurrency, 8);
        // Untouched sections keep defaults
        assert_eq!(config.control.settle_ms, 200);
    }
}
