//! Port-scan discoverer - brute-force TCP probing of known media ports
//!
//! Slowest and least precise method; exists to catch devices that answer
//! neither SSDP nor mDNS (AP-isolated, multicast-filtered or plain
//! non-compliant). A successful connect within the per-attempt timeout
//! counts as found; the port number alone drives a heuristic vendor and
//! name so the result is more useful than a generic label. Socket count
//! is capped so constrained devices and routers are not overwhelmed.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::device::{Device, DiscoveryMethod, META_VENDOR_HEURISTIC};
use crate::discovery::{Discoverer, DiscoveryContext};

/// The curated spectrum of TCP ports known to host media-control
/// services.
pub fn port_spectrum() -> Vec<u16> {
    let mut ports: Vec<u16> = vec![80, 443, 5000, 7000, 7100, 8873, 50002];
    ports.extend(1400..=1410);
    ports.extend(8008..=8099);
    ports.extend(8200..=8205);
    ports.extend(9000..=9010);
    ports.extend(10000..=10010);
    ports.extend(49152..=49170);
    ports.sort_unstable();
    ports
}

/// Vendor and device-type guess for a well-known port. `None` means the
/// port proves a listener and nothing else.
fn classify_port(port: u16) -> Option<(&'static str, &'static str)> {
    match port {
        1400..=1410 => Some(("Sonos", "urn:schemas-upnp-org:device:MediaRenderer:1")),
        8008 | 8009 => Some(("Chromecast", "urn:dial-multiscreen-org:device:dial:1")),
        5000 | 7000 | 7100 => Some(("AirPlay", "")),
        8200..=8205 | 8873 => Some(("DLNA", "urn:schemas-upnp-org:device:MediaRenderer:1")),
        9000..=9010 => Some(("Squeezebox", "")),
        49152..=49170 => Some(("UPnP", "urn:schemas-upnp-org:device:MediaRenderer:1")),
        50002 => Some(("Denon", "")),
        _ => None,
    }
}

/// Device record for a host that accepted a connect on `port`.
fn device_for(ip: &str, port: u16) -> Device {
    let mut device = Device::new(ip, port, DiscoveryMethod::PortScan);
    if let Some((vendor, device_type)) = classify_port(port) {
        device.friendly_name = format!("{} at {}", vendor, ip);
        device.manufacturer = vendor.to_string();
        device.device_type = device_type.to_string();
        device
            .metadata
            .insert(META_VENDOR_HEURISTIC.to_string(), "true".to_string());
    }
    device
        .metadata
        .insert("portscan.port".to_string(), port.to_string());
    device
}

pub struct PortScanDiscoverer {
    config: ScanConfig,
    ports: Vec<u16>,
}

impl PortScanDiscoverer {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            ports: port_spectrum(),
        }
    }

    /// Candidate hosts: configured list, or the local /24 minus ourselves.
    async fn candidate_hosts(&self) -> Result<Vec<String>> {
        if let Some(hosts) = &self.config.hosts {
            return Ok(hosts.clone());
        }

        let local = local_ipv4()
            .await
            .ok_or_else(|| anyhow::anyhow!("could not determine local IPv4 address"))?;
        let octets = local.octets();
        Ok((1u8..=254)
            .filter(|&host| host != octets[3])
            .map(|host| Ipv4Addr::new(octets[0], octets[1], octets[2], host).to_string())
            .collect())
    }
}

#[async_trait]
impl Discoverer for PortScanDiscoverer {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::PortScan
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<()> {
        let hosts = self.candidate_hosts().await?;
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        info!(
            "Port scan: {} host(s) x {} port(s), {} socket cap",
            hosts.len(),
            self.ports.len(),
            self.config.max_sockets
        );

        let targets = hosts
            .iter()
            .flat_map(|host| self.ports.iter().map(move |&port| (host.clone(), port)));

        let scan = futures::stream::iter(targets).for_each_concurrent(
            self.config.max_sockets,
            |(host, port)| {
                let devices = ctx.devices.clone();
                let cancel = ctx.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Ok(addr) = format!("{}:{}", host, port).parse::<SocketAddr>() else {
                        return;
                    };
                    let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(addr));
                    match connect.await {
                        Ok(Ok(_stream)) => {
                            debug!("Port scan hit: {}", addr);
                            let _ = devices.send(device_for(&host, port)).await;
                        }
                        // Refused, unreachable or too slow: not a finding
                        Ok(Err(_)) | Err(_) => {}
                    }
                }
            },
        );

        tokio::select! {
            () = scan => {}
            _ = ctx.cancel.cancelled() => {
                debug!("Port scan cancelled at deadline");
            }
        }

        Ok(())
    }
}

/// Local IPv4 via a connected UDP socket; no packets are sent. Aiming at
/// the SSDP multicast group keeps the route on the LAN interface.
async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("239.255.255.250:1900").await.ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}
