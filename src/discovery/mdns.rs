//! mDNS discoverer - DNS-SD browsing for cast/AirPlay-style renderers
//!
//! Browses the configured service types and emits a Device per resolved
//! instance. There is no secondary enrichment for this method; accuracy
//! depends entirely on what the device advertises. Partial resolutions
//! (host and port without TXT attributes) still produce a best-effort
//! Device rather than being dropped.

use anyhow::Result;
use async_trait::async_trait;
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use tracing::{debug, warn};

use crate::device::{Device, DiscoveryMethod};
use crate::discovery::{Discoverer, DiscoveryContext};

pub struct MdnsDiscoverer {
    service_types: Vec<String>,
}

impl MdnsDiscoverer {
    pub fn new(service_types: Vec<String>) -> Self {
        Self { service_types }
    }
}

#[async_trait]
impl Discoverer for MdnsDiscoverer {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Mdns
    }

    async fn discover(&self, ctx: DiscoveryContext) -> Result<()> {
        // Daemon failure is fatal to this method only
        let daemon = ServiceDaemon::new()?;

        let mut browsing = Vec::new();
        for service_type in &self.service_types {
            match daemon.browse(service_type) {
                Ok(receiver) => {
                    let service_type = service_type.clone();
                    let devices = ctx.devices.clone();
                    let cancel = ctx.cancel.clone();

                    browsing.push(service_type.clone());
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                event = receiver.recv_async() => {
                                    let Ok(event) = event else { break };
                                    if let ServiceEvent::ServiceResolved(info) = event {
                                        match device_from_service(&info, &service_type) {
                                            Some(device) => {
                                                if devices.send(device).await.is_err() {
                                                    break;
                                                }
                                            }
                                            None => debug!(
                                                "mDNS instance {} had no usable address",
                                                info.fullname
                                            ),
                                        }
                                    }
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("mDNS browse for {} failed: {}", service_type, e),
            }
        }

        if browsing.is_empty() {
            anyhow::bail!("no mDNS service type could be browsed");
        }

        // Browse until the shared deadline, then tear down
        tokio::select! {
            _ = ctx.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(ctx.deadline) => {}
        }

        for service_type in &browsing {
            if let Err(e) = daemon.stop_browse(service_type) {
                debug!("mDNS stop_browse {} failed: {}", service_type, e);
            }
        }
        // Shutdown may log a harmless closed-channel error inside the daemon
        if let Err(e) = daemon.shutdown() {
            debug!("mDNS daemon shutdown error: {}", e);
        }

        Ok(())
    }
}

/// Best-effort Device from a resolved DNS-SD instance. Returns None only
/// when no address was resolved (nothing to key on).
fn device_from_service(info: &ResolvedService, service_type: &str) -> Option<Device> {
    // Prefer IPv4; renderers routinely mishandle literal v6 control URLs
    let ip = info
        .addresses
        .iter()
        .find_map(|addr| match addr {
            ScopedIp::V4(v4) => Some(v4.addr().to_string()),
            _ => None,
        })
        .or_else(|| {
            info.addresses
                .iter()
                .next()
                .map(|addr| addr.to_ip_addr().to_string())
        })?;

    let mut device = Device::new(ip, info.port, DiscoveryMethod::Mdns);

    // TXT "fn" is the user-visible name on cast devices; fall back to the
    // service instance label
    device.friendly_name = info
        .txt_properties
        .get("fn")
        .map(|p| p.val_str().to_string())
        .unwrap_or_else(|| instance_name(&info.fullname, service_type));

    if let Some(model) = info
        .txt_properties
        .get("md")
        .or_else(|| info.txt_properties.get("am"))
    {
        device.model_name = model.val_str().to_string();
    }
    if let Some(id) = info.txt_properties.get("id") {
        device
            .metadata
            .insert("mdns.id".to_string(), id.val_str().to_string());
    }

    device
        .metadata
        .insert("mdns.fullname".to_string(), info.fullname.clone());
    device
        .metadata
        .insert("mdns.service_type".to_string(), service_type.to_string());
    device
        .metadata
        .insert("mdns.host".to_string(), info.host.clone());

    Some(device)
}

/// Instance label from a fullname like
/// `Living Room TV._googlecast._tcp.local.`.
fn instance_name(fullname: &str, service_type: &str) -> String {
    let trimmed = fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname);
    if trimmed.is_empty() {
        fullname.to_string()
    } else {
        trimmed.to_string()
    }
}
