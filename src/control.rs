//! Device control client - pushes a clip over UPnP AVTransport
//!
//! Executes SetAVTransportURI, waits a short settle delay so the renderer
//! can process the URI, then sends Play. Real-world devices are quirky:
//! several answer plain HTTP probes with 403/404 yet accept SOAP control,
//! some return 200 with a fault envelope inside. Every network call is
//! individually time-bounded; a hung device costs one timeout, never the
//! whole fan-out.

use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ControlConfig;
use crate::device::{ControlResult, Device};

const AV_TRANSPORT_URN: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const SOAP_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// SOAP control client for AVTransport renderers.
#[derive(Clone)]
pub struct ControlClient {
    http: Client,
    settle: Duration,
}

impl ControlClient {
    pub fn new() -> Self {
        Self::with_timeouts(SOAP_TIMEOUT, SETTLE_DELAY)
    }

    pub fn with_timeouts(soap_timeout: Duration, settle: Duration) -> Self {
        Self {
            http: Client::builder()
                .timeout(soap_timeout)
                .build()
                .unwrap_or_default(),
            settle,
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::with_timeouts(
            Duration::from_millis(config.soap_timeout_ms),
            Duration::from_millis(config.settle_ms),
        )
    }

    /// Run the full control sequence against one device. Failures come
    /// back as data; this never returns an error.
    pub async fn push_clip(&self, device: &Device, media_url: &str) -> ControlResult {
        let started = Instant::now();
        let key = device.key();
        let endpoint = device.control_endpoint();

        // Reachability probe is informational only: a 403/404 here must
        // not block the control sequence
        self.probe(device).await;

        if let Err(detail) = self.set_transport_uri(&endpoint, media_url).await {
            return ControlResult::failed(
                key,
                started.elapsed().as_millis() as u64,
                format!("SetAVTransportURI: {}", detail),
            );
        }

        // Let the renderer process the URI before asking it to play
        tokio::time::sleep(self.settle).await;

        if let Err(detail) = self.play(&endpoint).await {
            // URI set without playback starting is not a success
            return ControlResult::failed(
                key,
                started.elapsed().as_millis() as u64,
                format!("Play: {}", detail),
            );
        }

        ControlResult::ok(key, started.elapsed().as_millis() as u64)
    }

    async fn probe(&self, device: &Device) {
        match self.http.get(device.base_url()).send().await {
            Ok(response) => debug!("Probe {}: HTTP {}", device.key(), response.status()),
            Err(e) => debug!("Probe {} failed ({}), trying SOAP anyway", device.key(), e),
        }
    }

    async fn set_transport_uri(&self, endpoint: &str, media_url: &str) -> Result<(), String> {
        let uri = quick_xml::escape::escape(media_url);
        let body = format!(
            "<InstanceID>0</InstanceID><CurrentURI>{}</CurrentURI><CurrentURIMetaData></CurrentURIMetaData>",
            uri
        );
        self.soap_call(endpoint, "SetAVTransportURI", &body)
            .await
            .map(|_| ())
    }

    async fn play(&self, endpoint: &str) -> Result<(), String> {
        self.soap_call(endpoint, "Play", "<InstanceID>0</InstanceID><Speed>1</Speed>")
            .await
            .map(|_| ())
    }

    async fn soap_call(
        &self,
        url: &str,
        action: &str,
        body_content: &str,
    ) -> Result<String, String> {
        let soap_body = build_envelope(action, body_content);

        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}#{}\"", AV_TRANSPORT_URN, action))
            .body(soap_body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        let text = response.text().await.map_err(|e| e.to_string())?;

        if !status.is_success() {
            return Err(extract_soap_fault(&text)
                .unwrap_or_else(|| format!("HTTP {}", status)));
        }
        // Some renderers return 200 with a fault envelope inside
        if let Some(fault) = extract_soap_fault(&text) {
            return Err(fault);
        }

        Ok(text)
    }
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

fn build_envelope(action: &str, body_content: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action} xmlns:u="{service_type}">{body}</u:{action}>
  </s:Body>
</s:Envelope>"#,
        action = action,
        service_type = AV_TRANSPORT_URN,
        body = body_content
    )
}

/// Extract XML value, handling optional namespace prefixes (e.g., <u:Volume> or <Volume>)
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"<(?:[^:>]+:)?{}\b[^>]*>([^<]*)</(?:[^:>]+:)?{}>",
        regex::escape(tag),
        regex::escape(tag)
    );

    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Human-readable detail from a SOAP fault envelope, if one is present.
fn extract_soap_fault(xml: &str) -> Option<String> {
    if !xml.contains("Fault") && !xml.contains("UPnPError") {
        return None;
    }
    let code = extract_xml_value(xml, "errorCode");
    let description = extract_xml_value(xml, "errorDescription")
        .or_else(|| extract_xml_value(xml, "faultstring"));
    match (code, description) {
        (Some(code), Some(description)) => Some(format!("UPnP error {}: {}", code, description)),
        (Some(code), None) => Some(format!("UPnP error {}", code)),
        (None, Some(description)) => Some(description),
        (None, None) => None,
    }
}
