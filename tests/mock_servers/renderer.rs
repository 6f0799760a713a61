//! Mock UPnP MediaRenderer for testing
//!
//! Provides HTTP endpoints for a reachability probe, device description
//! and AVTransport SOAP control. Behaviors are scriptable per renderer:
//! probe rejection (the 403-but-still-controllable quirk), SOAP faults,
//! slow or hanging Play, and a fixed per-action delay for concurrency
//! tests. A shared `SoapGauge` tracks how many SOAP actions are in flight
//! across renderers.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use clipblast::device::{Device, DiscoveryMethod};

/// Tracks concurrent SOAP actions across any number of mock renderers.
pub struct SoapGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl SoapGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneously in-flight SOAP actions observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Scriptable renderer quirks.
#[derive(Debug, Clone, Default)]
pub struct MockRendererBehavior {
    /// Answer the reachability probe with HTTP 403.
    pub reject_probe: bool,
    /// Fail SetAVTransportURI with a UPnP fault.
    pub fail_set_uri: bool,
    /// Fail Play with a UPnP fault.
    pub fail_play: bool,
    /// Sleep this long before answering Play (simulates a hang).
    pub play_delay: Option<Duration>,
    /// Sleep this long on every SOAP action.
    pub action_delay: Option<Duration>,
}

struct MockRendererState {
    behavior: MockRendererBehavior,
    /// (action, request body) pairs in arrival order.
    actions: Vec<(String, String)>,
}

#[derive(Clone)]
struct AppState {
    state: Arc<RwLock<MockRendererState>>,
    gauge: Arc<SoapGauge>,
}

/// Mock UPnP MediaRenderer
pub struct MockRenderer {
    addr: SocketAddr,
    state: Arc<RwLock<MockRendererState>>,
    gauge: Arc<SoapGauge>,
    handle: JoinHandle<()>,
}

impl MockRenderer {
    /// Start a well-behaved renderer on a random port.
    pub async fn start() -> Self {
        Self::start_with(MockRendererBehavior::default()).await
    }

    pub async fn start_with(behavior: MockRendererBehavior) -> Self {
        Self::start_with_gauge(behavior, SoapGauge::new()).await
    }

    /// Start with a gauge shared across several renderers.
    pub async fn start_with_gauge(
        behavior: MockRendererBehavior,
        gauge: Arc<SoapGauge>,
    ) -> Self {
        let state = Arc::new(RwLock::new(MockRendererState {
            behavior,
            actions: Vec::new(),
        }));

        let app_state = AppState {
            state: state.clone(),
            gauge: gauge.clone(),
        };

        let app = Router::new()
            .route("/", get(handle_probe))
            .route("/description.xml", get(handle_description))
            .route("/AVTransport/control", post(handle_av_transport))
            .with_state(app_state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            gauge,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Device record pointing at this mock, as discovery would emit it.
    pub fn device(&self) -> Device {
        let mut device = Device::new("127.0.0.1", self.addr.port(), DiscoveryMethod::Ssdp);
        device.friendly_name = "Mock Renderer".to_string();
        device
    }

    pub fn gauge(&self) -> Arc<SoapGauge> {
        self.gauge.clone()
    }

    /// SOAP actions received so far, in arrival order.
    pub async fn actions(&self) -> Vec<(String, String)> {
        self.state.read().await.actions.clone()
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_probe(State(app): State<AppState>) -> impl IntoResponse {
    let reject = app.state.read().await.behavior.reject_probe;
    if reject {
        (StatusCode::FORBIDDEN, "Forbidden")
    } else {
        (StatusCode::OK, "OK")
    }
}

async fn handle_description(State(_app): State<AppState>) -> impl IntoResponse {
    let xml = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Mock Renderer</friendlyName>
    <manufacturer>Mock Corp</manufacturer>
    <modelName>Mock Model</modelName>
    <UDN>uuid:mock-renderer-12345</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/AVTransport/control</controlURL>
        <eventSubURL>/AVTransport/event</eventSubURL>
        <SCPDURL>/AVTransport/scpd.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(xml))
        .unwrap()
}

/// Handle AVTransport SOAP requests
async fn handle_av_transport(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    app.gauge.enter();
    let response = av_transport_inner(&app, &headers, body).await;
    app.gauge.exit();
    response
}

async fn av_transport_inner(app: &AppState, headers: &HeaderMap, body: String) -> Response {
    let soapaction = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let action = if soapaction.contains("SetAVTransportURI") {
        "SetAVTransportURI"
    } else if soapaction.contains("Play") {
        "Play"
    } else {
        "Unknown"
    };

    let behavior = {
        let mut state = app.state.write().await;
        state.actions.push((action.to_string(), body));
        state.behavior.clone()
    };

    if let Some(delay) = behavior.action_delay {
        tokio::time::sleep(delay).await;
    }

    match action {
        "SetAVTransportURI" if behavior.fail_set_uri => {
            fault_response(716, "Resource not found")
        }
        "SetAVTransportURI" => ok_response("SetAVTransportURI"),
        "Play" => {
            if let Some(delay) = behavior.play_delay {
                tokio::time::sleep(delay).await;
            }
            if behavior.fail_play {
                fault_response(701, "Transition not available")
            } else {
                ok_response("Play")
            }
        }
        _ => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from("Unknown action"))
            .unwrap(),
    }
}

fn ok_response(action: &str) -> Response {
    let body = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:{action}Response xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
    </u:{action}Response>
  </s:Body>
</s:Envelope>"#,
        action = action
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn fault_response(code: u32, description: &str) -> Response {
    let body = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>{code}</errorCode>
          <errorDescription>{description}</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#,
        code = code,
        description = description
    );

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}
