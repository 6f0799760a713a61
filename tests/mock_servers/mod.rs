//! Mock servers for integration testing
//!
//! The mock renderer simulates a real UPnP MediaRenderer (description XML
//! plus AVTransport SOAP control) with scriptable failure modes, allowing
//! full control-path testing without real hardware.

pub mod renderer;

pub use renderer::{MockRenderer, MockRendererBehavior, SoapGauge};
