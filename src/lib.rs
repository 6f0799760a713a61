//! clipblast
//!
//! Discovers network-attached media renderers on the local subnet and
//! drives them to play a served audio clip.
//!
//! This library provides:
//! - Three concurrent discovery strategies (SSDP, mDNS, TCP port scan)
//!   merged into one deduplicated device stream
//! - A SOAP AVTransport control client tolerant of quirky renderers
//! - A blast orchestrator with bounded concurrency and live metrics
//! - An event bus carrying device, progress and metrics streams

pub mod bus;
pub mod config;
pub mod control;
pub mod device;
pub mod discovery;
pub mod metrics;
pub mod orchestrator;
