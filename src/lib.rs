//! Envoy Bridge Library
//!
//! Tails the live meter feed of an Enphase Envoy gateway, polls its production
//! and inverter endpoints, and republishes the readings as Prometheus gauges
//! and as a virtual PV-inverter device on Modbus TCP.

pub mod config;
pub mod envoy_client;
pub mod error;
pub mod metrics;
pub mod poll_scraper;
pub mod pv_inverter_bus;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod stream_reader;
pub mod system_monitor;
pub mod telemetry;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for easier access
pub use config::{Config, OnStreamFailure};
pub use envoy_client::EnvoyClient;
pub use error::{DecodeError, EnvoyError};
pub use metrics::PrometheusMetrics;
pub use poll_scraper::PollScraper;
pub use pv_inverter_bus::{DeviceIdentity, PvInverterBus};
pub use scheduler::Scheduler;
pub use sink::{BusPath, BusSink, MetricsSink};
pub use stream_reader::{ReaderState, StreamReader, StreamSettings};
pub use system_monitor::{GxSystemMonitor, StaticSignal, SystemMonitor, UpstreamSignal};
