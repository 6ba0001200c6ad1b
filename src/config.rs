use crate::error::EnvoyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use std::{env, fs, path::Path};

/// Address left in the sample configuration.
const PLACEHOLDER_ADDRESS: &str = "IP_ADDR_OF_ENVOY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub envoy: EnvoyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    pub system_monitor: Option<SystemMonitorConfig>,
    /// Inverter serial number to installation location.
    #[serde(default)]
    pub inverters: BTreeMap<String, String>,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvoyConfig {
    /// host, host:port or a full base URL
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_username() -> String {
    "installer".into()
}

impl EnvoyConfig {
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_device_instance")]
    pub device_instance: u16,
}

fn default_bus_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5502))
}

fn default_device_instance() -> u16 {
    263
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: default_bus_listen(),
            device_instance: default_device_instance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMonitorConfig {
    pub address: SocketAddr,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_unit_id() -> u8 {
    100
}

/// What the bus device shows while the live feed is down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnStreamFailure {
    #[default]
    KeepLastValues,
    ZeroAndMarkOffline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub on_failure: OnStreamFailure,
    /// Published as the energy-forward totals in place of an accumulated value.
    #[serde(default = "default_energy_forward_placeholder_kwh")]
    pub energy_forward_placeholder_kwh: f64,
}

fn default_read_timeout_secs() -> u64 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_energy_forward_placeholder_kwh() -> f64 {
    10.0
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            on_failure: OnStreamFailure::default(),
            energy_forward_placeholder_kwh: default_energy_forward_placeholder_kwh(),
        }
    }
}

impl StreamConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    10
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Loads YAML from disk, applies `ENVOY_HOST`/`ENVOY_PASSWORD`, then validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EnvoyError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            EnvoyError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut cfg = Self::from_yaml(&raw)?;

        if let Ok(host) = env::var("ENVOY_HOST") {
            cfg.envoy.address = host;
        }
        if let Ok(password) = env::var("ENVOY_PASSWORD") {
            cfg.envoy.password = password;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, EnvoyError> {
        serde_yaml::from_str(raw).map_err(|e| EnvoyError::ConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), EnvoyError> {
        let address = self.envoy.address.trim();
        if address.is_empty() || address == PLACEHOLDER_ADDRESS {
            return Err(EnvoyError::ConfigInvalid(
                "envoy.address still holds the sample value".into(),
            ));
        }
        if self.poll.interval_secs == 0 {
            return Err(EnvoyError::ConfigInvalid(
                "poll.interval_secs must be positive".into(),
            ));
        }
        if self.stream.read_timeout_secs == 0 {
            return Err(EnvoyError::ConfigInvalid(
                "stream.read_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
envoy:
  address: 192.168.1.50
  password: secret
"#;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_yaml(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.envoy.username, "installer");
        assert_eq!(cfg.envoy.base_url(), "http://192.168.1.50");
        assert_eq!(cfg.metrics.port, 9100);
        assert_eq!(cfg.bus.listen, "0.0.0.0:5502".parse().unwrap());
        assert_eq!(cfg.bus.device_instance, 263);
        assert!(cfg.system_monitor.is_none());
        assert_eq!(cfg.stream.read_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.stream.on_failure, OnStreamFailure::KeepLastValues);
        assert_eq!(cfg.stream.energy_forward_placeholder_kwh, 10.0);
        assert_eq!(cfg.poll.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_full_config() {
        let cfg = Config::from_yaml(
            r#"
envoy:
  address: http://envoy.local/
  password: secret
  username: envoy
metrics:
  port: 8000
bus:
  listen: 127.0.0.1:1502
  device_instance: 40
system_monitor:
  address: 192.168.1.10:502
inverters:
  "121900012345": roof east
stream:
  reconnect_delay_secs: 2
  on_failure: zero-and-mark-offline
poll:
  interval_secs: 60
"#,
        )
        .unwrap();
        assert_eq!(cfg.envoy.base_url(), "http://envoy.local");
        assert_eq!(cfg.metrics.port, 8000);
        assert_eq!(cfg.bus.device_instance, 40);
        assert_eq!(cfg.system_monitor.as_ref().map(|m| m.unit_id), Some(100));
        assert_eq!(cfg.stream.on_failure, OnStreamFailure::ZeroAndMarkOffline);
        assert_eq!(cfg.stream.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(
            cfg.inverters.get("121900012345").map(String::as_str),
            Some("roof east")
        );
    }

    #[test]
    fn test_placeholder_address_is_invalid() {
        let cfg = Config::from_yaml("envoy:\n  address: IP_ADDR_OF_ENVOY\n").unwrap();
        assert!(matches!(cfg.validate(), Err(EnvoyError::ConfigInvalid(_))));
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let cfg = Config::from_yaml(
            "envoy:\n  address: 10.0.0.2\npoll:\n  interval_secs: 0\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_envoy_section_is_invalid() {
        assert!(matches!(
            Config::from_yaml("metrics:\n  port: 9100\n"),
            Err(EnvoyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/envoy.yaml"),
            Err(EnvoyError::ConfigInvalid(_))
        ));
    }
}
