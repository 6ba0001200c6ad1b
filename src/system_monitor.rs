use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::debug;

/// Battery state of charge of the energy-manager system service.
const SYSTEM_SOC_REGISTER: u16 = 843;

/// Whether the energy manager the bus device publishes to is reachable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpstreamSignal {
    /// Live; carries the value that was read (zero is still live).
    Available(f64),
    /// The read came back explicitly invalid.
    Unavailable,
}

#[async_trait]
pub trait SystemMonitor: Send + Sync {
    async fn upstream_signal(&self) -> UpstreamSignal;
}

/// Fixed answer, for deployments without an energy manager to probe.
pub struct StaticSignal(pub UpstreamSignal);

impl StaticSignal {
    pub fn available() -> Self {
        Self(UpstreamSignal::Available(0.0))
    }
}

#[async_trait]
impl SystemMonitor for StaticSignal {
    async fn upstream_signal(&self) -> UpstreamSignal {
        self.0
    }
}

/// Reads the system state of charge from a GX device over Modbus TCP.
pub struct GxSystemMonitor {
    address: SocketAddr,
    unit_id: u8,
    timeout: Duration,
}

impl GxSystemMonitor {
    pub fn new(address: SocketAddr, unit_id: u8, timeout: Duration) -> Self {
        Self {
            address,
            unit_id,
            timeout,
        }
    }

    async fn read_soc(&self) -> Result<f64, String> {
        let mut ctx = timeout(self.timeout, tcp::connect_slave(self.address, Slave(self.unit_id)))
            .await
            .map_err(|_| format!("connect to {} timed out", self.address))?
            .map_err(|e| format!("connect to {} failed: {e}", self.address))?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        match timeout(self.timeout, ctx.read_holding_registers(SYSTEM_SOC_REGISTER, 1)).await {
            Ok(Ok(Ok(words))) => words
                .first()
                .map(|soc| f64::from(*soc))
                .ok_or_else(|| "empty register response".to_string()),
            Ok(Ok(Err(exception))) => Err(format!("modbus exception: {exception:?}")),
            Ok(Err(e)) => Err(format!("modbus error: {e}")),
            Err(_) => Err("register read timed out".to_string()),
        }
    }
}

#[async_trait]
impl SystemMonitor for GxSystemMonitor {
    async fn upstream_signal(&self) -> UpstreamSignal {
        match self.read_soc().await {
            Ok(soc) => {
                debug!("system state of charge {soc}%");
                UpstreamSignal::Available(soc)
            }
            Err(e) => {
                debug!("system state of charge is invalid: {e}");
                UpstreamSignal::Unavailable
            }
        }
    }
}
