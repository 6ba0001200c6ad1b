//! The virtual PV-inverter device the energy manager reads.
//!
//! Values are kept by [`BusPath`] and mirrored into a holding-register image
//! served over Modbus TCP. Each path occupies two registers holding an IEEE-754
//! f32, high word first, starting at [`VALUE_REGISTER_BASE`] in
//! [`BusPath::ALL`] order. The product name follows at
//! [`PRODUCT_NAME_REGISTER`], two ASCII characters per register.

use crate::sink::{BusPath, BusSink, Position, StatusCode};
use std::{
    collections::{BTreeMap, HashMap},
    future,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const VALUE_REGISTER_BASE: u16 = 2000;
pub const PRODUCT_NAME_REGISTER: u16 = 2100;
const PRODUCT_NAME_REGISTERS: u16 = 16;

/// Fixed identity announced alongside the live values.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub device_instance: u16,
    pub product_id: u16,
    pub product_name: String,
    pub firmware_version: u16,
    pub hardware_version: u16,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            device_instance: 263,
            product_id: 126,
            product_name: "Enphase Envoy".to_string(),
            firmware_version: 478,
            hardware_version: 478,
        }
    }
}

/// Holding register of the first word of `path`.
pub fn register_of(path: BusPath) -> u16 {
    let index = BusPath::ALL
        .iter()
        .position(|candidate| *candidate == path)
        .unwrap_or_default();
    VALUE_REGISTER_BASE + 2 * index as u16
}

struct BusImage {
    values: BTreeMap<BusPath, f64>,
    registers: HashMap<u16, u16>,
}

impl BusImage {
    fn set(&mut self, path: BusPath, value: f64) {
        self.values.insert(path, value);
        let bits = (value as f32).to_bits();
        let register = register_of(path);
        self.registers.insert(register, (bits >> 16) as u16);
        self.registers.insert(register + 1, (bits & 0xFFFF) as u16);
    }
}

#[derive(Clone)]
pub struct PvInverterBus {
    image: Arc<Mutex<BusImage>>,
}

impl PvInverterBus {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let mut image = BusImage {
            values: BTreeMap::new(),
            registers: HashMap::new(),
        };
        for path in BusPath::ALL {
            image.set(path, 0.0);
        }
        image.set(BusPath::StatusCode, StatusCode::Running.value());
        image.set(BusPath::Position, Position::AcOutput.value());
        image.set(BusPath::DeviceInstance, identity.device_instance.into());
        image.set(BusPath::ProductId, identity.product_id.into());
        image.set(BusPath::FirmwareVersion, identity.firmware_version.into());
        image.set(BusPath::HardwareVersion, identity.hardware_version.into());
        image.set(BusPath::Connected, 1.0);

        let mut name = identity.product_name.bytes();
        for offset in 0..PRODUCT_NAME_REGISTERS {
            let high = name.next().unwrap_or(0) as u16;
            let low = name.next().unwrap_or(0) as u16;
            image
                .registers
                .insert(PRODUCT_NAME_REGISTER + offset, high << 8 | low);
        }

        Self {
            image: Arc::new(Mutex::new(image)),
        }
    }

    /// Current value of `path`.
    pub fn get(&self, path: BusPath) -> f64 {
        self.lock().values.get(&path).copied().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BusImage> {
        self.image.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusSink for PvInverterBus {
    fn set(&self, path: BusPath, value: f64) {
        self.lock().set(path, value);
    }

    // One lock for the whole batch so a reader never sees half a flush.
    fn publish(&self, updates: &[(BusPath, f64)]) {
        let mut image = self.lock();
        for (path, value) in updates {
            image.set(*path, *value);
        }
    }
}

impl tokio_modbus::server::Service for PvInverterBus {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                register_read(&self.lock().registers, addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                register_read(&self.lock().registers, addr, cnt).map(Response::ReadInputRegisters)
            }
            _ => {
                debug!("unsupported modbus request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];
    for i in 0..cnt {
        let reg_addr = addr.wrapping_add(i);
        match registers.get(&reg_addr) {
            Some(r) => response_values[i as usize] = *r,
            None => {
                debug!("read of unmapped register {reg_addr}/0x{reg_addr:X}");
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
    }
    Ok(response_values)
}

/// Serves the register image over Modbus TCP until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    bus: PvInverterBus,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let socket_addr: SocketAddr = listener.local_addr()?;
    info!("bus device serving modbus on {socket_addr}");
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(bus.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("modbus connection error: {err}");
    };
    tokio::select! {
        res = server.serve(&on_connected, on_process_error) => res?,
        _ = cancel.cancelled() => {}
    }
    Ok(())
}
