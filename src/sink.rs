//! Seams between the acquisition core and the two consumers it feeds.

use crate::telemetry::{MeterField, MeterType, Phase, SummaryField};

/// Pull-based gauge registry (scraped over HTTP).
pub trait MetricsSink: Send + Sync {
    fn set_meter(&self, meter_type: MeterType, phase: Phase, field: MeterField, value: f64);
    fn set_production(&self, category: &str, field: SummaryField, value: f64);
    fn set_consumption(&self, category: &str, field: SummaryField, value: f64);
    fn set_inverter_last_report(&self, serial: &str, location: &str, watts: f64);
    fn set_inverter_max_report(&self, serial: &str, location: &str, watts: f64);
}

/// Push-based named values of the virtual PV-inverter device.
pub trait BusSink: Send + Sync {
    fn set(&self, path: BusPath, value: f64);

    /// Applies a batch of values; implementations may make it atomic for readers.
    fn publish(&self, updates: &[(BusPath, f64)]) {
        for (path, value) in updates {
            self.set(*path, *value);
        }
    }
}

/// Every value the PV-inverter device exposes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusPath {
    EnergyForward,
    Power,
    L1Current,
    L1EnergyForward,
    L1Power,
    L1Voltage,
    L2Current,
    L2EnergyForward,
    L2Power,
    L2Voltage,
    StatusCode,
    Position,
    DeviceInstance,
    ProductId,
    FirmwareVersion,
    HardwareVersion,
    Connected,
}

impl BusPath {
    pub const ALL: [BusPath; 17] = [
        BusPath::EnergyForward,
        BusPath::Power,
        BusPath::L1Current,
        BusPath::L1EnergyForward,
        BusPath::L1Power,
        BusPath::L1Voltage,
        BusPath::L2Current,
        BusPath::L2EnergyForward,
        BusPath::L2Power,
        BusPath::L2Voltage,
        BusPath::StatusCode,
        BusPath::Position,
        BusPath::DeviceInstance,
        BusPath::ProductId,
        BusPath::FirmwareVersion,
        BusPath::HardwareVersion,
        BusPath::Connected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusPath::EnergyForward => "/Ac/Energy/Forward",
            BusPath::Power => "/Ac/Power",
            BusPath::L1Current => "/Ac/L1/Current",
            BusPath::L1EnergyForward => "/Ac/L1/Energy/Forward",
            BusPath::L1Power => "/Ac/L1/Power",
            BusPath::L1Voltage => "/Ac/L1/Voltage",
            BusPath::L2Current => "/Ac/L2/Current",
            BusPath::L2EnergyForward => "/Ac/L2/Energy/Forward",
            BusPath::L2Power => "/Ac/L2/Power",
            BusPath::L2Voltage => "/Ac/L2/Voltage",
            BusPath::StatusCode => "/StatusCode",
            BusPath::Position => "/Position",
            BusPath::DeviceInstance => "/DeviceInstance",
            BusPath::ProductId => "/ProductId",
            BusPath::FirmwareVersion => "/FirmwareVersion",
            BusPath::HardwareVersion => "/HardwareVersion",
            BusPath::Connected => "/Connected",
        }
    }

    /// Per-line paths (current, power, voltage, energy forward) for a phase.
    pub fn line(phase: Phase) -> [BusPath; 4] {
        match phase {
            Phase::A => [
                BusPath::L1Current,
                BusPath::L1Power,
                BusPath::L1Voltage,
                BusPath::L1EnergyForward,
            ],
            Phase::B => [
                BusPath::L2Current,
                BusPath::L2Power,
                BusPath::L2Voltage,
                BusPath::L2EnergyForward,
            ],
        }
    }
}

/// Inverter status codes understood by the energy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Startup = 0,
    Running = 7,
    Standby = 8,
    BootLoading = 9,
    Error = 10,
}

impl StatusCode {
    pub fn value(self) -> f64 {
        self as i32 as f64
    }
}

/// Mounting position of the inverter relative to the energy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    AcInput1 = 0,
    AcOutput = 1,
    AcInput2 = 2,
}

impl Position {
    pub fn value(self) -> f64 {
        self as i32 as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(BusPath, f64)>>);

    impl BusSink for Recorder {
        fn set(&self, path: BusPath, value: f64) {
            self.0.lock().unwrap().push((path, value));
        }
    }

    #[test]
    fn test_default_publish_sets_each_value_in_order() {
        let recorder = Recorder::default();
        recorder.publish(&[(BusPath::Power, 250.0), (BusPath::StatusCode, 7.0)]);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(BusPath::Power, 250.0), (BusPath::StatusCode, 7.0)]
        );
    }

    #[test]
    fn test_paths_are_unique() {
        let mut paths: Vec<&str> = BusPath::ALL.iter().map(|p| p.as_str()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), BusPath::ALL.len());
    }

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Running.value(), 7.0);
        assert_eq!(StatusCode::Error.value(), 10.0);
        assert_eq!(Position::AcOutput.value(), 1.0);
    }
}
