//! Last-known values, split by writer.
//!
//! [`DeviceState`] belongs to the stream reader and [`PollState`] to the poll
//! scraper. Neither is shared, so neither needs a lock.

use crate::sink::StatusCode;
use crate::telemetry::{
    ConsumptionSummary, InverterStatus, MeterField, MeterReading, MeterType, Phase, PhaseValues,
    ProductionSummary,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct DeviceState {
    readings: HashMap<(MeterType, Phase), PhaseValues>,
    total_production_power: f64,
    energy_forward_kwh: f64,
    status: StatusCode,
}

impl DeviceState {
    pub fn new(energy_forward_kwh: f64) -> Self {
        Self {
            readings: HashMap::new(),
            total_production_power: 0.0,
            energy_forward_kwh,
            status: StatusCode::Running,
        }
    }

    /// Overlays the fields present in `values` onto (meter type, phase).
    pub fn update(&mut self, meter_type: MeterType, phase: Phase, values: PhaseValues) {
        self.readings
            .entry((meter_type, phase))
            .or_default()
            .merge(&values);
    }

    pub fn reading(&self, meter_type: MeterType, phase: Phase) -> PhaseValues {
        self.readings
            .get(&(meter_type, phase))
            .copied()
            .unwrap_or_default()
    }

    /// Sets the production total from the phase powers of a single feed line
    /// and marks the device running. Phases the line did not carry count as 0;
    /// readings of other meter types are ignored.
    pub fn flush_production(&mut self, line: &[MeterReading]) -> f64 {
        self.total_production_power = line
            .iter()
            .filter(|reading| reading.meter_type == MeterType::Production)
            .map(|reading| reading.values.get(MeterField::ActivePower))
            .sum();
        self.status = StatusCode::Running;
        self.total_production_power
    }

    /// Total as of the last production flush.
    pub fn total_production_power(&self) -> f64 {
        self.total_production_power
    }

    /// Energy-forward counter published per line and in total.
    pub fn energy_forward_kwh(&self) -> f64 {
        self.energy_forward_kwh
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Forgets every reading and flags the device as faulted.
    pub fn mark_offline(&mut self) {
        self.readings.clear();
        self.total_production_power = 0.0;
        self.status = StatusCode::Error;
    }
}

/// Poll-derived summaries and inverter snapshots.
#[derive(Debug, Default, Clone)]
pub struct PollState {
    production: BTreeMap<String, ProductionSummary>,
    consumption: BTreeMap<String, ConsumptionSummary>,
    inverters: BTreeMap<String, InverterStatus>,
}

impl PollState {
    pub fn record_production(&mut self, summary: ProductionSummary) {
        self.production.insert(summary.category.clone(), summary);
    }

    pub fn record_consumption(&mut self, summary: ConsumptionSummary) {
        self.consumption.insert(summary.category.clone(), summary);
    }

    /// Upserts by serial number; inverters are never removed.
    pub fn snapshot_inverter(&mut self, serial: &str, status: InverterStatus) {
        self.inverters.insert(serial.to_string(), status);
    }

    pub fn production(&self, category: &str) -> Option<&ProductionSummary> {
        self.production.get(category)
    }

    pub fn consumption(&self, category: &str) -> Option<&ConsumptionSummary> {
        self.consumption.get(category)
    }

    pub fn inverter(&self, serial: &str) -> Option<&InverterStatus> {
        self.inverters.get(serial)
    }

    pub fn inverter_count(&self) -> usize {
        self.inverters.len()
    }
}
