//! Decoding of the gateway's live meter feed and its polled JSON documents.
//!
//! The live feed is newline delimited; lines that carry telemetry start with
//! [`FEED_MARKER`] followed by a JSON object keyed by meter type, then by
//! phase, each phase holding the seven electrical quantities. Everything in
//! here is pure: no I/O and no state beyond the line being decoded.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Prefix of feed lines that carry a telemetry record.
pub const FEED_MARKER: &[u8] = b"data: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeterType {
    Production,
    NetConsumption,
    TotalConsumption,
}

impl MeterType {
    /// Feed order; readings are emitted in this order.
    pub const ALL: [MeterType; 3] = [
        MeterType::Production,
        MeterType::NetConsumption,
        MeterType::TotalConsumption,
    ];

    /// Key used by the feed and by the `type` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterType::Production => "production",
            MeterType::NetConsumption => "net-consumption",
            MeterType::TotalConsumption => "total-consumption",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::A, Phase::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::A => "ph-a",
            Phase::B => "ph-b",
        }
    }
}

/// One electrical quantity of a phase reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterField {
    ActivePower,
    ReactivePower,
    ApparentPower,
    Voltage,
    Current,
    Frequency,
    PowerFactor,
}

impl MeterField {
    pub const ALL: [MeterField; 7] = [
        MeterField::ActivePower,
        MeterField::ReactivePower,
        MeterField::ApparentPower,
        MeterField::Voltage,
        MeterField::Current,
        MeterField::Frequency,
        MeterField::PowerFactor,
    ];
}

/// Values of a single phase as sent by the gateway.
///
/// Firmware omits fields inconsistently; an omitted field stays `None` and
/// reads as 0 through [`PhaseValues::get`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseValues {
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    pub reactive_power: Option<f64>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub apparent_power: Option<f64>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(rename = "pf", default, skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,
}

impl PhaseValues {
    /// The field as sent, `None` when the gateway left it out.
    pub fn field(&self, field: MeterField) -> Option<f64> {
        match field {
            MeterField::ActivePower => self.power,
            MeterField::ReactivePower => self.reactive_power,
            MeterField::ApparentPower => self.apparent_power,
            MeterField::Voltage => self.voltage,
            MeterField::Current => self.current,
            MeterField::Frequency => self.frequency,
            MeterField::PowerFactor => self.power_factor,
        }
    }

    pub fn get(&self, field: MeterField) -> f64 {
        self.field(field).unwrap_or_default()
    }

    /// Fields the gateway actually sent, in [`MeterField::ALL`] order.
    pub fn present(&self) -> impl Iterator<Item = (MeterField, f64)> + '_ {
        MeterField::ALL
            .into_iter()
            .filter_map(move |field| self.field(field).map(|value| (field, value)))
    }

    /// Overlays the fields present in `newer`, keeping the rest.
    pub fn merge(&mut self, newer: &PhaseValues) {
        let slots = [
            (&mut self.power, newer.power),
            (&mut self.reactive_power, newer.reactive_power),
            (&mut self.apparent_power, newer.apparent_power),
            (&mut self.voltage, newer.voltage),
            (&mut self.current, newer.current),
            (&mut self.frequency, newer.frequency),
            (&mut self.power_factor, newer.power_factor),
        ];
        for (slot, value) in slots {
            if value.is_some() {
                *slot = value;
            }
        }
    }
}

/// A decoded (meter type, phase) reading. Lives only until it has been fanned out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub meter_type: MeterType,
    pub phase: Phase,
    pub values: PhaseValues,
}

#[derive(Debug, Deserialize)]
struct FeedPhases {
    #[serde(rename = "ph-a")]
    a: Option<PhaseValues>,
    #[serde(rename = "ph-b")]
    b: Option<PhaseValues>,
}

#[derive(Debug, Deserialize)]
struct FeedRecord {
    production: Option<FeedPhases>,
    #[serde(rename = "net-consumption")]
    net_consumption: Option<FeedPhases>,
    #[serde(rename = "total-consumption")]
    total_consumption: Option<FeedPhases>,
}

impl FeedRecord {
    fn phases(&self, meter_type: MeterType) -> Option<&FeedPhases> {
        match meter_type {
            MeterType::Production => self.production.as_ref(),
            MeterType::NetConsumption => self.net_consumption.as_ref(),
            MeterType::TotalConsumption => self.total_consumption.as_ref(),
        }
    }
}

/// Returns the JSON payload of a marked feed line.
pub fn strip_marker(line: &[u8]) -> Result<&[u8], DecodeError> {
    line.strip_prefix(FEED_MARKER)
        .ok_or(DecodeError::MissingMarker)
}

/// Decodes one feed line into readings, grouped by meter type with phase A
/// ahead of phase B inside each group.
///
/// Keep-alive and other unmarked lines decode to an empty list.
pub fn decode_feed_line(line: &[u8]) -> Result<Vec<MeterReading>, DecodeError> {
    let payload = match strip_marker(line) {
        Ok(payload) => payload,
        Err(_) => return Ok(Vec::new()),
    };
    let record: FeedRecord = serde_json::from_slice(payload)?;

    let mut readings = Vec::new();
    for meter_type in MeterType::ALL {
        let Some(phases) = record.phases(meter_type) else {
            continue;
        };
        for (phase, values) in [(Phase::A, phases.a), (Phase::B, phases.b)] {
            if let Some(values) = values {
                readings.push(MeterReading {
                    meter_type,
                    phase,
                    values,
                });
            }
        }
    }
    Ok(readings)
}

/// Fields of the aggregate production/consumption summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummaryField {
    ActiveCount,
    PowerNow,
    EnergyToday,
    EnergyLastSevenDays,
    EnergyLifetime,
}

impl SummaryField {
    pub const ALL: [SummaryField; 5] = [
        SummaryField::ActiveCount,
        SummaryField::PowerNow,
        SummaryField::EnergyToday,
        SummaryField::EnergyLastSevenDays,
        SummaryField::EnergyLifetime,
    ];
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSummary {
    #[serde(rename = "type")]
    pub category: String,
    pub active_count: Option<f64>,
    #[serde(rename = "wNow")]
    pub power_now: Option<f64>,
    #[serde(rename = "whToday")]
    pub energy_today: Option<f64>,
    #[serde(rename = "whLastSevenDays")]
    pub energy_last_seven_days: Option<f64>,
    #[serde(rename = "whLifetime")]
    pub energy_lifetime: Option<f64>,
}

impl ProductionSummary {
    /// Fields the gateway actually sent; absent ones are skipped, not zeroed.
    pub fn present_fields(&self) -> Vec<(SummaryField, f64)> {
        [
            (SummaryField::ActiveCount, self.active_count),
            (SummaryField::PowerNow, self.power_now),
            (SummaryField::EnergyToday, self.energy_today),
            (SummaryField::EnergyLastSevenDays, self.energy_last_seven_days),
            (SummaryField::EnergyLifetime, self.energy_lifetime),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|value| (field, value)))
        .collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionSummary {
    #[serde(rename = "measurementType")]
    pub category: String,
    #[serde(rename = "wNow")]
    pub power_now: Option<f64>,
    #[serde(rename = "whToday")]
    pub energy_today: Option<f64>,
    #[serde(rename = "whLastSevenDays")]
    pub energy_last_seven_days: Option<f64>,
    #[serde(rename = "whLifetime")]
    pub energy_lifetime: Option<f64>,
}

impl ConsumptionSummary {
    pub fn present_fields(&self) -> Vec<(SummaryField, f64)> {
        [
            (SummaryField::PowerNow, self.power_now),
            (SummaryField::EnergyToday, self.energy_today),
            (SummaryField::EnergyLastSevenDays, self.energy_last_seven_days),
            (SummaryField::EnergyLifetime, self.energy_lifetime),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|value| (field, value)))
        .collect()
    }
}

/// Body of `GET /production.json`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionReport {
    #[serde(default)]
    pub production: Vec<ProductionSummary>,
    #[serde(default)]
    pub consumption: Vec<ConsumptionSummary>,
}

/// One element of `GET /api/v1/production/inverters`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InverterReport {
    pub serial_number: String,
    pub last_report_watts: f64,
    pub max_report_watts: f64,
}

/// An inverter report with its configured location resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct InverterStatus {
    pub serial_number: String,
    pub location: String,
    pub last_report_watts: f64,
    pub max_report_watts: f64,
}
