//! Tails the gateway's live meter feed and fans every reading out.
//!
//! Each decoded reading lands in the [`DeviceState`] and on the metrics sink
//! straight away, fields the gateway left out included in neither. The bus
//! device only models the production meter: once a line's production group
//! carries phase B, its phases and their total are published as one batch.
//! Nothing from an earlier line is mixed into that batch.

use crate::config::{OnStreamFailure, StreamConfig};
use crate::envoy_client::{EnvoyClient, MeterStream};
use crate::error::EnvoyError;
use crate::sink::{BusPath, BusSink, MetricsSink};
use crate::store::DeviceState;
use crate::system_monitor::{SystemMonitor, UpstreamSignal};
use crate::telemetry::{decode_feed_line, MeterField, MeterReading, MeterType, Phase};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Connecting,
    Streaming,
    Reconnecting,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    pub on_failure: OnStreamFailure,
    pub energy_forward_kwh: f64,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            reconnect_delay: config.reconnect_delay(),
            on_failure: config.on_failure,
            energy_forward_kwh: config.energy_forward_placeholder_kwh,
        }
    }
}

pub struct StreamReader {
    client: EnvoyClient,
    monitor: Arc<dyn SystemMonitor>,
    metrics: Arc<dyn MetricsSink>,
    bus: Arc<dyn BusSink>,
    settings: StreamSettings,
    device: DeviceState,
    state: ReaderState,
}

impl StreamReader {
    pub fn new(
        client: EnvoyClient,
        monitor: Arc<dyn SystemMonitor>,
        metrics: Arc<dyn MetricsSink>,
        bus: Arc<dyn BusSink>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            client,
            monitor,
            metrics,
            bus,
            device: DeviceState::new(settings.energy_forward_kwh),
            settings,
            state: ReaderState::Connecting,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    /// Runs until `cancel` fires. Transient failures never escape; the only
    /// error is an unavailable upstream signal at startup.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), EnvoyError> {
        info!("stream reader starting");
        self.state = ReaderState::Connecting;
        if let UpstreamSignal::Unavailable = self.monitor.upstream_signal().await {
            error!("upstream system signal is invalid, stream reader terminating");
            self.state = ReaderState::Terminated;
            return Err(EnvoyError::UpstreamUnavailable);
        }

        while !cancel.is_cancelled() {
            self.state = ReaderState::Connecting;
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                opened = self.client.open_meter_stream(self.settings.read_timeout) => opened,
            };

            let outcome = match opened {
                Ok(mut stream) => {
                    info!("meter stream connected");
                    self.state = ReaderState::Streaming;
                    self.stream(&mut stream, cancel).await
                }
                Err(e) => Err(e),
            };
            let Err(e) = outcome else {
                break;
            };

            self.state = ReaderState::Reconnecting;
            debug!(
                "meter stream failed: {e}; reconnecting in {:?}",
                self.settings.reconnect_delay
            );
            self.handle_stream_failure();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.reconnect_delay) => {}
            }
        }

        self.state = ReaderState::Draining;
        info!("stream reader stopped");
        Ok(())
    }

    /// Reads lines until the feed fails or `cancel` fires (`Ok`).
    async fn stream(
        &mut self,
        stream: &mut MeterStream,
        cancel: &CancellationToken,
    ) -> Result<(), EnvoyError> {
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                line = stream.next_line() => line?,
            };
            match line {
                Some(line) => self.process_line(line.as_bytes()),
                None => return Err(EnvoyError::StreamIo("feed closed by the gateway".into())),
            }
        }
    }

    /// Decodes one feed line and applies its readings in feed order.
    pub fn process_line(&mut self, line: &[u8]) {
        let readings = match decode_feed_line(line) {
            Ok(readings) => readings,
            Err(e) => {
                debug!("skipping feed line: {e}");
                return;
            }
        };
        for reading in &readings {
            self.apply(reading);
        }

        let production: Vec<MeterReading> = readings
            .into_iter()
            .filter(|reading| reading.meter_type == MeterType::Production)
            .collect();
        if production.iter().any(|reading| reading.phase == Phase::B) {
            self.flush_production(&production);
        }
    }

    fn apply(&mut self, reading: &MeterReading) {
        let MeterReading {
            meter_type,
            phase,
            values,
        } = *reading;
        self.device.update(meter_type, phase, values);
        for (field, value) in values.present() {
            self.metrics.set_meter(meter_type, phase, field, value);
        }
    }

    /// Publishes one line's production group: the phases it carried and their total.
    fn flush_production(&mut self, production: &[MeterReading]) {
        let total = self.device.flush_production(production);
        info!("Total Power: {}W", total as i64);

        let energy_forward = self.device.energy_forward_kwh();
        let mut updates = Vec::with_capacity(11);
        for reading in production {
            let values = &reading.values;
            let [current, power, voltage, line_energy] = BusPath::line(reading.phase);
            updates.extend([
                (current, values.get(MeterField::Current)),
                (power, values.get(MeterField::ActivePower)),
                (voltage, values.get(MeterField::Voltage)),
                (line_energy, energy_forward),
            ]);
        }
        self.publish_totals(&mut updates);
        self.bus.publish(&updates);
    }

    fn handle_stream_failure(&mut self) {
        match self.settings.on_failure {
            OnStreamFailure::KeepLastValues => {}
            OnStreamFailure::ZeroAndMarkOffline => {
                self.device.mark_offline();
                warn!("Total Power: 0W, offline");
                let energy_forward = self.device.energy_forward_kwh();
                let mut updates = Vec::with_capacity(11);
                for phase in Phase::ALL {
                    let [current, power, voltage, line_energy] = BusPath::line(phase);
                    updates.extend([
                        (current, 0.0),
                        (power, 0.0),
                        (voltage, 0.0),
                        (line_energy, energy_forward),
                    ]);
                }
                self.publish_totals(&mut updates);
                self.bus.publish(&updates);
            }
        }
    }

    fn publish_totals(&self, updates: &mut Vec<(BusPath, f64)>) {
        updates.extend([
            (BusPath::EnergyForward, self.device.energy_forward_kwh()),
            (BusPath::Power, self.device.total_production_power()),
            (BusPath::StatusCode, self.device.status().value()),
        ]);
    }
}
