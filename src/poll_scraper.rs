use crate::envoy_client::EnvoyClient;
use crate::error::EnvoyError;
use crate::sink::MetricsSink;
use crate::store::PollState;
use crate::telemetry::InverterStatus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Location label for inverters missing from the serial map.
pub const UNKNOWN_LOCATION: &str = "unknown";

/// Periodically pulls the production summary and per-inverter reports.
pub struct PollScraper {
    client: EnvoyClient,
    metrics: Arc<dyn MetricsSink>,
    state: PollState,
    locations: BTreeMap<String, String>,
    request_timeout: Duration,
}

impl PollScraper {
    pub fn new(
        client: EnvoyClient,
        metrics: Arc<dyn MetricsSink>,
        locations: BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            metrics,
            state: PollState::default(),
            locations,
            request_timeout,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    fn location_of(&self, serial: &str) -> &str {
        self.locations
            .get(serial)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LOCATION)
    }

    /// Fires immediately, then every `period` until `cancel` fires.
    pub async fn run(&mut self, period: Duration, cancel: &CancellationToken) {
        info!("poll scraper starting, period {period:?}");
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        info!("poll scraper stopped");
    }

    /// One cycle. A failure is logged and leaves previously published values alone.
    pub async fn tick(&mut self) {
        if let Err(e) = self.scrape_once().await {
            warn!("poll cycle skipped: {e}");
        }
    }

    pub async fn scrape_once(&mut self) -> Result<(), EnvoyError> {
        let report = self
            .client
            .production(self.request_timeout)
            .await
            .map_err(|e| EnvoyError::poll_step("production", e))?;
        for summary in report.production {
            for (field, value) in summary.present_fields() {
                self.metrics.set_production(&summary.category, field, value);
            }
            self.state.record_production(summary);
        }
        for summary in report.consumption {
            for (field, value) in summary.present_fields() {
                self.metrics.set_consumption(&summary.category, field, value);
            }
            self.state.record_consumption(summary);
        }

        let inverters = self
            .client
            .inverters(self.request_timeout)
            .await
            .map_err(|e| EnvoyError::poll_step("inverters", e))?;
        debug!("polled {} inverters", inverters.len());
        for inverter in inverters {
            let location = self.location_of(&inverter.serial_number).to_string();
            self.metrics.set_inverter_last_report(
                &inverter.serial_number,
                &location,
                inverter.last_report_watts,
            );
            self.metrics.set_inverter_max_report(
                &inverter.serial_number,
                &location,
                inverter.max_report_watts,
            );
            let serial = inverter.serial_number.clone();
            self.state.snapshot_inverter(
                &serial,
                InverterStatus {
                    serial_number: inverter.serial_number,
                    location,
                    last_report_watts: inverter.last_report_watts,
                    max_report_watts: inverter.max_report_watts,
                },
            );
        }
        Ok(())
    }
}
