//! Prometheus gauges and the `/metrics` pull endpoint.

use crate::sink::MetricsSink;
use crate::telemetry::{MeterField, MeterType, Phase, SummaryField};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const METER_GAUGES: [(MeterField, &str, &str); 7] = [
    (MeterField::ActivePower, "meter_active_power_watts", "Active Power"),
    (MeterField::ReactivePower, "meter_reactive_power_watts", "Reactive Power"),
    (MeterField::ApparentPower, "meter_apparent_power_watts", "Apparent Power"),
    (MeterField::Voltage, "meter_voltage_volts", "Voltage"),
    (MeterField::Current, "meter_current_amps", "Current"),
    (MeterField::Frequency, "meter_frequency_hertz", "Frequency"),
    (MeterField::PowerFactor, "meter_power_factor_ratio", "Power Factor"),
];

const PRODUCTION_GAUGES: [(SummaryField, &str, &str); 5] = [
    (SummaryField::ActiveCount, "production_active_count", "Active Count"),
    (SummaryField::PowerNow, "power_now_watts", "Current production power"),
    (SummaryField::EnergyToday, "production_today_watthours", "Total production today"),
    (
        SummaryField::EnergyLastSevenDays,
        "production_7days_watthours",
        "Total production last seven days",
    ),
    (
        SummaryField::EnergyLifetime,
        "production_lifetime_watthours",
        "Total production lifetime",
    ),
];

// The gateway has no active count for consumption meters.
const CONSUMPTION_GAUGES: [(SummaryField, &str, &str); 4] = [
    (SummaryField::PowerNow, "consumption_now_watts", "Current consumption power"),
    (SummaryField::EnergyToday, "consumption_today_watthours", "Total consumption today"),
    (
        SummaryField::EnergyLastSevenDays,
        "consumption_7days_watthours",
        "Total consumption last seven days",
    ),
    (
        SummaryField::EnergyLifetime,
        "consumption_lifetime_watthours",
        "Total consumption lifetime",
    ),
];

/// All gauges the bridge exports, registered once against a private registry.
pub struct PrometheusMetrics {
    registry: Registry,
    meter: Vec<(MeterField, GaugeVec)>,
    production: Vec<(SummaryField, GaugeVec)>,
    consumption: Vec<(SummaryField, GaugeVec)>,
    inverter_last: GaugeVec,
    inverter_max: GaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let mut meter = Vec::with_capacity(METER_GAUGES.len());
        for (field, name, help) in METER_GAUGES {
            meter.push((field, gauge_vec(&registry, name, help, &["type", "phase"])?));
        }
        let mut production = Vec::with_capacity(PRODUCTION_GAUGES.len());
        for (field, name, help) in PRODUCTION_GAUGES {
            production.push((field, gauge_vec(&registry, name, help, &["type"])?));
        }
        let mut consumption = Vec::with_capacity(CONSUMPTION_GAUGES.len());
        for (field, name, help) in CONSUMPTION_GAUGES {
            consumption.push((field, gauge_vec(&registry, name, help, &["type"])?));
        }
        let inverter_last = gauge_vec(
            &registry,
            "inverter_last_report_watts",
            "Last reported watts",
            &["serial", "location"],
        )?;
        let inverter_max = gauge_vec(
            &registry,
            "inverter_max_report_watts",
            "Max reported watts",
            &["serial", "location"],
        )?;

        Ok(Self {
            registry,
            meter,
            production,
            consumption,
            inverter_last,
            inverter_max,
        })
    }

    /// Encodes every registered gauge in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn lookup(table: &[(SummaryField, GaugeVec)], field: SummaryField) -> Option<&GaugeVec> {
        table
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, gauge)| gauge)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_meter(&self, meter_type: MeterType, phase: Phase, field: MeterField, value: f64) {
        if let Some((_, gauge)) = self.meter.iter().find(|(candidate, _)| *candidate == field) {
            gauge
                .with_label_values(&[meter_type.as_str(), phase.as_str()])
                .set(value);
        }
    }

    fn set_production(&self, category: &str, field: SummaryField, value: f64) {
        if let Some(gauge) = Self::lookup(&self.production, field) {
            gauge.with_label_values(&[category]).set(value);
        }
    }

    fn set_consumption(&self, category: &str, field: SummaryField, value: f64) {
        if let Some(gauge) = Self::lookup(&self.consumption, field) {
            gauge.with_label_values(&[category]).set(value);
        }
    }

    fn set_inverter_last_report(&self, serial: &str, location: &str, watts: f64) {
        self.inverter_last
            .with_label_values(&[serial, location])
            .set(watts);
    }

    fn set_inverter_max_report(&self, serial: &str, location: &str, watts: f64) {
        self.inverter_max
            .with_label_values(&[serial, location])
            .set(watts);
    }
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec, prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves `/metrics` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("http server listening on {addr}");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_meter_gauge_uses_feed_labels() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_meter(MeterType::NetConsumption, Phase::B, MeterField::Voltage, 240.9);
        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"meter_voltage_volts{phase="ph-b",type="net-consumption"} 240.9"#));
    }

    #[test]
    fn test_active_count_is_production_only() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_production("inverters", SummaryField::ActiveCount, 12.0);
        metrics.set_consumption("net-consumption", SummaryField::ActiveCount, 3.0);
        metrics.set_consumption("net-consumption", SummaryField::PowerNow, -840.0);
        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"production_active_count{type="inverters"} 12"#));
        assert!(text.contains(r#"consumption_now_watts{type="net-consumption"} -840"#));
        assert!(!text.contains(r#"type="net-consumption"} 3"#));
    }

    #[test]
    fn test_inverter_gauges() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_inverter_last_report("121900012345", "unknown", 231.0);
        metrics.set_inverter_max_report("121900012345", "unknown", 295.0);
        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"inverter_last_report_watts{location="unknown",serial="121900012345"} 231"#
        ));
        assert!(text.contains(
            r#"inverter_max_report_watts{location="unknown",serial="121900012345"} 295"#
        ));
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        metrics.set_production("eim", SummaryField::PowerNow, 1790.5);

        let response = router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#"power_now_watts{type="eim"} 1790.5"#));
    }
}
