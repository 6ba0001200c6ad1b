//! Recording sinks and a raw feed server shared by the unit tests.

use crate::sink::{BusPath, BusSink, MetricsSink};
use crate::telemetry::{MeterField, MeterType, Phase, SummaryField};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricWrite {
    Meter(MeterType, Phase, MeterField, f64),
    Production(String, SummaryField, f64),
    Consumption(String, SummaryField, f64),
    InverterLast(String, String, f64),
    InverterMax(String, String, f64),
}

#[derive(Default)]
pub struct RecordingMetrics {
    writes: Mutex<Vec<MetricWrite>>,
}

impl RecordingMetrics {
    pub fn writes(&self) -> Vec<MetricWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn meter(&self, meter_type: MeterType, phase: Phase, field: MeterField) -> Option<f64> {
        self.writes().into_iter().rev().find_map(|write| match write {
            MetricWrite::Meter(m, p, f, value) if m == meter_type && p == phase && f == field => {
                Some(value)
            }
            _ => None,
        })
    }

    fn push(&self, write: MetricWrite) {
        self.writes.lock().unwrap().push(write);
    }
}

impl MetricsSink for RecordingMetrics {
    fn set_meter(&self, meter_type: MeterType, phase: Phase, field: MeterField, value: f64) {
        self.push(MetricWrite::Meter(meter_type, phase, field, value));
    }

    fn set_production(&self, category: &str, field: SummaryField, value: f64) {
        self.push(MetricWrite::Production(category.to_string(), field, value));
    }

    fn set_consumption(&self, category: &str, field: SummaryField, value: f64) {
        self.push(MetricWrite::Consumption(category.to_string(), field, value));
    }

    fn set_inverter_last_report(&self, serial: &str, location: &str, watts: f64) {
        self.push(MetricWrite::InverterLast(
            serial.to_string(),
            location.to_string(),
            watts,
        ));
    }

    fn set_inverter_max_report(&self, serial: &str, location: &str, watts: f64) {
        self.push(MetricWrite::InverterMax(
            serial.to_string(),
            location.to_string(),
            watts,
        ));
    }
}

#[derive(Default)]
pub struct RecordingBus {
    writes: Mutex<Vec<(BusPath, f64)>>,
}

impl RecordingBus {
    pub fn writes(&self) -> Vec<(BusPath, f64)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last(&self, path: BusPath) -> Option<f64> {
        self.writes()
            .into_iter()
            .rev()
            .find_map(|(p, value)| (p == path).then_some(value))
    }
}

impl BusSink for RecordingBus {
    fn set(&self, path: BusPath, value: f64) {
        self.writes.lock().unwrap().push((path, value));
    }
}

/// A bare HTTP/1.1 server answering every connection with a chunked body.
///
/// With `hold_open` the connection then idles; otherwise it is dropped
/// without the terminating chunk, which the client sees as a broken body.
/// Returns the address and a counter of accepted connections.
pub async fn start_feed_server(body: &'static str, hold_open: bool) -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = [0u8; 2048];
                let _ = socket.read(&mut request).await;
                let mut response = String::from(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                );
                if !body.is_empty() {
                    response.push_str(&format!("{:x}\r\n{}\r\n", body.len(), body));
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
                if hold_open {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
        }
    });

    (addr, connections)
}
