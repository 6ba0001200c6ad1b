use envoy_bridge::config::Config;
use envoy_bridge::{
    metrics, pv_inverter_bus, DeviceIdentity, EnvoyClient, GxSystemMonitor, PollScraper,
    PrometheusMetrics, PvInverterBus, Scheduler, StaticSignal, StreamReader, StreamSettings,
    SystemMonitor,
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "envoy.yaml";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("envoy bridge exiting: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    info!("Starting Envoy bridge");
    let config_path =
        std::env::var("ENVOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    let cancel = CancellationToken::new();

    let prometheus = Arc::new(PrometheusMetrics::new()?);
    let metrics_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.metrics.port))).await?;
    let metrics_server = tokio::spawn(metrics::serve(
        metrics_listener,
        prometheus.clone(),
        cancel.clone(),
    ));

    let bus = PvInverterBus::new(&DeviceIdentity {
        device_instance: config.bus.device_instance,
        ..DeviceIdentity::default()
    });
    let bus_listener = TcpListener::bind(config.bus.listen).await?;
    let bus_server = tokio::spawn(pv_inverter_bus::serve(
        bus_listener,
        bus.clone(),
        cancel.clone(),
    ));

    let monitor: Arc<dyn SystemMonitor> = match &config.system_monitor {
        Some(gx) => Arc::new(GxSystemMonitor::new(gx.address, gx.unit_id, CONNECT_TIMEOUT)),
        None => Arc::new(StaticSignal::available()),
    };

    let client = EnvoyClient::new(
        config.envoy.base_url(),
        config.envoy.username.clone(),
        config.envoy.password.clone(),
        CONNECT_TIMEOUT,
    )?;
    let reader = StreamReader::new(
        client.clone(),
        monitor,
        prometheus.clone(),
        Arc::new(bus),
        StreamSettings::from(&config.stream),
    );
    let scraper = PollScraper::new(
        client,
        prometheus,
        config.inverters.clone(),
        config.poll.timeout(),
    );

    let scheduler = Scheduler::new(cancel.clone(), config.poll.interval())
        .with_grace(config.stream.read_timeout() + Duration::from_secs(1));
    let result = scheduler.run(reader, scraper, shutdown_signal()).await;

    cancel.cancel();
    if let Err(e) = metrics_server.await? {
        warn!("metrics server stopped with error: {e}");
    }
    if let Err(e) = bus_server.await? {
        warn!("bus server stopped with error: {e}");
    }
    info!("Envoy bridge stopped");
    result.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
