//! Process lifecycle: runs the stream reader and the poll scraper side by side
//! and stops both on a shutdown signal or a fatal reader error.

use crate::error::EnvoyError;
use crate::poll_scraper::PollScraper;
use crate::stream_reader::StreamReader;
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long the reader gets to notice cancellation before it is aborted.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

pub struct Scheduler {
    cancel: CancellationToken,
    poll_interval: Duration,
    grace: Duration,
}

impl Scheduler {
    /// `cancel` is shared with anything else that should stop alongside the core,
    /// such as the metrics and bus listeners.
    pub fn new(cancel: CancellationToken, poll_interval: Duration) -> Self {
        Self {
            cancel,
            poll_interval,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Runs until `shutdown` resolves (`Ok`) or the reader fails its startup
    /// precondition (`Err`). Either way every task sharing the token is cancelled.
    pub async fn run(
        &self,
        mut reader: StreamReader,
        mut scraper: PollScraper,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), EnvoyError> {
        let reader_cancel = self.cancel.clone();
        let mut reader_task = tokio::spawn(async move { reader.run(&reader_cancel).await });

        let scraper_cancel = self.cancel.clone();
        let period = self.poll_interval;
        let scraper_task = tokio::spawn(async move { scraper.run(period, &scraper_cancel).await });

        tokio::pin!(shutdown);
        let finished = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                None
            }
            joined = &mut reader_task => Some(joined),
        };
        self.cancel.cancel();

        let joined = match finished {
            Some(joined) => Some(joined),
            None => join_or_abort("stream reader", reader_task, self.grace).await,
        };
        let result = match joined {
            Some(joined) => joined.map_err(EnvoyError::from).and_then(|r| r),
            None => Ok(()),
        };

        join_or_abort("poll scraper", scraper_task, self.grace).await;

        match &result {
            Ok(()) => info!("scheduler stopped"),
            Err(e) => error!("scheduler stopping after fatal error: {e}"),
        }
        result
    }
}

/// Waits up to `grace` for `task`, aborting it when it overruns (`None`).
async fn join_or_abort<T>(
    name: &str,
    mut task: JoinHandle<T>,
    grace: Duration,
) -> Option<Result<T, JoinError>> {
    match timeout(grace, &mut task).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            warn!("{name} did not stop within {grace:?}, aborting");
            task.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnStreamFailure;
    use crate::envoy_client::EnvoyClient;
    use crate::sink::BusPath;
    use crate::stream_reader::StreamSettings;
    use crate::system_monitor::{StaticSignal, UpstreamSignal};
    use crate::test_support::{start_feed_server, RecordingBus, RecordingMetrics};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const FEED: &str = "data: {\"production\":{\"ph-a\":{\"p\":40.0},\"ph-b\":{\"p\":60.0}}}\n";

    fn parts(
        base_url: String,
        signal: UpstreamSignal,
    ) -> (StreamReader, PollScraper, Arc<RecordingBus>) {
        let client =
            EnvoyClient::new(base_url, "installer", "secret", Duration::from_secs(1)).unwrap();
        let metrics = Arc::new(RecordingMetrics::default());
        let bus = Arc::new(RecordingBus::default());
        let reader = StreamReader::new(
            client,
            Arc::new(StaticSignal(signal)),
            metrics.clone(),
            bus.clone(),
            StreamSettings {
                read_timeout: Duration::from_secs(2),
                reconnect_delay: Duration::from_millis(100),
                on_failure: OnStreamFailure::KeepLastValues,
                energy_forward_kwh: 10.0,
            },
        );
        // The scraper talks to a closed port so the feed server only counts stream connections.
        let poll_client =
            EnvoyClient::new("http://127.0.0.1:9", "installer", "secret", Duration::from_secs(1))
                .unwrap();
        let scraper =
            PollScraper::new(poll_client, metrics, BTreeMap::new(), Duration::from_secs(1));
        (reader, scraper, bus)
    }

    #[tokio::test]
    async fn test_overrunning_task_is_aborted() {
        let (guard, released) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });

        let joined = join_or_abort("stuck task", task, Duration::from_millis(50)).await;
        assert!(joined.is_none());
        // The guard is dropped only once the aborted task has been torn down.
        let released = timeout(Duration::from_secs(1), released)
            .await
            .expect("aborted task should be dropped");
        assert!(released.is_err());
    }

    #[tokio::test]
    async fn test_finished_task_is_joined() {
        let task = tokio::spawn(async { 7 });
        let joined = join_or_abort("quick task", task, Duration::from_secs(1)).await;
        assert_eq!(joined.map(|r| r.unwrap()), Some(7));
    }

    #[tokio::test]
    async fn test_precondition_failure_stops_everything() {
        let (addr, connections) = start_feed_server(FEED, true).await;
        let (reader, scraper, bus) = parts(format!("http://{addr}"), UpstreamSignal::Unavailable);
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(cancel.clone(), Duration::from_secs(60));

        let result = timeout(
            Duration::from_secs(3),
            scheduler.run(reader, scraper, std::future::pending()),
        )
        .await
        .expect("scheduler should stop on its own");

        assert!(matches!(result, Err(EnvoyError::UpstreamUnavailable)));
        assert!(cancel.is_cancelled());
        assert_eq!(connections.load(Ordering::SeqCst), 0);
        assert!(bus.writes().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_signal_drains_reader() {
        let (addr, connections) = start_feed_server(FEED, true).await;
        let (reader, scraper, bus) = parts(format!("http://{addr}"), UpstreamSignal::Available(80.0));
        let cancel = CancellationToken::new();
        let scheduler =
            Scheduler::new(cancel.clone(), Duration::from_secs(60)).with_grace(Duration::from_secs(1));

        let result = timeout(
            Duration::from_secs(3),
            scheduler.run(reader, scraper, tokio::time::sleep(Duration::from_millis(300))),
        )
        .await
        .expect("scheduler should honour the shutdown signal");

        assert!(result.is_ok());
        assert!(cancel.is_cancelled());
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(bus.last(BusPath::Power), Some(100.0));
    }
}
