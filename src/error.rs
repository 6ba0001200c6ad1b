use thiserror::Error;

/// Failure to turn one marked feed line into readings.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("feed line does not start with the data marker")]
    MissingMarker,
    #[error("invalid feed payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EnvoyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("upstream system signal is unavailable, no valid publication target")]
    UpstreamUnavailable,
    #[error("meter stream error: {0}")]
    StreamIo(String),
    #[error("poll step `{step}` failed: {source}")]
    PollCycle {
        step: &'static str,
        #[source]
        source: Box<EnvoyError>,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("digest authentication failed: {0}")]
    DigestAuth(#[from] digest_auth::Error),
    #[error("server at {0} answered 401 without a digest challenge")]
    MissingChallenge(String),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EnvoyError {
    pub(crate) fn poll_step(step: &'static str, source: EnvoyError) -> Self {
        EnvoyError::PollCycle {
            step,
            source: Box::new(source),
        }
    }
}
