use crate::error::EnvoyError;
use crate::telemetry::{InverterReport, ProductionReport};
use digest_auth::AuthContext;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

pub const METER_STREAM_PATH: &str = "/stream/meter";
pub const PRODUCTION_PATH: &str = "/production.json";
pub const INVERTERS_PATH: &str = "/api/v1/production/inverters";

/// Longest feed line accepted before the framing is considered broken.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// HTTP access to the gateway. Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct EnvoyClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl EnvoyClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, EnvoyError> {
        Ok(Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            client: reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()?,
        })
    }

    /// Opens the live meter feed. Waiting for the response head is bounded by
    /// `read_timeout`, as is every subsequent read.
    pub async fn open_meter_stream(&self, read_timeout: Duration) -> Result<MeterStream, EnvoyError> {
        let response = timeout(read_timeout, self.get_with_digest(METER_STREAM_PATH, None))
            .await
            .map_err(|_| EnvoyError::StreamIo("timed out waiting for the feed to answer".into()))??
            .error_for_status()?;
        Ok(MeterStream::new(response, read_timeout))
    }

    pub async fn production(&self, request_timeout: Duration) -> Result<ProductionReport, EnvoyError> {
        let report = self
            .request(&self.url(PRODUCTION_PATH), Some(request_timeout))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(report)
    }

    pub async fn inverters(
        &self,
        request_timeout: Duration,
    ) -> Result<Vec<InverterReport>, EnvoyError> {
        let inverters = self
            .get_with_digest(INVERTERS_PATH, Some(request_timeout))
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(inverters)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, url: &str, request_timeout: Option<Duration>) -> RequestBuilder {
        let builder = self.client.get(url);
        match request_timeout {
            Some(t) => builder.timeout(t),
            None => builder,
        }
    }

    /// GET that answers a digest challenge once if the gateway sends one.
    async fn get_with_digest(
        &self,
        path: &str,
        request_timeout: Option<Duration>,
    ) -> Result<Response, EnvoyError> {
        let url = self.url(path);
        let response = self.request(&url, request_timeout).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| EnvoyError::MissingChallenge(url.clone()))?;
        let mut prompt = digest_auth::parse(&challenge)?;
        let context = AuthContext::new(self.username.as_str(), self.password.as_str(), path);
        let answer = prompt.respond(&context)?;

        let response = self
            .request(&url, request_timeout)
            .header(AUTHORIZATION, answer.to_header_string())
            .send()
            .await?;
        Ok(response)
    }
}

/// Newline-delimited view over the chunked feed body.
pub struct MeterStream {
    lines: FramedRead<Pin<Box<dyn AsyncRead + Send>>, LinesCodec>,
    read_timeout: Duration,
}

impl MeterStream {
    fn new(response: Response, read_timeout: Duration) -> Self {
        let body: Pin<Box<dyn AsyncRead + Send>> = Box::pin(StreamReader::new(
            response.bytes_stream().map_err(std::io::Error::other),
        ));
        Self {
            lines: FramedRead::new(body, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            read_timeout,
        }
    }

    /// Next line without its terminator, or `None` once the feed has closed.
    pub async fn next_line(&mut self) -> Result<Option<String>, EnvoyError> {
        let line = timeout(self.read_timeout, self.lines.next())
            .await
            .map_err(|_| EnvoyError::StreamIo(format!("no data for {:?}", self.read_timeout)))?;
        line.transpose()
            .map_err(|e| EnvoyError::StreamIo(e.to_string()))
    }
}
