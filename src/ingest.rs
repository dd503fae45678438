//! # Ingest
//!
//! The client used to ship datapoints to the backend. A session is opened per
//! invocation, fed with datapoints, and stopped once at the end of the invocation.

use super::config::Config;
use super::datapoint::{Datapoint, DatapointBody};
use super::Error;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const TOKEN_HEADER: &str = "X-SF-Token";
const DATAPOINT_PATH: &str = "/v2/datapoint";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens ingest sessions
pub trait IngestClient: Send + Sync {
    fn open_session(&self, access_token: Option<&str>) -> Arc<dyn IngestSession>;
}

/// A per-invocation handle for sending datapoints
pub trait IngestSession: Send + Sync {
    /// Hand datapoints to the session
    fn send(&self, counters: Vec<Datapoint>, gauges: Vec<Datapoint>);

    /// Deliver everything sent so far and close the session
    fn stop(&self) -> BoxFuture<'static, Result<(), Error>>;
}

/// [IngestClient] posting SignalFx JSON datapoints over HTTP with [reqwest]
#[derive(Clone)]
pub struct HttpIngest {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIngest {
    /// Builds the HTTP client with a 1 second connect timeout and the configured
    /// response timeout
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(config.send_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{DATAPOINT_PATH}", config.metrics_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl IngestClient for HttpIngest {
    fn open_session(&self, access_token: Option<&str>) -> Arc<dyn IngestSession> {
        Arc::new(HttpSession {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            access_token: access_token.map(str::to_string),
            pending: Mutex::new(Pending::default()),
        })
    }
}

#[derive(Default)]
struct Pending {
    counters: Vec<Datapoint>,
    gauges: Vec<Datapoint>,
    stopped: bool,
}

struct HttpSession {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
    pending: Mutex<Pending>,
}

impl IngestSession for HttpSession {
    fn send(&self, counters: Vec<Datapoint>, gauges: Vec<Datapoint>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.stopped {
            debug!("Dropping datapoints sent to a stopped ingest session");
            return;
        }
        pending.counters.extend(counters);
        pending.gauges.extend(gauges);
    }

    fn stop(&self) -> BoxFuture<'static, Result<(), Error>> {
        let (counters, gauges) = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.stopped = true;
            (
                std::mem::take(&mut pending.counters),
                std::mem::take(&mut pending.gauges),
            )
        };

        let body = DatapointBody {
            counters: &counters,
            gauges: &gauges,
        };
        if body.is_empty() {
            return Box::pin(futures::future::ready(Ok(())));
        }

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.access_token {
            request = request.header(TOKEN_HEADER, token);
        }

        Box::pin(async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Rejected(status.as_u16()));
            }
            debug!(counters = counters.len(), gauges = gauges.len(), "Sent datapoints");
            Ok(())
        })
    }
}
