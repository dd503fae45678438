use super::collector::{self, Collector};
use super::config::Config;
use super::dimensions::{Dimensions, RESERVED_KEYS};
use super::ingest::{HttpIngest, IngestClient};
use super::Error;
use tracing::warn;

/// Builder for the SignalFx Lambda metrics [Collector]
///
/// # Example
/// ```no_run
///  let metrics = signalfx_lambda::Builder::new()
///      .with_dimension("team", "payments")
///      .init()
///      .unwrap();
/// ```
#[derive(Default)]
pub struct Builder {
    config: Option<Config>,
    client: Option<Box<dyn IngestClient>>,
    access_token: Option<String>,
    static_dimensions: Dimensions,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given configuration instead of reading it with [Config::from_env]
    pub fn config(self, config: Config) -> Self {
        Self {
            config: Some(config),
            ..self
        }
    }

    /// Overrides the access token from the configuration
    pub fn access_token(self, token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..self
        }
    }

    /// Sends datapoints through `client` instead of the default [HttpIngest]
    pub fn ingest_client(self, client: impl IngestClient + 'static) -> Self {
        Self {
            client: Some(Box::new(client)),
            ..self
        }
    }

    /// Adds a static dimension (name, value), that will be sent with each datapoint.
    /// * This method can be called multiple times with distinct names
    /// * Names derived from the invocation context (`aws_region`, `lambda_arn`, ...)
    ///   take precedence once the first invocation starts
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if RESERVED_KEYS.contains(&name.as_str()) {
            warn!("Dimension {name} is derived from the invocation context and will be overwritten");
        }
        self.static_dimensions.insert(name, value);
        self
    }

    /// Consume the builder into a [Collector] without installing a `metrics` recorder
    pub fn build(self) -> Result<Collector, Error> {
        let config = match self.config {
            Some(config) => config,
            None => Config::from_env()?,
        };
        let client = match self.client {
            Some(client) => client,
            None => Box::new(HttpIngest::new(&config)?),
        };
        let access_token = self.access_token.or_else(|| config.access_token.clone());

        Ok(Collector::new(config, client, access_token, self.static_dimensions))
    }

    /// Intialize the collector including the call to metrics::set_global_recorder
    pub fn init(self) -> Result<&'static Collector, Error> {
        let collector: &'static Collector = Box::leak(Box::new(self.build()?));
        metrics::set_global_recorder(collector::Recorder::from(collector)).map_err(|_| Error::RecorderInstalled)?;
        Ok(collector)
    }
}
