//! # Config
//!
//! Environment driven configuration shared by the metrics and tracing wrappers
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SIGNALFX_ACCESS_TOKEN` | none, datapoints are sent without a token |
//! | `SIGNALFX_METRICS_URL` | `SIGNALFX_ENDPOINT_URL`, then `https://pops.signalfx.com` |
//! | `SIGNALFX_TRACING_URL` | `SIGNALFX_ENDPOINT_URL/v2/trace/otlp`, then `https://ingest.signalfx.com/v2/trace/otlp` |
//! | `SIGNALFX_SERVICE_NAME` | the function name |
//! | `SIGNALFX_SPAN_PREFIX` | `lambda_rust_` |
//! | `SIGNALFX_SEND_TIMEOUT` | `0.3` seconds |
//! | `SIGNALFX_TRACING_DEBUG` | `false` |
//!
//! `SIGNALFX_AUTH_TOKEN` and `SIGNALFX_INGEST_ENDPOINT` are still honored but log a
//! deprecation warning.

use super::Error;
use std::time::Duration;
use tracing::warn;

pub const ACCESS_TOKEN: &str = "SIGNALFX_ACCESS_TOKEN";
pub const LEGACY_ACCESS_TOKEN: &str = "SIGNALFX_AUTH_TOKEN";
pub const METRICS_URL: &str = "SIGNALFX_METRICS_URL";
pub const LEGACY_METRICS_URL: &str = "SIGNALFX_INGEST_ENDPOINT";
pub const ENDPOINT_URL: &str = "SIGNALFX_ENDPOINT_URL";
pub const TRACING_URL: &str = "SIGNALFX_TRACING_URL";
pub const SERVICE_NAME: &str = "SIGNALFX_SERVICE_NAME";
pub const SPAN_PREFIX: &str = "SIGNALFX_SPAN_PREFIX";
pub const SEND_TIMEOUT: &str = "SIGNALFX_SEND_TIMEOUT";
pub const TRACING_DEBUG: &str = "SIGNALFX_TRACING_DEBUG";
pub const EXECUTION_ENV: &str = "AWS_EXECUTION_ENV";

const DEFAULT_METRICS_URL: &str = "https://pops.signalfx.com";
const DEFAULT_TRACING_URL: &str = "https://ingest.signalfx.com/v2/trace/otlp";
const TRACE_PATH: &str = "/v2/trace/otlp";
const DEFAULT_SPAN_PREFIX: &str = "lambda_rust_";
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(300);

/// Resolved wrapper configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub access_token: Option<String>,
    pub metrics_url: String,
    pub tracing_url: String,
    pub service_name: Option<String>,
    pub span_prefix: String,
    pub send_timeout: Duration,
    pub tracing_debug: bool,
    pub execution_env: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token: None,
            metrics_url: DEFAULT_METRICS_URL.to_string(),
            tracing_url: DEFAULT_TRACING_URL.to_string(),
            service_name: None,
            span_prefix: DEFAULT_SPAN_PREFIX.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            tracing_debug: false,
            execution_env: None,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let access_token = match get(ACCESS_TOKEN) {
            Some(token) => Some(token),
            None => get(LEGACY_ACCESS_TOKEN).inspect(|_| {
                warn!("{LEGACY_ACCESS_TOKEN} is deprecated, use {ACCESS_TOKEN} instead");
            }),
        };

        let endpoint = get(ENDPOINT_URL).map(|url| url.trim_end_matches('/').to_string());

        let metrics_url = get(METRICS_URL)
            .or_else(|| {
                get(LEGACY_METRICS_URL).inspect(|_| {
                    warn!("{LEGACY_METRICS_URL} is deprecated, use {METRICS_URL} instead");
                })
            })
            .or_else(|| endpoint.clone())
            .unwrap_or_else(|| DEFAULT_METRICS_URL.to_string());

        let tracing_url = get(TRACING_URL)
            .or_else(|| endpoint.map(|base| format!("{base}{TRACE_PATH}")))
            .unwrap_or_else(|| DEFAULT_TRACING_URL.to_string());

        let send_timeout = match get(SEND_TIMEOUT) {
            Some(value) => parse_seconds(SEND_TIMEOUT, value)?,
            None => DEFAULT_SEND_TIMEOUT,
        };

        let tracing_debug = match get(TRACING_DEBUG) {
            Some(value) => parse_flag(TRACING_DEBUG, value)?,
            None => false,
        };

        Ok(Self {
            access_token,
            metrics_url,
            tracing_url,
            service_name: get(SERVICE_NAME),
            span_prefix: get(SPAN_PREFIX).unwrap_or_else(|| DEFAULT_SPAN_PREFIX.to_string()),
            send_timeout,
            tracing_debug,
            execution_env: get(EXECUTION_ENV),
        })
    }
}

fn parse_seconds(name: &'static str, value: String) -> Result<Duration, Error> {
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(Error::InvalidConfig { name, value }),
    }
}

fn parse_flag(name: &'static str, value: String) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig { name, value }),
    }
}
