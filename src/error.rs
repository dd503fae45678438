//! Error types for the Lambda telemetry wrapper.

use thiserror::Error;

/// Errors raised by the wrapper itself.
///
/// Errors returned by the wrapped handler are never converted into this type; they
/// are handed back to the Lambda runtime unchanged.
#[derive(Error, Debug)]
pub enum Error {
    /// The invoked function ARN has too few colon-delimited segments to identify a
    /// region, account and resource.
    #[error("malformed function ARN `{arn}`: expected at least 6 colon-delimited segments, found {segments}")]
    MalformedArn { arn: String, segments: usize },

    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid value `{value}` for {name}")]
    InvalidConfig { name: &'static str, value: String },

    /// The tracing wrapper has not run yet, so there is no tracer to use.
    #[error("tracer is not initialized; wrap the handler with TracingLayer before injecting trace context")]
    TracerNotInitialized,

    /// The span exporter or tracer provider could not be built.
    #[error("failed to build tracer: {0}")]
    Tracer(String),

    /// Sending datapoints to the ingest endpoint failed.
    #[error("ingest transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The ingest endpoint answered with a non-success status.
    #[error("ingest endpoint rejected datapoints with status {0}")]
    Rejected(u16),

    /// A global `metrics` recorder was already installed.
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}
