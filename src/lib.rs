//! SignalFx metrics and tracing for AWS Lambda handlers
//!
//! [Builder] creates the process wide [Collector]; [lambda::MetricsLayer] and
//! [trace::TracingLayer] wrap a handler so every invocation is measured and traced.

pub use {
    builder::Builder,
    collector::{Collector, Recorder},
    config::Config,
    datapoint::Datapoint,
    dimensions::{lambda_fields, DimensionResolver, Dimensions, FunctionArn, InvocationContext},
    error::Error,
    ingest::{HttpIngest, IngestClient, IngestSession},
    invocation::{COLD_STARTS, DURATION, ERRORS, INVOCATIONS},
};

#[cfg(test)]
#[macro_use]
extern crate rusty_fork;

mod builder;
mod collector;
pub mod config;
mod datapoint;
pub mod dimensions;
mod error;
mod ingest;
mod invocation;
#[cfg(feature = "lambda")]
pub mod lambda;
#[cfg(feature = "trace")]
pub mod trace;
