//! Integration with [lambda_runtime] and [lambda_http]
//!
//! *this module requires the `lambda` feature flag*
//!
//! # Simple Example
//! ```ignore
//!
//! use lambda_runtime::{Error, LambdaEvent};
//! // This replaces lambda_runtime::run and lambda_runtime::service_fn
//! use signalfx_lambda::lambda::handler::run;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Request {}
//!
//! #[derive(Serialize)]
//! struct Response {}
//!
//! async fn function_handler(event: LambdaEvent<Request>) -> Result<Response, Error> {
//!
//!     // Do something important
//!
//!     metrics::counter!("requests", "Method" => "Default").increment(1);
//!
//!     Ok(Response {})
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     tracing_subscriber::fmt()
//!         .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
//!         .with_target(false)
//!         .without_time()
//!         .compact()
//!         .init();
//!
//!     let metrics = signalfx_lambda::Builder::new()
//!         .with_dimension("team", "payments")
//!         .init()?;
//!
//!     run(metrics, function_handler).await
//! }
//! ```
//!
//! Every invocation sends `function.invocations`, `function.duration` (milliseconds),
//! `function.cold_starts` on the first invocation and `function.errors` when the
//! handler fails.
//!
//! # Advanced Usage
//!
//! If you're building a more sophisticated [tower] stack, use [MetricsLayer] or
//! [MetricsService] instead
//!

use super::collector::Collector;
use super::dimensions::InvocationContext;
use super::invocation::Invocation;
use super::Error;
use futures::future::BoxFuture;
use lambda_runtime::LambdaEvent;
use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// [tower::Layer] wrapping services in a [MetricsService]
#[derive(Clone, Copy)]
pub struct MetricsLayer {
    metrics: &'static Collector,
}

impl MetricsLayer {
    pub fn new(metrics: &'static Collector) -> Self {
        Self { metrics }
    }
}

impl<S> tower::Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { metrics: self.metrics, inner }
    }
}

/// [tower::Service] sending invocation metrics around every request and
/// [stopping](super::IngestSession::stop) the ingest session after each one
///
/// For composing your own [tower] stacks to input into the Rust Lambda Runtime
#[derive(Clone)]
pub struct MetricsService<S> {
    metrics: &'static Collector,
    inner: S,
}

impl<S> MetricsService<S> {
    /// Constructs a new [MetricsService] with the given [Collector] and inner [`tower::Service<LambdaEvent<Request>>`]
    /// to wrap
    pub fn new<Request>(metrics: &'static Collector, inner: S) -> MetricsService<S>
    where
        S: tower::Service<LambdaEvent<Request>>,
    {
        Self { metrics, inner }
    }
}

impl<S, Request> tower::Service<LambdaEvent<Request>> for MetricsService<S>
where
    S: tower::Service<LambdaEvent<Request>>,
    S::Error: From<Error>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsServiceFuture<S::Future, S::Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: LambdaEvent<Request>) -> Self::Future {
        let mut invocation = Invocation::open(self.metrics);

        match invocation.start(&InvocationContext::from(&req.context)) {
            Ok(()) => MetricsServiceFuture {
                inner: Some(self.inner.call(req)),
                invocation: Some(invocation),
                stopping: None,
                result: None,
                panic: None,
            },
            // The handler is not called when the invocation context is unusable
            Err(e) => MetricsServiceFuture {
                inner: None,
                invocation: None,
                stopping: Some(invocation.close()),
                result: Some(Err(e.into())),
                panic: None,
            },
        }
    }
}

#[pin_project]
#[doc(hidden)]
pub struct MetricsServiceFuture<F, R, E> {
    #[pin]
    inner: Option<F>,
    invocation: Option<Invocation>,
    stopping: Option<BoxFuture<'static, ()>>,
    result: Option<Result<R, E>>,
    panic: Option<Box<dyn Any + Send>>,
}

impl<F, R, E> Future for MetricsServiceFuture<F, R, E>
where
    F: Future<Output = Result<R, E>>,
{
    type Output = Result<R, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if let Some(inner) = this.inner.as_mut().as_pin_mut() {
            // A panicking handler still counts as a failed invocation
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
                Ok(Poll::Pending) => return Poll::Pending,
                Ok(Poll::Ready(result)) => Ok(result),
                Err(payload) => Err(payload),
            };
            this.inner.set(None);

            // Flush our metrics after the inner service is finished
            if let Some(invocation) = this.invocation.take() {
                let failed = !matches!(outcome, Ok(Ok(_)));
                *this.stopping = Some(invocation.finish(failed));
            }
            match outcome {
                Ok(result) => *this.result = Some(result),
                Err(payload) => *this.panic = Some(payload),
            }
        }

        if let Some(stopping) = this.stopping.as_mut() {
            ready!(stopping.as_mut().poll(cx));
            *this.stopping = None;
        }

        if let Some(payload) = this.panic.take() {
            panic::resume_unwind(payload);
        }

        Poll::Ready(this.result.take().expect("MetricsServiceFuture polled after completion"))
    }
}

/// Helpers for starting the Lambda Rust runtime with a [tower::Service] wrapped by a [MetricsService]
///
/// Reduces the amount of ceremony needed in `main()` for simple use cases
///
pub mod service {

    use super::*;

    /// Start the Lambda Rust runtime with a given [`tower::Service<LambdaEvent<Request>>`]
    /// which is then wrapped by new [MetricsService] with a given [Collector]
    pub async fn run<S, Request, Response>(metrics: &'static Collector, inner: S) -> Result<(), lambda_runtime::Error>
    where
        S: tower::Service<LambdaEvent<Request>, Response = Response>,
        S::Future: Future<Output = Result<Response, S::Error>>,
        S::Error: From<Error> + Into<lambda_runtime::Diagnostic> + std::fmt::Debug,
        Request: for<'de> serde::Deserialize<'de>,
        Response: serde::Serialize,
    {
        lambda_runtime::run(MetricsService::new::<Request>(metrics, inner)).await
    }

    /// Start the Lambda Rust runtime with a given [tower::Service<lambda_http::Request>]
    /// which is then wrapped by new [MetricsService] with a given [Collector]
    pub async fn run_http<'a, R, S, E>(metrics: &'static Collector, inner: S) -> Result<(), lambda_runtime::Error>
    where
        S: tower::Service<lambda_http::Request, Response = R, Error = E>,
        S::Future: Send + 'a,
        R: lambda_http::IntoResponse,
        E: From<Error> + Into<lambda_runtime::Diagnostic> + std::fmt::Debug,
    {
        lambda_runtime::run(MetricsService::new::<lambda_http::request::LambdaRequest>(
            metrics,
            lambda_http::Adapter::from(inner),
        ))
        .await
    }
}

/// Helpers for starting the Lambda Rust runtime with a handler function wrapped by the [MetricsService]
///
/// Reduces the amount of ceremony needed in `main()` for simple use cases
///
pub mod handler {

    use super::*;

    /// Start the Lambda Rust runtime with a given [LambdaEvent] handler function
    /// which is then wrapped by a new [MetricsService] with a given [Collector]
    pub async fn run<T, F, Request, Response>(
        metrics: &'static Collector,
        handler: T,
    ) -> Result<(), lambda_runtime::Error>
    where
        T: FnMut(LambdaEvent<Request>) -> F,
        F: Future<Output = Result<Response, lambda_runtime::Error>>,
        Request: for<'de> serde::Deserialize<'de>,
        Response: serde::Serialize,
    {
        super::service::run(metrics, lambda_runtime::service_fn(handler)).await
    }

    /// Start the Lambda Rust runtime with a given [lambda_http::Request] handler function
    /// which is then wrapped by a new [MetricsService] with a given [Collector]
    pub async fn run_http<'a, T, F, Response>(
        metrics: &'static Collector,
        handler: T,
    ) -> Result<(), lambda_runtime::Error>
    where
        T: FnMut(lambda_http::Request) -> F,
        F: Future<Output = Result<Response, lambda_runtime::Error>> + Send + 'a,
        Response: lambda_http::IntoResponse,
    {
        super::service::run_http(metrics, lambda_http::service_fn(handler)).await
    }
}
