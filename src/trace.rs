//! OpenTelemetry tracing of Lambda invocations
//!
//! *this module requires the `trace` feature flag*
//!
//! [TracingLayer] opens one span per invocation. The parent span is extracted from
//! the W3C `traceparent` header of the event, the span is attached as the current
//! context while the handler runs, and the span is ended and flushed to
//! `SIGNALFX_TRACING_URL` before the response is returned to the runtime.
//!
//! # Example
//! ```ignore
//! use lambda_runtime::{Error, LambdaEvent};
//! use serde_json::Value;
//! use signalfx_lambda::{lambda::MetricsLayer, trace::TracingLayer};
//!
//! async fn function_handler(event: LambdaEvent<Value>) -> Result<Value, Error> {
//!     // Forward the trace to a downstream service
//!     let mut headers = std::collections::HashMap::new();
//!     signalfx_lambda::trace::inject(&mut headers)?;
//!
//!     Ok(event.payload)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let metrics = signalfx_lambda::Builder::new().init()?;
//!
//!     let service = tower::ServiceBuilder::new()
//!         .layer(TracingLayer::new())
//!         .layer(MetricsLayer::new(metrics))
//!         .service_fn(function_handler);
//!
//!     lambda_runtime::run(service).await
//! }
//! ```

use super::config::Config;
use super::dimensions::{DimensionResolver, Dimensions, InvocationContext};
use super::Error;
use aws_lambda_events::kinesis::KinesisEvent;
use aws_lambda_events::sns::SnsEvent;
use aws_lambda_events::sqs::SqsEvent;
use lambda_http::request::LambdaRequest;
use lambda_runtime::LambdaEvent;
use opentelemetry::propagation::{Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use pin_project::pin_project;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use tracing::{info, warn};

const TRACER_NAME: &str = "signalfx_lambda";
const COMPONENT: &str = "rust-lambda-wrapper";
const TOKEN_HEADER: &str = "X-SF-Token";

/// Event sources whose invocations are recorded as `Consumer` spans
const CONSUMER_SOURCES: [&str; 3] = ["aws:sqs", "aws:sns", "aws:kinesis"];

static TRACER: OnceLock<LambdaTracer> = OnceLock::new();

/// Tracer shared by every traced invocation of the process
pub struct LambdaTracer {
    provider: SdkTracerProvider,
    tracer: Tracer,
    propagator: TraceContextPropagator,
    config: Config,
    resolver: Mutex<DimensionResolver>,
}

impl LambdaTracer {
    /// Builds a tracer exporting over OTLP/HTTP to [Config::tracing_url]
    ///
    /// `service.name` is [Config::service_name], or `default_service_name` when unset.
    pub fn new(config: Config, default_service_name: &str) -> Result<Self, Error> {
        let mut headers = HashMap::new();
        if let Some(token) = &config.access_token {
            headers.insert(TOKEN_HEADER.to_string(), token.clone());
        }

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(config.tracing_url.clone())
            .with_headers(headers)
            .build()
            .map_err(|e| Error::Tracer(e.to_string()))?;

        let service_name = config
            .service_name
            .clone()
            .unwrap_or_else(|| default_service_name.to_string());

        let provider = SdkTracerProvider::builder()
            .with_sampler(Sampler::AlwaysOn)
            .with_batch_exporter(exporter)
            .with_resource(Resource::builder().with_service_name(service_name).build())
            .build();

        Ok(Self::with_provider(config, provider))
    }

    /// Wraps an already configured provider
    pub fn with_provider(config: Config, provider: SdkTracerProvider) -> Self {
        Self {
            tracer: provider.tracer(TRACER_NAME),
            provider,
            propagator: TraceContextPropagator::new(),
            resolver: Mutex::new(DimensionResolver::new(Dimensions::new(), config.execution_env.clone())),
            config,
        }
    }

    /// The process wide tracer, once a traced invocation created it
    pub fn global() -> Result<&'static LambdaTracer, Error> {
        TRACER.get().ok_or(Error::TracerNotInitialized)
    }

    /// Returns the process wide tracer, building it from the environment on first use
    pub fn init(function_name: &str) -> Result<&'static LambdaTracer, Error> {
        if let Some(tracer) = TRACER.get() {
            return Ok(tracer);
        }
        let tracer = Self::new(Config::from_env()?, function_name)?;
        Ok(TRACER.get_or_init(|| tracer))
    }

    /// Writes the current span context into `carrier`
    pub fn inject(&self, carrier: &mut HashMap<String, String>) {
        self.propagator.inject_context(&OtelContext::current(), carrier);
    }

    /// Writes the current span context into outgoing HTTP headers
    pub fn inject_headers(&self, headers: &mut http::HeaderMap) {
        self.propagator
            .inject_context(&OtelContext::current(), &mut HeaderInjector(headers));
    }

    /// Flushes finished spans to the exporter, logging failures
    pub fn flush(&self) {
        if let Err(e) = self.provider.force_flush() {
            warn!(error = %e, "Failed to flush spans");
        }
    }

    fn start_span(&self, ctx: &InvocationContext, event: &impl EventCarrier) -> Result<OtelContext, Error> {
        let fields = self
            .resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(ctx)?
            .clone();

        let parent = self.propagator.extract(&event.headers());
        let (kind, kind_name) = match event.event_source() {
            Some(source) if CONSUMER_SOURCES.contains(&source.as_str()) => (SpanKind::Consumer, "consumer"),
            _ => (SpanKind::Server, "server"),
        };

        let mut attributes: Vec<KeyValue> = fields
            .iter()
            .map(|(name, value)| KeyValue::new(name.to_string(), value.to_string()))
            .collect();
        attributes.push(KeyValue::new("component", COMPONENT));
        attributes.push(KeyValue::new("span.kind", kind_name));

        let name = format!("{}{}", self.config.span_prefix, ctx.function_name);
        if self.config.tracing_debug {
            info!(span = %name, kind = kind_name, "Starting invocation span");
        }

        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent);

        Ok(parent.with_span(span))
    }
}

/// Writes the current span context of the process wide tracer into `carrier`
///
/// Fails with [Error::TracerNotInitialized] before the first traced invocation.
pub fn inject(carrier: &mut HashMap<String, String>) -> Result<(), Error> {
    LambdaTracer::global()?.inject(carrier);
    Ok(())
}

struct HeaderInjector<'a>(&'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(key.as_bytes()),
            http::header::HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Event payloads that carry trace propagation headers
pub trait EventCarrier {
    /// Headers with lowercased names
    fn headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// `eventSource` of the first record, for batched event sources
    fn event_source(&self) -> Option<String> {
        None
    }
}

impl EventCarrier for Value {
    fn headers(&self) -> HashMap<String, String> {
        self.get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(name, value)| value.as_str().map(|v| (name.to_lowercase(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn event_source(&self) -> Option<String> {
        let record = self.get("Records")?.get(0)?;
        record
            .get("eventSource")
            .or_else(|| record.get("EventSource"))?
            .as_str()
            .map(str::to_string)
    }
}

fn header_carrier(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_lowercase(), v.to_string())))
        .collect()
}

impl EventCarrier for LambdaRequest {
    fn headers(&self) -> HashMap<String, String> {
        match self {
            LambdaRequest::ApiGatewayV1(req) => header_carrier(&req.headers),
            LambdaRequest::ApiGatewayV2(req) => header_carrier(&req.headers),
            LambdaRequest::Alb(req) => header_carrier(&req.headers),
            LambdaRequest::WebSocket(req) => header_carrier(&req.headers),
            _ => HashMap::new(),
        }
    }
}

/// Message attributes of the first record carry the trace headers
impl EventCarrier for SqsEvent {
    fn headers(&self) -> HashMap<String, String> {
        self.records
            .first()
            .map(|message| {
                message
                    .message_attributes
                    .iter()
                    .filter_map(|(name, attr)| attr.string_value.clone().map(|v| (name.to_lowercase(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn event_source(&self) -> Option<String> {
        self.records.first()?.event_source.clone()
    }
}

impl EventCarrier for SnsEvent {
    fn headers(&self) -> HashMap<String, String> {
        self.records
            .first()
            .map(|record| {
                record
                    .sns
                    .message_attributes
                    .iter()
                    .map(|(name, attr)| (name.to_lowercase(), attr.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn event_source(&self) -> Option<String> {
        self.records.first().map(|record| record.event_source.clone())
    }
}

impl EventCarrier for KinesisEvent {
    fn event_source(&self) -> Option<String> {
        self.records.first()?.event_source.clone()
    }
}

/// [tower::Layer] wrapping services in a [TracingService]
#[derive(Clone, Copy, Default)]
pub struct TracingLayer {
    tracer: Option<&'static LambdaTracer>,
}

impl TracingLayer {
    /// Traces with the process wide tracer, created on the first invocation
    pub fn new() -> Self {
        Self::default()
    }

    /// Traces with an explicitly built tracer
    pub fn with_tracer(tracer: &'static LambdaTracer) -> Self {
        Self { tracer: Some(tracer) }
    }
}

impl<S> tower::Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            tracer: self.tracer,
            inner,
        }
    }
}

/// [tower::Service] running every request inside an invocation span
///
/// Tracing failures never fail the invocation: the handler then runs untraced.
#[derive(Clone)]
pub struct TracingService<S> {
    tracer: Option<&'static LambdaTracer>,
    inner: S,
}

impl<S> TracingService<S> {
    fn start<Request: EventCarrier>(&self, req: &LambdaEvent<Request>) -> Option<InvocationSpan> {
        let tracer = match self.tracer {
            Some(tracer) => tracer,
            None => match LambdaTracer::init(&req.context.env_config.function_name) {
                Ok(tracer) => tracer,
                Err(e) => {
                    warn!(error = %e, "Failed to initialize the tracer");
                    return None;
                }
            },
        };

        match tracer.start_span(&InvocationContext::from(&req.context), &req.payload) {
            Ok(cx) => Some(InvocationSpan { tracer, cx }),
            Err(e) => {
                warn!(error = %e, "Invocation is not traced");
                None
            }
        }
    }
}

impl<S, Request> tower::Service<LambdaEvent<Request>> for TracingService<S>
where
    S: tower::Service<LambdaEvent<Request>>,
    S::Error: fmt::Display + fmt::Debug,
    Request: EventCarrier,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TracingServiceFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: LambdaEvent<Request>) -> Self::Future {
        let span = self.start(&req);

        let _attached = span.as_ref().map(|span| span.cx.clone().attach());
        TracingServiceFuture {
            inner: self.inner.call(req),
            span,
        }
    }
}

#[pin_project]
#[doc(hidden)]
pub struct TracingServiceFuture<F> {
    #[pin]
    inner: F,
    span: Option<InvocationSpan>,
}

impl<F, R, E> Future for TracingServiceFuture<F>
where
    F: Future<Output = Result<R, E>>,
    E: fmt::Display + fmt::Debug,
{
    type Output = Result<R, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let attached = this.span.as_ref().map(|span| span.cx.clone());
        let inner = this.inner;
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            let _attached = attached.map(OtelContext::attach);
            inner.poll(cx)
        }));

        let result = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(result)) => result,
            Err(payload) => {
                if let Some(span) = this.span.take() {
                    let message = panic_message(payload.as_ref());
                    let object = format!("panic({message:?})");
                    span.record_error(message, "panic", object);
                    span.finish(true);
                }
                panic::resume_unwind(payload);
            }
        };

        if let Some(span) = this.span.take() {
            if let Err(e) = &result {
                span.record_error(e.to_string(), std::any::type_name::<E>(), format!("{e:?}"));
            }
            span.finish(result.is_err());
        }
        Poll::Ready(result)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

struct InvocationSpan {
    tracer: &'static LambdaTracer,
    cx: OtelContext,
}

impl InvocationSpan {
    fn record_error(&self, message: String, kind: &'static str, object: String) {
        let span = self.cx.span();
        span.set_status(Status::error(message.clone()));
        span.set_attribute(KeyValue::new("error", true));
        span.set_attribute(KeyValue::new("sfx.error.message", message));
        span.set_attribute(KeyValue::new("sfx.error.kind", kind));
        span.set_attribute(KeyValue::new("sfx.error.object", object));
    }

    fn finish(self, failed: bool) {
        self.cx.span().end();
        if self.tracer.config.tracing_debug {
            info!(failed, "Finished invocation span");
        }
        self.tracer.flush();
    }
}
