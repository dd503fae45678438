//! # Collector
//!
//! Metric emitter and per-process wrapper state returned from signalfx_lambda::Builder

use super::config::Config;
use super::datapoint::Datapoint;
use super::dimensions::{DimensionResolver, Dimensions, InvocationContext};
use super::ingest::{IngestClient, IngestSession};
use super::Error;
use metrics::SharedString;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Collector state shared between invocations
/// This lives within a mutex
struct CollectorState {
    /// Default dimensions, refreshed when the request id changes
    resolver: DimensionResolver,
    /// Session of the invocation in flight, if any
    session: Option<Arc<dyn IngestSession>>,
}

/// SignalFx metrics emitter + invocation state
///
/// Use [Builder](super::Builder) to construct
///
/// # Example
/// ```no_run
/// use signalfx_lambda::Dimensions;
///
/// let metrics = signalfx_lambda::Builder::new()
///      .with_dimension("team", "payments")
///      .init()
///      .unwrap();
///
///  // Emitted through the session of the invocation in flight, dropped otherwise
///  metrics.emit_counter("orders", 1.0, Dimensions::new().with("method", "card"));
///  metrics::counter!("requests", "method" => "card").increment(1);
/// ```
pub struct Collector {
    state: Mutex<CollectorState>,
    client: Box<dyn IngestClient>,
    access_token: Option<String>,
    cold_start: AtomicBool,
    pub config: Config,
}

impl Collector {
    pub fn new(
        config: Config,
        client: Box<dyn IngestClient>,
        access_token: Option<String>,
        static_dimensions: Dimensions,
    ) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                resolver: DimensionResolver::new(static_dimensions, config.execution_env.clone()),
                session: None,
            }),
            client,
            access_token,
            cold_start: AtomicBool::new(true),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send counters and gauges through the active session
    ///
    /// Every datapoint gets the default dimensions it does not set itself. Without an
    /// active session (outside a wrapped invocation) this does nothing.
    pub fn emit(&self, mut counters: Vec<Datapoint>, mut gauges: Vec<Datapoint>) {
        let session = {
            let state = self.state();
            let Some(session) = state.session.clone() else {
                debug!("No active ingest session, dropping datapoints");
                return;
            };
            let defaults = state.resolver.current();
            for point in counters.iter_mut().chain(gauges.iter_mut()) {
                point.dimensions.merge_defaults(defaults);
            }
            session
        };

        session.send(counters, gauges);
    }

    pub fn emit_counters(&self, counters: Vec<Datapoint>) {
        self.emit(counters, Vec::new())
    }

    pub fn emit_gauges(&self, gauges: Vec<Datapoint>) {
        self.emit(Vec::new(), gauges)
    }

    pub fn emit_counter(&self, name: impl Into<String>, value: f64, dimensions: Dimensions) {
        self.emit_counters(vec![Datapoint::new(name, value).with_dimensions(dimensions)])
    }

    pub fn emit_gauge(&self, name: impl Into<String>, value: f64, dimensions: Dimensions) {
        self.emit_gauges(vec![Datapoint::new(name, value).with_dimensions(dimensions)])
    }

    /// Default dimensions currently merged into every datapoint
    pub fn default_dimensions(&self) -> Dimensions {
        self.state().resolver.current().clone()
    }

    /// Open a fresh session and make it the target of every emit call
    pub(crate) fn open_session(&self) -> Arc<dyn IngestSession> {
        let session = self.client.open_session(self.access_token.as_deref());
        let previous = self.state().session.replace(session.clone());
        if previous.is_some() {
            debug!("Replacing an ingest session left active by a previous invocation");
        }
        session
    }

    /// Stop routing emit calls to `session`
    pub(crate) fn close_session(&self, session: &Arc<dyn IngestSession>) {
        let mut state = self.state();
        if state.session.as_ref().is_some_and(|active| Arc::ptr_eq(active, session)) {
            state.session = None;
        }
    }

    pub(crate) fn refresh_dimensions(&self, ctx: &InvocationContext) -> Result<(), Error> {
        self.state().resolver.resolve(ctx).map(|_| ())
    }

    /// True exactly once per collector, on the first call
    pub(crate) fn take_cold_start(&self) -> bool {
        self.cold_start.swap(false, Ordering::SeqCst)
    }
}

/// [metrics::Recorder] forwarding every update to a [Collector]
pub struct Recorder {
    collector: &'static Collector,
}

impl From<&'static Collector> for Recorder {
    fn from(collector: &'static Collector) -> Self {
        Self { collector }
    }
}

fn key_parts(key: &metrics::Key) -> (String, Dimensions) {
    let dimensions = key.labels().map(|label| (label.key(), label.value())).collect();
    (key.name().to_string(), dimensions)
}

/// Counter handle; increments become counter datapoints
struct ForwardCounter {
    collector: &'static Collector,
    name: String,
    dimensions: Dimensions,
    total: AtomicU64,
}

impl metrics::CounterFn for ForwardCounter {
    fn increment(&self, value: u64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.collector.emit_counter(self.name.clone(), value as f64, self.dimensions.clone());
    }

    fn absolute(&self, value: u64) {
        // Only the delta since the last observation is a meaningful counter value
        let previous = self.total.swap(value, Ordering::Relaxed);
        if value > previous {
            self.collector
                .emit_counter(self.name.clone(), (value - previous) as f64, self.dimensions.clone());
        }
    }
}

/// Gauge handle; every change emits the new value as a gauge datapoint
struct ForwardGauge {
    collector: &'static Collector,
    name: String,
    dimensions: Dimensions,
    value: AtomicU64,
}

impl ForwardGauge {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        let value = loop {
            let next = f(f64::from_bits(current));
            match self
                .value
                .compare_exchange_weak(current, next.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };
        self.collector.emit_gauge(self.name.clone(), value, self.dimensions.clone());
    }
}

impl metrics::GaugeFn for ForwardGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value)
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value)
    }

    fn set(&self, value: f64) {
        self.update(|_| value)
    }
}

/// Histogram handle; each recorded value is emitted as a gauge datapoint
struct ForwardHistogram {
    collector: &'static Collector,
    name: String,
    dimensions: Dimensions,
}

impl metrics::HistogramFn for ForwardHistogram {
    fn record(&self, value: f64) {
        self.collector.emit_gauge(self.name.clone(), value, self.dimensions.clone());
    }
}

impl metrics::Recorder for Recorder {
    fn describe_counter(&self, key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {
        debug!(metric = key.as_str(), "Ignoring counter description");
    }

    fn describe_gauge(&self, key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {
        debug!(metric = key.as_str(), "Ignoring gauge description");
    }

    fn describe_histogram(&self, key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {
        debug!(metric = key.as_str(), "Ignoring histogram description");
    }

    fn register_counter(&self, key: &metrics::Key, _metadata: &metrics::Metadata) -> metrics::Counter {
        let (name, dimensions) = key_parts(key);
        metrics::Counter::from_arc(Arc::new(ForwardCounter {
            collector: self.collector,
            name,
            dimensions,
            total: AtomicU64::new(0),
        }))
    }

    fn register_gauge(&self, key: &metrics::Key, _metadata: &metrics::Metadata) -> metrics::Gauge {
        let (name, dimensions) = key_parts(key);
        metrics::Gauge::from_arc(Arc::new(ForwardGauge {
            collector: self.collector,
            name,
            dimensions,
            value: AtomicU64::new(0f64.to_bits()),
        }))
    }

    fn register_histogram(&self, key: &metrics::Key, _metadata: &metrics::Metadata) -> metrics::Histogram {
        let (name, dimensions) = key_parts(key);
        metrics::Histogram::from_arc(Arc::new(ForwardHistogram {
            collector: self.collector,
            name,
            dimensions,
        }))
    }
}
