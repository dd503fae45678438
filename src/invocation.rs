//! # Invocation
//!
//! Lifecycle of one wrapped invocation: open an ingest session, emit the start
//! counters, time the handler, emit the end datapoints and stop the session.
//!
//! The session is owned by an [Invocation] guard, so it is stopped on every exit
//! path: normal completion, handler error, failed start, or the guard being dropped
//! mid-flight.

use super::collector::Collector;
use super::datapoint::Datapoint;
use super::dimensions::InvocationContext;
use super::ingest::IngestSession;
use super::Error;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const INVOCATIONS: &str = "function.invocations";
pub const COLD_STARTS: &str = "function.cold_starts";
pub const ERRORS: &str = "function.errors";
pub const DURATION: &str = "function.duration";

/// Guard owning the ingest session of the invocation in flight
pub(crate) struct Invocation {
    collector: &'static Collector,
    session: Option<Arc<dyn IngestSession>>,
    started: Instant,
}

impl Invocation {
    /// Opens a new session and routes every emit call to it
    pub(crate) fn open(collector: &'static Collector) -> Self {
        Self {
            collector,
            session: Some(collector.open_session()),
            started: Instant::now(),
        }
    }

    /// Refreshes the default dimensions and emits the start counters
    ///
    /// The cold start flag is only consumed once dimensions resolved, so a failed
    /// start does not use it up.
    pub(crate) fn start(&mut self, ctx: &InvocationContext) -> Result<(), Error> {
        self.collector.refresh_dimensions(ctx)?;

        let mut counters = vec![Datapoint::new(INVOCATIONS, 1.0)];
        if self.collector.take_cold_start() {
            counters.push(Datapoint::new(COLD_STARTS, 1.0));
        }
        self.collector.emit_counters(counters);

        self.started = Instant::now();
        Ok(())
    }

    /// Emits the end of invocation batch and stops the session
    pub(crate) fn finish(self, failed: bool) -> BoxFuture<'static, ()> {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;

        let counters = if failed {
            vec![Datapoint::new(ERRORS, 1.0)]
        } else {
            Vec::new()
        };
        self.collector
            .emit(counters, vec![Datapoint::new(DURATION, duration_ms)]);

        self.close()
    }

    /// Stops the session without emitting anything else
    pub(crate) fn close(mut self) -> BoxFuture<'static, ()> {
        match self.session.take() {
            Some(session) => stop(self.collector, session),
            None => Box::pin(futures::future::ready(())),
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        warn!("Invocation ended before its datapoints were flushed");
        let stopping = stop(self.collector, session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(stopping);
            }
            Err(_) => debug!("No tokio runtime available, unflushed datapoints dropped"),
        }
    }
}

fn stop(collector: &'static Collector, session: Arc<dyn IngestSession>) -> BoxFuture<'static, ()> {
    collector.close_session(&session);
    let stopping = session.stop();
    Box::pin(async move {
        if let Err(e) = stopping.await {
            warn!(error = %e, "Failed to flush datapoints");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{context, leak_collector, RecordingIngest};

    #[tokio::test]
    async fn successful_invocation() {
        let ingest = RecordingIngest::default();
        let collector = leak_collector(&ingest);

        let mut invocation = Invocation::open(collector);
        invocation.start(&context("req-1")).unwrap();
        invocation.finish(false).await;

        let sessions = ingest.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].stop_count(), 1);

        let batches = sessions[0].batches();
        assert_eq!(batches.len(), 2);
        let start: Vec<&str> = batches[0].0.iter().map(|p| p.metric.as_str()).collect();
        assert_eq!(start, vec![INVOCATIONS, COLD_STARTS]);
        assert!(batches[1].0.is_empty());
        assert_eq!(batches[1].1.len(), 1);
        assert_eq!(batches[1].1[0].metric, DURATION);
        assert!(batches[1].1[0].value >= 0.0);
    }

    #[tokio::test]
    async fn failed_start_keeps_cold_start_and_stops_session() {
        let ingest = RecordingIngest::default();
        let collector = leak_collector(&ingest);

        let mut bad = context("req-1");
        bad.function_arn = "arn:aws:lambda".to_string();

        let mut invocation = Invocation::open(collector);
        assert!(matches!(invocation.start(&bad), Err(Error::MalformedArn { .. })));
        invocation.close().await;

        let sessions = ingest.sessions();
        assert_eq!(sessions[0].stop_count(), 1);
        assert!(sessions[0].batches().is_empty());

        let mut invocation = Invocation::open(collector);
        invocation.start(&context("req-2")).unwrap();
        invocation.finish(true).await;

        let batches = ingest.sessions()[1].batches();
        assert!(batches[0].0.iter().any(|p| p.metric == COLD_STARTS));
        assert_eq!(batches[1].0[0].metric, ERRORS);
    }

    #[tokio::test]
    async fn dropped_invocation_still_stops_session() {
        let ingest = RecordingIngest::default();
        let collector = leak_collector(&ingest);

        {
            let mut invocation = Invocation::open(collector);
            invocation.start(&context("req-1")).unwrap();
        }
        tokio::task::yield_now().await;

        let sessions = ingest.sessions();
        assert_eq!(sessions[0].stop_count(), 1);

        // The session no longer receives datapoints
        collector.emit_counter("late", 1.0, Default::default());
        assert_eq!(sessions[0].batches().len(), 1);
    }

    #[tokio::test]
    async fn stop_failures_are_swallowed() {
        let ingest = RecordingIngest::failing();
        let collector = leak_collector(&ingest);

        let mut invocation = Invocation::open(collector);
        invocation.start(&context("req-1")).unwrap();
        invocation.finish(false).await;

        assert_eq!(ingest.sessions()[0].stop_count(), 1);
    }
}
