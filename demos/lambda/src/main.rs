use lambda_runtime::{Error, LambdaEvent};
use serde_json::{json, Value};
use signalfx_lambda::{lambda::MetricsLayer, trace::TracingLayer, Dimensions};
use std::collections::HashMap;
use tracing::info;

async fn function_handler(metrics: &signalfx_lambda::Collector, event: LambdaEvent<Value>) -> Result<Value, Error> {
    info!("Hello from function_handler");

    metrics::counter!("requests", "Method" => "Default").increment(1);
    metrics.emit_gauge("payload_fields", event.payload.as_object().map_or(0, |o| o.len()) as f64, Dimensions::new());

    // Headers to continue the trace in a downstream call
    let mut headers = HashMap::new();
    signalfx_lambda::trace::inject(&mut headers)?;

    Ok(json!({ "req_id": event.context.request_id, "headers": headers }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with_target(false)
        .with_current_span(false)
        .without_time()
        .init();

    let metrics = signalfx_lambda::Builder::new()
        .with_dimension("team", "payments")
        .init()?;

    info!("Hello from main");

    let service = tower::ServiceBuilder::new()
        .layer(TracingLayer::new())
        .layer(MetricsLayer::new(metrics))
        .service_fn(|event| function_handler(metrics, event));

    lambda_runtime::run(service).await
}
