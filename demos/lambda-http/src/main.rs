use lambda_http::{Body, Error, Request, Response};
use signalfx_lambda::lambda::handler::run_http;
use tracing::info;

async fn function_handler(_event: Request) -> Result<Response<Body>, Error> {
    info!("Hello from function_handler");

    metrics::counter!("requests", "Method" => "Default").increment(1);

    let resp = Response::builder().status(200).body("".into()).map_err(Box::new)?;
    Ok(resp)
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

    run_http(metrics, function_handler).await
}
