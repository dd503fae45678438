//! # Datapoint
//!
//! Datapoints and the SignalFx JSON body they are sent in via serde_json
//!
//! <https://dev.splunk.com/observability/reference/api/ingest_data/latest#endpoint-send-metrics>

use super::dimensions::Dimensions;
use serde::Serialize;

/// A single counter or gauge observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datapoint {
    pub metric: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Dimensions::is_empty")]
    pub dimensions: Dimensions,
}

impl Datapoint {
    pub fn new(metric: impl Into<String>, value: impl Into<f64>) -> Self {
        Self {
            metric: metric.into(),
            value: value.into(),
            dimensions: Dimensions::new(),
        }
    }

    pub fn with_dimensions(self, dimensions: Dimensions) -> Self {
        Self { dimensions, ..self }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name, value);
        self
    }
}

/// Body of `POST /v2/datapoint`
#[derive(Serialize)]
pub struct DatapointBody<'a> {
    #[serde(rename = "counter")]
    #[serde(skip_serializing_if = "<[Datapoint]>::is_empty")]
    pub counters: &'a [Datapoint],
    #[serde(rename = "gauge")]
    #[serde(skip_serializing_if = "<[Datapoint]>::is_empty")]
    pub gauges: &'a [Datapoint],
}

impl DatapointBody<'_> {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datapoint_body() {
        let counters = [
            Datapoint::new("function.invocations", 1.0)
                .with_dimension("aws_region", "us-east-1")
                .with_dimension("aws_function_name", "myFn"),
            Datapoint::new("function.cold_starts", 1.0),
        ];
        let gauges = [Datapoint::new("function.duration", 12.5).with_dimension("aws_region", "us-east-1")];

        let body = DatapointBody {
            counters: &counters,
            gauges: &gauges,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "counter": [
                    {
                        "metric": "function.invocations",
                        "value": 1.0,
                        "dimensions": { "aws_function_name": "myFn", "aws_region": "us-east-1" }
                    },
                    { "metric": "function.cold_starts", "value": 1.0 }
                ],
                "gauge": [
                    { "metric": "function.duration", "value": 12.5, "dimensions": { "aws_region": "us-east-1" } }
                ]
            })
        );
    }

    #[test]
    fn empty_lists_are_omitted() {
        let gauges = [Datapoint::new("function.duration", 3.0)];
        let body = DatapointBody {
            counters: &[],
            gauges: &gauges,
        };

        assert!(!body.is_empty());
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"gauge":[{"metric":"function.duration","value":3.0}]}"#
        );
    }
}
