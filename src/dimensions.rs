//! # Dimensions
//!
//! Derives the default dimensions attached to every datapoint and span from the
//! invocation context, and caches them between invocations of the same request.

use super::Error;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const AWS_REQUEST_ID: &str = "aws_request_id";
pub const AWS_FUNCTION_NAME: &str = "aws_function_name";
pub const AWS_FUNCTION_VERSION: &str = "aws_function_version";
pub const AWS_FUNCTION_QUALIFIER: &str = "aws_function_qualifier";
pub const AWS_REGION: &str = "aws_region";
pub const AWS_ACCOUNT_ID: &str = "aws_account_id";
pub const AWS_EXECUTION_ENV: &str = "aws_execution_env";
pub const EVENT_SOURCE_MAPPINGS: &str = "event_source_mappings";
pub const LAMBDA_ARN: &str = "lambda_arn";
pub const METRIC_SOURCE: &str = "metric_source";
pub const FUNCTION_WRAPPER_VERSION: &str = "function_wrapper_version";

/// Keys owned by the resolver; these override caller supplied static dimensions
pub const RESERVED_KEYS: [&str; 11] = [
    AWS_REQUEST_ID,
    AWS_FUNCTION_NAME,
    AWS_FUNCTION_VERSION,
    AWS_FUNCTION_QUALIFIER,
    AWS_REGION,
    AWS_ACCOUNT_ID,
    AWS_EXECUTION_ENV,
    EVENT_SOURCE_MAPPINGS,
    LAMBDA_ARN,
    METRIC_SOURCE,
    FUNCTION_WRAPPER_VERSION,
];

const METRIC_SOURCE_VALUE: &str = "lambda_wrapper";
const WRAPPER_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), "_", env!("CARGO_PKG_VERSION"));

/// The parts of a Lambda invocation context the resolver needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    pub function_arn: String,
    pub function_name: String,
    pub function_version: String,
    pub request_id: String,
}

#[cfg(feature = "lambda")]
impl From<&lambda_runtime::Context> for InvocationContext {
    fn from(ctx: &lambda_runtime::Context) -> Self {
        Self {
            function_arn: ctx.invoked_function_arn.clone(),
            function_name: ctx.env_config.function_name.clone(),
            function_version: ctx.env_config.version.clone(),
            request_id: ctx.request_id.clone(),
        }
    }
}

/// A set of dimension name/value pairs with unique names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Dimensions(BTreeMap<String, String>);

impl Dimensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dimension, replacing any previous value with the same name
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fills in every name from `defaults` that is not already set on `self`
    pub fn merge_defaults(&mut self, defaults: &Dimensions) {
        for (name, value) in &defaults.0 {
            self.0.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Dimensions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Dimensions {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A Lambda ARN split into its colon-delimited segments
///
/// `arn:partition:service:region:account-id:resource-type:resource-name[:qualifier]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionArn {
    segments: Vec<String>,
}

impl FunctionArn {
    pub fn partition(&self) -> &str {
        &self.segments[1]
    }

    pub fn service(&self) -> &str {
        &self.segments[2]
    }

    pub fn region(&self) -> &str {
        &self.segments[3]
    }

    pub fn account_id(&self) -> &str {
        &self.segments[4]
    }

    pub fn resource_type(&self) -> &str {
        &self.segments[5]
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.segments.get(6).map(String::as_str)
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.segments.get(7).map(String::as_str)
    }

    /// The ARN with its qualifier replaced by (or extended with) `version`
    ///
    /// Only the unqualified (7 segment) and qualified (8 segment) forms are rewritten.
    pub fn with_version(&self, version: &str) -> String {
        let mut segments = self.segments.clone();
        match segments.len() {
            8 => segments[7] = version.to_string(),
            7 => segments.push(version.to_string()),
            _ => {}
        }
        segments.join(":")
    }
}

impl FromStr for FunctionArn {
    type Err = Error;

    fn from_str(arn: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = arn.split(':').map(str::to_string).collect();
        if segments.len() < 6 {
            return Err(Error::MalformedArn {
                arn: arn.to_string(),
                segments: segments.len(),
            });
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for FunctionArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join(":"))
    }
}

/// Computes the resolver owned dimensions for one invocation
pub fn lambda_fields(ctx: &InvocationContext, execution_env: Option<&str>) -> Result<Dimensions, Error> {
    let arn: FunctionArn = ctx.function_arn.parse()?;

    let mut fields = Dimensions::new()
        .with(AWS_REQUEST_ID, ctx.request_id.as_str())
        .with(AWS_FUNCTION_VERSION, ctx.function_version.as_str())
        .with(AWS_FUNCTION_NAME, ctx.function_name.as_str())
        .with(AWS_REGION, arn.region())
        .with(AWS_ACCOUNT_ID, arn.account_id())
        .with(METRIC_SOURCE, METRIC_SOURCE_VALUE)
        .with(FUNCTION_WRAPPER_VERSION, WRAPPER_VERSION);

    if let Some(env) = execution_env {
        fields.insert(AWS_EXECUTION_ENV, env);
    }

    match arn.resource_type() {
        "function" => {
            if let Some(qualifier) = arn.qualifier() {
                fields.insert(AWS_FUNCTION_QUALIFIER, qualifier);
            }
            fields.insert(LAMBDA_ARN, arn.with_version(&ctx.function_version));
        }
        "event-source-mappings" | "event-source-mapping" => {
            if let Some(mapping) = arn.resource_name() {
                fields.insert(EVENT_SOURCE_MAPPINGS, mapping);
            }
            fields.insert(LAMBDA_ARN, ctx.function_arn.as_str());
        }
        _ => {}
    }

    Ok(fields)
}

/// Caches the default dimensions between invocations
///
/// Static dimensions supplied by the caller persist for the life of the resolver.
/// Resolver owned fields are recomputed from scratch whenever the request id
/// changes, so per-request values never leak into a later request.
#[derive(Debug, Clone, Default)]
pub struct DimensionResolver {
    static_dimensions: Dimensions,
    execution_env: Option<String>,
    request_id: Option<String>,
    defaults: Dimensions,
}

impl DimensionResolver {
    pub fn new(static_dimensions: Dimensions, execution_env: Option<String>) -> Self {
        Self {
            defaults: static_dimensions.clone(),
            static_dimensions,
            execution_env,
            request_id: None,
        }
    }

    /// Resolve the defaults for `ctx`, recomputing only when the request id changed
    pub fn resolve(&mut self, ctx: &InvocationContext) -> Result<&Dimensions, Error> {
        if self.request_id.as_deref() != Some(ctx.request_id.as_str()) {
            let mut defaults = lambda_fields(ctx, self.execution_env.as_deref())?;
            defaults.merge_defaults(&self.static_dimensions);
            self.defaults = defaults;
            self.request_id = Some(ctx.request_id.clone());
        }
        Ok(&self.defaults)
    }

    /// The defaults from the last resolution, or only the static dimensions before any
    pub fn current(&self) -> &Dimensions {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(arn: &str, request_id: &str) -> InvocationContext {
        InvocationContext {
            function_arn: arn.to_string(),
            function_name: "myFn".to_string(),
            function_version: "3".to_string(),
            request_id: request_id.to_string(),
        }
    }

    #[test]
    fn qualified_function_arn() {
        let ctx = context("arn:aws:lambda:us-east-1:111111111111:function:myFn:3", "req-1");
        let fields = lambda_fields(&ctx, None).unwrap();

        assert_eq!(fields.get(AWS_REGION), Some("us-east-1"));
        assert_eq!(fields.get(AWS_ACCOUNT_ID), Some("111111111111"));
        assert_eq!(fields.get(AWS_FUNCTION_NAME), Some("myFn"));
        assert_eq!(fields.get(AWS_FUNCTION_VERSION), Some("3"));
        assert_eq!(fields.get(AWS_FUNCTION_QUALIFIER), Some("3"));
        assert_eq!(fields.get(AWS_REQUEST_ID), Some("req-1"));
        assert_eq!(fields.get(METRIC_SOURCE), Some("lambda_wrapper"));
        assert_eq!(fields.get(LAMBDA_ARN), Some("arn:aws:lambda:us-east-1:111111111111:function:myFn:3"));
        assert!(fields.get(FUNCTION_WRAPPER_VERSION).unwrap().starts_with("signalfx_lambda_"));
        assert!(!fields.contains(AWS_EXECUTION_ENV));
    }

    #[test]
    fn alias_qualifier_is_replaced_by_version() {
        let ctx = context("arn:aws:lambda:eu-west-1:222222222222:function:myFn:live", "req-1");
        let fields = lambda_fields(&ctx, None).unwrap();

        assert_eq!(fields.get(AWS_FUNCTION_QUALIFIER), Some("live"));
        assert_eq!(fields.get(LAMBDA_ARN), Some("arn:aws:lambda:eu-west-1:222222222222:function:myFn:3"));
    }

    #[test]
    fn unqualified_function_arn_gets_version_appended() {
        let fields = lambda_fields(
            &context("arn:aws:lambda:us-east-1:111111111111:function:myFn", "req-1"),
            Some("AWS_Lambda_rust"),
        )
        .unwrap();

        assert!(!fields.contains(AWS_FUNCTION_QUALIFIER));
        assert_eq!(fields.get(LAMBDA_ARN), Some("arn:aws:lambda:us-east-1:111111111111:function:myFn:3"));
        assert_eq!(fields.get(AWS_EXECUTION_ENV), Some("AWS_Lambda_rust"));
    }

    #[test]
    fn event_source_mapping_arn_is_kept_verbatim() {
        let arn = "arn:aws:lambda:us-east-1:111111111111:event-source-mappings:abc123";
        let fields = lambda_fields(&context(arn, "req-1"), None).unwrap();

        assert_eq!(fields.get(EVENT_SOURCE_MAPPINGS), Some("abc123"));
        assert_eq!(fields.get(LAMBDA_ARN), Some(arn));
        assert!(!fields.contains(AWS_FUNCTION_QUALIFIER));
    }

    #[test]
    fn malformed_arn_fails_fast() {
        let err = lambda_fields(&context("arn:aws:lambda:us-east-1:111111111111", "req-1"), None).unwrap_err();
        match err {
            Error::MalformedArn { arn, segments } => {
                assert_eq!(arn, "arn:aws:lambda:us-east-1:111111111111");
                assert_eq!(segments, 5);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn arn_accessors() {
        let arn: FunctionArn = "arn:aws:lambda:us-east-1:111111111111:function:myFn:3".parse().unwrap();
        assert_eq!(arn.partition(), "aws");
        assert_eq!(arn.service(), "lambda");
        assert_eq!(arn.resource_type(), "function");
        assert_eq!(arn.resource_name(), Some("myFn"));
        assert_eq!(arn.qualifier(), Some("3"));
        assert_eq!(arn.to_string(), "arn:aws:lambda:us-east-1:111111111111:function:myFn:3");
    }

    #[test]
    fn resolver_caches_per_request_and_refreshes_on_change() {
        let statics = Dimensions::new().with("team", "payments").with(AWS_REGION, "overridden");
        let mut resolver = DimensionResolver::new(statics, None);
        assert_eq!(resolver.current().get("team"), Some("payments"));

        let qualified = context("arn:aws:lambda:us-east-1:111111111111:function:myFn:live", "req-1");
        let first = resolver.resolve(&qualified).unwrap().clone();
        assert_eq!(first.get("team"), Some("payments"));
        assert_eq!(first.get(AWS_REGION), Some("us-east-1"));
        assert_eq!(first.get(AWS_FUNCTION_QUALIFIER), Some("live"));

        // Same request id: cached
        let mut same = qualified.clone();
        same.function_arn = "arn:aws:lambda:us-west-2:111111111111:function:myFn".to_string();
        assert_eq!(resolver.resolve(&same).unwrap(), &first);

        // New request id: every field recomputed, stale qualifier dropped
        let unqualified = context("arn:aws:lambda:us-west-2:111111111111:function:myFn", "req-2");
        let second = resolver.resolve(&unqualified).unwrap();
        assert_eq!(second.get(AWS_REQUEST_ID), Some("req-2"));
        assert_eq!(second.get(AWS_REGION), Some("us-west-2"));
        assert_eq!(second.get("team"), Some("payments"));
        assert!(!second.contains(AWS_FUNCTION_QUALIFIER));
    }

    #[test]
    fn merge_defaults_keeps_point_values() {
        let defaults = Dimensions::new().with("a", "default").with("b", "default");
        let mut point = Dimensions::new().with("a", "point");
        point.merge_defaults(&defaults);

        assert_eq!(point.get("a"), Some("point"));
        assert_eq!(point.get("b"), Some("default"));
    }
}
