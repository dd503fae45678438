use criterion::{criterion_group, criterion_main, Criterion};
use signalfx_lambda::{lambda_fields, DimensionResolver, Dimensions, InvocationContext};

fn context(request_id: &str) -> InvocationContext {
    InvocationContext {
        function_arn: "arn:aws:lambda:us-east-1:111111111111:function:myFn:3".to_string(),
        function_name: "myFn".to_string(),
        function_version: "3".to_string(),
        request_id: request_id.to_string(),
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let ctx = context("ABC123");

    c.bench_function("lambda_fields", |b| {
        b.iter(|| lambda_fields(&ctx, Some("AWS_Lambda_rust")).unwrap())
    });

    let mut resolver = DimensionResolver::new(
        Dimensions::new().with("Function", "My_Function_Name"),
        Some("AWS_Lambda_rust".to_string()),
    );
    c.bench_function("resolve_cached", |b| b.iter(|| resolver.resolve(&ctx).unwrap().len()));

    let defaults = lambda_fields(&ctx, None).unwrap();
    c.bench_function("merge_defaults", |b| {
        b.iter(|| {
            let mut point = Dimensions::new().with("Method", "Default");
            point.merge_defaults(&defaults);
            point
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
