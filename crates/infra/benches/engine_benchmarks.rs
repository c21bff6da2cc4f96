use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::{Value, json};
use stepwise_core::{JobId, Token};
use stepwise_infra::backend::InMemoryBackend;
use stepwise_infra::jobs::{HandlerResult, JobEngine, StageContext, StageRegistry};

/// Pops one entry of `files` per iteration, finishing when none remain.
fn pop_file(ctx: &mut StageContext<'_>) -> HandlerResult {
    let mut files: Vec<String> = ctx.get_as("files")?.unwrap_or_default();
    if !files.is_empty() {
        files.remove(0);
    }
    if files.is_empty() {
        ctx.mark_done();
    }
    ctx.set("files", &files)?;
    Ok(Value::Null)
}

fn files(count: usize) -> Value {
    json!((0..count).map(|i| format!("file-{i}")).collect::<Vec<_>>())
}

fn bench_call_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_latency");
    group.sample_size(1000);

    let engine = JobEngine::new(InMemoryBackend::new());

    // Fresh job that completes in a single iteration: no load, one delete.
    group.bench_function("fresh_single_stage", |b| {
        b.iter(|| {
            let token = Token::new().with_data("files", files(1));
            let registry = StageRegistry::new().stage("copy", pop_file);
            black_box(engine.run(token, registry).unwrap());
        });
    });

    // Parked job resumed for one iteration: load + save per call.
    group.bench_function("resume_parked", |b| {
        let id = JobId::parse("bench-parked").unwrap();
        let mut token = Token::with_id(id).with_iterations_per_call(1);
        b.iter(|| {
            let registry = StageRegistry::new().stage("tick", |ctx| {
                ctx.set("n", ctx.iteration_count())?;
                Ok(Value::Null)
            });
            let out = engine.run(token.clone(), registry).unwrap();
            token = black_box(out.token);
        });
    });

    group.finish();
}

fn bench_unbounded_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("unbounded_drain");
    let engine = JobEngine::new(InMemoryBackend::new());

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("pop_files", count), count, |b, &count| {
            b.iter(|| {
                let token = Token::new().with_data("files", files(count));
                let registry = StageRegistry::new().stage("copy", pop_file);
                black_box(engine.run(token, registry).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_blob_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_routing");
    let payload = "x".repeat(256 * 1024);

    for threshold in [0usize, 64 * 1024].iter() {
        let engine = JobEngine::new(InMemoryBackend::new().with_auto_blob_threshold(*threshold));
        group.bench_with_input(
            BenchmarkId::new("set_and_get", threshold),
            threshold,
            |b, _| {
                b.iter(|| {
                    let token = Token::new();
                    let registry = StageRegistry::new().stage("store", |ctx| {
                        ctx.set("payload", &payload)?;
                        let back = ctx.get("payload")?;
                        ctx.mark_done();
                        Ok(back.unwrap_or_default())
                    });
                    black_box(engine.run(token, registry).unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_call_latency,
    bench_unbounded_drain,
    bench_blob_routing
);
criterion_main!(benches);
