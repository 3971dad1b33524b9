//! Benchmarks for reconciliation and checkpoint encoding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mapflow::context::ExecutionContext;
use mapflow::reconcile::{BidirectionalReconciler, MappingRow, MappingTable, ReconcileRequest};

/// `sources` proteins, each mapped forward to `fanout` targets, with every
/// other forward pair also observed in reverse.
fn request(sources: usize, fanout: usize) -> ReconcileRequest {
    let mut forward = MappingTable::new();
    let mut reverse = MappingTable::new();
    for s in 0..sources {
        for t in 0..fanout {
            let source = format!("P{s:06}");
            let target = format!("T{:06}", s * fanout / 2 + t);
            if (s + t) % 2 == 0 {
                reverse.push(MappingRow::new(target.clone(), source.clone(), 0.8));
            }
            forward.push(MappingRow::new(source, target, 0.9));
        }
    }
    ReconcileRequest::new(forward, reverse)
        .with_requested_sources((0..sources + sources / 10).map(|s| format!("P{s:06}")))
}

fn reconcile_benchmark(c: &mut Criterion) {
    let reconciler = BidirectionalReconciler::new();
    let mut group = c.benchmark_group("reconcile");
    for sources in [100, 1_000, 10_000] {
        let req = request(sources, 3);
        group.bench_with_input(BenchmarkId::from_parameter(sources), &req, |b, req| {
            b.iter(|| reconciler.reconcile(black_box(req)));
        });
    }
    group.finish();
}

fn checkpoint_benchmark(c: &mut Criterion) {
    let reconciler = BidirectionalReconciler::new();
    let output = match reconciler.reconcile(&request(5_000, 3)) {
        Ok(output) => output,
        Err(e) => panic!("reconcile failed: {e}"),
    };
    let ctx = ExecutionContext::new().with_dataset("reconciled", output);

    c.bench_function("checkpoint_encode", |b| {
        b.iter(|| {
            let bytes = black_box(&ctx).to_bytes().unwrap_or_default();
            mapflow::compression::compress(&bytes)
        });
    });
}

criterion_group!(benches, reconcile_benchmark, checkpoint_benchmark);
criterion_main!(benches);
