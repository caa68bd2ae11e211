use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::time::Duration;

use chrono::Utc;
use jobward_core::JobError;
use jobward_queue::backoff::{BackoffType, base_backoff, calculate_backoff};
use jobward_queue::dead_letter::{DeadLetterEntry, FailureContext};
use jobward_queue::job::{JobDescriptor, JobOptions};
use jobward_queue::store::{InMemoryQueueStore, QueueStore};
use jobward_queue::strategy::{RetryStrategy, RetryStrategyRegistry};

fn filled_store(jobs: usize) -> InMemoryQueueStore {
    let store = InMemoryQueueStore::new();
    let now = Utc::now();
    for i in 0..jobs {
        let opts = JobOptions::new().with_priority((i % 5) as i32);
        let job = JobDescriptor::new("import", "manufacturing.import", serde_json::json!({"i": i}), &opts);
        store.enqueue(job, now).unwrap();
    }
    store
}

fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_throughput");

    for depth in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let store = filled_store(depth);
            let lease = Duration::from_secs(60);

            b.iter(|| {
                let now = Utc::now();
                let claimed = store.claim_next("import", "bench", lease, now).unwrap().unwrap();
                store.complete(claimed.job.id, claimed.lease.token).unwrap();
                // Keep the queue depth constant.
                let job = JobDescriptor::new("import", "manufacturing.import", serde_json::Value::Null, &JobOptions::new());
                store.enqueue(black_box(job), now).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_failure_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("failure_round_trip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("schedule_and_promote", |b| {
        let store = filled_store(1);
        let lease = Duration::from_secs(60);
        let ctx = FailureContext {
            worker_id: "bench".to_string(),
            processing_time: Duration::from_millis(1),
        };

        b.iter(|| {
            let now = Utc::now();
            let claimed = store.claim_next("import", "bench", lease, now).unwrap().unwrap();
            let entry = DeadLetterEntry::scheduled(&claimed, JobError::network("refused"), &ctx, "network", now, now);
            store.move_to_dead_letter(claimed.job.id, claimed.lease.token, entry).unwrap();
            black_box(store.promote_due_scheduled(now).unwrap());
        });
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    for (name, kind) in [
        ("fixed", BackoffType::Fixed),
        ("linear", BackoffType::Linear),
        ("exponential", BackoffType::Exponential),
    ] {
        let strategy = RetryStrategy {
            backoff_type: kind,
            ..RetryStrategy::default()
        };
        group.bench_function(BenchmarkId::new("base", name), |b| {
            b.iter(|| base_backoff(black_box(7), &strategy));
        });
        group.bench_function(BenchmarkId::new("jittered", name), |b| {
            b.iter(|| calculate_backoff(black_box(7), &strategy));
        });
    }

    group.finish();
}

fn bench_strategy_resolution(c: &mut Criterion) {
    let registry = RetryStrategyRegistry::new();
    let job = JobDescriptor::new("import", "manufacturing.import", serde_json::Value::Null, &JobOptions::new());
    let transient = JobError::untyped("connect ETIMEDOUT 10.0.0.5:443");
    let permanent = JobError::validation("missing machine_id");

    c.bench_function("resolve_transient", |b| {
        b.iter(|| registry.resolve(black_box(&job), black_box(&transient)).unwrap());
    });
    c.bench_function("resolve_and_decide_permanent", |b| {
        b.iter(|| {
            let resolved = registry.resolve(black_box(&job), black_box(&permanent)).unwrap();
            resolved.strategy.should_retry(1, &permanent)
        });
    });
}

criterion_group!(
    benches,
    bench_claim_throughput,
    bench_failure_round_trip,
    bench_backoff,
    bench_strategy_resolution
);
criterion_main!(benches);
