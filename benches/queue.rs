//! Benchmarks for the scheduling queues and entry pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shelfd::queue::{EntryId, EntryKind, QueueKind, Queues};
use shelfd::{ArchiveRequest, MediaClass, RequestName};

fn make_request(seq: u32, priority: f64) -> ArchiveRequest {
    let mut req = ArchiveRequest::new(
        RequestName::new("fs1", "allsets", seq),
        MediaClass::Removable,
        1,
    );
    req.priority = priority;
    req.sched_priority = priority;
    req
}

fn fill(queues: &mut Queues, count: u32) -> Vec<EntryId> {
    (0..count)
        .map(|seq| {
            let req = make_request(seq, (seq % 13) as f64);
            let id = queues.pool.insert(EntryKind::Normal(req));
            queues.enqueue(QueueKind::Schedule, id);
            id
        })
        .collect()
}

fn benchmark_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue");

    for size in [100u32, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut queues = Queues::new();
                fill(&mut queues, size);
                black_box(queues.schedule.len());
            });
        });
    }

    group.finish();
}

fn benchmark_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_find");

    for size in [100u32, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut queues = Queues::new();
            fill(&mut queues, size);
            let target = RequestName::new("fs1", "allsets", size / 2);
            b.iter(|| {
                black_box(queues.schedule.find(&queues.pool, &target));
            });
        });
    }

    group.finish();
}

fn benchmark_requeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_requeue");

    let mut queues = Queues::new();
    let ids = fill(&mut queues, 10000);
    let id = ids[5000];

    // Move one entry out and back; both sides pay the ordered insert.
    group.bench_function("move_between_queues", |b| {
        b.iter(|| {
            queues.requeue(id, QueueKind::Archive);
            queues.requeue(id, QueueKind::Schedule);
        });
    });

    group.finish();
}

fn benchmark_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_churn");

    let mut queues = Queues::new();
    fill(&mut queues, 10000);
    let mut seq = 10000u32;

    // Steady state: the head leaves, a new request arrives.
    group.bench_function("pop_head_push_new", |b| {
        b.iter(|| {
            if let Some(head) = queues.schedule.head() {
                queues.discard(head);
            }
            let req = make_request(seq, (seq % 13) as f64);
            seq = seq.wrapping_add(1);
            let id = queues.pool.insert(EntryKind::Normal(req));
            queues.enqueue(QueueKind::Schedule, id);
        });
    });

    group.finish();
}

fn benchmark_scan_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_scan_order");

    let mut queues = Queues::new();
    fill(&mut queues, 10000);

    group.bench_function("ids_walk", |b| {
        b.iter(|| {
            black_box(queues.schedule.ids(&queues.pool).len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_enqueue,
    benchmark_find,
    benchmark_requeue,
    benchmark_scan_order,
    benchmark_churn
);

criterion_main!(benches);
