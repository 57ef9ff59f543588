use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use ctbackup_core::{CorrelationId, Manifest, merge_profiles};
use ctbackup_infra::clock::SystemClock;
use ctbackup_infra::jobs::{BackupJob, JobOutcome, JobRegistry, JobSpec};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn spec() -> JobSpec {
    JobSpec {
        source: "db".to_string(),
        ephemeral: true,
        profile_edits: vec!["-".to_string(), "backup".to_string()],
        command: vec!["/usr/local/bin/dump".to_string()],
        environment: BTreeMap::new(),
        destination: PathBuf::from("/var/backups"),
    }
}

fn registry() -> JobRegistry {
    JobRegistry::new(Arc::new(SystemClock), Duration::from_secs(7200))
}

fn fill(registry: &JobRegistry, n: usize) {
    for _ in 0..n {
        let job = BackupJob::new(CorrelationId::new(), spec(), registry.clock().now());
        registry.add(job).unwrap();
    }
}

/// Full registry round trip: add, poll while processing, complete, consume.
fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");

    for live in [0usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            let registry = registry();
            fill(&registry, live);

            b.iter(|| {
                let id = CorrelationId::new();
                let job = BackupJob::new(id.clone(), spec(), registry.clock().now());
                registry.add(job).unwrap();
                black_box(registry.get(&id));
                registry.complete(&id, JobOutcome::Succeeded);
                black_box(registry.get(&id));
            });
        });
    }

    group.finish();
}

fn bench_prune_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("prune_sweep");

    for live in [100usize, 10_000] {
        group.throughput(Throughput::Elements(live as u64));
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            let registry = registry();
            fill(&registry, live);
            // Nothing is old enough: measures the scan under the lock.
            b.iter(|| black_box(registry.prune()));
        });
    }

    group.finish();
}

fn bench_output_parsing(c: &mut Criterion) {
    let output: String = (0..500)
        .map(|i| {
            if i % 10 == 0 {
                "\n".to_string()
            } else {
                format!("/var/lib/backup/part-{i:04}.tar.zst\n")
            }
        })
        .collect();

    c.bench_function("manifest_500_lines", |b| {
        b.iter(|| black_box(Manifest::from_output(black_box(output.as_bytes()))))
    });

    let source: Vec<String> = (0..20).map(|i| format!("profile-{i}")).collect();
    let edits = ["-profile-3", "net", "-", "default", "backup", "-net"];
    c.bench_function("merge_profiles", |b| {
        b.iter(|| black_box(merge_profiles(black_box(&source), black_box(&edits))))
    });
}

criterion_group!(
    benches,
    bench_job_lifecycle,
    bench_prune_sweep,
    bench_output_parsing
);
criterion_main!(benches);
