//! Registry write/read throughput under the advisory file lock.

use criterion::{criterion_group, criterion_main, Criterion};
use qpu_mesh::registry::{read_snapshot, write_entry, CommsEntry};
use tempfile::tempdir;

fn bench_write_entry(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("communications.json");
    let entry = CommsEntry {
        communications_endpoint: "tcp://127.0.0.1:5000".to_string(),
        executor_endpoint: None,
    };

    let mut counter = 0u64;
    c.bench_function("registry_write_entry", |b| {
        b.iter(|| {
            counter += 1;
            write_entry(&path, &format!("job_{counter}"), &entry).unwrap();
        })
    });
}

fn bench_read_snapshot(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("communications.json");
    let entry = CommsEntry {
        communications_endpoint: "tcp://127.0.0.1:5000".to_string(),
        executor_endpoint: None,
    };
    for i in 0..100 {
        write_entry(&path, &format!("job_{i}"), &entry).unwrap();
    }

    c.bench_function("registry_read_snapshot_100_entries", |b| {
        b.iter(|| read_snapshot(&path).unwrap())
    });
}

criterion_group!(benches, bench_write_entry, bench_read_snapshot);
criterion_main!(benches);
