//! Classical-channel connect and send/receive throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use qpu_mesh::classical_channel::ClassicalChannel;

fn bench_connect(c: &mut Criterion) {
    let server = ClassicalChannel::bind("127.0.0.1:0", "server").unwrap();
    let endpoint = server.bound_endpoint().to_string();

    c.bench_function("classical_channel_connect_idempotent", |b| {
        b.iter(|| {
            let mut channel = ClassicalChannel::bind("127.0.0.1:0", "bench").unwrap();
            channel.connect(&endpoint, "peer").unwrap();
        })
    });
}

fn bench_send_info(c: &mut Criterion) {
    let mut server = ClassicalChannel::bind("127.0.0.1:0", "server").unwrap();
    let endpoint = server.bound_endpoint().to_string();

    let mut channel = ClassicalChannel::bind("127.0.0.1:0", "bench").unwrap();
    channel.connect(&endpoint, "peer").unwrap();

    c.bench_function("classical_channel_send_info", |b| {
        b.iter(|| {
            channel.send_info("measurement-payload", "peer").unwrap();
            server.recv_info("bench").unwrap();
        })
    });
}

criterion_group!(benches, bench_connect, bench_send_info);
criterion_main!(benches);
