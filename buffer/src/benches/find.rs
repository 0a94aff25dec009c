use criterion::{criterion_group, Criterion};
use wanproxy_buffer::Buffer;

fn benchmark_find(c: &mut Criterion) {
    for lines in [1, 64, 1024] {
        let mut buffer = Buffer::new();
        for _ in 0..lines {
            buffer.append_slice(b"X-Forwarded-For: 192.0.2.1, 198.51.100.2\r");
        }
        buffer.append_byte(b'\n');
        c.bench_function(&format!("{}/lines={}", module_path!(), lines), |b| {
            b.iter(|| buffer.find(b'\n'));
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = benchmark_find,
}
