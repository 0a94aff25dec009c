use criterion::{criterion_group, Criterion, Throughput};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use wanproxy_buffer::Buffer;

fn benchmark_append(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group(module_path!());
    for size in [16, 512, 4096] {
        let mut chunk = vec![0u8; size];
        rng.fill_bytes(&mut chunk);
        group.throughput(Throughput::Bytes((size * 256) as u64));
        group.bench_function(format!("slice size={size}"), |b| {
            b.iter(|| {
                let mut buffer = Buffer::new();
                for _ in 0..256 {
                    buffer.append_slice(&chunk);
                }
                buffer
            });
        });

        let source = Buffer::from_slice(&chunk);
        group.bench_function(format!("buffer size={size}"), |b| {
            b.iter(|| {
                let mut buffer = Buffer::new();
                for _ in 0..256 {
                    buffer.append_buffer(&source);
                }
                buffer
            });
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = benchmark_append,
}
