use criterion::{criterion_group, BatchSize, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use wanproxy_buffer::Buffer;

fn benchmark_moveout(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut data = vec![0u8; 1024 * 1024];
    rng.fill_bytes(&mut data);
    let source = Buffer::from_slice(&data);

    for piece in [100, 1500, 65536] {
        c.bench_function(
            &format!("{}/into piece={}", module_path!(), piece),
            |b| {
                b.iter_batched(
                    || source.clone(),
                    |mut buffer| {
                        while buffer.len() >= piece {
                            let mut out = Buffer::new();
                            buffer.moveout_into(&mut out, piece);
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
        c.bench_function(
            &format!("{}/copy piece={}", module_path!(), piece),
            |b| {
                let mut out = vec![0u8; piece];
                b.iter_batched(
                    || source.clone(),
                    |mut buffer| {
                        while buffer.len() >= piece {
                            buffer.moveout(&mut out);
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = benchmark_moveout,
}
