use std::hint::black_box;

use anynet::{
    autodiff::{sum, Grad, Var},
    conv::{Conv, ConvShape, ConvStrategy},
    tensor::{cpu, Tensor},
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, SeedableRng};

fn gemm(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("gemm");
    for size in [4, 8, 16, 32, 64, 96, 128] {
        let a = Tensor::rand_normal(size * size, 1.0, &mut rng);
        let b = Tensor::rand_normal(size * size, 1.0, &mut rng);
        let mut out = vec![0.0; size * size];
        group.bench_with_input(BenchmarkId::new("cpu", size), &size, |bench, &n| {
            bench.iter(|| {
                cpu::gemm(false, true, n, n, n, 1.0, a.data(), b.data(), 0.0, &mut out);
                black_box(&out);
            })
        });
    }
    group.finish();
}

fn conv(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let shape = ConvShape {
        filter_count: 16,
        filter_width: 3,
        filter_height: 3,
        stride_x: 1,
        stride_y: 1,
        input_width: 28,
        input_height: 28,
        input_depth: 3,
    };
    let batch = 16;
    let input = Var::new(Tensor::rand_normal(batch * shape.input_size(), 1.0, &mut rng));

    let mut group = c.benchmark_group("conv");
    for strategy in [ConvStrategy::Serial, ConvStrategy::Parallel] {
        let layer = Conv::new_rand(shape, strategy, &mut rng);
        let params = layer.parameters();
        group.bench_function(BenchmarkId::new("forward_backward", format!("{strategy:?}")), |b| {
            b.iter(|| {
                let out = sum(layer.apply(input.res(), batch));
                let mut grad = Grad::zeros(&params);
                out.propagate(Tensor::from(vec![1.0]), &mut grad);
                black_box(grad)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, gemm, conv);
criterion_main!(benches);
