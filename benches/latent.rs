//! Latent bottleneck benchmarks
//!
//! Run with: cargo bench --bench latent

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use varseq::latent::LatentBottleneck;
use varseq::loss::{KlReduction, gaussian_kl, mmd};

fn gaussian_params(batch: usize, dim: usize, device: &Device) -> (Tensor, Tensor, Tensor, Tensor) {
    let mu_q = Tensor::randn(0f32, 1f32, (batch, dim), device).unwrap();
    let logvar_q = Tensor::randn(0f32, 0.1f32, (batch, dim), device).unwrap();
    let mu_p = Tensor::randn(0f32, 1f32, (batch, dim), device).unwrap();
    let logvar_p = Tensor::randn(0f32, 0.1f32, (batch, dim), device).unwrap();
    (mu_q, logvar_q, mu_p, logvar_p)
}

fn bench_gaussian_kl(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("gaussian_kl");
    for batch in [8usize, 32, 128] {
        let (mu_q, logvar_q, mu_p, logvar_p) = gaussian_params(batch, 64, &device);
        group.throughput(Throughput::Elements((batch * 64) as u64));
        group.bench_with_input(BenchmarkId::new("sum_then_mean", batch), &batch, |b, _| {
            b.iter(|| {
                gaussian_kl(
                    black_box(&mu_q),
                    black_box(&logvar_q),
                    black_box(&mu_p),
                    black_box(&logvar_p),
                    KlReduction::SumThenMean,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_mmd(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("mmd");
    for rows in [8usize, 32, 128] {
        let x = Tensor::randn(0f32, 1f32, (rows, 16), &device).unwrap();
        let y = Tensor::randn(0f32, 1f32, (rows, 16), &device).unwrap();
        group.throughput(Throughput::Elements((rows * 16) as u64));
        group.bench_with_input(BenchmarkId::new("paired", rows), &rows, |b, _| {
            b.iter(|| mmd(black_box(&x), black_box(&y), 2.0, 100).unwrap())
        });
    }
    group.finish();
}

fn bench_latent_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("latent_forward");

    for mode in [1u32, 2, 4, 5] {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let module = LatentBottleneck::new(64, 16, mode, 2.0, vb).unwrap();
        let src = Tensor::randn(0f32, 1f32, (20, 8, 64), &device).unwrap();
        let trg = Tensor::randn(0f32, 1f32, (20, 8, 64), &device).unwrap();
        group.bench_with_input(BenchmarkId::new("mode", mode), &mode, |b, _| {
            b.iter(|| {
                module
                    .forward(black_box(&src), Some(black_box(&trg)))
                    .unwrap()
            })
        });
    }

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let module = LatentBottleneck::new(1024, 128, 6, 2.0, vb).unwrap();
    let src = Tensor::randn(0f32, 1f32, (100, 2, 1024), &device).unwrap();
    let trg = Tensor::randn(0f32, 1f32, (100, 2, 1024), &device).unwrap();
    group.bench_function("mode/6", |b| {
        b.iter(|| {
            module
                .forward(black_box(&src), Some(black_box(&trg)))
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_gaussian_kl, bench_mmd, bench_latent_forward);
criterion_main!(benches);
