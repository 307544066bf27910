//! Benchmark plan + emission latency for representative convolution shapes.
//!
//! Run with: cargo bench --bench jit_compile_benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use conv_jit_kernels::compiler::planner::plan;
use conv_jit_kernels::{Activation, CompileOptions, ConvCompiler, ShapeParameters};

fn compiler() -> ConvCompiler {
    ConvCompiler::with_options(CompileOptions { dump_listing: false })
}

fn bench_plan_only(c: &mut Criterion) {
    let shape = ShapeParameters::blocked(1, 64, 56, 56, 64, 3, 3).with_padding(1, 1);
    c.bench_function("plan_blocked_64x56x56_k3", |b| {
        b.iter(|| black_box(plan(black_box(&shape))).unwrap())
    });
}

fn bench_compile_flat_first_layer(c: &mut Criterion) {
    let shape = ShapeParameters::flat(1, 224, 224, 64, 7, 7)
        .with_padding(3, 3)
        .with_stride(2, 2)
        .with_bias()
        .with_activation(Activation::relu());
    let compiler = compiler();
    c.bench_function("jit_flat_224_k7s2_relu", |b| {
        b.iter(|| black_box(compiler.compile(black_box(&shape))).unwrap())
    });
}

fn bench_compile_blocked_3x3(c: &mut Criterion) {
    let shape = ShapeParameters::blocked(1, 64, 56, 56, 64, 3, 3).with_padding(1, 1).with_bias();
    let compiler = compiler();
    c.bench_function("jit_blocked_64x56x56_k3", |b| {
        b.iter(|| black_box(compiler.compile(black_box(&shape))).unwrap())
    });
}

fn bench_compile_wide_kernel(c: &mut Criterion) {
    let shape = ShapeParameters::blocked(1, 32, 64, 64, 32, 11, 11).with_padding(1, 1);
    let compiler = compiler();
    c.bench_function("jit_blocked_k11_runtime_loop", |b| {
        b.iter(|| black_box(compiler.compile(black_box(&shape))).unwrap())
    });
}

criterion_group!(
    name = jit_compile;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(1))
        .measurement_time(std::time::Duration::from_secs(5))
        .sample_size(20);
    targets =
        bench_plan_only,
        bench_compile_flat_first_layer,
        bench_compile_blocked_3x3,
        bench_compile_wide_kernel,
);
criterion_main!(jit_compile);
