use iai_callgrind::{black_box, main};

use nestsched::common::Dtype;
use nestsched::ir::LoopNest;
use nestsched::lowering::{self, Conv2dParams};
use nestsched::shape;
use nestsched::strategies::{self, ConvTiling};
use nestsched::target::{CudaTarget, X86Target};
use nestsched::tuning::TunedParams;

#[export_name = "nestsched_bench_schedule::conv"]
fn schedule_conv(nest: &mut LoopNest, params: &TunedParams) -> ConvTiling {
    strategies::schedule_conv::<CudaTarget>(nest, params).unwrap()
}

#[export_name = "nestsched_bench_schedule::injective"]
fn schedule_injective(nest: &mut LoopNest) {
    strategies::schedule_injective::<X86Target>(nest, &shape![8, 16, 32, 64, 4], true).unwrap()
}

#[inline(never)]
fn schedule_conv_stem_benchmark() {
    let params = TunedParams::builtin();
    let mut nest = lowering::conv2d(
        &shape![1, 3, 224, 224],
        &shape![64, 3, 7, 7],
        Conv2dParams {
            pad: 3,
            stride: 2,
            dilation: 1,
        },
        Dtype::Float32,
    )
    .unwrap();
    schedule_conv(black_box(&mut nest), &params);
}

#[inline(never)]
fn schedule_conv_generic_benchmark() {
    let mut nest = lowering::conv2d(
        &shape![1, 64, 56, 56],
        &shape![64, 64, 3, 3],
        Conv2dParams {
            pad: 1,
            ..Conv2dParams::default()
        },
        Dtype::Float32,
    )
    .unwrap();
    schedule_conv(black_box(&mut nest), &TunedParams::default());
}

#[inline(never)]
fn schedule_injective_rank5_benchmark() {
    let mut nest =
        lowering::elementwise(&shape![8, 16, 32, 64, 4], Dtype::Float32, "exp").unwrap();
    schedule_injective(black_box(&mut nest));
}

main!(
    callgrind_args = "toggle-collect=nestsched_bench_schedule::*",
        "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = schedule_conv_stem_benchmark, schedule_conv_generic_benchmark,
        schedule_injective_rank5_benchmark
);
