use crate::ir::{DeviceAxis, LoopNest, LoopRef, MemScope};
use crate::scheduling::ScheduleError;
use crate::strategies::{block_name, expect_blocks, last_block, log_schedule, loops_named, nth};
use crate::target::Target;
use crate::tuning::{ConvFactors, ShapeSignature, TunedParams};
use crate::utils::{inner_splitter, split_even};

/// Which of the two convolution schedules was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvTiling {
    /// Factors came from a tuned-parameter entry.
    Tuned,
    /// Factors were derived from the shapes alone.
    Generic,
}

/// Schedules a convolution given as padding, weight dilation, and the convolution itself.
///
/// Uses the factors `params` holds for this shape signature when there are any, and falls back
/// to [schedule_conv_generic] otherwise.
pub fn schedule_conv<Tgt: Target>(
    nest: &mut LoopNest,
    params: &TunedParams,
) -> Result<ConvTiling, ScheduleError> {
    nest.merge_exprs();
    let blocks = expect_blocks(nest, 3)?;
    let signature = ShapeSignature::conv(
        &nest.output_buffer(&blocks[0])?.shape,
        &nest.read_buffer(&blocks[2], 2)?.shape,
        &nest.output_buffer(&blocks[2])?.shape,
    );
    match params.conv_factors(&signature)? {
        Some(factors) => {
            log::debug!("tuned parameters found for {signature}");
            schedule_conv_tuned(nest, &factors)?;
            Ok(ConvTiling::Tuned)
        }
        None => {
            log::debug!("no tuned parameters for {signature}; deriving a tiling");
            schedule_conv_generic::<Tgt>(nest)?;
            Ok(ConvTiling::Generic)
        }
    }
}

/// Tiles the convolution with tuned factors.
///
/// Padded input and dilated weights are staged through shared memory and the output through
/// local memory. Each output axis is split four ways into a block axis, a virtual-thread axis,
/// a thread axis, and an unrolled register tile.
pub fn schedule_conv_tuned(
    nest: &mut LoopNest,
    factors: &ConvFactors,
) -> Result<(), ScheduleError> {
    nest.merge_exprs();
    let blocks = expect_blocks(nest, 3)?;
    let pad_name = block_name(nest, &blocks[0])?;
    let out_name = block_name(nest, &blocks[2])?;

    let input_shared = nest.cache_read(&blocks[2], 1, MemScope::Shared)?;
    let input_shared = block_name(nest, &input_shared)?;
    let conv = last_block(nest)?;
    let weights_shared = nest.cache_read(&conv, 2, MemScope::Shared)?;
    let weights_shared = block_name(nest, &weights_shared)?;
    let conv = last_block(nest)?;
    let local = nest.cache_write(&conv, 0, MemScope::Local)?;
    let local = block_name(nest, &local)?;
    let pad = nest.get_block(&pad_name)?;
    nest.compute_inline(&pad)?;

    // Split innermost first so the indices of the outer axes stay put.
    for (axis, split) in [(3, factors.x), (2, factors.y), (1, factors.f)] {
        let loops = loops_named(nest, &out_name)?;
        nest.split(&nth(&loops, axis)?, &inferred_first(&split))?;
    }
    let loops = loops_named(nest, &out_name)?;
    reorder_by_index(nest, &loops, &[0, 1, 5, 9, 2, 6, 10, 3, 7, 11, 4, 8, 12])?;
    let loops = loops_named(nest, &out_name)?;
    for (index, axis) in [
        (1, DeviceAxis::BlockZ),
        (2, DeviceAxis::BlockY),
        (3, DeviceAxis::BlockX),
        (7, DeviceAxis::ThreadZ),
        (8, DeviceAxis::ThreadY),
        (9, DeviceAxis::ThreadX),
    ] {
        nest.bind(&nth(&loops, index)?, axis)?;
    }
    for index in 10..13 {
        nest.unroll(&nth(&loops, index)?)?;
    }

    let block = nest.get_block(&local)?;
    nest.compute_at(&block, &nth(&loops, 9)?)?;

    // The local block now has its ten shared outer loops, a register tile of three, and the
    // reduction axes rc, ry and rx at 13..16.
    for (axis, split) in [(15, factors.rx), (14, factors.ry), (13, factors.rc)] {
        let loops = loops_named(nest, &local)?;
        nest.split(&nth(&loops, axis)?, &[-1, split[1]])?;
    }
    let loops = loops_named(nest, &local)?;
    reorder_by_index(nest, &loops, &[13, 15, 17, 14, 16, 18, 10, 11, 12])?;

    for name in [&input_shared, &weights_shared] {
        let block = nest.get_block(name)?;
        let reduce_outer = nth(&loops_named(nest, &local)?, 12)?;
        nest.compute_at(&block, &reduce_outer)?;
    }
    let loops = loops_named(nest, &local)?;
    for index in 16..19 {
        nest.unroll(&nth(&loops, index)?)?;
    }
    log_schedule("conv (tuned)", nest);
    Ok(())
}

/// Tiles the convolution's output channels with factors derived from the output shape.
///
/// Channels are split into a block axis, a thread axis, and a per-thread tile; output rows go
/// to blocks and output columns to threads. Fails with [ScheduleError::NumericDerivation] when
/// no channel tiling keeps a block within the target's thread limit.
pub fn schedule_conv_generic<Tgt: Target>(nest: &mut LoopNest) -> Result<(), ScheduleError> {
    nest.merge_exprs();
    let blocks = expect_blocks(nest, 3)?;
    let output = nest.output_buffer(&blocks[2])?.shape.clone();
    let reduce_channels = nest.output_buffer(&blocks[0])?.shape[1].get();
    let (channels, height, width) = (output[1].get(), output[2].get(), output[3].get());
    let out_name = block_name(nest, &blocks[2])?;

    let max_threads = Tgt::max_num_threads();
    let mut f_inner = inner_splitter(channels, height, max_threads);
    let block_z = split_even(channels / f_inner);
    let mut thread_z = channels / f_inner / block_z;
    let rc_factor = split_even(reduce_channels);
    while u64::from(width) * u64::from(thread_z) > u64::from(max_threads) && thread_z % 2 == 0 {
        thread_z /= 2;
        f_inner *= 2;
    }
    if u64::from(width) * u64::from(thread_z) > u64::from(max_threads) {
        return Err(ScheduleError::NumericDerivation(format!(
            "{width} columns by {thread_z} channel threads exceed the limit of {max_threads}"
        )));
    }
    log::debug!(
        "conv tiling: {block_z} channel blocks, {thread_z} channel threads, {f_inner} channels \
         per thread, reduction step {rc_factor}"
    );

    nest.compute_inline(&blocks[0])?;
    let conv = last_block(nest)?;
    let local = nest.cache_write(&conv, 0, MemScope::Local)?;
    let local = block_name(nest, &local)?;

    let loops = loops_named(nest, &out_name)?;
    nest.split(&nth(&loops, 1)?, &[-1, thread_z as i32, f_inner as i32])?;
    let loops = loops_named(nest, &out_name)?;
    reorder_by_index(nest, &loops, &[1, 4, 2, 5, 3])?;
    let loops = loops_named(nest, &out_name)?;
    for (index, axis) in [
        (1, DeviceAxis::BlockZ),
        (2, DeviceAxis::BlockY),
        (3, DeviceAxis::ThreadZ),
        (4, DeviceAxis::ThreadX),
    ] {
        nest.bind(&nth(&loops, index)?, axis)?;
    }

    let block = nest.get_block(&local)?;
    nest.compute_at(&block, &nth(&loops, 4)?)?;
    let loops = loops_named(nest, &local)?;
    nest.split(&nth(&loops, 6)?, &[-1, rc_factor as i32])?;
    log_schedule("conv (generic)", nest);
    Ok(())
}

/// Tuned factor lists record the outermost factor too; it is re-inferred from the extent.
fn inferred_first<const N: usize>(factors: &[i32; N]) -> [i32; N] {
    let mut split = *factors;
    split[0] = -1;
    split
}

fn reorder_by_index(
    nest: &mut LoopNest,
    loops: &[LoopRef],
    order: &[usize],
) -> Result<(), ScheduleError> {
    let ordered = order
        .iter()
        .map(|&i| nth(loops, i))
        .collect::<Result<Vec<_>, _>>()?;
    nest.reorder(&ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimSize, Dtype};
    use crate::ir::Annotation;
    use crate::lowering::{self, Conv2dParams};
    use crate::shape;
    use crate::target::CudaTarget;
    use std::collections::BTreeMap;

    fn small_conv() -> LoopNest {
        lowering::conv2d(
            &shape![1, 2, 6, 6],
            &shape![4, 2, 3, 3],
            Conv2dParams {
                pad: 1,
                ..Conv2dParams::default()
            },
            Dtype::Float32,
        )
        .unwrap()
    }

    fn small_conv_params() -> TunedParams {
        let axes = [
            ("x", vec![1, 3, 2, 1]),
            ("y", vec![6, 1, 1, 1]),
            ("f", vec![1, 2, 1, 2]),
            ("rx", vec![1, 3]),
            ("ry", vec![3, 1]),
            ("rc", vec![2, 1]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect::<BTreeMap<_, _>>();
        let signature = ShapeSignature::conv(
            &shape![1, 2, 8, 8],
            &shape![4, 2, 3, 3],
            &shape![1, 4, 6, 6],
        );
        let mut params = TunedParams::default();
        params.insert(signature, axes);
        params
    }

    fn bound_axes(nest: &LoopNest, name: &str) -> Vec<DeviceAxis> {
        let block = nest.get_block(name).unwrap();
        nest.get_loops(&block)
            .unwrap()
            .iter()
            .filter_map(|l| match nest.loop_info(l).unwrap().annotation() {
                Annotation::Bound(axis) => Some(axis),
                _ => None,
            })
            .collect()
    }

    fn is_block_axis(axis: &DeviceAxis) -> bool {
        matches!(
            axis,
            DeviceAxis::BlockX | DeviceAxis::BlockY | DeviceAxis::BlockZ
        )
    }

    #[test]
    fn test_generic_tiling_on_cache_miss() {
        let mut nest = lowering::conv2d(
            &shape![1, 3, 32, 32],
            &shape![16, 3, 3, 3],
            Conv2dParams {
                pad: 1,
                ..Conv2dParams::default()
            },
            Dtype::Float32,
        )
        .unwrap();
        let tiling = schedule_conv::<CudaTarget>(&mut nest, &TunedParams::default()).unwrap();
        assert_eq!(tiling, ConvTiling::Generic);

        let axes = bound_axes(&nest, "conv2d_out");
        assert_eq!(axes.iter().filter(|a| is_block_axis(a)).count(), 2);
        assert_eq!(axes.iter().filter(|a| !is_block_axis(a)).count(), 2);

        let local = nest.get_block("conv2d_out_local").unwrap();
        assert_eq!(nest.output_buffer(&local).unwrap().scope, MemScope::Local);
        let extents = nest
            .get_loops(&local)
            .unwrap()
            .iter()
            .map(|l| l.extent())
            .collect::<Vec<_>>();
        assert_eq!(extents, vec![1, 1, 32, 2, 32, 8, 3, 1, 3, 3]);
        assert!(nest.get_block("input_pad").is_err());
    }

    #[test]
    fn test_generic_preserves_output_points() {
        let mut nest = small_conv();
        let before = nest.instance_set("conv2d_out");
        schedule_conv_generic::<CudaTarget>(&mut nest).unwrap();
        assert_eq!(nest.instance_set("conv2d_out_local"), before);
    }

    #[test]
    fn test_tuned_tiling_on_cache_hit() {
        let mut nest = small_conv();
        let before = nest.instance_set("conv2d_out");
        let tiling = schedule_conv::<CudaTarget>(&mut nest, &small_conv_params()).unwrap();
        assert_eq!(tiling, ConvTiling::Tuned);

        assert_eq!(
            bound_axes(&nest, "conv2d_out"),
            vec![
                DeviceAxis::BlockZ,
                DeviceAxis::BlockY,
                DeviceAxis::BlockX,
                DeviceAxis::ThreadZ,
                DeviceAxis::ThreadY,
                DeviceAxis::ThreadX,
            ]
        );
        let local = nest.get_block("conv2d_out_local").unwrap();
        let loops = nest.get_loops(&local).unwrap();
        assert_eq!(loops.len(), 19);
        for lp in &loops[16..] {
            assert_eq!(nest.loop_info(lp).unwrap().annotation(), Annotation::Unrolled);
        }
        for name in ["input_pad_shared", "weights_dilation_shared"] {
            let block = nest.get_block(name).unwrap();
            assert_eq!(nest.output_buffer(&block).unwrap().scope, MemScope::Shared);
            assert_eq!(nest.get_loops(&block).unwrap()[12], loops[12]);
        }
        assert_eq!(nest.instance_set("conv2d_out_local"), before);
    }

    #[test]
    fn test_builtin_stem_is_tuned() {
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
        let tiling = schedule_conv::<CudaTarget>(&mut nest, &TunedParams::builtin()).unwrap();
        assert_eq!(tiling, ConvTiling::Tuned);
        let extents = |name: &str| {
            let block = nest.get_block(name).unwrap();
            nest.get_loops(&block)
                .unwrap()
                .iter()
                .map(|l| l.extent())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            extents("conv2d_out"),
            vec![1, 1, 112, 1, 4, 1, 7, 8, 1, 16, 2, 1, 1]
        );
        assert_eq!(extents("conv2d_out_local").len(), 19);
    }

    #[test]
    fn test_malformed_entry_is_an_error() {
        let mut params = small_conv_params();
        let signature = ShapeSignature::conv(
            &shape![1, 2, 8, 8],
            &shape![4, 2, 3, 3],
            &shape![1, 4, 6, 6],
        );
        params.insert(
            signature,
            [("x".to_owned(), vec![1, 6])].into_iter().collect(),
        );
        let mut nest = small_conv();
        assert!(matches!(
            schedule_conv::<CudaTarget>(&mut nest, &params),
            Err(ScheduleError::MalformedParams(_))
        ));
    }

    #[test]
    fn test_requires_three_blocks() {
        let mut nest = lowering::matmul(4, 4, 4, Dtype::Float32).unwrap();
        assert_eq!(
            schedule_conv::<CudaTarget>(&mut nest, &TunedParams::default()),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 3,
                found: 1
            })
        );
    }

    #[test]
    fn test_signature_uses_padded_input() {
        let nest = small_conv();
        let blocks = nest.get_all_blocks();
        let pad: &[DimSize] = &nest.output_buffer(&blocks[0]).unwrap().shape;
        assert_eq!(pad, &shape![1, 2, 8, 8][..]);
    }
}
