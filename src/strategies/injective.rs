use crate::common::{volume, DimSize};
use crate::ir::{DeviceAxis, LoopNest};
use crate::scheduling::ScheduleError;
use crate::strategies::{log_schedule, merged_blocks, nth};
use crate::target::{Arch, Target};
use crate::utils::vectorize_factor;

/// Schedules a single elementwise block for `Tgt`.
pub fn schedule_injective<Tgt: Target>(
    nest: &mut LoopNest,
    output_shape: &[DimSize],
    vectorizable: bool,
) -> Result<(), ScheduleError> {
    match Tgt::arch() {
        Arch::Host => schedule_injective_cpu::<Tgt>(nest, output_shape, vectorizable),
        Arch::Accelerator => schedule_injective_gpu::<Tgt>(nest, output_shape),
    }
}

/// Fuses leading loops into one parallel loop and vectorizes the innermost dimension.
///
/// Ranks of five or more fuse three leading loops, ranks three and four fuse two. The
/// innermost loop is split by the largest factor of its extent that fits a vector register.
pub fn schedule_injective_cpu<Tgt: Target>(
    nest: &mut LoopNest,
    output_shape: &[DimSize],
    vectorizable: bool,
) -> Result<(), ScheduleError> {
    let blocks = merged_blocks(nest, 1)?;
    let lanes = Tgt::vector_lanes(nest.output_buffer(&blocks[0])?.dtype);
    let loops = nest.get_loops(&blocks[0])?;

    let mut dims = output_shape.len();
    let fused = if dims >= 5 {
        dims -= 2;
        nest.fuse(&loops[..3])?
    } else if dims >= 3 {
        dims -= 1;
        nest.fuse(&loops[..2])?
    } else {
        nth(&loops, 0)?
    };
    // A rank-1 loop is split below; it is parallelized afterwards.
    if dims > 1 || !vectorizable {
        nest.parallel(&fused)?;
    }

    if vectorizable {
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0])?;
        let innermost = nth(&loops, dims - 1)?;
        let factor = vectorize_factor(innermost.extent(), lanes);
        let split = nest.split(&innermost, &[-1, factor as i32])?;
        nest.vectorize(&split[1], factor)?;
        if dims == 1 {
            nest.parallel(&split[0])?;
        }
    }
    log_schedule("injective (host)", nest);
    Ok(())
}

/// Fuses every loop and distributes the iterations over blocks and threads.
///
/// More than `max_num_threads` iterations split into block-bound and thread-bound loops of
/// `max_num_threads` threads each. Fewer bind the fused loop to blocks directly. Outputs
/// needing more blocks than [Target::max_block_count] are rejected.
pub fn schedule_injective_gpu<Tgt: Target>(
    nest: &mut LoopNest,
    output_shape: &[DimSize],
) -> Result<(), ScheduleError> {
    let threads = Tgt::max_num_threads();
    let count = volume(output_shape);
    let grid = count.div_ceil(u64::from(threads));
    if grid > u64::from(Tgt::max_block_count()) {
        return Err(ScheduleError::InvalidShape(format!(
            "{count} elements need {grid} blocks of {threads} threads, more than {} allows",
            Tgt::target_id()
        )));
    }

    let blocks = merged_blocks(nest, 1)?;
    let loops = nest.get_loops(&blocks[0])?;
    let fused = nest.fuse(&loops)?;
    if count > u64::from(threads) {
        let split = nest.split(&fused, &[-1, threads as i32])?;
        nest.bind(&split[0], DeviceAxis::BlockX)?;
        nest.bind(&split[1], DeviceAxis::ThreadX)?;
    } else {
        nest.bind(&fused, DeviceAxis::BlockX)?;
    }
    log_schedule("injective (accelerator)", nest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::Annotation;
    use crate::lowering;
    use crate::shape;
    use crate::target::{ArmTarget, CudaTarget, X86Target};
    use proptest::prelude::*;

    fn annotations(nest: &LoopNest) -> Vec<(u32, Annotation)> {
        let blocks = nest.get_all_blocks();
        nest.get_loops(&blocks[0])
            .unwrap()
            .iter()
            .map(|l| (l.extent(), nest.loop_info(l).unwrap().annotation()))
            .collect()
    }

    #[test]
    fn test_cpu_rank4_fuses_two_and_vectorizes() {
        let shape = shape![2, 3, 4, 5];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
        schedule_injective_cpu::<X86Target>(&mut nest, &shape, true).unwrap();
        assert_eq!(
            annotations(&nest),
            vec![
                (6, Annotation::Parallel),
                (4, Annotation::Serial),
                (1, Annotation::Serial),
                (5, Annotation::Vectorized(5)),
            ]
        );
    }

    #[test]
    fn test_cpu_rank5_fuses_three() {
        let shape = shape![2, 2, 2, 3, 16];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
        schedule_injective_cpu::<ArmTarget>(&mut nest, &shape, true).unwrap();
        assert_eq!(
            annotations(&nest),
            vec![
                (8, Annotation::Parallel),
                (3, Annotation::Serial),
                (4, Annotation::Serial),
                (4, Annotation::Vectorized(4)),
            ]
        );
    }

    #[test]
    fn test_cpu_rank1_parallelizes_outer_split() {
        let shape = shape![64];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "exp").unwrap();
        schedule_injective_cpu::<X86Target>(&mut nest, &shape, true).unwrap();
        assert_eq!(
            annotations(&nest),
            vec![(8, Annotation::Parallel), (8, Annotation::Vectorized(8))]
        );
    }

    #[test]
    fn test_cpu_without_vectorization() {
        let shape = shape![7];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "exp").unwrap();
        schedule_injective_cpu::<X86Target>(&mut nest, &shape, false).unwrap();
        assert_eq!(annotations(&nest), vec![(7, Annotation::Parallel)]);
    }

    #[test]
    fn test_gpu_two_million_elements() {
        let shape = shape![2_000_000];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
        schedule_injective_gpu::<CudaTarget>(&mut nest, &shape).unwrap();
        assert_eq!(
            annotations(&nest),
            vec![
                (1954, Annotation::Bound(DeviceAxis::BlockX)),
                (1024, Annotation::Bound(DeviceAxis::ThreadX)),
            ]
        );
    }

    #[test]
    fn test_gpu_rejects_grid_beyond_target_limit() {
        let shape = shape![2_097_152, 2_097_152];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
        assert!(matches!(
            schedule_injective_gpu::<CudaTarget>(&mut nest, &shape),
            Err(ScheduleError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_gpu_small_output_binds_blocks_only() {
        let shape = shape![4, 8];
        let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
        schedule_injective::<CudaTarget>(&mut nest, &shape, true).unwrap();
        assert_eq!(
            annotations(&nest),
            vec![(32, Annotation::Bound(DeviceAxis::BlockX))]
        );
    }

    #[test]
    fn test_rejects_multiple_blocks() {
        let shape = shape![4, 8];
        let mut nest = lowering::softmax(&shape, -1, Dtype::Float32).unwrap();
        assert_eq!(
            schedule_injective_cpu::<X86Target>(&mut nest, &shape, true),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 1,
                found: 3
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_cpu_schedule_preserves_instances(
            dims in proptest::collection::vec(1u32..6, 1..6)
        ) {
            let shape = dims.iter().map(|&d| DimSize::new(d).unwrap()).collect::<Vec<_>>();
            let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
            let before = nest.instance_set("out");
            schedule_injective_cpu::<X86Target>(&mut nest, &shape, true).unwrap();
            prop_assert_eq!(nest.instance_set("out"), before);
            let extents = annotations(&nest).iter().map(|(e, _)| u64::from(*e)).product::<u64>();
            prop_assert_eq!(extents, volume(&shape));
        }

        #[test]
        fn test_gpu_schedule_preserves_instances(
            dims in proptest::collection::vec(1u32..40, 1..4)
        ) {
            let shape = dims.iter().map(|&d| DimSize::new(d).unwrap()).collect::<Vec<_>>();
            let mut nest = lowering::elementwise(&shape, Dtype::Float32, "relu").unwrap();
            let before = nest.instance_set("out");
            schedule_injective_gpu::<CudaTarget>(&mut nest, &shape).unwrap();
            prop_assert_eq!(nest.instance_set("out"), before);
        }
    }
}
