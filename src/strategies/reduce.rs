use crate::common::DimSize;
use crate::ir::{DeviceAxis, LoopNest, MemScope};
use crate::scheduling::ScheduleError;
use crate::strategies::{last_block, log_schedule, loops_of, merged_blocks, nth};
use crate::target::Target;

/// Schedules the final block of a reduction whose output has `output_shape`.
///
/// The trailing `last_dimension_num` output loops are fused and bound to threads, split by the
/// target's thread limit when larger. The remaining leading output loops are fused and bound to
/// blocks.
pub fn schedule_reduce_gpu<Tgt: Target>(
    nest: &mut LoopNest,
    output_shape: &[DimSize],
    last_dimension_num: usize,
) -> Result<(), ScheduleError> {
    let rank = output_shape.len();
    if last_dimension_num == 0 || last_dimension_num > rank {
        return Err(ScheduleError::InvalidShape(format!(
            "cannot thread {last_dimension_num} trailing axes of a rank-{rank} output"
        )));
    }
    let index = rank - last_dimension_num;
    let parallel_thread_num = output_shape[index..]
        .iter()
        .map(|d| u64::from(d.get()))
        .product::<u64>();

    for _ in 1..last_dimension_num {
        let loops = nest.get_loops(&last_block(nest)?)?;
        nest.fuse(&[nth(&loops, index)?, nth(&loops, index + 1)?])?;
    }

    let max_threads = Tgt::max_num_threads();
    let loops = nest.get_loops(&last_block(nest)?)?;
    if parallel_thread_num > u64::from(max_threads) {
        let split = nest.split(&nth(&loops, index)?, &[-1, max_threads as i32])?;
        nest.bind(&split[1], DeviceAxis::ThreadX)?;
    } else {
        nest.bind(&nth(&loops, index)?, DeviceAxis::ThreadX)?;
    }

    for _ in 1..index {
        let loops = nest.get_loops(&last_block(nest)?)?;
        nest.fuse(&[nth(&loops, 0)?, nth(&loops, 1)?])?;
    }
    if index > 0 {
        let loops = nest.get_loops(&last_block(nest)?)?;
        nest.bind(&nth(&loops, 0)?, DeviceAxis::BlockX)?;
    }
    log_schedule("reduce", nest);
    Ok(())
}

/// Schedules a two-stage reduction: per-thread partial results held in local memory, then a
/// cross-thread combination.
///
/// `tmp_rank` is the rank of the partial-result buffer, which carries one trailing thread axis
/// after the parallel axes.
pub fn schedule_block_reduce_internal(
    nest: &mut LoopNest,
    tmp_rank: usize,
) -> Result<(), ScheduleError> {
    merged_blocks(nest, 2)?;

    for _ in 2..tmp_rank {
        for index in 0..2 {
            let block = nest.get_all_blocks()[index];
            nest.fuse_block(&block, &[0, 1])?;
        }
    }

    let blocks = nest.get_all_blocks();
    if tmp_rank == 1 {
        let loops = nest.get_loops(&blocks[0])?;
        nest.bind(&nth(&loops, 0)?, DeviceAxis::ThreadX)?;
        nest.set_buffer(&blocks[0], MemScope::Local)?;
        let loops = nest.get_loops(&blocks[1])?;
        nest.bind(&nth(&loops, 0)?, DeviceAxis::ThreadX)?;
    } else {
        let loops = nest.get_loops(&blocks[0])?;
        nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
        nest.set_buffer(&blocks[0], MemScope::Local)?;
        let loops = nest.get_loops(&blocks[1])?;
        nest.bind(&nth(&loops, 0)?, DeviceAxis::BlockX)?;
        nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
        nest.simple_compute_at(&blocks[0], &loops[0])?;
    }
    log_schedule("block reduce (2 stages)", nest);
    Ok(())
}

/// Schedules a three-stage reduction. The first two stages keep their results in local
/// memory and are computed inside the outer loop of the stage consuming them.
///
/// `reduce_tmp_rank` and `tmp_rank` are the ranks of the first and second stage's buffers.
pub fn schedule_block_reduce(
    nest: &mut LoopNest,
    reduce_tmp_rank: usize,
    tmp_rank: usize,
) -> Result<(), ScheduleError> {
    merged_blocks(nest, 3)?;
    if tmp_rank == 0 || reduce_tmp_rank < tmp_rank {
        return Err(ScheduleError::InvalidShape(format!(
            "stage ranks {reduce_tmp_rank} and {tmp_rank} do not describe a block reduction"
        )));
    }

    let parallel_rank = tmp_rank - 1;
    for _ in tmp_rank..reduce_tmp_rank {
        let first = nest.get_all_blocks()[0];
        nest.fuse_block(&first, &[parallel_rank, parallel_rank + 1])?;
    }
    for _ in 1..parallel_rank {
        for index in 0..3 {
            let block = nest.get_all_blocks()[index];
            nest.fuse_block(&block, &[0, 1])?;
        }
    }

    let blocks = nest.get_all_blocks();
    if tmp_rank == 1 {
        for (index, block) in blocks.iter().enumerate() {
            let loops = nest.get_loops(block)?;
            nest.bind(&nth(&loops, 0)?, DeviceAxis::ThreadX)?;
            if index < 2 {
                nest.set_buffer(block, MemScope::Local)?;
            }
        }
    } else {
        let loops = nest.get_loops(&blocks[0])?;
        nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
        nest.set_buffer(&blocks[0], MemScope::Local)?;
        let loops = nest.get_loops(&blocks[1])?;
        nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
        nest.set_buffer(&blocks[1], MemScope::Local)?;
        nest.simple_compute_at(&blocks[0], &loops[0])?;

        let loops = loops_of(nest, 2)?;
        nest.bind(&nth(&loops, 0)?, DeviceAxis::BlockX)?;
        nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
        let second = nest.get_all_blocks()[1];
        nest.simple_compute_at(&second, &loops[0])?;
    }
    log_schedule("block reduce (3 stages)", nest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{Annotation, ReduceKind};
    use crate::lowering;
    use crate::shape;
    use crate::target::CudaTarget;

    fn loop_annotations(nest: &LoopNest, name: &str) -> Vec<(u32, Annotation)> {
        let block = nest.get_block(name).unwrap();
        nest.get_loops(&block)
            .unwrap()
            .iter()
            .map(|l| (l.extent(), nest.loop_info(l).unwrap().annotation()))
            .collect()
    }

    #[test]
    fn test_reduce_binds_trailing_axes_to_threads() {
        let mut nest =
            lowering::reduce(&shape![8, 4, 16, 32], &[1], ReduceKind::Sum, Dtype::Float32)
                .unwrap();
        let before = nest.instance_set("reduce_out");
        schedule_reduce_gpu::<CudaTarget>(&mut nest, &shape![8, 16, 32], 2).unwrap();
        assert_eq!(
            loop_annotations(&nest, "reduce_out"),
            vec![
                (8, Annotation::Bound(DeviceAxis::BlockX)),
                (512, Annotation::Bound(DeviceAxis::ThreadX)),
                (4, Annotation::Serial),
            ]
        );
        assert_eq!(nest.instance_set("reduce_out"), before);
    }

    #[test]
    fn test_reduce_splits_wide_thread_axis() {
        let mut nest =
            lowering::reduce(&shape![3, 2048, 4], &[2], ReduceKind::Max, Dtype::Float32).unwrap();
        schedule_reduce_gpu::<CudaTarget>(&mut nest, &shape![3, 2048], 1).unwrap();
        assert_eq!(
            loop_annotations(&nest, "reduce_out"),
            vec![
                (3, Annotation::Bound(DeviceAxis::BlockX)),
                (2, Annotation::Serial),
                (1024, Annotation::Bound(DeviceAxis::ThreadX)),
                (4, Annotation::Serial),
            ]
        );
    }

    #[test]
    fn test_reduce_rejects_bad_trailing_count() {
        let mut nest =
            lowering::reduce(&shape![3, 4], &[1], ReduceKind::Sum, Dtype::Float32).unwrap();
        assert!(matches!(
            schedule_reduce_gpu::<CudaTarget>(&mut nest, &shape![3], 2),
            Err(ScheduleError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_block_reduce_internal_with_parallel_axes() {
        let mut nest =
            lowering::block_reduce_internal(&shape![4, 6], 32, 8, Dtype::Float32).unwrap();
        let before = nest.instance_set("tmp_out");
        schedule_block_reduce_internal(&mut nest, 3).unwrap();

        assert_eq!(nest.expr_count(), 1);
        let tmp = nest.get_block("tmp_out").unwrap();
        assert_eq!(nest.output_buffer(&tmp).unwrap().scope, MemScope::Local);
        assert_eq!(
            loop_annotations(&nest, "tmp_out"),
            vec![
                (24, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadX)),
                (8, Annotation::Serial),
            ]
        );
        assert_eq!(
            loop_annotations(&nest, "out"),
            vec![
                (24, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadX)),
            ]
        );
        assert_eq!(nest.instance_set("tmp_out"), before);
    }

    #[test]
    fn test_block_reduce_internal_scalar() {
        let mut nest = lowering::block_reduce_internal(&[], 32, 8, Dtype::Float32).unwrap();
        schedule_block_reduce_internal(&mut nest, 1).unwrap();
        assert_eq!(
            loop_annotations(&nest, "tmp_out"),
            vec![(32, Annotation::Bound(DeviceAxis::ThreadX)), (8, Annotation::Serial)]
        );
        assert_eq!(
            loop_annotations(&nest, "out")[0],
            (1, Annotation::Bound(DeviceAxis::ThreadX))
        );
    }

    #[test]
    fn test_block_reduce_three_stages() {
        let mut nest = lowering::block_reduce(&shape![2, 5], 32, 4, 2, Dtype::Float32).unwrap();
        let before = nest.instance_set("reduce_tmp_out");
        schedule_block_reduce(&mut nest, 4, 3).unwrap();

        assert_eq!(
            loop_annotations(&nest, "reduce_tmp_out"),
            vec![
                (10, Annotation::Bound(DeviceAxis::BlockX)),
                (128, Annotation::Bound(DeviceAxis::ThreadX)),
                (2, Annotation::Serial),
            ]
        );
        assert_eq!(
            loop_annotations(&nest, "tmp_out"),
            vec![
                (10, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadX)),
                (4, Annotation::Serial),
            ]
        );
        for name in ["reduce_tmp_out", "tmp_out"] {
            let block = nest.get_block(name).unwrap();
            assert_eq!(nest.output_buffer(&block).unwrap().scope, MemScope::Local);
        }
        assert_eq!(nest.instance_set("reduce_tmp_out"), before);
    }

    #[test]
    fn test_block_reduce_requires_three_blocks() {
        let mut nest =
            lowering::block_reduce_internal(&shape![4], 32, 8, Dtype::Float32).unwrap();
        assert_eq!(
            schedule_block_reduce(&mut nest, 3, 2),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 3,
                found: 2
            })
        );
    }
}
