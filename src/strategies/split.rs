use crate::common::DimSize;
use crate::ir::{DeviceAxis, LoopNest};
use crate::scheduling::ScheduleError;
use crate::strategies::{block_name, log_schedule, loops_named, nth};
use crate::target::{Arch, Target};

/// Schedules an operator that writes one output per section of `axis`.
///
/// Every block gets `axis` as its innermost loop and its remaining loops fused into one. The
/// other blocks are then computed inside the last block's outer loops, which an accelerator
/// binds to blocks and threads.
pub fn schedule_split<Tgt: Target>(
    nest: &mut LoopNest,
    output_shapes: &[Vec<DimSize>],
    axis: usize,
) -> Result<(), ScheduleError> {
    nest.merge_exprs();
    let first_shape = output_shapes
        .first()
        .ok_or_else(|| ScheduleError::InvalidShape("split without outputs".to_owned()))?;
    let dims = first_shape.len();
    if axis >= dims {
        return Err(ScheduleError::InvalidShape(format!(
            "axis {axis} out of range for rank {dims}"
        )));
    }
    let names = nest
        .get_all_blocks()
        .iter()
        .map(|b| block_name(nest, b))
        .collect::<Result<Vec<_>, _>>()?;
    if names.len() != output_shapes.len() {
        return Err(ScheduleError::UnexpectedBlockCount {
            expected: output_shapes.len(),
            found: names.len(),
        });
    }

    let order = (0..dims)
        .filter(|&d| d != axis)
        .chain(std::iter::once(axis))
        .collect::<Vec<_>>();
    let fuse_indices = (0..dims - 1).collect::<Vec<_>>();
    for name in &names {
        let block = nest.get_block(name)?;
        nest.reorder_block(&block, &order)?;
        if !fuse_indices.is_empty() {
            let block = nest.get_block(name)?;
            nest.fuse_block(&block, &fuse_indices)?;
        }
    }
    let fused_shape = (0..dims)
        .filter(|&d| d != axis)
        .map(|d| u64::from(first_shape[d].get()))
        .product::<u64>();

    let (last, others) = names
        .split_last()
        .expect("the block count matches a non-empty output list");
    let max_threads = Tgt::max_num_threads();
    let tiled = Tgt::arch() == Arch::Accelerator && fused_shape > u64::from(max_threads);
    if Tgt::arch() == Arch::Accelerator {
        let loops = loops_named(nest, last)?;
        if tiled {
            let split = nest.split(&nth(&loops, 0)?, &[-1, max_threads as i32])?;
            nest.bind(&split[0], DeviceAxis::BlockX)?;
            nest.bind(&split[1], DeviceAxis::ThreadX)?;
        } else {
            nest.bind(&nth(&loops, 0)?, DeviceAxis::ThreadX)?;
        }
    }

    // A rank-1 split has no loop shared by every output.
    if dims > 1 {
        let level = usize::from(tiled);
        for name in others {
            if tiled {
                let loops = loops_named(nest, name)?;
                nest.split(&nth(&loops, 0)?, &[-1, max_threads as i32])?;
            }
            let block = nest.get_block(name)?;
            let target = nth(&loops_named(nest, last)?, level)?;
            nest.simple_compute_at(&block, &target)?;
        }
    }
    log_schedule("split", nest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::Annotation;
    use crate::lowering;
    use crate::shape;
    use crate::target::{CudaTarget, X86Target};

    fn loop_annotations(nest: &LoopNest, name: &str) -> Vec<(u32, Annotation)> {
        let block = nest.get_block(name).unwrap();
        nest.get_loops(&block)
            .unwrap()
            .iter()
            .map(|l| (l.extent(), nest.loop_info(l).unwrap().annotation()))
            .collect()
    }

    #[test]
    fn test_cpu_shares_outer_loop() {
        let (mut nest, shapes) =
            lowering::split(&shape![4, 6, 5], 1, &[2, 4], Dtype::Float32).unwrap();
        let before = nest.instance_set("split_out_0");
        schedule_split::<X86Target>(&mut nest, &shapes, 1).unwrap();

        assert_eq!(nest.expr_count(), 1);
        let extents = |name| {
            loop_annotations(&nest, name)
                .into_iter()
                .map(|(e, _)| e)
                .collect::<Vec<_>>()
        };
        assert_eq!(extents("split_out_0"), vec![20, 2]);
        assert_eq!(extents("split_out_1"), vec![20, 4]);
        let first = nest.get_block("split_out_0").unwrap();
        let last = nest.get_block("split_out_1").unwrap();
        assert_eq!(
            nest.get_loops(&first).unwrap()[0],
            nest.get_loops(&last).unwrap()[0]
        );
        assert_eq!(nest.instance_set("split_out_0"), before);
    }

    #[test]
    fn test_gpu_small_outputs_bind_threads() {
        let (mut nest, shapes) =
            lowering::split(&shape![8, 6], 1, &[3, 3], Dtype::Float32).unwrap();
        schedule_split::<CudaTarget>(&mut nest, &shapes, 1).unwrap();
        for name in ["split_out_0", "split_out_1"] {
            assert_eq!(
                loop_annotations(&nest, name),
                vec![
                    (8, Annotation::Bound(DeviceAxis::ThreadX)),
                    (3, Annotation::Serial),
                ]
            );
        }
    }

    #[test]
    fn test_gpu_large_outputs_tile_by_threads() {
        let (mut nest, shapes) =
            lowering::split(&shape![2, 2048], 0, &[1, 1], Dtype::Float32).unwrap();
        let before = nest.instance_set("split_out_0");
        schedule_split::<CudaTarget>(&mut nest, &shapes, 0).unwrap();
        for name in ["split_out_0", "split_out_1"] {
            assert_eq!(
                loop_annotations(&nest, name),
                vec![
                    (2, Annotation::Bound(DeviceAxis::BlockX)),
                    (1024, Annotation::Bound(DeviceAxis::ThreadX)),
                    (1, Annotation::Serial),
                ]
            );
        }
        assert_eq!(nest.instance_set("split_out_0"), before);
    }

    #[test]
    fn test_rank1_keeps_separate_nests() {
        let (mut nest, shapes) =
            lowering::split(&shape![6], 0, &[2, 4], Dtype::Float32).unwrap();
        schedule_split::<X86Target>(&mut nest, &shapes, 0).unwrap();
        assert_eq!(nest.block_count(), 2);
        assert_eq!(loop_annotations(&nest, "split_out_1"), vec![(4, Annotation::Serial)]);
    }

    #[test]
    fn test_block_count_must_match_outputs() {
        let (mut nest, mut shapes) =
            lowering::split(&shape![4, 6], 1, &[2, 4], Dtype::Float32).unwrap();
        shapes.push(shape![4, 1]);
        assert_eq!(
            schedule_split::<X86Target>(&mut nest, &shapes, 1),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 3,
                found: 2
            })
        );
    }
}
