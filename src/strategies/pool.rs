use crate::ir::{DeviceAxis, LoopNest, MemScope};
use crate::scheduling::ScheduleError;
use crate::strategies::{expect_blocks, log_schedule, nth};
use crate::target::Target;

/// Width of the thread tile each block of a global pool reduces.
const GLOBAL_POOL_LANES: i32 = 32;

/// Fuses the four output loops of a windowed pool and spreads them over blocks and threads.
pub fn schedule_pool_gpu<Tgt: Target>(nest: &mut LoopNest) -> Result<(), ScheduleError> {
    let blocks = expect_blocks(nest, 1)?;
    let fused = nest.fuse_block(&blocks[0], &[0, 1, 2, 3])?;
    let split = nest.split(&fused, &[-1, Tgt::max_num_threads() as i32])?;
    nest.bind(&split[0], DeviceAxis::BlockX)?;
    nest.bind(&split[1], DeviceAxis::ThreadX)?;
    log_schedule("pool", nest);
    Ok(())
}

/// Schedules a global pool given as a partial-sum stage and a combining stage.
///
/// Both stages fuse their batch and channel loops and tile them by 32. Each tile row is a
/// `threadIdx.y` slice of a block, and its partial sums are accumulated in local memory by
/// `threadIdx.x` lanes right before they are combined.
pub fn schedule_global_pool_gpu(nest: &mut LoopNest) -> Result<(), ScheduleError> {
    let blocks = expect_blocks(nest, 2)?;
    let fused = nest.fuse_block(&blocks[0], &[0, 1])?;
    nest.split(&fused, &[-1, GLOBAL_POOL_LANES])?;

    let blocks = nest.get_all_blocks();
    let fused = nest.fuse_block(&blocks[1], &[0, 1])?;
    let split = nest.split(&fused, &[-1, GLOBAL_POOL_LANES])?;
    nest.bind(&split[0], DeviceAxis::BlockX)?;
    nest.bind(&split[1], DeviceAxis::ThreadY)?;

    let blocks = nest.get_all_blocks();
    nest.simple_compute_at(&blocks[0], &split[1])?;

    let blocks = nest.get_all_blocks();
    nest.set_buffer(&blocks[0], MemScope::Local)?;
    let loops = nest.get_loops(&blocks[0])?;
    nest.bind(&nth(&loops, 2)?, DeviceAxis::ThreadX)?;
    log_schedule("global pool", nest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::Annotation;
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
    fn test_pool_binds_fused_output() {
        let mut nest = lowering::pool2d(&shape![2, 16, 32, 32], 2, 2, Dtype::Float32).unwrap();
        let before = nest.instance_set("pool_out");
        schedule_pool_gpu::<CudaTarget>(&mut nest).unwrap();
        assert_eq!(
            loop_annotations(&nest, "pool_out"),
            vec![
                (8, Annotation::Bound(DeviceAxis::BlockX)),
                (1024, Annotation::Bound(DeviceAxis::ThreadX)),
                (2, Annotation::Serial),
                (2, Annotation::Serial),
            ]
        );
        assert_eq!(nest.instance_set("pool_out"), before);
    }

    #[test]
    fn test_pool_guards_partial_block() {
        let mut nest = lowering::pool2d(&shape![1, 3, 9, 9], 3, 3, Dtype::Float32).unwrap();
        let before = nest.instance_set("pool_out");
        schedule_pool_gpu::<CudaTarget>(&mut nest).unwrap();
        let pool = nest.get_block("pool_out").unwrap();
        assert_eq!(nest.block(&pool).unwrap().predicates().len(), 1);
        assert_eq!(nest.instance_set("pool_out"), before);
    }

    #[test]
    fn test_global_pool() {
        let mut nest = lowering::global_pool(&shape![2, 64, 7, 7], 32, Dtype::Float32).unwrap();
        let before = nest.instance_set("pool_partial");
        schedule_global_pool_gpu(&mut nest).unwrap();

        assert_eq!(nest.expr_count(), 1);
        assert_eq!(
            loop_annotations(&nest, "pool_partial"),
            vec![
                (4, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadY)),
                (32, Annotation::Bound(DeviceAxis::ThreadX)),
                (2, Annotation::Serial),
            ]
        );
        assert_eq!(
            loop_annotations(&nest, "pool_out"),
            vec![
                (4, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadY)),
                (32, Annotation::Serial),
            ]
        );
        let partial = nest.get_block("pool_partial").unwrap();
        assert_eq!(nest.output_buffer(&partial).unwrap().scope, MemScope::Local);
        assert_eq!(nest.instance_set("pool_partial"), before);
    }

    #[test]
    fn test_global_pool_requires_two_blocks() {
        let mut nest = lowering::pool2d(&shape![1, 3, 9, 9], 3, 3, Dtype::Float32).unwrap();
        assert_eq!(
            schedule_global_pool_gpu(&mut nest),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 2,
                found: 1
            })
        );
    }
}
