use crate::common::DimSize;
use crate::ir::{DeviceAxis, LoopNest};
use crate::scheduling::ScheduleError;
use crate::strategies::{last_block, log_schedule, merged_blocks, nth};
use crate::target::{Arch, Target};

/// Schedules a matrix multiply for `Tgt`. `reduce_first_shape` is the shape of the host
/// variant's partial-product buffer and is ignored on accelerators.
pub fn schedule_matmul<Tgt: Target>(
    nest: &mut LoopNest,
    reduce_first_shape: &[DimSize],
) -> Result<(), ScheduleError> {
    match Tgt::arch() {
        Arch::Host => schedule_matmul_cpu(nest, reduce_first_shape),
        Arch::Accelerator => schedule_matmul_gpu(nest),
    }
}

/// Rows go to blocks and pairs of columns to threads.
pub fn schedule_matmul_gpu(nest: &mut LoopNest) -> Result<(), ScheduleError> {
    let loops = nest.get_loops(&last_block(nest)?)?;
    nest.split(&nth(&loops, 1)?, &[-1, 2])?;
    let loops = nest.get_loops(&last_block(nest)?)?;
    nest.bind(&nth(&loops, 0)?, DeviceAxis::BlockX)?;
    nest.bind(&nth(&loops, 1)?, DeviceAxis::ThreadX)?;
    log_schedule("matmul (accelerator)", nest);
    Ok(())
}

/// Unrolls the final accumulation over partial products when there is more than one.
pub fn schedule_matmul_cpu(
    nest: &mut LoopNest,
    reduce_first_shape: &[DimSize],
) -> Result<(), ScheduleError> {
    let blocks = merged_blocks(nest, 4)?;
    if reduce_first_shape.last().map_or(false, |d| d.get() > 1) {
        let loops = nest.get_loops(&blocks[3])?;
        let innermost = nth(&loops, loops.len().saturating_sub(1))?;
        nest.unroll(&innermost)?;
    }
    log_schedule("matmul (host)", nest);
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
    fn test_gpu_binds_rows_and_column_pairs() {
        let mut nest = lowering::matmul(32, 64, 16, Dtype::Float32).unwrap();
        schedule_matmul::<CudaTarget>(&mut nest, &[]).unwrap();
        assert_eq!(
            loop_annotations(&nest, "matmul_out"),
            vec![
                (32, Annotation::Bound(DeviceAxis::BlockX)),
                (32, Annotation::Bound(DeviceAxis::ThreadX)),
                (2, Annotation::Serial),
                (16, Annotation::Serial),
            ]
        );
    }

    #[test]
    fn test_cpu_unrolls_partial_sum() {
        let mut nest = lowering::matmul_cpu(8, 8, 32, 8, Dtype::Float32).unwrap();
        schedule_matmul::<X86Target>(&mut nest, &shape![8, 8, 4]).unwrap();
        assert_eq!(nest.expr_count(), 1);
        assert_eq!(
            loop_annotations(&nest, "mul_out")[2],
            (4, Annotation::Unrolled)
        );
    }

    #[test]
    fn test_cpu_single_partial_stays_serial() {
        let mut nest = lowering::matmul_cpu(8, 8, 8, 8, Dtype::Float32).unwrap();
        schedule_matmul_cpu(&mut nest, &shape![8, 8, 1]).unwrap();
        assert_eq!(
            loop_annotations(&nest, "mul_out")[2],
            (1, Annotation::Serial)
        );
    }

    #[test]
    fn test_cpu_requires_four_blocks() {
        let mut nest = lowering::matmul(8, 8, 8, Dtype::Float32).unwrap();
        assert_eq!(
            schedule_matmul_cpu(&mut nest, &shape![8, 8, 1]),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 4,
                found: 1
            })
        );
    }
}
