use crate::ir::LoopNest;
use crate::lowering::normalize_axis;
use crate::scheduling::ScheduleError;
use crate::strategies::{log_schedule, merged_blocks, nth};

/// Schedules the three softmax stages for a host: the output loops ahead of `axis` are fused and
/// the sum stage is computed inside the fused loop, next to the normalization reading it.
///
/// A negative `axis` counts from the end.
pub fn schedule_softmax_cpu(nest: &mut LoopNest, axis: i32) -> Result<(), ScheduleError> {
    let blocks = merged_blocks(nest, 3)?;
    let rank = nest.output_buffer(&blocks[2])?.shape.len();
    let axis = normalize_axis(axis, rank)?;

    for _ in 1..axis {
        let output = nest.get_all_blocks()[2];
        nest.fuse_block(&output, &[0, 1])?;
    }
    let blocks = nest.get_all_blocks();
    let loops = nest.get_loops(&blocks[2])?;
    nest.compute_at(&blocks[1], &nth(&loops, 0)?)?;
    log_schedule("softmax", nest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::lowering;
    use crate::shape;

    fn extents(nest: &LoopNest, name: &str) -> Vec<u32> {
        let block = nest.get_block(name).unwrap();
        nest.get_loops(&block)
            .unwrap()
            .iter()
            .map(|l| l.extent())
            .collect()
    }

    #[test]
    fn test_last_axis_of_rank3() {
        let mut nest = lowering::softmax(&shape![2, 3, 4], -1, Dtype::Float32).unwrap();
        let before = nest.instance_set("softmax_sum");
        schedule_softmax_cpu(&mut nest, -1).unwrap();

        assert_eq!(nest.block_count(), 3);
        assert_eq!(extents(&nest, "softmax_out"), vec![6, 4]);
        // The sum shares the fused loop and keeps only its reduction loop.
        assert_eq!(extents(&nest, "softmax_sum"), vec![6, 4]);
        let sum = nest.get_block("softmax_sum").unwrap();
        let out = nest.get_block("softmax_out").unwrap();
        assert_eq!(
            nest.get_loops(&sum).unwrap()[0],
            nest.get_loops(&out).unwrap()[0]
        );
        assert_eq!(nest.instance_set("softmax_sum"), before);
    }

    #[test]
    fn test_sum_precedes_normalization_per_row() {
        let mut nest = lowering::softmax(&shape![2, 3], 1, Dtype::Float32).unwrap();
        schedule_softmax_cpu(&mut nest, 1).unwrap();
        let order = nest
            .instances()
            .into_iter()
            .filter(|inst| inst.block != "softmax_exp")
            .map(|inst| inst.block)
            .collect::<Vec<_>>();
        let row = ["softmax_sum"; 3]
            .into_iter()
            .chain(["softmax_out"; 3])
            .collect::<Vec<_>>();
        assert_eq!(order, [row.clone(), row].concat());
    }

    #[test]
    fn test_axis_out_of_range() {
        let mut nest = lowering::softmax(&shape![2, 3], -1, Dtype::Float32).unwrap();
        assert!(matches!(
            schedule_softmax_cpu(&mut nest, 2),
            Err(ScheduleError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_requires_three_blocks() {
        let mut nest = lowering::elementwise(&shape![2, 3], Dtype::Float32, "exp").unwrap();
        assert_eq!(
            schedule_softmax_cpu(&mut nest, -1),
            Err(ScheduleError::UnexpectedBlockCount {
                expected: 3,
                found: 1
            })
        );
    }
}
