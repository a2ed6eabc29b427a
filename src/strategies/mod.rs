//! Operator-specific schedules built from the primitives in [crate::scheduling].
//!
//! Every strategy takes the naive nest of one operator and rewrites it in place. Strategies
//! generic over a [Target](crate::target::Target) pick host or accelerator variants from
//! [Target::arch](crate::target::Target::arch). A strategy that finds a nest shaped differently
//! from what it was written for returns [ScheduleError::UnexpectedBlockCount] and leaves the
//! nest unusable.

mod conv;
mod injective;
mod matmul;
mod pool;
mod reduce;
mod softmax;
mod split;

pub use conv::{schedule_conv, schedule_conv_generic, schedule_conv_tuned, ConvTiling};
pub use injective::{schedule_injective, schedule_injective_cpu, schedule_injective_gpu};
pub use matmul::{schedule_matmul, schedule_matmul_cpu, schedule_matmul_gpu};
pub use pool::{schedule_global_pool_gpu, schedule_pool_gpu};
pub use reduce::{schedule_block_reduce, schedule_block_reduce_internal, schedule_reduce_gpu};
pub use softmax::schedule_softmax_cpu;
pub use split::schedule_split;

use crate::ir::{BlockRef, LoopNest, LoopRef};
use crate::scheduling::ScheduleError;

/// Merges all sub-expressions and checks that exactly `expected` blocks remain.
fn merged_blocks(nest: &mut LoopNest, expected: usize) -> Result<Vec<BlockRef>, ScheduleError> {
    nest.merge_exprs();
    expect_blocks(nest, expected)
}

fn expect_blocks(nest: &LoopNest, expected: usize) -> Result<Vec<BlockRef>, ScheduleError> {
    let blocks = nest.get_all_blocks();
    if blocks.len() != expected {
        return Err(ScheduleError::UnexpectedBlockCount {
            expected,
            found: blocks.len(),
        });
    }
    Ok(blocks)
}

fn last_block(nest: &LoopNest) -> Result<BlockRef, ScheduleError> {
    nest.get_all_blocks()
        .pop()
        .ok_or(ScheduleError::UnexpectedBlockCount {
            expected: 1,
            found: 0,
        })
}

/// The loops currently enclosing the block at `index`.
fn loops_of(nest: &LoopNest, index: usize) -> Result<Vec<LoopRef>, ScheduleError> {
    let block = nest
        .get_all_blocks()
        .get(index)
        .copied()
        .ok_or(ScheduleError::InvalidBlock(index))?;
    nest.get_loops(&block)
}

fn loops_named(nest: &LoopNest, name: &str) -> Result<Vec<LoopRef>, ScheduleError> {
    let block = nest.get_block(name)?;
    nest.get_loops(&block)
}

fn nth(loops: &[LoopRef], index: usize) -> Result<LoopRef, ScheduleError> {
    loops
        .get(index)
        .copied()
        .ok_or(ScheduleError::LoopIndexOutOfRange {
            index,
            count: loops.len(),
        })
}

fn block_name(nest: &LoopNest, block: &BlockRef) -> Result<String, ScheduleError> {
    Ok(nest.block(block)?.name().to_owned())
}

fn log_schedule(strategy: &str, nest: &LoopNest) {
    log::debug!("after {strategy}:\n{nest}");
}
