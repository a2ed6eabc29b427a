//! Structural transformations on a [LoopNest](crate::ir::LoopNest).
//!
//! Every primitive is a method on the nest taking fresh handles. Primitives that change the set
//! of blocks or loops (fuse, split, cache read/write, compute-at, inline) invalidate every
//! handle previously obtained from the nest.

mod annotate;
mod cache;
mod compute_at;
mod inline;
mod loops;

use crate::ir::{Annotation, DeviceAxis};
use crate::tuning::TuningError;

#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ScheduleError {
    #[error("Handle from generation {handle} used at generation {current}")]
    StaleHandle { handle: u64, current: u64 },
    #[error("No block at position {0}")]
    InvalidBlock(usize),
    #[error("No block named {0:?}")]
    UnknownBlock(String),
    #[error("No loop over {0}")]
    UnknownLoop(String),
    #[error("Loop index {index} out of range for a block under {count} loops")]
    LoopIndexOutOfRange { index: usize, count: usize },
    #[error("Loops are not a perfectly nested chain: {0}")]
    NotAChain(String),
    #[error("Invalid split factors {factors:?} for a loop of extent {extent}")]
    InvalidSplitFactors { factors: Vec<i32>, extent: u32 },
    #[error("Loop {var} is already marked {existing}")]
    AnnotationConflict { var: String, existing: Annotation },
    #[error("Cannot bind {var} to {axis}: loop {other} is already bound to it")]
    BindingConflict {
        var: String,
        axis: DeviceAxis,
        other: String,
    },
    #[error("Extent {extent} of loop {var} is not divisible by vector width {width}")]
    NotDivisible { var: String, extent: u32, width: u32 },
    #[error("Loop {var} carries the reduction of block {block}")]
    LoopCarriesReduction { var: String, block: String },
    #[error("Loop {var} of extent {extent} is too long to unroll")]
    UnrollTooLarge { var: String, extent: u32 },
    #[error("Block {block} has no read at index {index}")]
    InvalidReadIndex { block: String, index: usize },
    #[error("Block {block} has no write at index {index}")]
    InvalidWriteIndex { block: String, index: usize },
    #[error("Cannot inline block {block}: {reason}")]
    InlineNotApplicable { block: String, reason: String },
    #[error("Cannot compute block {block} at loop {var}: {reason}")]
    ComputeAtNotApplicable {
        block: String,
        var: String,
        reason: String,
    },
    #[error("Expected {expected} blocks, found {found}")]
    UnexpectedBlockCount { expected: usize, found: usize },
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    #[error("Failed to derive tiling factors: {0}")]
    NumericDerivation(String),
    #[error("Malformed tuned parameters: {0}")]
    MalformedParams(String),
}

impl From<TuningError> for ScheduleError {
    fn from(err: TuningError) -> Self {
        ScheduleError::MalformedParams(err.to_string())
    }
}

/// Loop extents at or below this may be unrolled.
pub const MAX_UNROLL_EXTENT: u32 = 1024;
