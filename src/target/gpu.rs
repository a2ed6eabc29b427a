use crate::target::{Arch, Target, TargetId};

use serde::Serialize;

const GRID_DIM_LIMIT: u32 = i32::MAX as u32;

#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct CudaTarget;

#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct RocmTarget;

impl Target for CudaTarget {
    fn arch() -> Arch {
        Arch::Accelerator
    }

    fn max_num_threads() -> u32 {
        1024
    }

    fn warp_size() -> u32 {
        32
    }

    fn vector_bits() -> u32 {
        0
    }

    fn max_block_count() -> u32 {
        GRID_DIM_LIMIT
    }

    fn target_id() -> TargetId {
        TargetId::Cuda
    }
}

impl Target for RocmTarget {
    fn arch() -> Arch {
        Arch::Accelerator
    }

    fn max_num_threads() -> u32 {
        1024
    }

    fn warp_size() -> u32 {
        64
    }

    fn vector_bits() -> u32 {
        0
    }

    fn max_block_count() -> u32 {
        GRID_DIM_LIMIT
    }

    fn target_id() -> TargetId {
        TargetId::Rocm
    }
}
