use crate::target::{Arch, Target, TargetId};

use std::fmt::Debug;

pub trait CpuTarget: Clone + Copy + std::hash::Hash + Eq + Default + Debug + 'static {
    fn host_id() -> TargetId;
    fn simd_bits() -> u32;
}

impl<T: CpuTarget> Target for T {
    fn arch() -> Arch {
        Arch::Host
    }

    fn max_num_threads() -> u32 {
        32
    }

    fn warp_size() -> u32 {
        1
    }

    fn vector_bits() -> u32 {
        <Self as CpuTarget>::simd_bits()
    }

    fn max_block_count() -> u32 {
        1
    }

    fn target_id() -> TargetId {
        <Self as CpuTarget>::host_id()
    }
}
