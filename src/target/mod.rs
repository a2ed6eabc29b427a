mod arm;
mod cpu;
mod gpu;
mod x86;

pub use arm::ArmTarget;
pub use cpu::CpuTarget;
pub use gpu::{CudaTarget, RocmTarget};
pub use x86::X86Target;

use crate::common::Dtype;

use std::fmt::Debug;

pub trait Target: Clone + Copy + std::hash::Hash + Eq + Default + Debug + 'static {
    fn arch() -> Arch;

    /// Threads per block on accelerators; worker threads on hosts.
    fn max_num_threads() -> u32;

    /// Warp or wavefront width. Hosts report `1`.
    fn warp_size() -> u32;

    /// Native SIMD register width in bits. Accelerators report `0`.
    fn vector_bits() -> u32;

    fn max_block_count() -> u32;

    /// Get corresponding [TargetId] enum
    fn target_id() -> TargetId;

    /// The number of `dtype` lanes in one native vector register, at least 1.
    fn vector_lanes(dtype: Dtype) -> u32 {
        (Self::vector_bits() / dtype.bits()).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// Multicore host with SIMD units.
    Host,
    /// Accelerator with a block/thread execution grid.
    Accelerator,
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum TargetId {
    #[default]
    X86,
    Arm,
    Cuda,
    Rocm,
}
