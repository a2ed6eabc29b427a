use crate::target::{cpu::CpuTarget, TargetId};

use serde::Serialize;

/// NEON hosts.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct ArmTarget;

impl CpuTarget for ArmTarget {
    fn host_id() -> TargetId {
        TargetId::Arm
    }

    fn simd_bits() -> u32 {
        128
    }
}
