use crate::target::{cpu::CpuTarget, TargetId};

use serde::Serialize;

/// AVX2 hosts.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct X86Target;

impl CpuTarget for X86Target {
    fn host_id() -> TargetId {
        TargetId::X86
    }

    fn simd_bits() -> u32 {
        256
    }
}
