//! Cache-control MSRs: reading the firmware's MTRRs and programming PAT.

use alloc::vec::Vec;
use core::arch::x86_64::__cpuid;

use libkernel::arch::x86_64::{
    memory::PAT_VALUE,
    mtrr::{FIXED_RANGE_MSRS, MtrrState, VariableRange},
};
use log::{debug, warn};
use x86_64::registers::model_specific::Msr;

const IA32_MTRRCAP: u32 = 0xfe;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;
const IA32_MTRR_FIX64K_00000: u32 = 0x250;
const IA32_MTRR_FIX16K_80000: u32 = 0x258;
const IA32_MTRR_FIX16K_A0000: u32 = 0x259;
const IA32_MTRR_FIX4K_C0000: u32 = 0x268;
const IA32_PAT: u32 = 0x277;
const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;

const CPUID_EDX_MTRR: u32 = 1 << 12;
const MTRRCAP_VCNT: u64 = 0xff;
const MTRRCAP_FIX: u64 = 1 << 8;

/// Fixed-range MSRs in the order `MtrrState::fixed` expects them.
const FIXED_MSRS: [u32; FIXED_RANGE_MSRS] = [
    IA32_MTRR_FIX64K_00000,
    IA32_MTRR_FIX16K_80000,
    IA32_MTRR_FIX16K_A0000,
    IA32_MTRR_FIX4K_C0000,
    IA32_MTRR_FIX4K_C0000 + 1,
    IA32_MTRR_FIX4K_C0000 + 2,
    IA32_MTRR_FIX4K_C0000 + 3,
    IA32_MTRR_FIX4K_C0000 + 4,
    IA32_MTRR_FIX4K_C0000 + 5,
    IA32_MTRR_FIX4K_C0000 + 6,
    IA32_MTRR_FIX4K_C0000 + 7,
];

fn rdmsr(msr: u32) -> u64 {
    // SAFETY: only called for MSRs whose presence MTRRCAP reported.
    unsafe { Msr::new(msr).read() }
}

/// Snapshot of the calling CPU's MTRRs. A CPU without MTRRs yields a
/// disabled state, under which everything is uncacheable.
pub fn read_mtrr_state() -> MtrrState {
    // SAFETY: CPUID leaf 1 exists on every x86-64 CPU.
    let features = unsafe { __cpuid(1) };
    if features.edx & CPUID_EDX_MTRR == 0 {
        warn!("CPU has no MTRRs");
        return MtrrState::default();
    }

    let cap = rdmsr(IA32_MTRRCAP);
    let mut state = MtrrState {
        def_type: rdmsr(IA32_MTRR_DEF_TYPE),
        ..MtrrState::default()
    };

    if cap & MTRRCAP_FIX != 0 {
        for (slot, msr) in state.fixed.iter_mut().zip(FIXED_MSRS) {
            *slot = rdmsr(msr);
        }
    }

    let count = (cap & MTRRCAP_VCNT) as u32;
    state.variable = (0..count)
        .map(|n| VariableRange {
            base: rdmsr(IA32_MTRR_PHYSBASE0 + 2 * n),
            mask: rdmsr(IA32_MTRR_PHYSBASE0 + 2 * n + 1),
        })
        .collect::<Vec<_>>();

    debug!(
        "MTRR: def {:#x}, {} variable ranges",
        state.def_type,
        state.variable.len()
    );

    state
}

/// Loads the kernel's PAT layout on the calling CPU.
pub fn program_pat() {
    let mut pat = Msr::new(IA32_PAT);
    // SAFETY: indices 0 to 3 keep their power-on meaning, so mappings
    // created before this point do not change type.
    unsafe { pat.write(PAT_VALUE) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_msrs_are_the_eleven_architectural_ones() {
        assert_eq!(FIXED_MSRS[3], 0x268);
        assert_eq!(FIXED_MSRS[FIXED_RANGE_MSRS - 1], 0x26f);
        assert!(FIXED_MSRS.windows(2).all(|w| w[0] < w[1]));
    }
}
