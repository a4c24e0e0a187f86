//! Local APIC access in x2APIC mode.

use bitflags::bitflags;
use x86_64::registers::model_specific::Msr;

const IA32_X2APIC_EOI: u32 = 0x80b;
const IA32_X2APIC_ICR: u32 = 0x830;

bitflags! {
    /// ICR control bits. Fixed delivery, physical destination and edge
    /// trigger are the all-zero encodings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct IcrFlags: u64 {
        const LEVEL_ASSERT = 1 << 14;
    }
}

/// Remote kernel entry: asks a CPU to flush stale translations.
pub const VEC_IPI_RKE: u8 = 0xfd;

/// Composes the ICR value for a fixed IPI.
pub const fn icr_value(apic_id: u32, vector: u8) -> u64 {
    (apic_id as u64) << 32 | IcrFlags::LEVEL_ASSERT.bits() | vector as u64
}

pub fn send_ipi(apic_id: u32, vector: u8) {
    let mut icr = Msr::new(IA32_X2APIC_ICR);
    // SAFETY: the kernel runs with x2APIC enabled. A fixed IPI has no side
    // effects beyond interrupting the target.
    unsafe { icr.write(icr_value(apic_id, vector)) };
}

pub fn eoi() {
    let mut eoi = Msr::new(IA32_X2APIC_EOI);
    // SAFETY: as for `send_ipi`.
    unsafe { eoi.write(0) };
}
