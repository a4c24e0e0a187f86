use core::arch::asm;

use libkernel::{
    arch::x86_64::memory::GuestFormat,
    space::tlb::TlbFlush,
    sync::CpuSet,
};
use x86_64::instructions::tlb;

/// CPUs that owe an ASID flush on their next VMRUN.
static NPT_FLUSH_PENDING: CpuSet = CpuSet::new();

/// INVEPT type 2: all EPT contexts.
const INVEPT_GLOBAL: u64 = 2;

fn invept_global() {
    let descriptor = [0u64; 2];

    // SAFETY: VMX is enabled on every CPU before any guest table exists,
    // and a global INVEPT ignores the descriptor contents.
    unsafe {
        asm!(
            "invept {ty}, [{desc}]",
            ty = in(reg) INVEPT_GLOBAL,
            desc = in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Local TLB maintenance on the calling CPU.
pub struct X86Tlb {
    pub cpu: usize,
    pub guest: GuestFormat,
}

impl TlbFlush for X86Tlb {
    fn flush_host(&self) {
        tlb::flush_all();
    }

    fn flush_guest(&self) {
        match self.guest {
            GuestFormat::Extended => invept_global(),
            // SVM has no instruction for this; the next VMRUN flushes the
            // guest ASID instead.
            GuestFormat::Nested => {
                NPT_FLUSH_PENDING.set(self.cpu);
            }
        }
    }
}

/// Whether the next VMRUN on `cpu` must flush the guest's ASID. Clears the
/// request.
pub fn take_npt_flush(cpu: usize) -> bool {
    NPT_FLUSH_PENDING.test_and_clear(cpu)
}
