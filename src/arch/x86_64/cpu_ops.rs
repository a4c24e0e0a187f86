use libkernel::CpuOps;
use x86_64::{
    instructions::{hlt, interrupts},
    registers::{
        model_specific::Msr,
        rflags::{self, RFlags},
    },
};

use super::X86_64;

/// Holds the logical CPU id, written once during CPU bring-up.
const IA32_TSC_AUX: u32 = 0xC000_0103;

impl CpuOps for X86_64 {
    #[inline(always)]
    fn id() -> usize {
        // SAFETY: TSC_AUX exists on every CPU with RDTSCP, which we require.
        unsafe { Msr::new(IA32_TSC_AUX).read() as usize }
    }

    fn halt() -> ! {
        loop {
            hlt();
        }
    }

    #[inline(always)]
    fn enable_interrupts() {
        interrupts::enable();
    }

    #[inline(always)]
    fn disable_interrupts() -> usize {
        let flags = rflags::read_raw();
        interrupts::disable();
        flags as usize
    }

    #[inline(always)]
    fn restore_interrupt_state(flags: usize) {
        if RFlags::from_bits_truncate(flags as u64).contains(RFlags::INTERRUPT_FLAG) {
            interrupts::enable();
        }
    }
}

/// Records `id` as the calling CPU's logical id.
///
/// # Safety
///
/// Must be called once per CPU during bring-up, with a unique id below
/// `MAX_CPUS`.
pub unsafe fn set_cpu_id(id: usize) {
    let mut aux = Msr::new(IA32_TSC_AUX);
    unsafe { aux.write(id as u64) };
}
