use core::arch::x86_64::__cpuid;

use libkernel::arch::x86_64::memory::{GuestFormat, PagingConfig};
use log::info;

pub mod cpu_ops;
pub mod lapic;
pub mod msr;
pub mod tlb;

/// x86-64 architecture provider.
pub struct X86_64;

const CPUID_EXT_FEATURES: u32 = 0x8000_0001;
const EXT_EDX_PDPE1GB: u32 = 1 << 26;
const EXT_ECX_SVM: u32 = 1 << 2;

/// Probes the CPU for the paging features the translation tables may use.
///
/// The device side is filled in later from the IOMMU capabilities.
pub fn detect_paging() -> PagingConfig {
    // SAFETY: CPUID is available on every x86-64 CPU.
    let ext = unsafe { __cpuid(CPUID_EXT_FEATURES) };

    let guest = if ext.ecx & EXT_ECX_SVM != 0 {
        GuestFormat::Nested
    } else {
        GuestFormat::Extended
    };

    let config = PagingConfig {
        guest,
        huge_pages: ext.edx & EXT_EDX_PDPE1GB != 0,
        ..PagingConfig::default()
    };

    info!("paging: guest {:?}, 1G pages {}", config.guest, config.huge_pages);
    config
}
