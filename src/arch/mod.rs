#[cfg(any(target_arch = "x86_64", doc))]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{X86_64 as ArchImpl, cpu_ops, detect_paging, lapic, msr, tlb};
