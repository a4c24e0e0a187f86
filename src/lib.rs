//! x86-64 glue around the memory-space core in `libkernel`: CPU
//! primitives, the flush IPI, VT-d invalidation and the boot-time kernel
//! space.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(feature = "arch-x86_64")]
pub mod arch;
#[cfg(feature = "arch-x86_64")]
pub mod iommu;
#[cfg(feature = "arch-x86_64")]
pub mod memory;
#[cfg(feature = "arch-x86_64")]
pub mod smp;
