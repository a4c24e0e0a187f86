#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
pub mod memory;
#[cfg(feature = "arch-x86_64")]
pub mod space;
pub mod sync;


/// Per-CPU primitives the memory-space core needs from the architecture.
pub trait CpuOps: 'static {
    /// Returns the logical id of the calling CPU.
    fn id() -> usize;

    /// Halts the CPU indefinitely.
    fn halt() -> !;

    /// Disables interrupts on the calling CPU and returns the previous state.
    fn disable_interrupts() -> usize;

    /// Restores the interrupt state returned by `disable_interrupts`.
    fn restore_interrupt_state(flags: usize);

    /// Unconditionally enables interrupts on the calling CPU.
    fn enable_interrupts();
}
