//! Per-CPU state behind the TLB shootdown protocol.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use libkernel::{
    CpuOps,
    memory::pg_tables::PageTableMemory,
    space::{
        MemorySpace, ShootdownCounters, TlbShootdownOps, TlbTracker,
        tlb::{TlbFlush, flush_stale, service_flush_request},
    },
    sync::{CpuSet, MAX_CPUS},
};
use log::{info, trace};

use crate::arch::{ArchImpl, lapic};

pub struct KernelSmp {
    online: CpuSet,
    apic_ids: [AtomicU32; MAX_CPUS],
    /// Tracker of the domain each CPU is running.
    active: [AtomicPtr<TlbTracker>; MAX_CPUS],
    counters: ShootdownCounters,
    /// CPUs that must flush stale translations before returning to a
    /// domain.
    flush_hazard: CpuSet,
}

impl KernelSmp {
    pub const fn new() -> Self {
        Self {
            online: CpuSet::new(),
            apic_ids: [const { AtomicU32::new(0) }; MAX_CPUS],
            active: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS],
            counters: ShootdownCounters::new(),
            flush_hazard: CpuSet::new(),
        }
    }

    /// Marks `cpu` online and reachable at `apic_id`.
    pub fn cpu_online(&self, cpu: usize, apic_id: u32) {
        self.apic_ids[cpu].store(apic_id, Ordering::Relaxed);
        self.online.set(cpu);
        info!("CPU {cpu} online (APIC {apic_id})");
    }

    /// Records that `cpu` now runs the domain owning `tracker`, and joins
    /// it to the domain's CPU set.
    ///
    /// # Safety
    ///
    /// `tracker` must stay alive until another tracker is activated on
    /// `cpu`.
    pub unsafe fn activate(&self, cpu: usize, tracker: &TlbTracker) {
        tracker.init(cpu);
        self.active[cpu].store(ptr::from_ref(tracker).cast_mut(), Ordering::Release);
    }

    /// Consumes a pending local flush request for `cpu`.
    pub fn take_flush_hazard(&self, cpu: usize) -> bool {
        self.flush_hazard.test_and_clear(cpu)
    }
}

impl Default for KernelSmp {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbShootdownOps for KernelSmp {
    fn num_cpus(&self) -> usize {
        MAX_CPUS
    }

    fn is_online(&self, cpu: usize) -> bool {
        self.online.contains(cpu)
    }

    fn active_tracker(&self, cpu: usize) -> Option<&TlbTracker> {
        let tracker = NonNull::new(self.active[cpu].load(Ordering::Acquire))?;
        // SAFETY: `activate` requires the tracker to outlive its time as
        // the active one.
        Some(unsafe { tracker.as_ref() })
    }

    fn ack_count(&self, cpu: usize) -> u32 {
        self.counters.count(cpu)
    }

    fn send_flush_ipi(&self, cpu: usize) {
        lapic::send_ipi(self.apic_ids[cpu].load(Ordering::Relaxed), lapic::VEC_IPI_RKE);
    }

    fn defer_local_flush(&self, cpu: usize) {
        self.flush_hazard.set(cpu);
    }
}

pub static SMP: KernelSmp = KernelSmp::new();

/// Switches the calling CPU to `space` and drops anything it left stale
/// here since this CPU last ran it.
///
/// # Safety
///
/// As for [`KernelSmp::activate`].
pub unsafe fn make_current<M: PageTableMemory>(space: &MemorySpace<M>, flush: &impl TlbFlush) {
    let cpu = ArchImpl::id();

    unsafe { SMP.activate(cpu, space.tlb()) };
    let stale = flush_stale(space.tlb(), cpu, flush);
    trace!("CPU {cpu} switched space, flushed {stale:?}");
}

/// Vector `VEC_IPI_RKE` handler.
pub fn handle_flush_ipi(flush: &impl TlbFlush) {
    let cpu = ArchImpl::id();

    service_flush_request(SMP.active_tracker(cpu), &SMP.counters, cpu, flush);
    lapic::eoi();
}

/// Run before returning to a domain: performs a flush deferred by a
/// shootdown this CPU issued itself.
pub fn check_flush_hazard(flush: &impl TlbFlush) {
    let cpu = ArchImpl::id();

    if SMP.take_flush_hazard(cpu)
        && let Some(tracker) = SMP.active_tracker(cpu)
    {
        flush_stale(tracker, cpu, flush);
    }
}

/// Pushes the stale-TLB state accumulated by earlier delegations out to
/// every CPU.
pub fn shootdown<M: PageTableMemory>(space: &MemorySpace<M>) {
    space.shootdown::<ArchImpl>(&SMP);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFlush {
        host: AtomicUsize,
        guest: AtomicUsize,
    }

    impl TlbFlush for CountingFlush {
        fn flush_host(&self) {
            self.host.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_guest(&self) {
            self.guest.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn active_tracker_follows_activation() {
        let smp = KernelSmp::new();
        let a = TlbTracker::new();
        let b = TlbTracker::new();

        assert!(smp.active_tracker(2).is_none());

        unsafe { smp.activate(2, &a) };
        assert!(ptr::eq(smp.active_tracker(2).unwrap(), &a));
        assert!(a.cpus().contains(2));

        unsafe { smp.activate(2, &b) };
        assert!(ptr::eq(smp.active_tracker(2).unwrap(), &b));
        // The old domain keeps the CPU in its set; it may still hold
        // translations from it.
        assert!(a.cpus().contains(2));
    }

    #[test]
    fn flush_request_acknowledges_and_clears_stale_state() {
        let smp = KernelSmp::new();
        let tracker = TlbTracker::new();
        let flush = CountingFlush::default();

        unsafe { smp.activate(1, &tracker) };
        tracker.mark_host_stale();

        let before = smp.ack_count(1);
        service_flush_request(smp.active_tracker(1), &smp.counters, 1, &flush);

        assert_eq!(smp.ack_count(1), before + 1);
        assert_eq!(flush.host.load(Ordering::SeqCst), 1);
        assert_eq!(flush.guest.load(Ordering::SeqCst), 0);
        assert!(!tracker.is_stale(1));
    }

    #[test]
    fn local_deferral_sets_a_one_shot_hazard() {
        let smp = KernelSmp::new();

        smp.defer_local_flush(4);
        assert!(smp.take_flush_hazard(4));
        assert!(!smp.take_flush_hazard(4));
    }

    #[test]
    fn only_online_cpus_are_reported() {
        let smp = KernelSmp::new();
        smp.cpu_online(0, 0);
        smp.cpu_online(3, 6);

        assert!(smp.is_online(3));
        assert!(!smp.is_online(1));
        assert_eq!(smp.apic_ids[3].load(Ordering::Relaxed), 6);
    }
}
