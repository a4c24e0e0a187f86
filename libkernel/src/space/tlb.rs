//! Cross-CPU TLB coherence.
//!
//! A domain remembers on which CPUs it has run. When one of its host or
//! guest tables loses a translation, those CPUs are marked stale. A stale
//! CPU flushes either when it next switches to the domain or when it
//! receives a shootdown IPI; only the CPU itself clears its stale bit.

use core::hint::spin_loop;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace};

use crate::{
    CpuOps,
    sync::{CpuSet, MAX_CPUS},
};

/// Which of a CPU's translation caches must be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaleTlb {
    pub host: bool,
    pub guest: bool,
}

impl StaleTlb {
    pub fn any(&self) -> bool {
        self.host || self.guest
    }
}

/// Per-domain stale TLB state.
#[derive(Debug, Default)]
pub struct TlbTracker {
    cpus: CpuSet,
    stale_host: CpuSet,
    stale_guest: CpuSet,
}

impl TlbTracker {
    pub const fn new() -> Self {
        Self {
            cpus: CpuSet::new(),
            stale_host: CpuSet::new(),
            stale_guest: CpuSet::new(),
        }
    }

    /// Records that the domain has been active on `cpu`.
    pub fn init(&self, cpu: usize) {
        self.cpus.set(cpu);
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    pub fn mark_host_stale(&self) {
        self.stale_host.merge(&self.cpus);
    }

    pub fn mark_guest_stale(&self) {
        self.stale_guest.merge(&self.cpus);
    }

    pub fn is_stale(&self, cpu: usize) -> bool {
        self.stale_host.contains(cpu) || self.stale_guest.contains(cpu)
    }

    pub fn stale(&self, cpu: usize) -> StaleTlb {
        StaleTlb {
            host: self.stale_host.contains(cpu),
            guest: self.stale_guest.contains(cpu),
        }
    }

    /// Clears and returns the stale state of `cpu`. Must run on `cpu`.
    pub fn take_stale(&self, cpu: usize) -> StaleTlb {
        StaleTlb {
            host: self.stale_host.test_and_clear(cpu),
            guest: self.stale_guest.test_and_clear(cpu),
        }
    }
}

/// Per-CPU count of serviced shootdown requests.
///
/// Each counter is only advanced by its own CPU; senders spin until the
/// value they sampled before sending the IPI changes.
pub struct ShootdownCounters {
    counts: [AtomicU32; MAX_CPUS],
}

impl ShootdownCounters {
    pub const fn new() -> Self {
        Self {
            counts: [const { AtomicU32::new(0) }; MAX_CPUS],
        }
    }

    pub fn count(&self, cpu: usize) -> u32 {
        self.counts[cpu].load(Ordering::Acquire)
    }

    pub fn acknowledge(&self, cpu: usize) {
        self.counts[cpu].fetch_add(1, Ordering::Release);
    }
}

impl Default for ShootdownCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Local TLB maintenance instructions.
pub trait TlbFlush {
    /// Drops host translations of the current domain.
    fn flush_host(&self);

    /// Drops guest-physical (EPT/NPT) translations.
    fn flush_guest(&self);
}

/// What the shootdown protocol needs from the SMP layer.
pub trait TlbShootdownOps {
    fn num_cpus(&self) -> usize;

    fn is_online(&self, cpu: usize) -> bool;

    /// Tracker of the domain currently active on `cpu`.
    fn active_tracker(&self, cpu: usize) -> Option<&TlbTracker>;

    fn ack_count(&self, cpu: usize) -> u32;

    /// Sends the flush IPI to `cpu`.
    fn send_flush_ipi(&self, cpu: usize);

    /// Arranges for the calling CPU (`cpu`) to flush at its next reschedule.
    fn defer_local_flush(&self, cpu: usize);
}

/// Interrupts enabled for the lifetime of the guard, restored on drop.
struct IrqWindow<C: CpuOps> {
    flags: usize,
    _cpu: PhantomData<C>,
}

impl<C: CpuOps> IrqWindow<C> {
    fn open() -> Self {
        let flags = C::disable_interrupts();
        C::enable_interrupts();

        Self {
            flags,
            _cpu: PhantomData,
        }
    }
}

impl<C: CpuOps> Drop for IrqWindow<C> {
    fn drop(&mut self) {
        C::disable_interrupts();
        C::restore_interrupt_state(self.flags);
    }
}

/// Makes every online CPU drop stale translations of the domain it is
/// currently running.
///
/// CPUs are visited in id order and each remote one is fully waited for
/// before the next. The calling CPU only defers its own flush. Interrupts
/// are enabled while waiting so that a CPU shooting down at us in turn can
/// make progress. There is no timeout.
pub fn shootdown<C: CpuOps>(ops: &impl TlbShootdownOps) {
    let me = C::id();

    for cpu in 0..ops.num_cpus().min(MAX_CPUS) {
        if !ops.is_online(cpu) {
            continue;
        }

        let Some(tracker) = ops.active_tracker(cpu) else {
            continue;
        };

        if !tracker.is_stale(cpu) {
            continue;
        }

        if cpu == me {
            trace!("TLB shootdown: deferring local flush on CPU {cpu}");
            ops.defer_local_flush(cpu);
            continue;
        }

        let ctr = ops.ack_count(cpu);

        debug!("TLB shootdown: IPI to CPU {cpu}");
        ops.send_flush_ipi(cpu);

        let _irqs = IrqWindow::<C>::open();
        while ops.ack_count(cpu) == ctr {
            spin_loop();
        }
    }
}

/// Flushes whatever `tracker` has marked stale for the calling CPU.
pub fn flush_stale(tracker: &TlbTracker, cpu: usize, flush: &impl TlbFlush) -> StaleTlb {
    let stale = tracker.take_stale(cpu);

    if stale.host {
        flush.flush_host();
    }

    if stale.guest {
        flush.flush_guest();
    }

    stale
}

/// Body of the flush IPI handler: flush, then acknowledge.
///
/// The acknowledgment is sent even if nothing was stale, since the sender
/// is spinning on it.
pub fn service_flush_request(
    tracker: Option<&TlbTracker>,
    counters: &ShootdownCounters,
    cpu: usize,
    flush: &impl TlbFlush,
) {
    if let Some(tracker) = tracker {
        let stale = flush_stale(tracker, cpu, flush);
        trace!("CPU {cpu} serviced shootdown {stale:?}");
    }

    counters.acknowledge(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockCpu;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

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

    /// Two or more CPUs that all run the same domain.
    struct TestSmp<'a> {
        num_cpus: usize,
        online: CpuSet,
        active: &'a TlbTracker,
        counters: ShootdownCounters,
        mailbox: [AtomicBool; 4],
        ipis: Mutex<Vec<usize>>,
        deferred: Mutex<Vec<usize>>,
    }

    impl<'a> TestSmp<'a> {
        fn new(num_cpus: usize, active: &'a TlbTracker) -> Self {
            let online = CpuSet::new();
            for cpu in 0..num_cpus {
                online.set(cpu);
            }

            Self {
                num_cpus,
                online,
                active,
                counters: ShootdownCounters::new(),
                mailbox: Default::default(),
                ipis: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
            }
        }

        /// Plays `cpu`: waits for one IPI and services it.
        fn serve_one(&self, cpu: usize, flush: &CountingFlush) {
            MockCpu::set_id(cpu);
            while !self.mailbox[cpu].swap(false, Ordering::SeqCst) {
                spin_loop();
            }
            service_flush_request(Some(self.active), &self.counters, cpu, flush);
        }
    }

    impl TlbShootdownOps for TestSmp<'_> {
        fn num_cpus(&self) -> usize {
            self.num_cpus
        }

        fn is_online(&self, cpu: usize) -> bool {
            self.online.contains(cpu)
        }

        fn active_tracker(&self, _cpu: usize) -> Option<&TlbTracker> {
            Some(self.active)
        }

        fn ack_count(&self, cpu: usize) -> u32 {
            self.counters.count(cpu)
        }

        fn send_flush_ipi(&self, cpu: usize) {
            self.ipis.lock().unwrap().push(cpu);
            self.mailbox[cpu].store(true, Ordering::SeqCst);
        }

        fn defer_local_flush(&self, cpu: usize) {
            self.deferred.lock().unwrap().push(cpu);
        }
    }

    #[test]
    fn tracker_marks_only_cpus_that_ran_the_domain() {
        let t = TlbTracker::new();
        t.init(1);
        t.init(3);
        t.mark_host_stale();

        assert!(!t.is_stale(0));
        assert!(t.is_stale(1));
        assert_eq!(t.stale(3), StaleTlb { host: true, guest: false });

        assert_eq!(t.take_stale(1), StaleTlb { host: true, guest: false });
        assert!(!t.is_stale(1));
        // Another CPU's bit is untouched.
        assert!(t.is_stale(3));
    }

    #[test]
    fn shootdown_interrupts_only_the_stale_remote_cpu() {
        let tracker = TlbTracker::new();
        tracker.init(1);
        tracker.mark_guest_stale();

        let smp = TestSmp::new(2, &tracker);
        let flush = CountingFlush::default();

        MockCpu::set_id(0);
        MockCpu::set_irqs(false);

        thread::scope(|s| {
            s.spawn(|| smp.serve_one(1, &flush));
            shootdown::<MockCpu>(&smp);

            // Returning implies CPU 1 already acknowledged.
            assert_eq!(smp.counters.count(1), 1);
        });

        assert_eq!(*smp.ipis.lock().unwrap(), vec![1]);
        assert!(smp.deferred.lock().unwrap().is_empty());
        assert_eq!(smp.counters.count(0), 0);
        assert_eq!(flush.guest.load(Ordering::SeqCst), 1);
        assert_eq!(flush.host.load(Ordering::SeqCst), 0);
        assert!(!tracker.is_stale(1));

        // Interrupts were opened for the wait and closed again.
        assert!(MockCpu::irq_enables() >= 1);
        assert!(!MockCpu::irqs_enabled());
    }

    #[test]
    fn shootdown_defers_the_local_cpu() {
        let tracker = TlbTracker::new();
        tracker.init(0);
        tracker.mark_host_stale();

        let smp = TestSmp::new(2, &tracker);
        MockCpu::set_id(0);

        shootdown::<MockCpu>(&smp);

        assert!(smp.ipis.lock().unwrap().is_empty());
        assert_eq!(*smp.deferred.lock().unwrap(), vec![0]);
        // The bit stays set until CPU 0 reschedules and flushes.
        assert!(tracker.is_stale(0));
    }

    #[test]
    fn shootdown_skips_offline_and_clean_cpus() {
        let tracker = TlbTracker::new();
        tracker.init(2);
        tracker.mark_host_stale();

        let smp = TestSmp::new(3, &tracker);
        smp.online.test_and_clear(2);
        MockCpu::set_id(0);

        shootdown::<MockCpu>(&smp);

        assert!(smp.ipis.lock().unwrap().is_empty());
        assert!(smp.deferred.lock().unwrap().is_empty());
    }

    #[test]
    fn shootdown_preserves_enabled_interrupts() {
        let tracker = TlbTracker::new();
        tracker.init(2);
        tracker.mark_host_stale();

        let smp = TestSmp::new(3, &tracker);
        let flush = CountingFlush::default();

        MockCpu::set_id(0);
        MockCpu::set_irqs(true);

        thread::scope(|s| {
            s.spawn(|| smp.serve_one(2, &flush));
            shootdown::<MockCpu>(&smp);
        });

        assert_eq!(*smp.ipis.lock().unwrap(), vec![2]);
        assert_eq!(flush.host.load(Ordering::SeqCst), 1);
        assert!(MockCpu::irqs_enabled());
    }

    #[test]
    fn handler_acknowledges_without_a_domain() {
        let counters = ShootdownCounters::new();
        let flush = CountingFlush::default();

        service_flush_request(None, &counters, 5, &flush);

        assert_eq!(counters.count(5), 1);
        assert_eq!(flush.host.load(Ordering::SeqCst), 0);
    }
}
