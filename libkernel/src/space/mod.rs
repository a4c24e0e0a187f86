//! Per-domain memory spaces: delegation and revocation of mappings across
//! the host, guest and device translation tables of a protection domain.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{error, warn};

use crate::{
    CpuOps,
    arch::x86_64::memory::{DeviceTable, GuestTable, HostTable, PagingConfig},
    error::Result,
    memory::{
        PAGE_SHIFT, USER_ADDR,
        address::VA,
        attr::{Attributes, MemRights},
        cleanup::TlbCleanup,
        mapping::Mapping,
        max_order,
        pg_tables::{PageTable, PageTableMemory},
    },
};

pub mod boot;
pub mod tlb;

pub use tlb::{ShootdownCounters, TlbShootdownOps, TlbTracker};

bitflags! {
    /// Translation tables a delegation writes into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Subspace: u8 {
        const DEVICE = 1 << 0;
        const GUEST  = 1 << 1;
        const HOST   = 1 << 2;
    }
}

/// Invalidation of IOMMU translation caches.
pub trait IommuContexts: Sync {
    /// Drops every cached context and IOTLB entry on all units.
    fn flush_all_contexts(&self);
}

/// Which tables a new memory space owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceConfig {
    pub host: bool,
    pub guest: bool,
    pub device: bool,
}

impl SpaceConfig {
    /// A regular user domain: host table only.
    pub const fn host_only() -> Self {
        Self {
            host: true,
            guest: false,
            device: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            host: true,
            guest: true,
            device: true,
        }
    }
}

/// Last domain id handed out. Id 0 is never issued.
static DID_CTR: AtomicU32 = AtomicU32::new(0);

fn next_domain_id() -> u32 {
    DID_CTR.fetch_add(1, Ordering::Relaxed) + 1
}

/// `base` starts a user region of `2^order` bytes: below the canonical
/// boundary and naturally aligned.
fn is_valid_user_mapping(base: VA, order: usize) -> bool {
    base.value() < USER_ADDR
        && order >= PAGE_SHIFT
        && order <= max_order(base.value(), USER_ADDR)
        && base.is_aligned(order)
}

/// The translation tables of one protection domain.
pub struct MemorySpace<M: PageTableMemory> {
    hpt: Option<HostTable<M>>,
    guest: Option<GuestTable<M>>,
    dpt: Option<DeviceTable<M>>,
    tlb: TlbTracker,
    iommu: &'static dyn IommuContexts,
    memory: M,
    did: Option<u32>,
}

impl<M: PageTableMemory> MemorySpace<M> {
    pub fn new(
        paging: &PagingConfig,
        config: SpaceConfig,
        memory: M,
        iommu: &'static dyn IommuContexts,
    ) -> Result<Self> {
        let hpt = if config.host {
            Some(PageTable::new(paging.host_format(), memory.clone())?)
        } else {
            None
        };

        let guest = if config.guest {
            Some(paging.new_guest_table(memory.clone())?)
        } else {
            None
        };

        let dpt = if config.device {
            Some(PageTable::new(paging.device_format(), memory.clone())?)
        } else {
            None
        };

        let did = dpt.as_ref().map(|_| next_domain_id());

        Ok(Self {
            hpt,
            guest,
            dpt,
            tlb: TlbTracker::new(),
            iommu,
            memory,
            did,
        })
    }

    /// Id tagging this space's IOMMU context entries, if it has a device
    /// table.
    pub fn domain_id(&self) -> Option<u32> {
        self.did
    }

    pub fn host_table(&self) -> Option<&HostTable<M>> {
        self.hpt.as_ref()
    }

    pub fn guest_table(&self) -> Option<&GuestTable<M>> {
        self.guest.as_ref()
    }

    pub fn device_table(&self) -> Option<&DeviceTable<M>> {
        self.dpt.as_ref()
    }

    pub fn tlb(&self) -> &TlbTracker {
        &self.tlb
    }

    /// Records that this space has been made current on `cpu`.
    pub fn init(&self, cpu: usize) {
        self.tlb.init(cpu);
    }

    /// The mapping to copy out of this space at `cur`, narrowed to
    /// `requested`.
    fn lookup_and_adjust_rights(&self, cur: VA, end: usize, requested: Attributes) -> Mapping {
        let empty = Mapping::absent(cur, max_order(cur.value(), end - cur.value()));

        let mut mapping = match &self.hpt {
            Some(hpt) if requested.is_present() => hpt.lookup(cur),
            _ => empty,
        };

        if mapping.present()
            && (mapping.attr.contains(Attributes::NODELEG) || !mapping.attr.contains(Attributes::USER))
        {
            error!(
                "Refusing to map region {} order {}",
                mapping.vaddr, mapping.order
            );
            mapping = Mapping::absent(mapping.vaddr, mapping.order);
        }

        mapping.attr = mapping.attr.merge(requested);
        mapping
    }

    /// Copies `[snd_base, snd_base + 2^order)` of `snd` to `rcv_base` in
    /// this space, granting at most `rights`, in each table named by `sub`.
    ///
    /// Empty `rights` tear the receive window down instead. A malformed
    /// window is logged and ignored. Failures of individual tables are
    /// logged and skip that table for the affected granule. The returned
    /// ticket tells the caller which flushes are still owed; stale CPUs
    /// have already been marked.
    pub fn delegate(
        &self,
        snd: &MemorySpace<M>,
        snd_base: VA,
        rcv_base: VA,
        order: usize,
        rights: MemRights,
        sub: Subspace,
    ) -> TlbCleanup {
        let mut cleanup = TlbCleanup::new();

        if !is_valid_user_mapping(snd_base, order) || !is_valid_user_mapping(rcv_base, order) {
            error!(
                "INVALID MEM SB:{snd_base} RB:{rcv_base} O:{order:#x} R:{rights:?} S:{sub:?}"
            );
            return cleanup;
        }

        let requested = Attributes::from_rights(rights);
        let snd_end = snd_base.value() + (1 << order);
        let delta = rcv_base.value().wrapping_sub(snd_base.value());

        let mut cur = snd_base.value();
        while cur < snd_end {
            let mapping = snd.lookup_and_adjust_rights(VA::from_value(cur), snd_end, requested);
            let clamped = mapping.clamp(snd_base, order);
            let target = clamped.move_by(delta);

            debug_assert!(target.attr.cache_bits().is_empty());

            if sub.contains(Subspace::DEVICE) {
                if let Some(dpt) = &self.dpt {
                    // The IOMMU may cache non-present entries too, so any
                    // change is pushed out regardless of what was replaced.
                    if apply("device", dpt.update(target, &mut cleanup), &target) {
                        cleanup.flush_device_later();
                    }
                }
            }

            if sub.contains(Subspace::GUEST) {
                if let Some(guest) = &self.guest {
                    apply("guest", guest.update(target, &mut cleanup), &target);
                }
            }

            if sub.contains(Subspace::HOST) {
                if let Some(hpt) = &self.hpt {
                    apply("host", hpt.update(target, &mut cleanup), &target);
                }
            }

            cur = clamped.vaddr.value() + target.size();
        }

        if cleanup.need_tlb_flush() {
            if sub.contains(Subspace::DEVICE) && self.dpt.is_some() {
                self.iommu.flush_all_contexts();
            }

            if sub.contains(Subspace::GUEST) && self.guest.is_some() {
                self.tlb.mark_guest_stale();
            }

            if sub.contains(Subspace::HOST) && self.hpt.is_some() {
                self.tlb.mark_host_stale();
            }
        }

        cleanup
    }

    /// Removes every mapping in `[vaddr, vaddr + 2^order)` from all tables.
    ///
    /// Only full revocation exists; asking for less than all rights is
    /// logged and the whole region is removed anyway.
    pub fn revoke(&self, vaddr: VA, order: usize, rights: MemRights) -> TlbCleanup {
        if rights != MemRights::all() {
            warn!(
                "Partial memory rights revocation is not supported: revoking everything ({vaddr} {order} {rights:?})"
            );
        }

        self.delegate(self, vaddr, vaddr, order, MemRights::empty(), Subspace::all())
    }

    /// Flushes stale translations of the domains active on other CPUs. See
    /// [`tlb::shootdown`].
    pub fn shootdown<C: CpuOps>(&self, smp: &impl TlbShootdownOps) {
        tlb::shootdown::<C>(smp);
    }

    /// Frees the table frames a ticket retired.
    ///
    /// # Safety
    ///
    /// The shootdown for `ticket` must have completed, and the IOMMU must
    /// have been flushed if the ticket asked for it.
    pub unsafe fn release(&self, mut ticket: TlbCleanup) {
        for table in ticket.take_retired() {
            // SAFETY: forwarded from the caller.
            unsafe { self.memory.free_table(table) };
        }
    }
}

/// Logs a failed table update. Returns whether the table changed.
fn apply(kind: &str, result: Result<bool>, target: &Mapping) -> bool {
    match result {
        Ok(touched) => touched,
        Err(e) => {
            error!(
                "{kind} table update failed for {} order {}: {e}",
                target.vaddr, target.order
            );
            false
        }
    }
}
