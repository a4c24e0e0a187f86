//! Early-boot population of the kernel's host table.
//!
//! These run on the bootstrap CPU before any other CPU has loaded the
//! tables they write, so no ticket is returned and unlinked tables are
//! freed on the spot.

use log::{debug, error};

use super::MemorySpace;
use crate::{
    arch::x86_64::{
        memory::HostTable,
        mtrr::MemoryTypeMap,
    },
    error::{KernelError, Result},
    memory::{
        PAGE_SHIFT,
        address::{PA, VA},
        attr::{Attributes, MemRights, MemoryType},
        cleanup::TlbCleanup,
        mapping::Mapping,
        max_order,
        pg_tables::PageTableMemory,
    },
};

/// Writes `mapping` into `table` and frees whatever it unlinked.
fn update_now<M: PageTableMemory>(table: &HostTable<M>, mapping: Mapping) -> Result<()> {
    let mut cleanup = TlbCleanup::new();
    let result = table.update(mapping, &mut cleanup);

    // SAFETY: nothing but the bootstrap CPU has used these tables yet.
    unsafe { table.reclaim(cleanup.ignore_tlb_flush()) };

    result.map(|_| ())
}

/// Identity-maps `[start, end)` with `attr` in the largest blocks the table
/// supports.
fn map_typed_range<M: PageTableMemory>(
    hpt: &HostTable<M>,
    start: usize,
    end: usize,
    attr: Attributes,
) -> Result<()> {
    let mut cur = start;

    while cur < end {
        let order = core::cmp::min(hpt.max_order(), max_order(cur, end - cur));
        if order < PAGE_SHIFT {
            return Err(KernelError::InvalidValue);
        }

        update_now(
            hpt,
            Mapping::new(VA::from_value(cur), PA::from_value(cur), attr, order),
        )?;

        cur += 1 << order;
    }

    Ok(())
}

impl<M: PageTableMemory> MemorySpace<M> {
    fn boot_hpt(&self) -> Result<&HostTable<M>> {
        self.hpt.as_ref().ok_or(KernelError::NotSupported)
    }

    /// Identity-maps the page frames `[start_pfn, end_pfn)` with `rights`,
    /// giving every range the memory type firmware assigned to it.
    pub fn insert_root(
        &self,
        types: &impl MemoryTypeMap,
        start_pfn: u64,
        end_pfn: u64,
        rights: MemRights,
    ) -> Result<()> {
        let hpt = self.boot_hpt()?;
        let attr = Attributes::from_rights(rights);

        let start = (start_pfn << PAGE_SHIFT) as usize;
        let end = (end_pfn << PAGE_SHIFT) as usize;
        let mut cur = start;

        while cur < end {
            let (mt, next) = types.memtype(cur as u64);
            let next = next as usize;

            if next <= cur {
                error!("Memory type map did not advance at {cur:#x}");
                return Err(KernelError::InvalidValue);
            }

            let range_end = core::cmp::min(next, end);
            debug!("root map {cur:#x}..{range_end:#x} as {mt:?}");
            map_typed_range(hpt, cur, range_end, attr.with_memory_type(mt))?;

            cur = next;
        }

        Ok(())
    }

    /// Maps `2^order` bytes at `virt` to `phys` in the boot table. An
    /// exclusive claim also removes the range from this space.
    pub fn claim(
        &self,
        boot: &HostTable<M>,
        virt: VA,
        order: usize,
        attr: Attributes,
        phys: PA,
        exclusive: bool,
    ) -> Result<()> {
        let hpt = self.boot_hpt()?;
        debug_assert!(!core::ptr::eq(boot, hpt));

        update_now(boot, Mapping::new(virt, phys, attr, order))?;

        if exclusive {
            update_now(hpt, Mapping::absent(virt, order))?;
        }

        Ok(())
    }

    /// Claims one uncached, non-executable kernel page of device registers.
    pub fn claim_mmio_page(&self, boot: &HostTable<M>, virt: VA, phys: PA, exclusive: bool) -> Result<()> {
        let attr = (Attributes::PRESENT | Attributes::WRITE | Attributes::GLOBAL | Attributes::NX)
            .with_memory_type(MemoryType::Uncacheable);

        self.claim(boot, virt, PAGE_SHIFT, attr, phys, exclusive)
    }
}
