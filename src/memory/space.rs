//! The kernel's own memory space and the boot host table.

use libkernel::{
    arch::x86_64::{
        memory::{HostTable, PagingConfig},
        mtrr::MemoryTypeMap,
    },
    error::{KernelError, Result},
    memory::{
        address::{PA, VA},
        attr::MemRights,
        pg_tables::PageTable,
    },
    space::{MemorySpace, SpaceConfig},
};
use log::info;
use spin::Once;

use super::static_alloc::{StaticTableMemory, StaticTables};
use crate::iommu::DMAR;

pub type KernelSpace = MemorySpace<StaticTableMemory>;

static BOOT_POOL: Once<StaticTables> = Once::new();
static BOOT_HPT: Once<HostTable<StaticTableMemory>> = Once::new();
static KERNEL_SPACE: Once<KernelSpace> = Once::new();

fn boot_memory(phys_offset: usize) -> Result<StaticTableMemory> {
    let pool = BOOT_POOL.try_call_once(|| StaticTables::boot(phys_offset))?;
    Ok(StaticTableMemory::new(pool))
}

/// Creates the kernel space and the boot host table, and seeds the kernel
/// space with identity mappings of all physical frames below `end_pfn`.
pub fn init_kernel_space(
    paging: &PagingConfig,
    phys_offset: usize,
    types: &impl MemoryTypeMap,
    end_pfn: u64,
) -> Result<&'static KernelSpace> {
    let memory = boot_memory(phys_offset)?;

    BOOT_HPT.try_call_once(|| PageTable::new(paging.host_format(), memory))?;

    let space = KERNEL_SPACE
        .try_call_once(|| MemorySpace::new(paging, SpaceConfig::host_only(), memory, &DMAR))?;

    space.insert_root(types, 0, end_pfn, MemRights::all())?;
    info!("kernel space: {end_pfn:#x} frames mapped");

    Ok(space)
}

pub fn kernel_space() -> Option<&'static KernelSpace> {
    KERNEL_SPACE.get()
}

pub fn boot_hpt() -> Option<&'static HostTable<StaticTableMemory>> {
    BOOT_HPT.get()
}

/// Makes a device register page reachable through the boot table. An
/// exclusive claim also withdraws it from the kernel space, so it can never
/// be delegated.
pub fn claim_mmio_page(virt: VA, phys: PA, exclusive: bool) -> Result<()> {
    let (Some(space), Some(boot)) = (kernel_space(), boot_hpt()) else {
        return Err(KernelError::Other("kernel space not initialised"));
    };

    space.claim_mmio_page(boot, virt, phys, exclusive)
}
