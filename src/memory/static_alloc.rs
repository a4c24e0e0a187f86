//! Bump allocator for translation tables carved out of the kernel image.
//!
//! Tables handed out here are never returned: the kernel's own tables live
//! as long as the kernel, and the pool is too small to be worth recycling.

use core::sync::atomic::{AtomicUsize, Ordering};

use libkernel::{
    error::{KernelError, Result},
    memory::{
        PAGE_SIZE,
        address::{PA, VA},
        pg_tables::{DESCRIPTORS_PER_TABLE, PageTableMemory},
    },
};
use log::{debug, error};
use static_cell::ConstStaticCell;

/// Tables reserved for the kernel's boot-time spaces.
pub const BOOT_TABLES: usize = 512;

#[repr(C, align(4096))]
pub struct TableFrame([u64; DESCRIPTORS_PER_TABLE]);

static POOL: ConstStaticCell<[TableFrame; BOOT_TABLES]> =
    ConstStaticCell::new([const { TableFrame([0; DESCRIPTORS_PER_TABLE]) }; BOOT_TABLES]);

/// A contiguous run of zeroed, page-aligned table frames.
pub struct StaticTables {
    base: VA,
    count: usize,
    next: AtomicUsize,
    /// Kernel virtual minus physical address of the pool.
    phys_offset: usize,
}

impl StaticTables {
    /// Takes the boot pool. Fails if it has been taken before.
    pub fn boot(phys_offset: usize) -> Result<Self> {
        let pool = POOL.try_take().ok_or(KernelError::Other("boot table pool already taken"))?;

        // SAFETY: the pool is exclusively ours from here on.
        Ok(unsafe { Self::new(VA::from_value(pool.as_mut_ptr() as usize), BOOT_TABLES, phys_offset) })
    }

    /// # Safety
    ///
    /// `[base, base + count * PAGE_SIZE)` must be zeroed, page aligned and
    /// owned by the returned allocator for the rest of the kernel's life.
    pub unsafe fn new(base: VA, count: usize, phys_offset: usize) -> Self {
        Self {
            base,
            count,
            next: AtomicUsize::new(0),
            phys_offset,
        }
    }

    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.count)
    }
}

/// Handle through which page tables allocate from a [`StaticTables`] pool.
#[derive(Clone, Copy)]
pub struct StaticTableMemory {
    pool: &'static StaticTables,
}

impl StaticTableMemory {
    pub const fn new(pool: &'static StaticTables) -> Self {
        Self { pool }
    }
}

impl PageTableMemory for StaticTableMemory {
    fn allocate_table(&self) -> Result<PA> {
        let idx = self.pool.next.fetch_add(1, Ordering::Relaxed);

        if idx >= self.pool.count {
            error!("boot table pool exhausted ({} tables)", self.pool.count);
            return Err(KernelError::NoMemory);
        }

        let va = self.pool.base.add_bytes(idx * PAGE_SIZE);
        Ok(PA::from_value(va.value().wrapping_sub(self.pool.phys_offset)))
    }

    unsafe fn free_table(&self, table: PA) {
        debug!("leaking boot table {table}");
    }

    fn table_ptr(&self, table: PA) -> *mut u64 {
        VA::from_value(table.value().wrapping_add(self.pool.phys_offset)).as_ptr_mut()
    }
}
