use alloc::vec::Vec;
use log::trace;
use spin::Mutex;

use super::{
    PAGE_SHIFT,
    address::{PA, VA},
    attr::Attributes,
    cleanup::TlbCleanup,
    mapping::Mapping,
};
use crate::error::{MapError, Result};

/// Index bits consumed by each table level.
pub const TABLE_BITS: usize = 9;
pub const DESCRIPTORS_PER_TABLE: usize = 1 << TABLE_BITS;
pub const LEVEL_MASK: usize = DESCRIPTORS_PER_TABLE - 1;

/// Order of the region covered by one entry at `level` (level 0 maps pages).
pub const fn level_order(level: usize) -> usize {
    PAGE_SHIFT + TABLE_BITS * level
}

/// Index of `va` inside a table at `level`.
pub const fn pg_index(va: usize, level: usize) -> usize {
    (va >> level_order(level)) & LEVEL_MASK
}

/// Supplies and reaches the frames that hold translation tables.
///
/// Tables are addressed by physical address; `table_ptr` turns that into
/// something the kernel can dereference.
pub trait PageTableMemory: Clone {
    /// Allocates one zero-filled, page-sized, page-aligned table frame.
    fn allocate_table(&self) -> Result<PA>;

    /// Returns a table frame to its allocator.
    ///
    /// # Safety
    ///
    /// `table` must come from `allocate_table` on this memory and must no
    /// longer be reachable by software or by any hardware walker.
    unsafe fn free_table(&self, table: PA);

    /// Kernel-accessible pointer to the first entry of `table`.
    fn table_ptr(&self, table: PA) -> *mut u64;
}

/// Hardware encoding of one kind of translation table.
///
/// All formats share the x86 radix layout: 512 eight-byte entries per
/// table, 9 index bits per level, level 0 mapping 4 KiB pages. They differ
/// in depth, in which levels may hold leaves, and in the bit layout of the
/// entries.
pub trait PteFormat {
    /// Number of table levels walked from the root.
    fn levels(&self) -> usize;

    /// Highest level whose entries may map memory directly.
    fn max_leaf_level(&self) -> usize;

    fn is_present(&self, raw: u64) -> bool;

    /// Whether a present entry at `level` maps memory rather than a table.
    fn is_leaf(&self, raw: u64, level: usize) -> bool;

    fn table_descriptor(&self, table: PA) -> u64;

    fn table_address(&self, raw: u64) -> PA;

    fn leaf_descriptor(&self, pa: PA, attr: Attributes, level: usize) -> u64;

    fn decode_leaf(&self, raw: u64, level: usize) -> (PA, Attributes);
}

/// A multi-level translation table in one of the supported formats.
///
/// Updates are serialized by an internal lock so that several domains may
/// write into the same table concurrently.
pub struct PageTable<F: PteFormat, M: PageTableMemory> {
    root: PA,
    format: F,
    memory: M,
    lock: Mutex<()>,
}

impl<F: PteFormat, M: PageTableMemory> PageTable<F, M> {
    pub fn new(format: F, memory: M) -> Result<Self> {
        let root = memory.allocate_table()?;

        Ok(Self {
            root,
            format,
            memory,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> PA {
        self.root
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    /// Largest order a single entry can map.
    pub fn max_order(&self) -> usize {
        level_order(self.format.max_leaf_level())
    }

    /// Width of the input address space translated by this table.
    pub fn address_bits(&self) -> usize {
        level_order(self.format.levels())
    }

    /// Writes `mapping` into the table; a non-present mapping removes
    /// whatever covers its range.
    ///
    /// The mapping is stored at the largest leaf level whose page size does
    /// not exceed `2^order`, using as many consecutive entries as needed.
    /// Returns whether any entry changed. Flush requirements and unlinked
    /// tables are recorded in `cleanup`.
    pub fn update(&self, mapping: Mapping, cleanup: &mut TlbCleanup) -> Result<bool> {
        if mapping.order < PAGE_SHIFT {
            return Err(MapError::OrderTooSmall.into());
        }

        if !mapping.vaddr.is_aligned(mapping.order) {
            return Err(MapError::VirtNotAligned.into());
        }

        if mapping.present() && !mapping.paddr.is_aligned(mapping.order) {
            return Err(MapError::PhysNotAligned.into());
        }

        let start = mapping.vaddr.value();
        let size = mapping.size();
        let limit = 1usize << self.address_bits();

        // Removal only concerns the part this table can translate.
        let end = if mapping.present() {
            if start >= limit || size > limit - start {
                return Err(MapError::OutOfRange.into());
            }
            start + size
        } else {
            if start >= limit {
                return Ok(false);
            }
            if size == 0 || size > limit - start {
                limit
            } else {
                start + size
            }
        };

        let leaf_level = self.leaf_level(mapping.order);
        let _guard = self.lock.lock();

        self.update_level(
            self.root,
            self.format.levels() - 1,
            start,
            end,
            &mapping,
            leaf_level,
            cleanup,
        )
    }

    /// Translation covering `va`.
    ///
    /// When nothing is mapped, the result is an absent mapping spanning the
    /// empty entry at which the walk stopped.
    pub fn lookup(&self, va: VA) -> Mapping {
        let bits = self.address_bits();
        if va.value() >> bits != 0 {
            return Mapping::absent(va.align_down(bits), bits);
        }

        let _guard = self.lock.lock();
        let mut table = self.root;
        let mut level = self.format.levels() - 1;

        loop {
            let order = level_order(level);
            let raw = self.read(table, pg_index(va.value(), level));

            if !self.format.is_present(raw) {
                return Mapping::absent(va.align_down(order), order);
            }

            if self.format.is_leaf(raw, level) {
                let (pa, attr) = self.format.decode_leaf(raw, level);
                return Mapping::new(va.align_down(order), pa, attr, order);
            }

            table = self.format.table_address(raw);
            level -= 1;
        }
    }

    /// Frees table frames unlinked by earlier updates.
    ///
    /// # Safety
    ///
    /// Every CPU and device that may have walked this table must have
    /// flushed its translation caches since the frames were unlinked.
    pub unsafe fn reclaim(&self, retired: Vec<PA>) {
        for table in retired {
            trace!("freeing retired table {table:?}");
            // SAFETY: the caller guarantees the frame is unreachable.
            unsafe { self.memory.free_table(table) };
        }
    }

    fn leaf_level(&self, order: usize) -> usize {
        (0..=self.format.max_leaf_level())
            .rev()
            .find(|&level| level_order(level) <= order)
            .unwrap_or(0)
    }

    fn read(&self, table: PA, idx: usize) -> u64 {
        debug_assert!(idx < DESCRIPTORS_PER_TABLE);
        // SAFETY: `table` is a live frame of this tree and `idx` is in bounds.
        unsafe { self.memory.table_ptr(table).add(idx).read_volatile() }
    }

    fn write(&self, table: PA, idx: usize, raw: u64) {
        debug_assert!(idx < DESCRIPTORS_PER_TABLE);
        // SAFETY: as for `read`; writers hold `self.lock`.
        unsafe { self.memory.table_ptr(table).add(idx).write_volatile(raw) }
    }

    #[allow(clippy::too_many_arguments)]
    fn update_level(
        &self,
        table: PA,
        level: usize,
        start: usize,
        end: usize,
        mapping: &Mapping,
        leaf_level: usize,
        cleanup: &mut TlbCleanup,
    ) -> Result<bool> {
        let entry_mask = (1usize << level_order(level)) - 1;
        let mut touched = false;
        let mut cur = start;

        while cur < end {
            let idx = pg_index(cur, level);
            let entry_end = core::cmp::min((cur | entry_mask) + 1, end);
            let old = self.read(table, idx);

            if level == leaf_level {
                let new = if mapping.present() {
                    let pa = mapping.paddr.add_bytes(cur - mapping.vaddr.value());
                    self.format.leaf_descriptor(pa, mapping.attr, level)
                } else {
                    0
                };

                if self.format.is_present(old) {
                    if !self.format.is_leaf(old, level) {
                        self.retire_subtree(self.format.table_address(old), level - 1, cleanup);
                    } else if old != new {
                        cleanup.flush_tlb_later();
                    }
                }

                if old != new {
                    self.write(table, idx, new);
                    touched = true;
                }
            } else {
                let next = if !self.format.is_present(old) {
                    if !mapping.present() {
                        cur = entry_end;
                        continue;
                    }

                    let next = self.memory.allocate_table()?;
                    self.write(table, idx, self.format.table_descriptor(next));
                    touched = true;
                    next
                } else if self.format.is_leaf(old, level) {
                    let next = self.split(old, level)?;
                    trace!("split level {level} leaf at {cur:#x} into table {next:?}");
                    self.write(table, idx, self.format.table_descriptor(next));
                    cleanup.flush_tlb_later();
                    touched = true;
                    next
                } else {
                    self.format.table_address(old)
                };

                touched |=
                    self.update_level(next, level - 1, cur, entry_end, mapping, leaf_level, cleanup)?;
            }

            cur = entry_end;
        }

        Ok(touched)
    }

    /// Builds a next-level table that maps the same memory as the leaf `old`.
    fn split(&self, old: u64, level: usize) -> Result<PA> {
        let (pa, attr) = self.format.decode_leaf(old, level);
        let table = self.memory.allocate_table()?;
        let child_size = 1usize << level_order(level - 1);

        for idx in 0..DESCRIPTORS_PER_TABLE {
            let raw = self
                .format
                .leaf_descriptor(pa.add_bytes(idx * child_size), attr, level - 1);
            self.write(table, idx, raw);
        }

        Ok(table)
    }

    /// Records `table` (a table at `level`) and every table below it.
    fn retire_subtree(&self, table: PA, level: usize, cleanup: &mut TlbCleanup) {
        if level > 0 {
            for idx in 0..DESCRIPTORS_PER_TABLE {
                let raw = self.read(table, idx);
                if self.format.is_present(raw) && !self.format.is_leaf(raw, level) {
                    self.retire_subtree(self.format.table_address(raw), level - 1, cleanup);
                }
            }
        }

        cleanup.retire_table(table);
    }
}

impl<F: PteFormat, M: PageTableMemory> Drop for PageTable<F, M> {
    fn drop(&mut self) {
        let mut cleanup = TlbCleanup::new();
        self.retire_subtree(self.root, self.format.levels() - 1, &mut cleanup);

        // SAFETY: the table is being destroyed with its owning domain; no
        // CPU can be running on it any more.
        unsafe { self.reclaim(cleanup.ignore_tlb_flush()) };
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::memory::{
        PAGE_SIZE,
        attr::{MemRights, MemoryType},
    };
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn table_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    struct HeapState {
        live: AtomicUsize,
        allocated: AtomicUsize,
        max_tables: usize,
    }

    /// Table memory on the host heap. The "physical address" of a table is
    /// simply its host pointer.
    #[derive(Clone)]
    pub struct HeapMemory {
        state: Arc<HeapState>,
    }

    impl HeapMemory {
        pub fn new(max_tables: usize) -> Self {
            Self {
                state: Arc::new(HeapState {
                    live: AtomicUsize::new(0),
                    allocated: AtomicUsize::new(0),
                    max_tables,
                }),
            }
        }

        /// Tables currently allocated and not yet freed.
        pub fn live_tables(&self) -> usize {
            self.state.live.load(Ordering::SeqCst)
        }
    }

    impl PageTableMemory for HeapMemory {
        fn allocate_table(&self) -> Result<PA> {
            if self.state.allocated.fetch_add(1, Ordering::SeqCst) >= self.state.max_tables {
                self.state.allocated.fetch_sub(1, Ordering::SeqCst);
                return Err(KernelError::NoMemory);
            }

            let ptr = unsafe { alloc_zeroed(table_layout()) };
            if ptr.is_null() {
                panic!("Host failed to allocate memory for test");
            }

            self.state.live.fetch_add(1, Ordering::SeqCst);
            Ok(PA::from_value(ptr as usize))
        }

        unsafe fn free_table(&self, table: PA) {
            unsafe { dealloc(table.value() as *mut u8, table_layout()) };
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.allocated.fetch_sub(1, Ordering::SeqCst);
        }

        fn table_ptr(&self, table: PA) -> *mut u64 {
            table.value() as *mut u64
        }
    }

    /// Minimal four-level format: bit 0 present, bit 7 large leaf, the
    /// remaining attribute bits stored as-is.
    pub struct TestFormat {
        pub max_leaf_level: usize,
    }

    const VALID: u64 = 1 << 0;
    const LARGE: u64 = 1 << 7;
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    fn stored_attr() -> Attributes {
        Attributes::WRITE
            | Attributes::USER
            | Attributes::ACCESSED
            | Attributes::DIRTY
            | Attributes::NX
    }

    impl PteFormat for TestFormat {
        fn levels(&self) -> usize {
            4
        }

        fn max_leaf_level(&self) -> usize {
            self.max_leaf_level
        }

        fn is_present(&self, raw: u64) -> bool {
            raw & VALID != 0
        }

        fn is_leaf(&self, raw: u64, level: usize) -> bool {
            level == 0 || raw & LARGE != 0
        }

        fn table_descriptor(&self, table: PA) -> u64 {
            table.value() as u64 | VALID
        }

        fn table_address(&self, raw: u64) -> PA {
            PA::from_value((raw & ADDR_MASK) as usize)
        }

        fn leaf_descriptor(&self, pa: PA, attr: Attributes, level: usize) -> u64 {
            let large = if level > 0 { LARGE } else { 0 };
            pa.value() as u64 | (attr & stored_attr()).bits() | VALID | large
        }

        fn decode_leaf(&self, raw: u64, _level: usize) -> (PA, Attributes) {
            let attr = Attributes::from_bits_truncate(raw) & stored_attr();
            (
                PA::from_value((raw & ADDR_MASK) as usize),
                attr | Attributes::PRESENT,
            )
        }
    }

    pub struct TestHarness {
        pub memory: HeapMemory,
        pub table: PageTable<TestFormat, HeapMemory>,
    }

    impl TestHarness {
        pub fn new(max_tables: usize, max_leaf_level: usize) -> Self {
            let memory = HeapMemory::new(max_tables);
            let table = PageTable::new(TestFormat { max_leaf_level }, memory.clone()).unwrap();

            Self { memory, table }
        }

        pub fn map(&self, va: usize, pa: usize, order: usize, rights: MemRights) -> Result<TlbCleanup> {
            let mut cleanup = TlbCleanup::new();
            self.table.update(
                Mapping::new(
                    VA::from_value(va),
                    PA::from_value(pa),
                    Attributes::from_rights(rights),
                    order,
                ),
                &mut cleanup,
            )?;
            Ok(cleanup)
        }

        pub fn unmap(&self, va: usize, order: usize) -> Result<(bool, TlbCleanup)> {
            let mut cleanup = TlbCleanup::new();
            let touched = self
                .table
                .update(Mapping::absent(VA::from_value(va), order), &mut cleanup)?;
            Ok((touched, cleanup))
        }
    }

    #[test]
    fn test_pg_index() {
        const L3_IDX: usize = 0x1A;
        const L2_IDX: usize = 0x2B;
        const L1_IDX: usize = 0x3C;
        const L0_IDX: usize = 0x4D;

        let va = (L3_IDX << 39) | (L2_IDX << 30) | (L1_IDX << 21) | (L0_IDX << 12) | 0x5E;

        assert_eq!(pg_index(va, 3), L3_IDX);
        assert_eq!(pg_index(va, 2), L2_IDX);
        assert_eq!(pg_index(va, 1), L1_IDX);
        assert_eq!(pg_index(va, 0), L0_IDX);
        assert_eq!(level_order(0), 12);
        assert_eq!(level_order(2), 30);
    }

    #[test]
    fn test_map_single_4k_page() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let cleanup = h.map(0x1_0000, 0x8_0000, 12, MemRights::READ | MemRights::WRITE)?;
        assert!(!cleanup.need_tlb_flush());

        // Root plus one table for each lower level.
        assert_eq!(h.memory.live_tables(), 4);

        let m = h.table.lookup(VA::from_value(0x1_0abc));
        assert!(m.present());
        assert_eq!(m.vaddr, VA::from_value(0x1_0000));
        assert_eq!(m.paddr, PA::from_value(0x8_0000));
        assert_eq!(m.order, 12);
        assert_eq!(m.attr.rights(), MemRights::READ | MemRights::WRITE);

        Ok(())
    }

    #[test]
    fn test_map_uses_largest_leaf() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let _ = h.map(0x4000_0000, 0x8000_0000, 30, MemRights::all())?;
        assert_eq!(h.memory.live_tables(), 2);

        let m = h.table.lookup(VA::from_value(0x4123_4000));
        assert_eq!(m.order, 30);
        assert_eq!(m.paddr, PA::from_value(0x8000_0000));

        Ok(())
    }

    #[test]
    fn test_order_between_levels_writes_several_entries() -> Result<()> {
        let h = TestHarness::new(8, 1);

        // Order 22 with 2 MiB leaves takes two entries.
        let _ = h.map(0x40_0000, 0x1_0000_0000, 22, MemRights::all())?;

        let first = h.table.lookup(VA::from_value(0x40_0000));
        let second = h.table.lookup(VA::from_value(0x60_0000));

        assert_eq!(first.order, 21);
        assert_eq!(first.paddr, PA::from_value(0x1_0000_0000));
        assert_eq!(second.order, 21);
        assert_eq!(second.paddr, PA::from_value(0x1_0020_0000));
        assert!(!h.table.lookup(VA::from_value(0x80_0000)).present());

        Ok(())
    }

    #[test]
    fn test_lookup_absent_reports_empty_entry_span() {
        let h = TestHarness::new(8, 2);

        let m = h.table.lookup(VA::from_value(0x7f_1234_5000));
        assert!(!m.present());
        assert_eq!(m.order, 39);
        assert_eq!(m.vaddr, VA::from_value(0x0));
    }

    #[test]
    fn test_unmap_empty_range_touches_nothing() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let (touched, cleanup) = h.unmap(0x20_0000, 21)?;
        assert!(!touched);
        assert!(cleanup.is_empty());
        assert_eq!(h.memory.live_tables(), 1);

        Ok(())
    }

    #[test]
    fn test_remap_requires_flush_only_on_change() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let _ = h.map(0x1000, 0x5000, 12, MemRights::all())?;

        let same = h.map(0x1000, 0x5000, 12, MemRights::all())?;
        assert!(!same.need_tlb_flush());

        let downgrade = h.map(0x1000, 0x5000, 12, MemRights::READ)?;
        assert!(downgrade.need_tlb_flush());

        let (touched, unmap) = h.unmap(0x1000, 12)?;
        assert!(touched);
        assert!(unmap.need_tlb_flush());
        assert!(!h.table.lookup(VA::from_value(0x1000)).present());

        Ok(())
    }

    #[test]
    fn test_unmap_inside_superpage_splits_it() -> Result<()> {
        let h = TestHarness::new(8, 1);

        let _ = h.map(0x20_0000, 0x4000_0000, 21, MemRights::all())?;
        let tables = h.memory.live_tables();

        let (touched, cleanup) = h.unmap(0x20_1000, 12)?;
        assert!(touched);
        assert!(cleanup.need_tlb_flush());
        assert_eq!(h.memory.live_tables(), tables + 1);

        assert!(!h.table.lookup(VA::from_value(0x20_1000)).present());

        let neighbour = h.table.lookup(VA::from_value(0x20_2000));
        assert!(neighbour.present());
        assert_eq!(neighbour.order, 12);
        assert_eq!(neighbour.paddr, PA::from_value(0x4000_2000));
        assert_eq!(neighbour.attr.rights(), MemRights::all());

        Ok(())
    }

    #[test]
    fn test_superpage_over_small_pages_retires_table() -> Result<()> {
        let h = TestHarness::new(8, 1);

        let _ = h.map(0x20_0000, 0x10_0000, 12, MemRights::all())?;
        let _ = h.map(0x20_1000, 0x10_1000, 12, MemRights::all())?;
        assert_eq!(h.memory.live_tables(), 4);

        let mut cleanup = h.map(0x20_0000, 0x4000_0000, 21, MemRights::READ)?;
        assert!(cleanup.need_tlb_flush());
        assert_eq!(cleanup.retired().len(), 1);

        let m = h.table.lookup(VA::from_value(0x20_1000));
        assert_eq!(m.order, 21);
        assert_eq!(m.paddr, PA::from_value(0x4000_0000));

        unsafe { h.table.reclaim(cleanup.take_retired()) };
        assert_eq!(h.memory.live_tables(), 3);

        Ok(())
    }

    #[test]
    fn test_unmap_large_order_walks_into_tables() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let _ = h.map(0x7000_0000, 0x9000, 12, MemRights::all())?;

        // Covers the whole lower half of the address space.
        let (touched, cleanup) = h.unmap(0, 47)?;
        assert!(touched);
        assert!(cleanup.need_tlb_flush());
        assert!(!h.table.lookup(VA::from_value(0x7000_0000)).present());

        Ok(())
    }

    #[test]
    fn test_unmap_wider_than_table_is_clipped() -> Result<()> {
        let h = TestHarness::new(8, 2);

        let _ = h.map(0x7000_0000, 0x9000, 12, MemRights::all())?;
        let _ = h.map(0x7f_0000_0000, 0xa000, 12, MemRights::all())?;

        // 2^50 bytes from zero reaches past the 48-bit table.
        let (touched, cleanup) = h.unmap(0, 50)?;
        assert!(touched);
        assert!(cleanup.need_tlb_flush());
        assert!(!h.table.lookup(VA::from_value(0x7000_0000)).present());
        assert!(!h.table.lookup(VA::from_value(0x7f_0000_0000)).present());

        // Entirely beyond the table: nothing to remove.
        let (touched, cleanup) = h.unmap(1 << 48, 48)?;
        assert!(!touched);
        assert!(cleanup.is_empty());

        Ok(())
    }

    #[test]
    fn test_rejects_bad_mappings() {
        let h = TestHarness::new(8, 2);

        assert!(matches!(
            h.map(0x1800, 0x2000, 12, MemRights::all()),
            Err(KernelError::MappingError(MapError::VirtNotAligned))
        ));
        assert!(matches!(
            h.map(0x2000, 0x1800, 12, MemRights::all()),
            Err(KernelError::MappingError(MapError::PhysNotAligned))
        ));
        assert!(matches!(
            h.map(0x2000, 0x2000, 11, MemRights::all()),
            Err(KernelError::MappingError(MapError::OrderTooSmall))
        ));
        assert!(matches!(
            h.map(1 << 48, 0x2000, 12, MemRights::all()),
            Err(KernelError::MappingError(MapError::OutOfRange))
        ));
    }

    #[test]
    fn test_out_of_tables() {
        let h = TestHarness::new(2, 2);

        assert!(matches!(
            h.map(0x1000, 0x1000, 12, MemRights::all()),
            Err(KernelError::NoMemory)
        ));
    }

    #[test]
    fn test_drop_frees_every_table() -> Result<()> {
        let memory = HeapMemory::new(32);

        {
            let table = PageTable::new(TestFormat { max_leaf_level: 1 }, memory.clone())?;
            let mut cleanup = TlbCleanup::new();

            for i in 0..4usize {
                let va = i << 30;
                table.update(
                    Mapping::new(
                        VA::from_value(va),
                        PA::from_value(0x10_0000),
                        Attributes::from_rights(MemRights::READ).with_memory_type(MemoryType::WriteBack),
                        12,
                    ),
                    &mut cleanup,
                )?;
            }

            assert!(memory.live_tables() > 1);
        }

        assert_eq!(memory.live_tables(), 0);
        Ok(())
    }
}
