use alloc::vec::Vec;
use bitflags::bitflags;

use super::address::PA;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct CleanupFlags: u8 {
        /// Some translation cache may hold a stale entry.
        const TLB_FLUSH    = 1 << 0;
        /// A device table changed and the IOMMU must be told.
        const DEVICE_FLUSH = 1 << 1;
    }
}

/// Work owed after a batch of page-table updates.
///
/// Collects whether a TLB shootdown is needed and which table frames were
/// unlinked. Retired frames may still be walked by another CPU until the
/// shootdown completes, so they are only handed back to the allocator
/// afterwards.
#[must_use]
#[derive(Debug, Default)]
pub struct TlbCleanup {
    flags: CleanupFlags,
    retired: Vec<PA>,
}

impl TlbCleanup {
    pub const fn new() -> Self {
        Self {
            flags: CleanupFlags::empty(),
            retired: Vec::new(),
        }
    }

    pub fn flush_tlb_later(&mut self) {
        self.flags |= CleanupFlags::TLB_FLUSH;
    }

    pub fn flush_device_later(&mut self) {
        self.flags |= CleanupFlags::DEVICE_FLUSH | CleanupFlags::TLB_FLUSH;
    }

    pub fn need_tlb_flush(&self) -> bool {
        self.flags.contains(CleanupFlags::TLB_FLUSH)
    }

    pub fn need_device_flush(&self) -> bool {
        self.flags.contains(CleanupFlags::DEVICE_FLUSH)
    }

    /// Records a table frame that was unlinked from the tree.
    pub fn retire_table(&mut self, table: PA) {
        self.retired.push(table);
        self.flush_tlb_later();
    }

    pub fn retired(&self) -> &[PA] {
        &self.retired
    }

    pub fn take_retired(&mut self) -> Vec<PA> {
        core::mem::take(&mut self.retired)
    }

    /// Nothing owed: no flush and no frames to reclaim.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.retired.is_empty()
    }

    pub fn merge(&mut self, mut other: TlbCleanup) {
        self.flags |= other.flags;
        self.retired.append(&mut other.retired);
    }

    /// Drops the flush obligation, returning only the retired frames.
    ///
    /// Used where no CPU can have cached the affected translations yet.
    pub fn ignore_tlb_flush(mut self) -> Vec<PA> {
        self.take_retired()
    }
}
