use pg_descriptors::{DeviceFormat, EptFormat, HostFormat};

use crate::{
    error::Result,
    memory::{
        address::{PA, VA},
        attr::MemoryType,
        cleanup::TlbCleanup,
        mapping::Mapping,
        pg_tables::{PageTable, PageTableMemory},
    },
};

pub mod pg_descriptors;

/// IA32_PAT layout assumed by host and nested descriptors.
///
/// | index | 0  | 1  | 2   | 3  | 4  | 5  | 6   | 7  |
/// |-------|----|----|-----|----|----|----|-----|----|
/// | type  | WB | WT | UC- | UC | WC | WP | UC- | UC |
///
/// Indices 0-3 match the power-on default, so tables written before the
/// MSR is programmed only ever see WB, WT or UC.
pub const PAT_VALUE: u64 = 0x0007_0501_0007_0406;

/// PAT index (PAT:PCD:PWT) selecting `mt`.
pub const fn pat_index(mt: MemoryType) -> u8 {
    match mt {
        MemoryType::WriteBack => 0,
        MemoryType::WriteThrough => 1,
        MemoryType::Uncacheable => 3,
        MemoryType::WriteCombining => 4,
        MemoryType::WriteProtected => 5,
    }
}

pub const fn pat_memory_type(idx: u8) -> MemoryType {
    match idx & 0b111 {
        0 => MemoryType::WriteBack,
        1 => MemoryType::WriteThrough,
        4 => MemoryType::WriteCombining,
        5 => MemoryType::WriteProtected,
        _ => MemoryType::Uncacheable,
    }
}

pub type HostTable<M> = PageTable<HostFormat, M>;
pub type NestedTable<M> = PageTable<HostFormat, M>;
pub type ExtendedTable<M> = PageTable<EptFormat, M>;
pub type DeviceTable<M> = PageTable<DeviceFormat, M>;

/// Second-dimension paging flavour, fixed by the CPU vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFormat {
    /// Intel VMX extended page tables.
    Extended,
    /// AMD SVM nested paging.
    Nested,
}

/// Guest-physical translation of a domain.
pub enum GuestTable<M: PageTableMemory> {
    Extended(ExtendedTable<M>),
    Nested(NestedTable<M>),
}

impl<M: PageTableMemory> GuestTable<M> {
    pub fn update(&self, mapping: Mapping, cleanup: &mut TlbCleanup) -> Result<bool> {
        match self {
            Self::Extended(ept) => ept.update(mapping, cleanup),
            Self::Nested(npt) => npt.update(mapping, cleanup),
        }
    }

    pub fn lookup(&self, va: VA) -> Mapping {
        match self {
            Self::Extended(ept) => ept.lookup(va),
            Self::Nested(npt) => npt.lookup(va),
        }
    }

    pub fn max_order(&self) -> usize {
        match self {
            Self::Extended(ept) => ept.max_order(),
            Self::Nested(npt) => npt.max_order(),
        }
    }

    pub fn root(&self) -> PA {
        match self {
            Self::Extended(ept) => ept.root(),
            Self::Nested(npt) => npt.root(),
        }
    }

    pub fn format(&self) -> GuestFormat {
        match self {
            Self::Extended(_) => GuestFormat::Extended,
            Self::Nested(_) => GuestFormat::Nested,
        }
    }
}

/// Paging capabilities detected at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    pub guest: GuestFormat,
    /// 1 GiB leaves in host and guest tables.
    pub huge_pages: bool,
    /// IOMMU table depth: 3 (39-bit) or 4 (48-bit).
    pub device_levels: usize,
    /// Highest superpage level the IOMMU supports (0 for none).
    pub device_max_leaf_level: usize,
}

impl PagingConfig {
    fn cpu_max_leaf_level(&self) -> usize {
        if self.huge_pages { 2 } else { 1 }
    }

    pub fn host_format(&self) -> HostFormat {
        HostFormat {
            max_leaf_level: self.cpu_max_leaf_level(),
            nested: false,
        }
    }

    pub fn device_format(&self) -> DeviceFormat {
        DeviceFormat {
            levels: self.device_levels,
            max_leaf_level: core::cmp::min(self.device_max_leaf_level, self.device_levels - 1),
        }
    }

    pub fn new_guest_table<M: PageTableMemory>(&self, memory: M) -> Result<GuestTable<M>> {
        let max_leaf_level = self.cpu_max_leaf_level();

        Ok(match self.guest {
            GuestFormat::Extended => GuestTable::Extended(PageTable::new(EptFormat { max_leaf_level }, memory)?),
            GuestFormat::Nested => GuestTable::Nested(PageTable::new(
                HostFormat {
                    max_leaf_level,
                    nested: true,
                },
                memory,
            )?),
        })
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            guest: GuestFormat::Extended,
            huge_pages: true,
            device_levels: 4,
            device_max_leaf_level: 1,
        }
    }
}
