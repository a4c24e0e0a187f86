use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::{register_bitfields, registers::InMemoryRegister};

use super::{pat_index, pat_memory_type};
use crate::memory::{
    PAGE_SHIFT,
    address::PA,
    attr::{Attributes, MemoryType},
    pg_tables::{PteFormat, level_order},
};

register_bitfields![u64,
    // Native paging entries. AMD nested paging uses the same layout.
    pub HostEntry [
        PRESENT   OFFSET(0)  NUMBITS(1) [],
        WRITE     OFFSET(1)  NUMBITS(1) [],
        USER      OFFSET(2)  NUMBITS(1) [],
        PWT       OFFSET(3)  NUMBITS(1) [],
        PCD       OFFSET(4)  NUMBITS(1) [],
        ACCESSED  OFFSET(5)  NUMBITS(1) [],
        DIRTY     OFFSET(6)  NUMBITS(1) [],
        // PAT on 4K pages, page size on everything above.
        PS        OFFSET(7)  NUMBITS(1) [],
        GLOBAL    OFFSET(8)  NUMBITS(1) [],
        // Software available: refuse delegation.
        NODELEG   OFFSET(9)  NUMBITS(1) [],
        LARGE_PAT OFFSET(12) NUMBITS(1) [],
        ADDR      OFFSET(12) NUMBITS(40) [],
        NX        OFFSET(63) NUMBITS(1) []
    ],

    // Intel extended page table entries.
    pub EptEntry [
        READ       OFFSET(0)  NUMBITS(1) [],
        WRITE      OFFSET(1)  NUMBITS(1) [],
        EXECUTE    OFFSET(2)  NUMBITS(1) [],
        MEMTYPE    OFFSET(3)  NUMBITS(3) [],
        IGNORE_PAT OFFSET(6)  NUMBITS(1) [],
        LARGE      OFFSET(7)  NUMBITS(1) [],
        ACCESSED   OFFSET(8)  NUMBITS(1) [],
        DIRTY      OFFSET(9)  NUMBITS(1) [],
        ADDR       OFFSET(12) NUMBITS(40) []
    ],

    // VT-d second-level translation entries.
    pub DeviceEntry [
        READ      OFFSET(0)  NUMBITS(1) [],
        WRITE     OFFSET(1)  NUMBITS(1) [],
        SUPERPAGE OFFSET(7)  NUMBITS(1) [],
        SNOOP     OFFSET(11) NUMBITS(1) [],
        ADDR      OFFSET(12) NUMBITS(40) []
    ]
];

macro_rules! entry_accessors {
    ($($fields:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[inline]
                fn [<$fields:snake>](raw: u64) -> InMemoryRegister<u64, $fields::Register> {
                    InMemoryRegister::new(raw)
                }
            )*
        }
    };
}

entry_accessors!(HostEntry, EptEntry, DeviceEntry);

/// Page frame number of a leaf or table address.
fn frame(pa: PA) -> u64 {
    (pa.value() >> PAGE_SHIFT) as u64
}

/// Physical base of a leaf at `level`, dropping low bits that large leaves
/// reuse for other fields.
fn leaf_base(addr_field: u64, level: usize) -> PA {
    let pa = (addr_field as usize) << PAGE_SHIFT;
    PA::from_value(pa).align_down(level_order(level))
}

/// Host page-table format, also used for AMD nested paging.
///
/// Nested tables are walked with user privilege by the hardware, so every
/// entry there carries the user bit.
#[derive(Debug, Clone, Copy)]
pub struct HostFormat {
    pub max_leaf_level: usize,
    pub nested: bool,
}

impl HostFormat {
    pub const LEVELS: usize = 4;
}

impl PteFormat for HostFormat {
    fn levels(&self) -> usize {
        Self::LEVELS
    }

    fn max_leaf_level(&self) -> usize {
        self.max_leaf_level
    }

    fn is_present(&self, raw: u64) -> bool {
        host_entry(raw).is_set(HostEntry::PRESENT)
    }

    fn is_leaf(&self, raw: u64, level: usize) -> bool {
        level == 0 || host_entry(raw).is_set(HostEntry::PS)
    }

    fn table_descriptor(&self, table: PA) -> u64 {
        let reg = host_entry(0);
        reg.modify(
            HostEntry::PRESENT::SET
                + HostEntry::WRITE::SET
                + HostEntry::USER::SET
                + HostEntry::ACCESSED::SET
                + HostEntry::ADDR.val(frame(table)),
        );
        reg.get()
    }

    fn table_address(&self, raw: u64) -> PA {
        PA::from_value((host_entry(raw).read(HostEntry::ADDR) as usize) << PAGE_SHIFT)
    }

    fn leaf_descriptor(&self, pa: PA, attr: Attributes, level: usize) -> u64 {
        if !attr.is_present() {
            return 0;
        }

        let reg = host_entry(0);
        reg.modify(HostEntry::PRESENT::SET + HostEntry::ADDR.val(frame(pa)));

        if attr.contains(Attributes::WRITE) {
            reg.modify(HostEntry::WRITE::SET);
        }
        if attr.contains(Attributes::USER) || self.nested {
            reg.modify(HostEntry::USER::SET);
        }
        if attr.contains(Attributes::ACCESSED) {
            reg.modify(HostEntry::ACCESSED::SET);
        }
        if attr.contains(Attributes::DIRTY) {
            reg.modify(HostEntry::DIRTY::SET);
        }
        if attr.contains(Attributes::GLOBAL) && !self.nested {
            reg.modify(HostEntry::GLOBAL::SET);
        }
        if attr.contains(Attributes::NODELEG) {
            reg.modify(HostEntry::NODELEG::SET);
        }
        if attr.contains(Attributes::NX) {
            reg.modify(HostEntry::NX::SET);
        }

        let idx = pat_index(attr.memory_type());
        if idx & 0b001 != 0 {
            reg.modify(HostEntry::PWT::SET);
        }
        if idx & 0b010 != 0 {
            reg.modify(HostEntry::PCD::SET);
        }

        if level == 0 {
            if idx & 0b100 != 0 {
                reg.modify(HostEntry::PS::SET);
            }
        } else {
            reg.modify(HostEntry::PS::SET);
            if idx & 0b100 != 0 {
                reg.modify(HostEntry::LARGE_PAT::SET);
            }
        }

        reg.get()
    }

    fn decode_leaf(&self, raw: u64, level: usize) -> (PA, Attributes) {
        let reg = host_entry(raw);
        let mut attr = Attributes::PRESENT;

        let flags = [
            (HostEntry::WRITE, Attributes::WRITE),
            (HostEntry::USER, Attributes::USER),
            (HostEntry::ACCESSED, Attributes::ACCESSED),
            (HostEntry::DIRTY, Attributes::DIRTY),
            (HostEntry::GLOBAL, Attributes::GLOBAL),
            (HostEntry::NODELEG, Attributes::NODELEG),
            (HostEntry::NX, Attributes::NX),
        ];
        for (field, flag) in flags {
            if reg.is_set(field) {
                attr |= flag;
            }
        }

        let pat_bit = if level == 0 {
            reg.is_set(HostEntry::PS)
        } else {
            reg.is_set(HostEntry::LARGE_PAT)
        };
        let idx = (pat_bit as u8) << 2
            | (reg.is_set(HostEntry::PCD) as u8) << 1
            | reg.is_set(HostEntry::PWT) as u8;

        (
            leaf_base(reg.read(HostEntry::ADDR), level),
            attr.with_memory_type(pat_memory_type(idx)),
        )
    }
}

/// Intel EPT format.
#[derive(Debug, Clone, Copy)]
pub struct EptFormat {
    pub max_leaf_level: usize,
}

impl EptFormat {
    pub const LEVELS: usize = 4;
}

impl PteFormat for EptFormat {
    fn levels(&self) -> usize {
        Self::LEVELS
    }

    fn max_leaf_level(&self) -> usize {
        self.max_leaf_level
    }

    fn is_present(&self, raw: u64) -> bool {
        let reg = ept_entry(raw);
        reg.is_set(EptEntry::READ) || reg.is_set(EptEntry::WRITE) || reg.is_set(EptEntry::EXECUTE)
    }

    fn is_leaf(&self, raw: u64, level: usize) -> bool {
        level == 0 || ept_entry(raw).is_set(EptEntry::LARGE)
    }

    fn table_descriptor(&self, table: PA) -> u64 {
        let reg = ept_entry(0);
        reg.modify(
            EptEntry::READ::SET
                + EptEntry::WRITE::SET
                + EptEntry::EXECUTE::SET
                + EptEntry::ADDR.val(frame(table)),
        );
        reg.get()
    }

    fn table_address(&self, raw: u64) -> PA {
        PA::from_value((ept_entry(raw).read(EptEntry::ADDR) as usize) << PAGE_SHIFT)
    }

    fn leaf_descriptor(&self, pa: PA, attr: Attributes, level: usize) -> u64 {
        if !attr.is_present() {
            return 0;
        }

        let reg = ept_entry(0);
        reg.modify(
            EptEntry::READ::SET
                + EptEntry::MEMTYPE.val(attr.memory_type().as_raw() as u64)
                + EptEntry::ADDR.val(frame(pa)),
        );

        if attr.contains(Attributes::WRITE) {
            reg.modify(EptEntry::WRITE::SET);
        }
        if !attr.contains(Attributes::NX) {
            reg.modify(EptEntry::EXECUTE::SET);
        }
        if level > 0 {
            reg.modify(EptEntry::LARGE::SET);
        }

        reg.get()
    }

    fn decode_leaf(&self, raw: u64, level: usize) -> (PA, Attributes) {
        let reg = ept_entry(raw);
        let mut attr = Attributes::PRESENT | Attributes::USER | Attributes::ACCESSED | Attributes::DIRTY;

        if reg.is_set(EptEntry::WRITE) {
            attr |= Attributes::WRITE;
        }
        if !reg.is_set(EptEntry::EXECUTE) {
            attr |= Attributes::NX;
        }

        let mt = MemoryType::from_raw(reg.read(EptEntry::MEMTYPE) as u8)
            .unwrap_or(MemoryType::Uncacheable);

        (leaf_base(reg.read(EptEntry::ADDR), level), attr.with_memory_type(mt))
    }
}

/// VT-d second-level format.
///
/// The depth follows the address width the IOMMU supports; superpage levels
/// follow its capability register. Devices cannot execute, and the memory
/// type is left to snooping.
#[derive(Debug, Clone, Copy)]
pub struct DeviceFormat {
    pub levels: usize,
    pub max_leaf_level: usize,
}

impl PteFormat for DeviceFormat {
    fn levels(&self) -> usize {
        self.levels
    }

    fn max_leaf_level(&self) -> usize {
        self.max_leaf_level
    }

    fn is_present(&self, raw: u64) -> bool {
        let reg = device_entry(raw);
        reg.is_set(DeviceEntry::READ) || reg.is_set(DeviceEntry::WRITE)
    }

    fn is_leaf(&self, raw: u64, level: usize) -> bool {
        level == 0 || device_entry(raw).is_set(DeviceEntry::SUPERPAGE)
    }

    fn table_descriptor(&self, table: PA) -> u64 {
        let reg = device_entry(0);
        reg.modify(DeviceEntry::READ::SET + DeviceEntry::WRITE::SET + DeviceEntry::ADDR.val(frame(table)));
        reg.get()
    }

    fn table_address(&self, raw: u64) -> PA {
        PA::from_value((device_entry(raw).read(DeviceEntry::ADDR) as usize) << PAGE_SHIFT)
    }

    fn leaf_descriptor(&self, pa: PA, attr: Attributes, level: usize) -> u64 {
        if !attr.is_present() {
            return 0;
        }

        let reg = device_entry(0);
        reg.modify(DeviceEntry::READ::SET + DeviceEntry::ADDR.val(frame(pa)));

        if attr.contains(Attributes::WRITE) {
            reg.modify(DeviceEntry::WRITE::SET);
        }
        if level > 0 {
            reg.modify(DeviceEntry::SUPERPAGE::SET);
        }

        reg.get()
    }

    fn decode_leaf(&self, raw: u64, level: usize) -> (PA, Attributes) {
        let reg = device_entry(raw);
        let mut attr = Attributes::PRESENT
            | Attributes::USER
            | Attributes::ACCESSED
            | Attributes::DIRTY
            | Attributes::NX;

        if reg.is_set(DeviceEntry::WRITE) {
            attr |= Attributes::WRITE;
        }

        (
            leaf_base(reg.read(DeviceEntry::ADDR), level),
            attr.with_memory_type(MemoryType::WriteBack),
        )
    }
}
