//! Memory type range registers, decoded from raw MSR values.
//!
//! Reading the MSRs is left to the kernel; this module only answers which
//! memory type firmware assigned to a physical address.

use alloc::vec::Vec;

use crate::memory::{PAGE_SHIFT, attr::MemoryType};

/// Source of per-address memory types used when seeding the root mappings.
pub trait MemoryTypeMap {
    /// Memory type at `phys`, together with the first address above `phys`
    /// at which the type may change.
    fn memtype(&self, phys: u64) -> (MemoryType, u64);
}

/// Number of fixed-range MSRs: one 64K, two 16K and eight 4K registers.
pub const FIXED_RANGE_MSRS: usize = 11;

const DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;
const DEF_TYPE_ENABLE: u64 = 1 << 11;
const PHYSMASK_VALID: u64 = 1 << 11;
const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

/// One variable-range pair, `IA32_MTRR_PHYSBASEn` and `IA32_MTRR_PHYSMASKn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableRange {
    pub base: u64,
    pub mask: u64,
}

impl VariableRange {
    fn valid(&self) -> bool {
        self.mask & PHYSMASK_VALID != 0
    }

    fn start(&self) -> u64 {
        self.base & !PAGE_MASK
    }

    fn size(&self) -> u64 {
        let mask = self.mask & !PAGE_MASK;
        1u64.checked_shl(mask.trailing_zeros()).unwrap_or(0)
    }

    fn contains(&self, phys: u64) -> bool {
        (phys ^ self.base) & self.mask & !PAGE_MASK == 0
    }

    fn memtype(&self) -> u8 {
        (self.base & 0xff) as u8
    }
}

/// Snapshot of the boot CPU's MTRR configuration.
#[derive(Debug, Clone, Default)]
pub struct MtrrState {
    /// Raw `IA32_MTRR_DEF_TYPE`.
    pub def_type: u64,
    /// `IA32_MTRR_FIX64K_00000`, `FIX16K_80000`, `FIX16K_A0000`, then
    /// `FIX4K_C0000` through `FIX4K_F8000`.
    pub fixed: [u64; FIXED_RANGE_MSRS],
    pub variable: Vec<VariableRange>,
}

const UC: u8 = MemoryType::Uncacheable as u8;
const WT: u8 = MemoryType::WriteThrough as u8;
const WB: u8 = MemoryType::WriteBack as u8;

impl MtrrState {
    fn enabled(&self) -> bool {
        self.def_type & DEF_TYPE_ENABLE != 0
    }

    fn fixed_enabled(&self) -> bool {
        self.def_type & DEF_TYPE_FIXED_ENABLE != 0
    }

    /// Type byte from the fixed-range registers for addresses below 1 MiB.
    fn fixed_memtype(&self, phys: u64) -> (u8, u64) {
        let (msr, shift, next) = if phys < 0x8_0000 {
            (0, (phys >> 13) & 0x38, (phys | 0xffff) + 1)
        } else if phys < 0xc_0000 {
            ((phys >> 17) as usize - 3, (phys >> 11) & 0x38, (phys | 0x3fff) + 1)
        } else {
            ((phys >> 15) as usize - 21, (phys >> 9) & 0x38, (phys | 0xfff) + 1)
        };

        (((self.fixed[msr] >> shift) & 0xff) as u8, next)
    }

    fn variable_memtype(&self, phys: u64) -> (u8, u64) {
        let mut memtype: Option<u8> = None;
        let mut next = u64::MAX;

        for range in self.variable.iter().filter(|r| r.valid()) {
            let start = range.start();

            if phys < start {
                next = next.min(start);
                continue;
            }

            if !range.contains(phys) {
                continue;
            }

            next = next.min(start.saturating_add(range.size()));

            let t = range.memtype();
            memtype = Some(match memtype {
                None => t,
                Some(cur) if cur == UC || t == UC => UC,
                Some(cur) if (cur == WT && t == WB) || (cur == WB && t == WT) => WT,
                // Other overlaps are undefined; keep the first match.
                Some(cur) => cur,
            });
        }

        (memtype.unwrap_or((self.def_type & 0xff) as u8), next)
    }
}

impl MemoryTypeMap for MtrrState {
    fn memtype(&self, phys: u64) -> (MemoryType, u64) {
        if !self.enabled() {
            return (MemoryType::Uncacheable, u64::MAX);
        }

        let (raw, next) = if phys < 0x10_0000 && self.fixed_enabled() {
            self.fixed_memtype(phys)
        } else {
            self.variable_memtype(phys)
        };

        (
            MemoryType::from_raw(raw).unwrap_or(MemoryType::Uncacheable),
            next,
        )
    }
}
