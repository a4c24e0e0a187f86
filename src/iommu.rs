//! VT-d remapping units, as far as the memory space needs them: discovering
//! their translation limits and invalidating their caches.

use alloc::vec::Vec;
use core::hint::spin_loop;

use libkernel::{
    arch::x86_64::memory::PagingConfig,
    memory::address::VA,
    space::IommuContexts,
};
use log::{debug, info};
use spin::Mutex;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite},
};

register_bitfields! [
    u64,
    /// Capability Register
    CAP [
        SAGAW OFFSET(8) NUMBITS(5) [],  // Supported adjusted guest address widths
        SLLPS OFFSET(34) NUMBITS(4) []  // Second-level large page support
    ],
    /// Extended Capability Register
    ECAP [
        IRO OFFSET(8) NUMBITS(10) []    // IOTLB register offset, in 16-byte units
    ],
    /// Context Command Register
    CCMD [
        CAIG OFFSET(59) NUMBITS(2) [],
        CIRG OFFSET(61) NUMBITS(2) [
            Global = 1,
            Domain = 2,
            Device = 3
        ],
        ICC OFFSET(63) NUMBITS(1) []
    ],
    /// IOTLB Invalidate Register
    IOTLB [
        DW OFFSET(48) NUMBITS(1) [],    // Drain writes
        DR OFFSET(49) NUMBITS(1) [],    // Drain reads
        IAIG OFFSET(57) NUMBITS(2) [],
        IIRG OFFSET(60) NUMBITS(2) [
            Global = 1,
            Domain = 2,
            Page = 3
        ],
        IVT OFFSET(63) NUMBITS(1) []
    ]
];

register_structs! {
    #[allow(non_snake_case)]
    pub DmarRegs {
        (0x00 => pub ver: ReadOnly<u32>),
        (0x04 => _reserved0),
        (0x08 => pub cap: ReadOnly<u64, CAP::Register>),
        (0x10 => pub ecap: ReadOnly<u64, ECAP::Register>),
        (0x18 => pub gcmd: ReadWrite<u32>),
        (0x1c => pub gsts: ReadOnly<u32>),
        (0x20 => pub rtaddr: ReadWrite<u64>),
        (0x28 => pub ccmd: ReadWrite<u64, CCMD::Register>),
        (0x30 => @END),
    }
}

register_structs! {
    pub IotlbRegs {
        (0x00 => pub iva: ReadWrite<u64>),
        (0x08 => pub iotlb: ReadWrite<u64, IOTLB::Register>),
        (0x10 => @END),
    }
}

/// SAGAW bit for 39-bit, 3-level tables.
const SAGAW_3LEVEL: u64 = 1 << 1;
/// SAGAW bit for 48-bit, 4-level tables.
const SAGAW_4LEVEL: u64 = 1 << 2;

/// Table depth and largest leaf level a unit with capability `cap`
/// supports, or `None` if it can walk neither 3- nor 4-level tables.
pub fn device_paging(cap: u64) -> Option<(usize, usize)> {
    let sagaw = CAP::SAGAW.read(cap);
    let levels = if sagaw & SAGAW_4LEVEL != 0 {
        4
    } else if sagaw & SAGAW_3LEVEL != 0 {
        3
    } else {
        return None;
    };

    let sllps = CAP::SLLPS.read(cap);
    let max_leaf = if sllps & 0b10 != 0 {
        2
    } else if sllps & 0b01 != 0 {
        1
    } else {
        0
    };

    Some((levels, max_leaf))
}

/// Offset of the IOTLB register pair from the unit's base.
pub fn iotlb_offset(ecap: u64) -> usize {
    (ECAP::IRO.read(ecap) as usize) * 16
}

/// One DMA remapping unit.
pub struct DmarUnit {
    regs: &'static DmarRegs,
    iotlb: &'static IotlbRegs,
}

// Register access is serialized by the lock in `Dmar`.
unsafe impl Send for DmarUnit {}

impl DmarUnit {
    /// # Safety
    ///
    /// `base` must map the unit's register page for the kernel's lifetime.
    pub unsafe fn new(base: VA) -> Self {
        let regs = unsafe { &*(base.as_ptr::<DmarRegs>()) };
        let iotlb = unsafe { &*(base.add_bytes(iotlb_offset(regs.ecap.get())).as_ptr::<IotlbRegs>()) };

        Self { regs, iotlb }
    }

    fn invalidate_context_cache(&self) {
        self.regs.ccmd.write(CCMD::ICC::SET + CCMD::CIRG::Global);
        while self.regs.ccmd.is_set(CCMD::ICC) {
            spin_loop();
        }
    }

    fn invalidate_iotlb(&self) {
        self.iotlb
            .iotlb
            .write(IOTLB::IVT::SET + IOTLB::IIRG::Global + IOTLB::DR::SET + IOTLB::DW::SET);
        while self.iotlb.iotlb.is_set(IOTLB::IVT) {
            spin_loop();
        }
    }
}

/// All remapping units of the platform.
pub struct Dmar {
    units: Mutex<Vec<DmarUnit>>,
}

impl Dmar {
    pub const fn new() -> Self {
        Self {
            units: Mutex::new(Vec::new()),
        }
    }

    /// Registers the unit whose registers are mapped at `base`.
    ///
    /// # Safety
    ///
    /// As for [`DmarUnit::new`].
    pub unsafe fn add_unit(&self, base: VA) {
        let unit = unsafe { DmarUnit::new(base) };
        info!(
            "DMAR unit at {base}: cap {:#x} ecap {:#x}",
            unit.regs.cap.get(),
            unit.regs.ecap.get()
        );
        self.units.lock().push(unit);
    }

    /// Narrows the device side of `paging` to what every unit supports.
    pub fn restrict_paging(&self, paging: &mut PagingConfig) {
        for unit in self.units.lock().iter() {
            if let Some((levels, max_leaf)) = device_paging(unit.regs.cap.get()) {
                paging.device_levels = paging.device_levels.min(levels);
                paging.device_max_leaf_level = paging.device_max_leaf_level.min(max_leaf);
            }
        }
    }
}

impl Default for Dmar {
    fn default() -> Self {
        Self::new()
    }
}

impl IommuContexts for Dmar {
    fn flush_all_contexts(&self) {
        let units = self.units.lock();
        debug!("flushing {} DMAR units", units.len());

        for unit in units.iter() {
            unit.invalidate_context_cache();
            unit.invalidate_iotlb();
        }
    }
}

/// The platform's remapping units. Units are added during boot, before any
/// device table is used.
pub static DMAR: Dmar = Dmar::new();
