use bitflags::bitflags;

bitflags! {
    /// Access rights carried by a memory capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemRights: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Cache policy of a mapping, using the x86 MTRR/PAT type encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Architecture-neutral attributes of a [`Mapping`](super::mapping::Mapping).
    ///
    /// The low bits follow the x86 host page-table layout. The memory type is
    /// kept in its own field (`MEMTYPE`) rather than in the PWT/PCD/PAT bits;
    /// each backend encodes it in its own way when the mapping is written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const PWT      = 1 << 3;
        const PCD      = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const PAT      = 1 << 7;
        const GLOBAL   = 1 << 8;
        /// The mapping may not be delegated to another domain.
        const NODELEG  = 1 << 9;
        const MEMTYPE  = 0b111 << 52;
        const NX       = 1 << 63;
    }
}

impl Attributes {
    pub const MEMTYPE_SHIFT: u32 = 52;

    /// Rights that survive a merge only if both sides carry them.
    const INTERSECT: Self = Self::PRESENT
        .union(Self::WRITE)
        .union(Self::USER)
        .union(Self::ACCESSED)
        .union(Self::DIRTY);

    /// Hardware attributes for a user mapping granting `rights`.
    ///
    /// Empty rights produce empty (non-present) attributes.
    pub fn from_rights(rights: MemRights) -> Self {
        if rights.is_empty() {
            return Self::empty();
        }

        let mut attr = Self::PRESENT | Self::USER | Self::ACCESSED | Self::DIRTY;

        if rights.contains(MemRights::WRITE) {
            attr |= Self::WRITE;
        }

        if !rights.contains(MemRights::EXECUTE) {
            attr |= Self::NX;
        }

        attr
    }

    pub fn rights(self) -> MemRights {
        if !self.is_present() {
            return MemRights::empty();
        }

        let mut rights = MemRights::READ;

        if self.contains(Self::WRITE) {
            rights |= MemRights::WRITE;
        }

        if !self.contains(Self::NX) {
            rights |= MemRights::EXECUTE;
        }

        rights
    }

    pub fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Narrows `self` to what `requested` allows.
    ///
    /// Either side being non-present yields empty attributes. Otherwise the
    /// permission bits are intersected, NX is the union, and the memory type
    /// is taken from `self`.
    pub fn merge(self, requested: Self) -> Self {
        if !self.is_present() || !requested.is_present() {
            return Self::empty();
        }

        (self & requested & Self::INTERSECT)
            | ((self | requested) & Self::NX)
            | (self & Self::MEMTYPE)
    }

    pub fn memory_type(self) -> MemoryType {
        let raw = ((self & Self::MEMTYPE).bits() >> Self::MEMTYPE_SHIFT) as u8;
        MemoryType::from_raw(raw).unwrap_or(MemoryType::Uncacheable)
    }

    pub fn with_memory_type(self, mt: MemoryType) -> Self {
        self.difference(Self::MEMTYPE)
            | Self::from_bits_retain((mt.as_raw() as u64) << Self::MEMTYPE_SHIFT)
    }

    /// Raw cache-control bits. Always empty for attributes produced by a
    /// lookup or a merge.
    pub fn cache_bits(self) -> Self {
        self & (Self::PWT | Self::PCD | Self::PAT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rights_round_trip_through_attributes() {
        for bits in 0..8u8 {
            let rights = MemRights::from_bits_truncate(bits);
            let attr = Attributes::from_rights(rights);

            if rights.is_empty() {
                assert!(attr.is_empty());
            } else {
                // Any non-empty right implies read access on x86.
                assert_eq!(attr.rights(), rights | MemRights::READ);
                assert!(attr.contains(Attributes::USER));
            }
        }
    }

    #[test]
    fn merge_never_widens_rights() {
        for src in 0..8u8 {
            for req in 0..8u8 {
                let src = Attributes::from_rights(MemRights::from_bits_truncate(src))
                    .with_memory_type(MemoryType::WriteBack);
                let req = Attributes::from_rights(MemRights::from_bits_truncate(req));
                let merged = src.merge(req);

                assert!(src.rights().contains(merged.rights()));
                assert!(req.rights().contains(merged.rights()));
                assert!(merged.cache_bits().is_empty());
            }
        }
    }

    #[test]
    fn merge_keeps_source_memory_type() {
        let src = Attributes::from_rights(MemRights::all()).with_memory_type(MemoryType::WriteCombining);
        let merged = src.merge(Attributes::from_rights(MemRights::READ));

        assert_eq!(merged.memory_type(), MemoryType::WriteCombining);
        assert!(!merged.contains(Attributes::WRITE));
        assert!(merged.contains(Attributes::NX));
    }

    #[test]
    fn merge_with_non_present_is_empty() {
        let src = Attributes::from_rights(MemRights::all());

        assert!(src.merge(Attributes::empty()).is_empty());
        assert!(Attributes::empty().merge(src).is_empty());
    }

    #[test]
    fn memory_type_field() {
        let attr = Attributes::PRESENT.with_memory_type(MemoryType::WriteBack);
        assert_eq!(attr.memory_type(), MemoryType::WriteBack);

        let attr = attr.with_memory_type(MemoryType::WriteThrough);
        assert_eq!(attr.memory_type(), MemoryType::WriteThrough);
        assert!(attr.is_present());

        assert_eq!(Attributes::empty().memory_type(), MemoryType::Uncacheable);
    }
}
