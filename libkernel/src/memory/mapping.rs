use super::{
    address::{PA, VA},
    attr::Attributes,
};

/// One translation: `2^order` bytes at `vaddr` backed by `paddr`.
///
/// Both bases are aligned to `2^order`. Mappings are plain values built per
/// delegation step; they are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub vaddr: VA,
    pub paddr: PA,
    pub attr: Attributes,
    pub order: usize,
}

impl Mapping {
    pub const fn new(vaddr: VA, paddr: PA, attr: Attributes, order: usize) -> Self {
        Self {
            vaddr,
            paddr,
            attr,
            order,
        }
    }

    /// A non-present mapping covering `2^order` bytes at `vaddr`.
    pub const fn absent(vaddr: VA, order: usize) -> Self {
        Self::new(vaddr, PA::null(), Attributes::empty(), order)
    }

    /// Size in bytes, or zero if the order does not fit the address width.
    pub const fn size(&self) -> usize {
        match 1usize.checked_shl(self.order as u32) {
            Some(size) => size,
            None => 0,
        }
    }

    pub fn present(&self) -> bool {
        self.attr.is_present() && self.size() != 0
    }

    /// Restricts the mapping to the aligned window `[base, base + 2^order)`.
    ///
    /// A mapping no larger than the window is returned unchanged; it must
    /// already lie inside the window. A larger mapping is cut down to the
    /// window, with the physical base advanced by the same offset.
    pub fn clamp(&self, base: VA, order: usize) -> Self {
        if self.order <= order {
            debug_assert!(
                base.align_down(order) == self.vaddr.align_down(order),
                "clamping {self:?} to a disjoint window {base:?}/{order}"
            );
            return *self;
        }

        let offset = base.value().wrapping_sub(self.vaddr.value());
        let paddr = if self.present() {
            self.paddr.add_bytes(offset)
        } else {
            PA::null()
        };

        Self::new(base, paddr, self.attr, order)
    }

    /// Shifts the virtual base by `delta` bytes (modulo the address width).
    ///
    /// Only the virtual side moves: the physical frames backing a delegated
    /// region stay where they are.
    pub fn move_by(&self, delta: usize) -> Self {
        Self::new(self.vaddr.add_bytes(delta), self.paddr, self.attr, self.order)
    }
}
