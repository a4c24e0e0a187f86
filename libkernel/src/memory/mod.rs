pub mod address;
pub mod attr;
pub mod cleanup;
pub mod mapping;
pub mod pg_tables;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// First address that is not available to user mappings (the lower canonical
/// half of a 48-bit address space).
pub const USER_ADDR: usize = 1 << 47;

/// Order of the largest naturally aligned block that starts at `addr` and
/// does not extend past `size` bytes.
///
/// `addr == 0` is aligned to any order, so only `size` limits the result. A
/// zero `size` yields order zero.
pub const fn max_order(addr: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }

    let by_size = (usize::BITS - 1 - size.leading_zeros()) as usize;
    let by_align = addr.trailing_zeros() as usize;

    if by_align < by_size { by_align } else { by_size }
}
