use core::fmt;

macro_rules! define_address {
    ($(#[$outer:meta])* $name:ident, $prefix:literal) => {
        $(#[$outer])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_value(value: usize) -> Self {
                Self(value)
            }

            pub const fn null() -> Self {
                Self(0)
            }

            pub const fn value(self) -> usize {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            pub const fn add_bytes(self, bytes: usize) -> Self {
                Self(self.0.wrapping_add(bytes))
            }

            /// Returns `true` if the address is a multiple of `2^order`.
            pub const fn is_aligned(self, order: usize) -> bool {
                if order >= usize::BITS as usize {
                    self.0 == 0
                } else {
                    self.0 & ((1 << order) - 1) == 0
                }
            }

            pub const fn align_down(self, order: usize) -> Self {
                if order >= usize::BITS as usize {
                    Self(0)
                } else {
                    Self(self.0 & !((1 << order) - 1))
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{:#018x}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

define_address!(
    /// A physical address.
    PA,
    "PA"
);

define_address!(
    /// A virtual address. For guest and device tables this is the guest
    /// physical or I/O virtual address being translated.
    VA,
    "VA"
);

impl VA {
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_ptr_mut<T>(self) -> *mut T {
        self.0 as *mut T
    }
}
