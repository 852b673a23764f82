//! Typed addresses for firmware images.
//!
//! A stripped Cortex-M image is addressed two ways at once: by its position in the file on
//! disk, and by the virtual address the processor sees once the image is loaded (and,
//! usually, rebased by some `app_code_base`). Mixing the two up is the easiest way to
//! misdecode a branch target, so [`FileOffset`] and [`VirtAddr`] are distinct types that do
//! not implicitly convert into one another.
#![no_std]

pub mod range;

pub use range::AddressRange;

/// Constructs a 32-bit address newtype with the arithmetic firmware analysis needs.
macro_rules! implement_address {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// The address `0`.
            pub const ZERO: Self = Self(0);

            /// Creates a new address with the given value.
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            /// Returns the underlying value of this address.
            pub const fn value(self) -> u32 {
                self.0
            }

            /// Returns a new address `count` bytes higher, or `None` on overflow.
            pub const fn checked_add(self, count: u32) -> Option<Self> {
                match self.0.checked_add(count) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }

            /// Returns a new address `count` bytes higher.
            ///
            /// # Panics
            ///
            /// Panics if the addition overflows.
            pub const fn strict_add(self, count: u32) -> Self {
                Self(self.0.strict_add(count))
            }

            /// Returns a new address `count` bytes lower, or `None` on underflow.
            pub const fn checked_sub(self, count: u32) -> Option<Self> {
                match self.0.checked_sub(count) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }

            /// Returns a new address `count` bytes lower.
            ///
            /// # Panics
            ///
            /// Panics if the subtraction underflows.
            pub const fn strict_sub(self, count: u32) -> Self {
                Self(self.0.strict_sub(count))
            }

            /// Returns the difference `self - other`, or `None` if `other` is greater.
            pub const fn checked_offset_from(self, other: Self) -> Option<u32> {
                self.0.checked_sub(other.0)
            }

            /// Returns `true` if this address is a multiple of `alignment`.
            ///
            /// `alignment` must be a power of two.
            pub const fn is_aligned(self, alignment: u32) -> bool {
                debug_assert!(alignment.is_power_of_two());
                self.0.is_multiple_of(alignment)
            }

            /// Returns the greatest address less than or equal to `self` that is a multiple of
            /// `alignment`.
            ///
            /// `alignment` must be a power of two.
            pub const fn align_down(self, alignment: u32) -> Self {
                debug_assert!(alignment.is_power_of_two());
                Self((self.0 / alignment) * alignment)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

implement_address!(
    FileOffset,
    "A byte offset into the firmware image as it sits on disk."
);
implement_address!(
    VirtAddr,
    "A Thumb virtual address as seen by the processor (bit 0 is the Thumb marker on code \
     pointers pulled from the vector table, but is stripped once stored here)."
);

impl VirtAddr {
    /// Clears the Thumb bit (bit 0) from a raw vector-table or `BLX`/`BX` target value.
    pub const fn from_thumb_pointer(raw: u32) -> Self {
        Self::new(raw & !1)
    }

    /// Returns `true` if the raw pointer value had the Thumb bit set.
    pub const fn is_thumb_pointer(raw: u32) -> bool {
        raw & 1 != 0
    }
}

#[cfg(test)]
mod test {
    use super::{FileOffset, VirtAddr};

    #[test]
    fn thumb_bit_is_stripped() {
        assert_eq!(VirtAddr::from_thumb_pointer(0x0800_1235).value(), 0x0800_1234);
        assert!(VirtAddr::is_thumb_pointer(0x0800_1235));
        assert!(!VirtAddr::is_thumb_pointer(0x0800_1234));
    }

    #[test]
    fn align_down_rounds_toward_zero() {
        assert_eq!(VirtAddr::new(0x1003).align_down(4), VirtAddr::new(0x1000));
        assert!(VirtAddr::new(0x1000).is_aligned(4));
        assert!(!VirtAddr::new(0x1002).is_aligned(4));
    }

    #[test]
    fn checked_add_detects_overflow() {
        assert_eq!(FileOffset::new(u32::MAX).checked_add(1), None);
        assert_eq!(
            FileOffset::new(0x10).checked_add(4),
            Some(FileOffset::new(0x14))
        );
    }

    #[test]
    fn offset_from_rejects_negative_distance() {
        let a = VirtAddr::new(0x100);
        let b = VirtAddr::new(0x200);
        assert_eq!(b.checked_offset_from(a), Some(0x100));
        assert_eq!(a.checked_offset_from(b), None);
    }
}
