//! The `image` crate provides bounds-checked read access to a firmware image and parses its
//! Cortex-M vector table.
//!
//! # Capabilities
//!
//! ## Works in `no_std` environments
//!
//! This crate does not allocate or use any `std` features, so it can be used in `no_std`
//! contexts.
//!
//! ## Zero-copy parsing
//!
//! The image is held as a single borrowed byte slice; every read returns sub-slices or
//! decoded scalars without copying the backing bytes.
//!
//! ## Uses no unsafe code
//!
//! This crate contains zero unsafe blocks of code.
#![no_std]

use address::{AddressRange, FileOffset, VirtAddr};
use conversion::{u32_to_usize, usize_to_u32_truncating, usize_to_u64};

pub mod medium;
pub mod raw;
pub mod vector_table;

use medium::{Medium, MediumError};

/// A firmware image held entirely in memory, addressed by [`FileOffset`].
///
/// The image has no declared load address and no section headers; stage 2 of the pipeline
/// (the code-base estimator, implemented in the `thumbtrace` crate) is what eventually
/// assigns file offsets a meaning in the virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Image<'slice> {
    bytes: &'slice [u8],
}

impl<'slice> Image<'slice> {
    /// Wraps `bytes` as an [`Image`].
    pub const fn new(bytes: &'slice [u8]) -> Self {
        Self { bytes }
    }

    /// Returns the number of bytes in the image.
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the image is empty.
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the full backing slice.
    pub const fn as_slice(&self) -> &'slice [u8] {
        self.bytes
    }

    /// Returns `true` if `offset` addresses a byte within the image.
    pub fn contains(&self, offset: FileOffset) -> bool {
        u32_to_usize(offset.value()) < self.bytes.len()
    }

    /// Reads `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MediumError::BoundsError`] if the requested region does not fit in the image.
    pub fn read_slice(
        &self,
        offset: FileOffset,
        length: usize,
    ) -> Result<&'slice [u8], MediumError> {
        Medium::access_slice(
            self.bytes,
            u64::from(offset.value()),
            usize_to_u64(length),
        )
    }

    /// Reads a little-endian `u16` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MediumError::BoundsError`] if the two bytes do not fit in the image.
    pub fn read_u16(&self, offset: FileOffset) -> Result<u16, MediumError> {
        let slice = self.read_slice(offset, 2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    /// Reads a little-endian `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MediumError::BoundsError`] if the four bytes do not fit in the image.
    pub fn read_u32(&self, offset: FileOffset) -> Result<u32, MediumError> {
        let slice = self.read_slice(offset, 4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    /// Reads a big-endian `u32` at `offset`.
    ///
    /// The original data-segment discovery heuristic reads its `.data` source words
    /// big-endian (it treats the four bytes as if assembling a display value, not a decoded
    /// instruction operand); kept here for parity.
    ///
    /// # Errors
    ///
    /// Returns [`MediumError::BoundsError`] if the four bytes do not fit in the image.
    pub fn read_u32_be(&self, offset: FileOffset) -> Result<u32, MediumError> {
        let slice = self.read_slice(offset, 4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    /// Returns the file-offset range covered by this image, `[0, len)`.
    pub fn full_range(&self) -> AddressRange<FileOffset> {
        AddressRange::new(
            FileOffset::ZERO,
            FileOffset::new(usize_to_u32_truncating(self.bytes.len())),
        )
    }
}

#[cfg(test)]
mod test {
    use address::FileOffset;

    use super::Image;

    #[test]
    fn reads_are_little_endian_by_default() {
        let bytes = [0x00, 0x10, 0x00, 0x20, 0x01, 0x00, 0x00, 0x08];
        let image = Image::new(&bytes);

        assert_eq!(image.read_u32(FileOffset::ZERO).unwrap(), 0x2000_1000);
        assert_eq!(image.read_u32(FileOffset::new(4)).unwrap(), 0x0800_0001);
    }

    #[test]
    fn out_of_bounds_read_is_an_error() {
        let bytes = [0u8; 4];
        let image = Image::new(&bytes);

        assert!(image.read_u32(FileOffset::new(2)).is_err());
        assert!(image.read_u32(FileOffset::new(4)).is_err());
    }

    #[test]
    fn contains_respects_image_length() {
        let bytes = [0u8; 8];
        let image = Image::new(&bytes);

        assert!(image.contains(FileOffset::new(7)));
        assert!(!image.contains(FileOffset::new(8)));
    }
}

/// Converts a raw vector-table pointer value (which may carry the Thumb bit) into the
/// [`VirtAddr`] it addresses.
pub fn pointer_to_virt_addr(raw: u32) -> VirtAddr {
    VirtAddr::from_thumb_pointer(raw)
}
