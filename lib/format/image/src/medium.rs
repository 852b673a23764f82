//! Bounds-checked byte access over an in-memory firmware image.

use core::{error, fmt};

use conversion::{u64_to_usize, usize_to_u64};

/// Bounds-checked read access to a contiguous, immutable byte source.
///
/// The only implementor in this crate is `[u8]`; the image is always fully resident in
/// memory (see [`crate::Image`]), so unlike a general binary-format crate there is no need
/// for a generic backing-storage abstraction or an underlying-error variant.
pub(crate) trait Medium {
    /// Accesses `length` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MediumError::BoundsError`] if the requested region does not fit.
    fn access_slice(&self, offset: u64, length: u64) -> Result<&[u8], MediumError>;
}

impl Medium for [u8] {
    fn access_slice(&self, offset: u64, length: u64) -> Result<&[u8], MediumError> {
        let size = usize_to_u64(self.len());
        let end = offset.checked_add(length).ok_or(MediumError::BoundsError {
            offset,
            length,
            size,
        })?;
        if end > size {
            return Err(MediumError::BoundsError {
                offset,
                length,
                size,
            });
        }

        Ok(&self[u64_to_usize(offset)..u64_to_usize(end)])
    }
}

/// Errors that can occur reading from an [`Image`](crate::Image).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediumError {
    /// Requested region is outside the bounds of the image.
    BoundsError {
        /// The offset, in bytes, of the start of the requested region.
        offset: u64,
        /// The size, in bytes, of the requested region.
        length: u64,
        /// The actual size of the image.
        size: u64,
    },
}

impl fmt::Display for MediumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoundsError {
                offset,
                length,
                size,
            } => write!(
                f,
                "requested region at {offset} bytes with a length of {length} \
                does not fit inside image of {size} bytes"
            ),
        }
    }
}

impl error::Error for MediumError {}
