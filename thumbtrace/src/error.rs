//! The pipeline's fatal error type.
//!
//! Soft failures (an unresolved branch target, an unreadable table byte) never reach this
//! type: they accumulate in [`crate::model::PipelineOutput::errored_instructions`] instead.
//! Warnings (several plausible code bases, an odd trailing table byte) are logged via the
//! `log` crate and never affect control flow.

use core::{error, fmt};

use address::VirtAddr;
use image::medium::MediumError;
use image::vector_table::VectorTableError;

/// A fatal condition that halts the pipeline before it can produce a [`crate::PipelineOutput`].
#[derive(Debug)]
pub enum Error {
    /// The image could not be read at a location the pipeline needed.
    UnreadableImage(MediumError),

    /// Vector table validation failed at every candidate base offset that was tried.
    VectorTableInvalid(VectorTableError),

    /// No candidate application code base placed the reset handler inside the image: every
    /// self-targeting-branch/interrupt-handler pairing was rejected, or none existed.
    CodeBaseUndetermined {
        /// The reset handler address from the vector table.
        reset: VirtAddr,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadableImage(error) => write!(f, "unable to read firmware image: {error}"),
            Self::VectorTableInvalid(error) => write!(f, "vector table failed validation: {error}"),
            Self::CodeBaseUndetermined { reset } => write!(
                f,
                "no application code base candidate places reset handler {reset} inside the image"
            ),
        }
    }
}

impl error::Error for Error {}

impl From<MediumError> for Error {
    fn from(value: MediumError) -> Self {
        Self::UnreadableImage(value)
    }
}

impl From<VectorTableError> for Error {
    fn from(value: VectorTableError) -> Self {
        Self::VectorTableInvalid(value)
    }
}
