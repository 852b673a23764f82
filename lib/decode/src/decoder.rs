//! The thin adapter the pipeline decodes instructions through.

use crate::instruction::DecodedInstruction;

/// An error produced while decoding a single instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than 2 bytes were available at the decode point.
    Truncated,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "fewer than 2 bytes remained at the decode point"),
        }
    }
}

impl core::error::Error for DecodeError {}

/// Decodes one instruction from a byte stream.
///
/// Implemented by the concrete Thumb/Thumb-2 decoder in this crate, and by synthetic
/// decoders in the pipeline's own test suite, so the pipeline never depends on the
/// concrete decoder directly.
pub trait Decoder {
    /// Decodes the instruction at the start of `bytes`.
    ///
    /// `bytes` is the remaining slice of the image from the current decode point onward;
    /// implementations read only as many bytes as [`DecodedInstruction::length`] reports
    /// consuming. Returns [`DecodeError::Truncated`] if fewer than 2 bytes remain.
    fn decode(&self, bytes: &[u8]) -> Result<DecodedInstruction, DecodeError>;
}
