//! Thumb/Thumb-2 instruction decoding.
//!
//! Exposes a concrete decoder ([`thumb::ThumbDecoder`]) behind a thin adapter trait
//! ([`decoder::Decoder`]), so that consumers can swap in a synthetic decoder for testing
//! without depending on the real instruction set.
#![no_std]

pub mod condition;
pub mod decoder;
pub mod instruction;
pub mod opcode;
pub mod operand;
pub mod register;
pub mod thumb;

pub use condition::Condition;
pub use decoder::{DecodeError, Decoder};
pub use instruction::{DecodedInstruction, OperandList, MAX_OPERANDS};
pub use opcode::Opcode;
pub use operand::Operand;
pub use register::Register;
pub use thumb::ThumbDecoder;
