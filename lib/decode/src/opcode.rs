//! Opcode identifiers.

/// The decoded opcode of a Thumb/Thumb-2 instruction.
///
/// Covers at minimum every mnemonic the pipeline's external interface requires, plus the
/// handful of additional mnemonics (`SUB`, `LSL`, `STR`, `STM`, `LDM`, `SVC`) needed to decode
/// a representative slice of real Cortex-M code without immediately falling back to
/// [`Opcode::Invalid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[expect(missing_docs, reason = "instruction mnemonics are self-explanatory")]
pub enum Opcode {
    B,
    Bl,
    Bx,
    Blx,
    It,
    Cmp,
    Ldr,
    Ldrb,
    Ldrh,
    Ldrsb,
    Ldrsh,
    Ldrd,
    Str,
    Strb,
    Strh,
    Strd,
    Adr,
    Add,
    Sub,
    Mov,
    Movt,
    Movw,
    Lsl,
    Lsr,
    Asr,
    Push,
    Pop,
    Nop,
    Cbz,
    Cbnz,
    Tbb,
    Tbh,
    Udiv,
    Ldm,
    Stm,
    Svc,
    /// A decodable-but-unallocated 16- or 32-bit encoding. Treated by the pipeline as a
    /// candidate data slot.
    Invalid,
    /// A single byte that did not even form a plausible instruction head (Capstone's
    /// `.byte` pseudo-mnemonic). Treated by the pipeline as an immediate soft error rather
    /// than silently reclassified as data.
    ByteLiteral,
}

impl Opcode {
    /// Returns `true` for any of the four control-flow-transfer mnemonics.
    pub const fn is_branch(self) -> bool {
        matches!(self, Self::B | Self::Bl | Self::Bx | Self::Blx)
    }

    /// Returns `true` for `BL`/`BLX` (the two mnemonics the cross-reference pass treats as
    /// calls rather than plain jumps).
    pub const fn is_call(self) -> bool {
        matches!(self, Self::Bl | Self::Blx)
    }
}
