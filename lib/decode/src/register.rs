//! Register identifiers.

/// A Thumb general-purpose register, including the three special aliases (`SP`, `LR`, `PC`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[expect(missing_docs, reason = "register names are self-explanatory")]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl Register {
    /// Decodes a 3-bit register field (`R0..R7` only).
    pub const fn from_bits3(bits: u16) -> Self {
        Self::from_bits4(bits & 0b111)
    }

    /// Decodes a 4-bit register field (`R0..R15`).
    pub const fn from_bits4(bits: u16) -> Self {
        match bits & 0b1111 {
            0 => Self::R0,
            1 => Self::R1,
            2 => Self::R2,
            3 => Self::R3,
            4 => Self::R4,
            5 => Self::R5,
            6 => Self::R6,
            7 => Self::R7,
            8 => Self::R8,
            9 => Self::R9,
            10 => Self::R10,
            11 => Self::R11,
            12 => Self::R12,
            13 => Self::Sp,
            14 => Self::Lr,
            _ => Self::Pc,
        }
    }

    /// Returns the architectural register number (`0..=15`).
    pub const fn number(self) -> u8 {
        match self {
            Self::R0 => 0,
            Self::R1 => 1,
            Self::R2 => 2,
            Self::R3 => 3,
            Self::R4 => 4,
            Self::R5 => 5,
            Self::R6 => 6,
            Self::R7 => 7,
            Self::R8 => 8,
            Self::R9 => 9,
            Self::R10 => 10,
            Self::R11 => 11,
            Self::R12 => 12,
            Self::Sp => 13,
            Self::Lr => 14,
            Self::Pc => 15,
        }
    }

    /// Returns `true` for `PC`.
    pub const fn is_pc(self) -> bool {
        matches!(self, Self::Pc)
    }

    /// Returns `true` for `LR`.
    pub const fn is_lr(self) -> bool {
        matches!(self, Self::Lr)
    }

    /// Returns `true` for `SP`.
    pub const fn is_sp(self) -> bool {
        matches!(self, Self::Sp)
    }
}

#[cfg(test)]
mod test {
    use super::Register;

    #[test]
    fn high_register_aliases_decode_correctly() {
        assert_eq!(Register::from_bits4(13), Register::Sp);
        assert_eq!(Register::from_bits4(14), Register::Lr);
        assert_eq!(Register::from_bits4(15), Register::Pc);
    }

    #[test]
    fn three_bit_field_wraps_into_low_half() {
        assert_eq!(Register::from_bits3(0b1_111), Register::R7);
    }
}
