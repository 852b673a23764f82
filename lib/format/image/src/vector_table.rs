//! Vector Table Reader (pipeline stage 1): parses and validates the fixed Cortex-M core
//! exception table at the start of the image.

use core::{error, fmt};

use address::{FileOffset, VirtAddr};

use crate::{
    Image,
    medium::MediumError,
    raw::{CORTEX_M_VECTOR_SLOTS, VectorSlot},
};

/// The byte size of the fixed, vendor-independent portion of the vector table (15 words:
/// `initial_sp`, `reset`, and 13 further slots including reserved ones).
pub const MIN_VECTOR_TABLE_BYTES: u32 = 60;

/// The parsed, validated core exception table.
///
/// `SysTick` and every external interrupt handler (offset `0x3C` onward) are not represented
/// here: their count is vendor-specific and is only established by the Vector Table Sizer,
/// which reads them directly from the [`Image`] once it knows how far to scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorTable {
    initial_sp: u32,
    reset: VirtAddr,
    nmi: Option<VirtAddr>,
    hard_fault: Option<VirtAddr>,
    mem_manage: Option<VirtAddr>,
    bus_fault: Option<VirtAddr>,
    usage_fault: Option<VirtAddr>,
    sv_call: Option<VirtAddr>,
    debug_monitor: Option<VirtAddr>,
    pend_sv: Option<VirtAddr>,
}

impl VectorTable {
    /// Returns the initial stack pointer value.
    pub const fn initial_sp(&self) -> u32 {
        self.initial_sp
    }

    /// Returns the reset handler address, with the Thumb bit stripped.
    pub const fn reset(&self) -> VirtAddr {
        self.reset
    }

    /// Returns the handler address for `slot`, or `None` if the slot is unused (zero) or not
    /// part of the fixed table (e.g. external interrupts).
    pub const fn handler(&self, slot: VectorSlot) -> Option<VirtAddr> {
        match slot {
            VectorSlot::InitialSp => None,
            VectorSlot::Reset => Some(self.reset),
            VectorSlot::Nmi => self.nmi,
            VectorSlot::HardFault => self.hard_fault,
            VectorSlot::MemManage => self.mem_manage,
            VectorSlot::BusFault => self.bus_fault,
            VectorSlot::UsageFault => self.usage_fault,
            VectorSlot::SvCall => self.sv_call,
            VectorSlot::DebugMonitor => self.debug_monitor,
            VectorSlot::PendSv => self.pend_sv,
        }
    }

    /// Returns every non-`initial_sp`, non-`reset` handler address present in the table, in
    /// slot order.
    ///
    /// This is exactly the "interrupt-handler addresses" collection the code-base estimator
    /// needs (spec step 4.2.1): every present core handler except the three that are excluded
    /// because they are either the stack pointer (not a code address at all) or too easily
    /// confused with ordinary code addresses.
    pub fn interrupt_handler_addresses(&self) -> impl Iterator<Item = VirtAddr> {
        [
            self.nmi,
            self.hard_fault,
            self.mem_manage,
            self.bus_fault,
            self.usage_fault,
            self.sv_call,
            self.debug_monitor,
            self.pend_sv,
        ]
        .into_iter()
        .flatten()
    }
}

/// Errors returned by [`read_vector_table`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorTableError {
    /// Reading one of the fixed vector-table words went out of the image's bounds.
    OutOfBounds(MediumError),
    /// `initial_sp` was odd or zero.
    InvalidInitialSp(u32),
    /// `reset` was even (no Thumb bit) or zero.
    InvalidReset(u32),
    /// A present handler (nonzero) did not have its Thumb bit set.
    InvalidHandler { slot: VectorSlot, value: u32 },
}

impl fmt::Display for VectorTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds(error) => write!(f, "vector table read out of bounds: {error}"),
            Self::InvalidInitialSp(value) => {
                write!(f, "initial_sp {value:#010x} is not even and nonzero")
            }
            Self::InvalidReset(value) => {
                write!(f, "reset handler {value:#010x} is not odd and nonzero")
            }
            Self::InvalidHandler { slot, value } => {
                write!(f, "handler {slot:?} {value:#010x} is nonzero but not odd")
            }
        }
    }
}

impl error::Error for VectorTableError {}

impl From<MediumError> for VectorTableError {
    fn from(value: MediumError) -> Self {
        Self::OutOfBounds(value)
    }
}

/// Reads and validates the fixed core exception table starting at file offset 0 of `image`.
///
/// Per spec: `initial_sp` must be even and nonzero; `reset` must be odd and nonzero; every
/// other present handler must be odd (zero means "unused" and is skipped, not rejected). The
/// Thumb bit is stripped from every handler address before it is stored.
///
/// # Errors
///
/// Returns [`VectorTableError`] if any of the above invariants is violated, or if the table
/// does not fit within the image.
pub fn read_vector_table(image: &Image<'_>) -> Result<VectorTable, VectorTableError> {
    let mut words = [0u32; CORTEX_M_VECTOR_SLOTS.len()];
    for (descriptor, word) in CORTEX_M_VECTOR_SLOTS.iter().zip(words.iter_mut()) {
        *word = image.read_u32(FileOffset::new(descriptor.byte_offset))?;
    }

    let initial_sp = slot_value(&words, VectorSlot::InitialSp);
    if initial_sp == 0 || !initial_sp.is_multiple_of(2) {
        return Err(VectorTableError::InvalidInitialSp(initial_sp));
    }

    let reset_raw = slot_value(&words, VectorSlot::Reset);
    if reset_raw == 0 || !VirtAddr::is_thumb_pointer(reset_raw) {
        return Err(VectorTableError::InvalidReset(reset_raw));
    }

    let mut handler = |slot: VectorSlot| -> Result<Option<VirtAddr>, VectorTableError> {
        let raw = slot_value(&words, slot);
        if raw == 0 {
            return Ok(None);
        }
        if !VirtAddr::is_thumb_pointer(raw) {
            return Err(VectorTableError::InvalidHandler { slot, value: raw });
        }
        Ok(Some(VirtAddr::from_thumb_pointer(raw)))
    };

    Ok(VectorTable {
        initial_sp,
        reset: VirtAddr::from_thumb_pointer(reset_raw),
        nmi: handler(VectorSlot::Nmi)?,
        hard_fault: handler(VectorSlot::HardFault)?,
        mem_manage: handler(VectorSlot::MemManage)?,
        bus_fault: handler(VectorSlot::BusFault)?,
        usage_fault: handler(VectorSlot::UsageFault)?,
        sv_call: handler(VectorSlot::SvCall)?,
        debug_monitor: handler(VectorSlot::DebugMonitor)?,
        pend_sv: handler(VectorSlot::PendSv)?,
    })
}

fn slot_value(words: &[u32], slot: VectorSlot) -> u32 {
    let index = CORTEX_M_VECTOR_SLOTS
        .iter()
        .position(|descriptor| descriptor.name == slot)
        .expect("every VectorSlot variant has a CORTEX_M_VECTOR_SLOTS entry");
    words[index]
}

#[cfg(test)]
mod test {
    use address::{FileOffset, VirtAddr};

    use super::{VectorTableError, read_vector_table};
    use crate::Image;

    fn build_image(initial_sp: u32, reset: u32, handlers: &[(u32, u32)]) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..4].copy_from_slice(&initial_sp.to_le_bytes());
        bytes[4..8].copy_from_slice(&reset.to_le_bytes());
        for &(offset, value) in handlers {
            let start = usize::try_from(offset).unwrap();
            bytes[start..start + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn valid_table_strips_thumb_bit() {
        let bytes = build_image(0x2000_0400, 0x0800_0101, &[(0x0C, 0x0800_0121)]);
        let image = Image::new(&bytes);

        let table = read_vector_table(&image).unwrap();
        assert_eq!(table.initial_sp(), 0x2000_0400);
        assert_eq!(table.reset(), VirtAddr::new(0x0800_0100));
        assert_eq!(
            table.handler(crate::raw::VectorSlot::HardFault),
            Some(VirtAddr::new(0x0800_0120))
        );
    }

    #[test]
    fn odd_initial_sp_is_rejected() {
        let bytes = build_image(0x2000_0401, 0x0800_0101, &[]);
        let image = Image::new(&bytes);

        assert!(matches!(
            read_vector_table(&image),
            Err(VectorTableError::InvalidInitialSp(_))
        ));
    }

    #[test]
    fn even_reset_is_rejected() {
        let bytes = build_image(0x2000_0400, 0x0800_0100, &[]);
        let image = Image::new(&bytes);

        assert!(matches!(
            read_vector_table(&image),
            Err(VectorTableError::InvalidReset(_))
        ));
    }

    #[test]
    fn zero_handler_is_skipped_not_rejected() {
        let bytes = build_image(0x2000_0400, 0x0800_0101, &[]);
        let image = Image::new(&bytes);

        let table = read_vector_table(&image).unwrap();
        assert_eq!(table.handler(crate::raw::VectorSlot::Nmi), None);
    }

    #[test]
    fn out_of_bounds_image_is_an_error() {
        let bytes = [0u8; 10];
        let image = Image::new(&bytes);

        assert!(matches!(
            read_vector_table(&image),
            Err(VectorTableError::OutOfBounds(_))
        ));
    }

    #[test]
    fn file_offset_helper_is_reachable() {
        // exercised indirectly via read_vector_table; kept to document the slot-offset table
        // stays in sync with MIN_VECTOR_TABLE_BYTES.
        assert_eq!(super::MIN_VECTOR_TABLE_BYTES, 60);
        let _ = FileOffset::ZERO;
    }
}
