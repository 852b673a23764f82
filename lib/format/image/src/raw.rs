//! Raw byte layout of the Cortex-M vector table.
#![expect(missing_docs, reason = "no need to document raw definitions")]

/// One entry in the fixed, vendor-independent portion of the Cortex-M vector table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorSlotDescriptor {
    pub name: VectorSlot,
    pub byte_offset: u32,
    /// `true` if the slot is only meaningful on ARMv7-M (e.g. `MemManage`); on ARMv6-M the
    /// bytes at this offset are reserved and read back as zero.
    pub armv7m_only: bool,
}

/// The name of a Cortex-M vector-table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[expect(missing_docs, reason = "slot names are self-explanatory")]
pub enum VectorSlot {
    InitialSp,
    Reset,
    Nmi,
    HardFault,
    MemManage,
    BusFault,
    UsageFault,
    SvCall,
    DebugMonitor,
    PendSv,
}

/// The classic Cortex-M0/M0+/M3/M4 core exception table, in byte-offset order.
///
/// This covers exactly the fixed 15 words (`0x00..0x3C`) the Vector Table Reader validates.
/// `SysTick` and every vendor IRQ slot from offset `0x3C` onward are not modeled here: they
/// carry no fixed meaning this crate can use and are left to the pipeline's Vector Table
/// Sizer, which scans them directly from the image once it knows where the fixed table ends.
pub const CORTEX_M_VECTOR_SLOTS: &[VectorSlotDescriptor] = &[
    VectorSlotDescriptor {
        name: VectorSlot::InitialSp,
        byte_offset: 0x00,
        armv7m_only: false,
    },
    VectorSlotDescriptor {
        name: VectorSlot::Reset,
        byte_offset: 0x04,
        armv7m_only: false,
    },
    VectorSlotDescriptor {
        name: VectorSlot::Nmi,
        byte_offset: 0x08,
        armv7m_only: false,
    },
    VectorSlotDescriptor {
        name: VectorSlot::HardFault,
        byte_offset: 0x0C,
        armv7m_only: false,
    },
    VectorSlotDescriptor {
        name: VectorSlot::MemManage,
        byte_offset: 0x10,
        armv7m_only: true,
    },
    VectorSlotDescriptor {
        name: VectorSlot::BusFault,
        byte_offset: 0x14,
        armv7m_only: true,
    },
    VectorSlotDescriptor {
        name: VectorSlot::UsageFault,
        byte_offset: 0x18,
        armv7m_only: true,
    },
    VectorSlotDescriptor {
        name: VectorSlot::SvCall,
        byte_offset: 0x2C,
        armv7m_only: false,
    },
    VectorSlotDescriptor {
        name: VectorSlot::DebugMonitor,
        byte_offset: 0x30,
        armv7m_only: true,
    },
    VectorSlotDescriptor {
        name: VectorSlot::PendSv,
        byte_offset: 0x38,
        armv7m_only: false,
    },
];
