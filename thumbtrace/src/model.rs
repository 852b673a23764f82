//! The pipeline's artifacts: the disassembly map and everything built on top of it.

use std::collections::{BTreeMap, BTreeSet};

use address::VirtAddr;
use decode::{DecodedInstruction, Register};

/// Maximum encoded instruction length this crate's decoder ever produces.
const MAX_RAW_BYTES: usize = 4;

/// The raw bytes a [`DecodedSlot`] was decoded from (or, for a data slot, simply holds).
///
/// Kept so that re-decoding a data slot in isolation (Testable Property 7) and re-decoding
/// the tail of a table-removal split both work from the same bytes that were originally
/// read, rather than re-reading the image a second time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBytes {
    bytes: [u8; MAX_RAW_BYTES],
    len: u8,
}

impl RawBytes {
    /// Captures up to [`MAX_RAW_BYTES`] bytes from `slice`.
    ///
    /// # Panics
    ///
    /// Panics if `slice` is longer than [`MAX_RAW_BYTES`]; every caller in this crate slices
    /// to an instruction's own decoded length first.
    pub fn from_slice(slice: &[u8]) -> Self {
        assert!(slice.len() <= MAX_RAW_BYTES, "raw slot is never longer than 4 bytes");
        let mut bytes = [0u8; MAX_RAW_BYTES];
        bytes[..slice.len()].copy_from_slice(slice);
        Self {
            bytes,
            len: u8::try_from(slice.len()).expect("checked above"),
        }
    }

    /// Returns the captured bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

/// One entry of the [`DisassemblyMap`], keyed by virtual address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSlot {
    /// The decoded instruction, or `None` if this slot is data or was never a decode head.
    pub insn: Option<DecodedInstruction>,
    /// `true` if this slot has been classified as inline data.
    pub is_data: bool,
    /// Addresses of branches whose resolved target is this slot.
    pub xref_from: BTreeSet<VirtAddr>,
    /// The most recent non-NOP, non-self-MOV, valid-code instruction preceding this one.
    pub last_insn_address: Option<VirtAddr>,
    /// The raw bytes this slot occupies.
    pub raw_bytes: RawBytes,
}

impl DecodedSlot {
    /// Builds a code slot from a freshly decoded instruction.
    pub fn code(insn: DecodedInstruction, raw_bytes: RawBytes) -> Self {
        Self {
            insn: Some(insn),
            is_data: false,
            xref_from: BTreeSet::new(),
            last_insn_address: None,
            raw_bytes,
        }
    }

    /// Marks this slot as data, dropping any previously decoded instruction.
    pub fn mark_data(&mut self) {
        self.insn = None;
        self.is_data = true;
    }
}

/// Ordered mapping from virtual address to the slot occupying it.
pub type DisassemblyMap = BTreeMap<VirtAddr, DecodedSlot>;

/// The GNU thumb helper subtype, selected by the first load opcode seen in its body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GnuCaseSubtype {
    /// `case_sqi`: signed byte entries (`LDRSB`).
    CaseSqi,
    /// `case_uqi`: unsigned byte entries (`LDRB`).
    CaseUqi,
    /// `case_shi`: signed halfword entries (`LDRSH`).
    CaseShi,
    /// `case_uhi`: unsigned halfword entries (`LDRH`).
    CaseUhi,
    /// `case_si`: word entries (`LDR`).
    CaseSi,
}

impl GnuCaseSubtype {
    /// The byte width of one table entry for this subtype.
    pub const fn entry_width(self) -> u32 {
        match self {
            Self::CaseSqi | Self::CaseUqi => 1,
            Self::CaseShi | Self::CaseUhi => 2,
            Self::CaseSi => 4,
        }
    }

    /// `true` if table entries are sign-extended before use.
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::CaseSqi | Self::CaseShi)
    }
}

/// The kind of recognized helper function an entry in [`ReplaceFunctions`] points to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperKind {
    /// `__ARM_common_switch8`.
    ArmSwitch8,
    /// A `__gnu_thumb1_case_*` variant.
    GnuThumbCase(GnuCaseSubtype),
}

/// Mapping from the entry address of a recognized helper function to its kind.
pub type ReplaceFunctions = BTreeMap<VirtAddr, HelperKind>;

/// The kind of switch-dispatch idiom a [`SwitchRecord`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchKind {
    /// A call to `__ARM_common_switch8`.
    ArmSwitch8,
    /// A call to a `__gnu_thumb1_case_*` helper.
    GnuThumbCase(GnuCaseSubtype),
    /// A `TBB` (byte entries) or `TBH` (halfword entries) instruction.
    TableBranch {
        /// `true` for `TBH`, `false` for `TBB`.
        halfword: bool,
    },
    /// A PC-writing arithmetic instruction preceded by a range check, resolved with the
    /// help of a [`crate::tracer::StrandTracer`].
    PcSwitch,
}

/// One recognized switch-dispatch site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchRecord {
    /// The address of the dispatching instruction (the `BL`, `TBB`/`TBH`, or PC-write).
    pub dispatch_address: VirtAddr,
    /// The kind of dispatch idiom this record describes.
    pub kind: DispatchKind,
    /// The first address of the jump table (inclusive).
    pub table_start: VirtAddr,
    /// The address one past the last byte of the jump table (exclusive).
    pub table_end: VirtAddr,
    /// Every branch target the table resolves to, in table order.
    pub targets: Vec<VirtAddr>,
    /// The immediate value the gating `CMP` compared against.
    pub comparison_value: u32,
    /// The register the gating `CMP` inspected.
    pub comparison_register: Register,
    /// The address of the gating `CMP`.
    pub comparison_address: VirtAddr,
    /// The address of the conditional branch gating the dispatch.
    pub conditional_branch_address: VirtAddr,
}

/// RAM address to big-endian 32-bit word, populated from the `.data` image discovered via
/// the reset handler.
pub type DataRegion = BTreeMap<u32, u32>;

/// The RAM/file-offset pair at which the `.data` segment begins, as discovered by the
/// reset-handler data-discovery pass.
///
/// Kept distinct from the flat [`DataRegion`] map because the base address itself is
/// load-bearing for any consumer that wants to reconstruct initial RAM contents, and is
/// otherwise lost once the map is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataSegment {
    /// The runtime RAM address `.data` is copied to.
    pub ram_start: u32,
    /// The virtual address in the image the initializer bytes are copied from.
    pub file_start: VirtAddr,
}

/// The detected Cortex-M architecture variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    /// No ARMv7-M-only opcode (`UDIV`, `TBB`, `TBH`) was observed in the code region.
    ArmV6M,
    /// At least one ARMv7-M-only opcode was observed in the code region.
    ArmV7M,
}

/// Every artifact the pipeline produces, frozen once stage 6 completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOutput {
    /// The fully annotated disassembly.
    pub disassembly: DisassemblyMap,
    /// Recognized switch-helper trampoline entry points.
    pub replace_functions: ReplaceFunctions,
    /// Every recognized switch-dispatch site.
    pub switches: Vec<SwitchRecord>,
    /// Reconstructed `.data` initializer words.
    pub data_region: DataRegion,
    /// The RAM/file-offset base of the `.data` segment, if discovered.
    pub data_segment: Option<DataSegment>,
    /// The first address of executable code (past the vector table).
    pub code_start_address: VirtAddr,
    /// The last address occupied by a decoded slot.
    pub code_end_address: VirtAddr,
    /// The estimated virtual address of file offset 0.
    pub app_code_base: u32,
    /// The size, in bytes, of the vector table (fixed portion plus scanned IRQ slots).
    pub vector_table_size: u32,
    /// Addresses of branches or loads that could not be resolved with confidence.
    pub errored_instructions: BTreeSet<VirtAddr>,
    /// The detected architecture variant.
    pub architecture: Architecture,
}
