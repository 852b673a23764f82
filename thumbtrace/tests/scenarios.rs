//! Integration tests running the full pipeline end to end over small synthetic images,
//! mirroring the concrete scenarios this crate's heuristics are specified against.
//!
//! Unlike the per-stage unit tests colocated with each stage module, these build a whole
//! image byte-by-byte and drive it through [`thumbtrace::analyze`], so a regression that
//! only shows up from the interaction between stages (e.g. a code base the estimator
//! recovers but the sizer then misreads) has somewhere to surface.

use address::VirtAddr;
use decode::ThumbDecoder;
use image::Image;
use thumbtrace::model::{Architecture, DisassemblyMap};
use thumbtrace::tracer::{ConditionFlags, RegisterSnapshot};
use thumbtrace::{PipelineConfig, StrandTracer, analyze};

/// Surfaces the pipeline's `log` output under `RUST_LOG` when running these tests with
/// `--nocapture`; a no-op everywhere else. Safe to call more than once per test binary.
fn init_logging() {
    let _ = env_logger::try_init();
}

struct NullTracer;

impl StrandTracer for NullTracer {
    fn trace(
        &self,
        _disassembly: &DisassemblyMap,
        _start: VirtAddr,
        _stop_addresses: &[VirtAddr],
        _initial_registers: RegisterSnapshot,
        _initial_flags: ConditionFlags,
        _respect_path: bool,
    ) -> Option<RegisterSnapshot> {
        None
    }
}

/// Lays out a 0x130-byte image sharing S1/S2's vector table shape: `initial_sp` at 0x00,
/// `reset` at 0x04, six repeated handlers disclosing a default handler of `0x121` relative
/// to `base`, and a self-branch (`E7FE`) at file offset 0x120 confirming `base` as the code
/// base. `base` is added to every handler/reset value so the same layout can be replayed at
/// a nonzero code base (S2) without duplicating the byte-construction logic.
fn vector_table_image(base: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x130];
    bytes[0..4].copy_from_slice(&0x2000_0400u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&(base | 0x101).to_le_bytes());
    for offset in [0x0Cusize, 0x10, 0x14, 0x18, 0x2C, 0x30, 0x38] {
        bytes[offset..offset + 4].copy_from_slice(&(base | 0x121).to_le_bytes());
    }
    // Stops the Vector Table Sizer at its first scanned slot (0x3C) instead of letting it
    // walk all the way to the self-branch at 0x120.
    bytes[0x3C..0x40].copy_from_slice(&((base.wrapping_add(0x141)) | 1).to_le_bytes());
    bytes[0x120..0x122].copy_from_slice(&0xE7FEu16.to_le_bytes());
    // MOVS R0, #5 ; BX LR at the reset handler (file offset 0x100).
    bytes[0x100..0x102].copy_from_slice(&0x2005u16.to_le_bytes());
    bytes[0x102..0x104].copy_from_slice(&0x4770u16.to_le_bytes());
    bytes
}

/// S1: a zero-based image. The estimator must recover `app_code_base == 0` without any
/// relocation evidence beyond the self-branch/handler correlation.
#[test]
fn s1_zero_code_base_is_recovered() {
    init_logging();
    let bytes = vector_table_image(0);
    let image = Image::new(&bytes);
    let output = analyze(&image, &ThumbDecoder, &NullTracer, &PipelineConfig::default())
        .expect("vector table and code base are both well formed");

    assert_eq!(output.app_code_base, 0);
    assert_eq!(output.vector_table_size, 0x3C);
    assert!(output.disassembly.contains_key(&VirtAddr::new(0x100)));
    assert_eq!(output.architecture, Architecture::ArmV6M);
}

/// S2: the same image relocated to `app_code_base = 0x0800_0000`. Every handler and the
/// self-branch's *absolute* address move with it; the estimator must recover the nonzero
/// base from the same correlation it used for S1.
#[test]
fn s2_relocated_code_base_is_recovered() {
    init_logging();
    let base = 0x0800_0000;
    let bytes = vector_table_image(base);
    let image = Image::new(&bytes);
    let output = analyze(&image, &ThumbDecoder, &NullTracer, &PipelineConfig::default())
        .expect("vector table and code base are both well formed");

    assert_eq!(output.app_code_base, base);
    assert!(output.disassembly.contains_key(&VirtAddr::new(base + 0x100)));
}

/// A vector table whose `initial_sp` is zero fails validation outright (Invariant 8's
/// oddness check never even gets to run) and the pipeline reports it as fatal rather than
/// producing a partial result.
#[test]
fn malformed_vector_table_is_reported_as_a_fatal_error() {
    init_logging();
    let bytes = vec![0u8; 0x80];
    let image = Image::new(&bytes);

    let result = analyze(&image, &ThumbDecoder, &NullTracer, &PipelineConfig::default());

    assert!(matches!(result, Err(thumbtrace::Error::VectorTableInvalid(_))));
}

/// S6: `LDR R0, [PC, #4]` loads a literal that, once the Thumb bit is stripped, points at
/// a reachable code address, and a `BX R0` a few instructions later actually branches
/// through it. The loaded literal's *target* (not the pool slot holding it) is what the
/// inline-address pass reclassifies as data, per the scenario's own wording.
#[test]
fn s6_inline_literal_feeding_a_register_branch_is_marked_as_data() {
    init_logging();
    let mut bytes = vec![0u8; 0x20];
    // LDR R0, [PC, #4] at file offset 0 -> pool address = (0 + 4 aligned to 4) + 4 = 8.
    bytes[0..2].copy_from_slice(&0x4801u16.to_le_bytes());
    // NOP at file offset 2, so the lookahead doesn't see R0 clobbered before the BX.
    bytes[2..4].copy_from_slice(&0xBF00u16.to_le_bytes());
    // BX R0 at file offset 4, two decode heads after the LDR.
    bytes[4..6].copy_from_slice(&0x4700u16.to_le_bytes());
    // The literal: a Thumb pointer (bit 0 set) to 0x10, stored at the pool address.
    bytes[8..12].copy_from_slice(&0x11u32.to_le_bytes());
    // The landing site: BX LR, so nothing downstream looks like a dangling decode.
    bytes[0x10..0x12].copy_from_slice(&0x4770u16.to_le_bytes());

    let image = Image::new(&bytes);
    let mut disassembly = thumbtrace::stages::disassemble::linear_disassemble(&image, 0, &ThumbDecoder);

    // `reset_address` points outside the disassembly map, so the reset-handler `.data`
    // discovery pass (which also walks PC-relative loads) never touches this literal; only
    // the inline-address pass below is under test.
    let _ = thumbtrace::stages::data_code_separator::separate_data_and_code(
        &mut disassembly,
        &image,
        0,
        VirtAddr::new(0),
        VirtAddr::new(0x1000),
        0x2000_0400,
        &PipelineConfig::default(),
        &ThumbDecoder,
        &NullTracer,
    );

    assert!(disassembly[&VirtAddr::new(0x10)].is_data);
    assert!(disassembly[&VirtAddr::new(0x12)].is_data);
}
