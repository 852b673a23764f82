//! Pipeline stage 5: the Data/Code Separator.
//!
//! Runs, in order, the four sub-passes the original tool performs:
//! reset-handler `.data` discovery, switch-helper trampoline discovery, the main
//! instruction-by-instruction sweep (which resolves the three switch-dispatch idioms and
//! literal-pool loads), and finally the inline-address pass. Each later pass depends on data
//! slots the earlier ones marked, so the order is load-bearing.

use std::collections::BTreeSet;

use address::{FileOffset, VirtAddr};
use decode::{Condition, DecodedInstruction, Decoder, Opcode, Operand, Register};
use image::Image;
use image::medium::MediumError;

use crate::config::PipelineConfig;
use crate::model::{
    DataRegion, DataSegment, DecodedSlot, DispatchKind, DisassemblyMap, GnuCaseSubtype,
    HelperKind, RawBytes, ReplaceFunctions, SwitchRecord,
};
use crate::stages::util::{next_address, previous_address};
use crate::tracer::{ConditionFlags, RegisterSnapshot, StrandTracer};

/// Everything this stage produces on top of the disassembly map it mutates in place.
pub struct SeparatorOutput {
    /// Recognized switch-helper trampoline entry points.
    pub replace_functions: ReplaceFunctions,
    /// Every recognized switch-dispatch site.
    pub switches: Vec<SwitchRecord>,
    /// Reconstructed `.data` initializer words.
    pub data_region: DataRegion,
    /// The RAM/file-offset base of the `.data` segment, if discovered.
    pub data_segment: Option<DataSegment>,
    /// The last address occupied by code, as revised by this stage.
    pub code_end_address: VirtAddr,
    /// Addresses this stage could not resolve with confidence.
    pub errored_instructions: BTreeSet<VirtAddr>,
}

/// Runs the full Data/Code Separator over `disassembly`, mutating it in place.
#[expect(clippy::too_many_arguments, reason = "each sub-pass genuinely needs its own input")]
pub fn separate_data_and_code(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    code_start_address: VirtAddr,
    reset_address: VirtAddr,
    initial_sp: u32,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
    tracer: &dyn StrandTracer,
) -> SeparatorOutput {
    let mut errored_instructions = BTreeSet::new();

    let (data_segment, data_region, code_end_address) = discover_reset_handler_data(
        disassembly,
        image,
        app_code_base,
        code_start_address,
        reset_address,
        config,
        decoder,
    );

    let replace_functions =
        discover_switch_helpers(disassembly, code_start_address, code_end_address);

    let switches = sweep_main(
        disassembly,
        image,
        app_code_base,
        code_start_address,
        code_end_address,
        &replace_functions,
        initial_sp,
        config,
        decoder,
        tracer,
        &mut errored_instructions,
    );

    mark_inline_addresses(disassembly, image, app_code_base, code_start_address, code_end_address);

    SeparatorOutput {
        replace_functions,
        switches,
        data_region,
        data_segment,
        code_end_address,
        errored_instructions,
    }
}

// ---------------------------------------------------------------------------------------
// (a) Reset-handler `.data` discovery
// ---------------------------------------------------------------------------------------

#[expect(clippy::too_many_arguments, reason = "mirrors the caller's own argument set")]
fn discover_reset_handler_data(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    code_start_address: VirtAddr,
    reset_address: VirtAddr,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
) -> (Option<DataSegment>, DataRegion, VirtAddr) {
    let image_end = app_code_base.wrapping_add(conversion::usize_to_u32_truncating(image.len()));
    let mut address = reset_address;
    let mut data_start_firmware: Option<VirtAddr> = None;
    let mut data_start_real: Option<u32> = None;
    let mut scanned = 0usize;

    while scanned < config.max_reset_scan_instructions {
        let Some(slot) = disassembly.get(&address) else {
            break;
        };
        if slot.is_data {
            break;
        }
        let Some(insn) = slot.insn else { break };
        if insn.opcode == Opcode::Invalid {
            break;
        }

        if insn.opcode == Opcode::B
            && insn.condition.is_always()
            && let Some(Operand::Immediate(offset)) = insn.operands.as_slice().first()
            && address.value().wrapping_add(4).wrapping_add_signed(*offset) == address.value()
        {
            break;
        }

        if let Some(pool_address) = pc_relative_word_load(&insn, address) {
            mark_data_and_redecode(disassembly, image, app_code_base, decoder, pool_address, 4);
            let offset = pool_address.value().wrapping_sub(app_code_base);
            if let Ok(loaded) = image.read_u32(FileOffset::new(offset)) {
                if loaded >= app_code_base && loaded < image_end {
                    let keep_existing =
                        data_start_firmware.is_some_and(|existing| existing.value() >= loaded);
                    if !keep_existing {
                        data_start_firmware = Some(VirtAddr::new(loaded));
                    }
                } else if data_start_firmware.is_some() {
                    data_start_real = Some(loaded);
                }
            }
        }

        if data_start_firmware.is_some() && data_start_real.is_some() {
            break;
        }

        scanned += 1;
        let Some(next) = next_address(disassembly, address) else { break };
        address = next;
    }

    let Some(data_start_firmware) = data_start_firmware else {
        let code_end = disassembly.keys().next_back().copied().unwrap_or(code_start_address);
        return (None, DataRegion::new(), code_end);
    };

    let image_end_addr = VirtAddr::new(image_end);
    let mut cursor = data_start_firmware;
    while cursor.value() < image_end_addr.value() {
        mark_one_data_slot(disassembly, image, app_code_base, cursor);
        cursor = cursor.strict_add(2);
    }

    let data_region = data_start_real
        .map(|ram_start| {
            build_data_region(image, app_code_base, data_start_firmware, image_end_addr, ram_start)
        })
        .unwrap_or_default();
    let data_segment = data_start_real.map(|ram_start| DataSegment {
        ram_start,
        file_start: data_start_firmware,
    });
    let code_end_address =
        previous_address(disassembly, data_start_firmware).unwrap_or(code_start_address);

    (data_segment, data_region, code_end_address)
}

fn pc_relative_word_load(insn: &DecodedInstruction, address: VirtAddr) -> Option<VirtAddr> {
    if insn.opcode != Opcode::Ldr {
        return None;
    }
    let Some(Operand::Memory {
        base: Register::Pc,
        displacement,
        ..
    }) = insn.operands.as_slice().get(1)
    else {
        return None;
    };
    let pc = address.strict_add(4).align_down(4);
    Some(VirtAddr::new(pc.value().wrapping_add_signed(*displacement)))
}

fn build_data_region(
    image: &Image<'_>,
    app_code_base: u32,
    data_start_firmware: VirtAddr,
    image_end: VirtAddr,
    ram_start: u32,
) -> DataRegion {
    let mut region = DataRegion::new();
    let byte_len = image_end.value().saturating_sub(data_start_firmware.value());
    let word_count = byte_len / 4;
    let ram_base = (ram_start / 4) * 4;
    let file_base = data_start_firmware.value().wrapping_sub(app_code_base);

    for i in 0..word_count {
        let file_offset = file_base.wrapping_add(i * 4);
        let Ok(word) = image.read_u32_be(FileOffset::new(file_offset)) else {
            break;
        };
        region.insert(ram_base.wrapping_add(i * 4), word);
    }

    region
}

// ---------------------------------------------------------------------------------------
// (b) Switch-helper discovery
// ---------------------------------------------------------------------------------------

fn discover_switch_helpers(
    disassembly: &DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) -> ReplaceFunctions {
    let mut replace_functions = ReplaceFunctions::new();

    if let Some(address) =
        find_arm_switch8_prologue(disassembly, code_start_address, code_end_address)
    {
        replace_functions.insert(address, HelperKind::ArmSwitch8);
    }

    if let Some((address, subtype)) =
        find_gnu_thumb_prologue(disassembly, code_start_address, code_end_address)
    {
        replace_functions.insert(address, HelperKind::GnuThumbCase(subtype));
    }

    replace_functions
}

fn find_arm_switch8_prologue(
    disassembly: &DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) -> Option<VirtAddr> {
    let mut cursor = Some(code_start_address);
    while let Some(address) = cursor {
        if address > code_end_address {
            return None;
        }
        if let Some(insn) = disassembly.get(&address).and_then(|slot| slot.insn.as_ref())
            && insn.opcode == Opcode::Push
            && matches!(
                insn.operands.as_slice().first(),
                Some(Operand::RegisterList(mask)) if *mask == (1 << 4) | (1 << 5)
            )
            && let Some(next) = next_address(disassembly, address)
            && let Some(next_insn) = disassembly.get(&next).and_then(|slot| slot.insn.as_ref())
            && moves_lr_into_r4(next_insn)
        {
            return Some(address);
        }
        cursor = next_address(disassembly, address);
    }
    None
}

fn moves_lr_into_r4(insn: &DecodedInstruction) -> bool {
    match insn.opcode {
        Opcode::Mov => matches!(
            insn.operands.as_slice(),
            [Operand::Register(Register::R4), Operand::Register(Register::Lr)]
        ),
        Opcode::Movt | Opcode::Movw => {
            matches!(insn.operands.as_slice().first(), Some(Operand::Register(Register::R4)))
        }
        _ => false,
    }
}

/// Walks decode heads rather than `ins_address + 2*i` the way the original prologue scan
/// does, since a Thumb-2 instruction inside the six-instruction window would otherwise throw
/// off a fixed 2-byte stride.
fn find_gnu_thumb_prologue(
    disassembly: &DisassemblyMap,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) -> Option<(VirtAddr, GnuCaseSubtype)> {
    let mut cursor = Some(code_start_address);
    while let Some(address) = cursor {
        if address > code_end_address {
            return None;
        }
        if let Some(insn) = disassembly.get(&address).and_then(|slot| slot.insn.as_ref())
            && insn.opcode == Opcode::Push
            && is_r0_r1_or_r1_only(insn)
            && let Some(next) = next_address(disassembly, address)
            && let Some(next_insn) = disassembly.get(&next).and_then(|slot| slot.insn.as_ref())
            && next_insn.opcode == Opcode::Mov
            && matches!(
                next_insn.operands.as_slice(),
                [Operand::Register(Register::R1), Operand::Register(Register::Lr)]
            )
            && let Some(subtype) = scan_for_subtype(disassembly, next)
        {
            return Some((address, subtype));
        }
        cursor = next_address(disassembly, address);
    }
    None
}

fn is_r0_r1_or_r1_only(insn: &DecodedInstruction) -> bool {
    matches!(
        insn.operands.as_slice().first(),
        Some(Operand::RegisterList(mask)) if *mask == (1 | (1 << 1)) || *mask == (1 << 1)
    )
}

fn scan_for_subtype(disassembly: &DisassemblyMap, from: VirtAddr) -> Option<GnuCaseSubtype> {
    let mut cursor = from;
    for _ in 0..6 {
        cursor = next_address(disassembly, cursor)?;
        let insn = disassembly.get(&cursor)?.insn.as_ref()?;
        let subtype = match insn.opcode {
            Opcode::Ldrsb => Some(GnuCaseSubtype::CaseSqi),
            Opcode::Ldrb => Some(GnuCaseSubtype::CaseUqi),
            Opcode::Ldrsh => Some(GnuCaseSubtype::CaseShi),
            Opcode::Ldrh => Some(GnuCaseSubtype::CaseUhi),
            Opcode::Ldr => Some(GnuCaseSubtype::CaseSi),
            _ => None,
        };
        if subtype.is_some() {
            return subtype;
        }
    }
    None
}

// ---------------------------------------------------------------------------------------
// Shared: gating-comparison discovery
// ---------------------------------------------------------------------------------------

struct PrecedingComparison {
    comparison_register: Register,
    comparison_value: u32,
    comparison_address: VirtAddr,
    conditional_branch_address: VirtAddr,
}

/// Walks backward up to `config.cmp_search_window` decode heads for a `CMP Rx, #imm`, then
/// forward to the dispatch site for the conditional branch (or `IT`) it gates. A `HS`
/// ("unsigned higher or same") gate means the dispatch is only reached when the index is
/// strictly greater than the compared value, so the effective bound is one lower.
fn find_preceding_comparison(
    disassembly: &DisassemblyMap,
    dispatch_address: VirtAddr,
    config: &PipelineConfig,
) -> Option<PrecedingComparison> {
    let mut cursor = dispatch_address;
    let mut found = None;
    for _ in 0..config.cmp_search_window {
        cursor = previous_address(disassembly, cursor)?;
        if let Some(insn) = disassembly.get(&cursor).and_then(|slot| slot.insn.as_ref())
            && insn.opcode == Opcode::Cmp
            && let [Operand::Register(register), Operand::Immediate(imm)] = insn.operands.as_slice()
        {
            found = Some((cursor, *register, *imm as u32));
            break;
        }
    }
    let (comparison_address, comparison_register, mut comparison_value) = found?;

    let mut conditional_branch_address = None;
    let mut gating_condition = None;
    let mut cursor = comparison_address;
    while let Some(next) = next_address(disassembly, cursor) {
        if next >= dispatch_address {
            break;
        }
        cursor = next;
        if let Some(insn) = disassembly.get(&cursor).and_then(|slot| slot.insn.as_ref())
            && matches!(insn.opcode, Opcode::B | Opcode::It)
            && !matches!(insn.condition, Condition::Al | Condition::Invalid)
        {
            conditional_branch_address = Some(cursor);
            gating_condition = Some((insn.opcode, insn.condition));
            break;
        }
    }
    let conditional_branch_address = conditional_branch_address?;

    // The HS adjustment is only documented for a direct gating `B`; its meaning for the body
    // of an `IT` block is unclear from the source, so it is deliberately not applied there.
    if gating_condition == Some((Opcode::B, Condition::Hs)) {
        comparison_value = comparison_value.wrapping_sub(1);
    }

    Some(PrecedingComparison {
        comparison_register,
        comparison_value,
        comparison_address,
        conditional_branch_address,
    })
}

// ---------------------------------------------------------------------------------------
// (c) Main sweep
// ---------------------------------------------------------------------------------------

#[expect(clippy::too_many_arguments, reason = "each dispatch branch needs its own context")]
fn sweep_main(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
    replace_functions: &ReplaceFunctions,
    initial_sp: u32,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
    tracer: &dyn StrandTracer,
    errored_instructions: &mut BTreeSet<VirtAddr>,
) -> Vec<SwitchRecord> {
    let mut switches = Vec::new();
    let mut cursor = Some(code_start_address);

    while let Some(address) = cursor {
        if address > code_end_address {
            break;
        }
        let Some(insn) = disassembly.get(&address).and_then(|slot| slot.insn) else {
            cursor = next_address(disassembly, address);
            continue;
        };

        if insn.opcode == Opcode::Invalid {
            disassembly.get_mut(&address).expect("looked up above").mark_data();
            cursor = next_address(disassembly, address);
            continue;
        }
        if insn.opcode == Opcode::ByteLiteral {
            errored_instructions.insert(address);
            cursor = next_address(disassembly, address);
            continue;
        }

        if insn.opcode == Opcode::It
            && insn.condition == Condition::Al
            && let Some(Operand::Immediate(mask)) = insn.operands.as_slice().first()
            && it_mask_has_else(*mask as u8)
        {
            disassembly.get_mut(&address).expect("looked up above").mark_data();
            cursor = next_address(disassembly, address);
            continue;
        }

        if insn.opcode == Opcode::Bl
            && let Some(target) = resolve_direct_branch_target(&insn, address)
        {
            match replace_functions.get(&target).copied() {
                Some(HelperKind::ArmSwitch8) => {
                    if let Some((record, next)) = handle_arm_switch8_table(
                        disassembly, image, app_code_base, address, decoder,
                    ) {
                        switches.push(record);
                        cursor = Some(next);
                        continue;
                    }
                    errored_instructions.insert(address);
                }
                Some(HelperKind::GnuThumbCase(subtype)) => {
                    if let Some((record, next)) = handle_gnu_switch_table(
                        disassembly, image, app_code_base, address, subtype, config, decoder,
                    ) {
                        switches.push(record);
                        cursor = Some(next);
                        continue;
                    }
                    errored_instructions.insert(address);
                }
                None => {}
            }
            cursor = next_address(disassembly, address);
            continue;
        }

        if matches!(insn.opcode, Opcode::Tbb | Opcode::Tbh) {
            if let Some((record, next)) = handle_table_branch(
                disassembly, image, app_code_base, address, &insn, config, decoder,
            ) {
                switches.push(record);
                cursor = Some(next);
                continue;
            }
            errored_instructions.insert(address);
            cursor = next_address(disassembly, address);
            continue;
        }

        if handle_ldr_adr(disassembly, image, app_code_base, decoder, &insn, address) {
            cursor = next_address(disassembly, address);
            continue;
        }

        if writes_pc_from_plain_source(&insn)
            && let Some((record, next)) = handle_pc_switch(
                disassembly,
                image,
                app_code_base,
                address,
                initial_sp,
                config,
                decoder,
                tracer,
            )
        {
            switches.push(record);
            cursor = Some(next);
            continue;
        }

        cursor = next_address(disassembly, address);
    }

    switches
}

fn resolve_direct_branch_target(insn: &DecodedInstruction, address: VirtAddr) -> Option<VirtAddr> {
    let Some(Operand::Immediate(offset)) = insn.operands.as_slice().first() else {
        return None;
    };
    let pc = address.value().wrapping_add(4);
    Some(VirtAddr::new(pc.wrapping_add_signed(*offset)))
}

fn it_mask_has_else(mask: u8) -> bool {
    let size = if mask & 0b0001 != 0 {
        4
    } else if mask & 0b0010 != 0 {
        3
    } else if mask & 0b0100 != 0 {
        2
    } else {
        1
    };
    (1..size).any(|i| (mask >> (4 - i)) & 1 == 1)
}

fn round_table_end(table_start: VirtAddr, byte_len: u32, dispatch_address: VirtAddr) -> VirtAddr {
    let end = table_start.strict_add(byte_len);
    if byte_len.is_multiple_of(2) {
        end
    } else {
        log::warn!(
            "switch table for dispatch at {dispatch_address} has an odd trailing byte; \
             padding to the next even address"
        );
        end.strict_add(1)
    }
}

fn read_table_entry(image: &Image<'_>, offset: u32, width: u32) -> Result<u32, MediumError> {
    match width {
        1 => image.read_slice(FileOffset::new(offset), 1).map(|bytes| u32::from(bytes[0])),
        2 => image.read_u16(FileOffset::new(offset)).map(u32::from),
        _ => image.read_u32(FileOffset::new(offset)),
    }
}

fn sign_extend_entry(value: u32, width: u32) -> i32 {
    let bits = width * 8;
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn handle_arm_switch8_table(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    dispatch_address: VirtAddr,
    decoder: &dyn Decoder,
) -> Option<(SwitchRecord, VirtAddr)> {
    let lr = dispatch_address.strict_add(4);
    let offset = lr.value().wrapping_sub(app_code_base);
    let length_byte = image.read_slice(FileOffset::new(offset), 1).ok()?[0];
    let num_entries = u32::from(length_byte) + 1;
    let byte_len = num_entries + 1;
    let table_end = round_table_end(lr, byte_len, dispatch_address);

    let mut targets = Vec::with_capacity(num_entries as usize);
    for i in 0..num_entries {
        let entry_offset = offset.wrapping_add(1).wrapping_add(i);
        let Ok(entry) = image.read_slice(FileOffset::new(entry_offset), 1) else {
            break;
        };
        targets.push(VirtAddr::new(lr.value().wrapping_add(2 * u32::from(entry[0]))));
    }

    mark_table_as_data(disassembly, image, app_code_base, decoder, lr, table_end);

    let record = SwitchRecord {
        dispatch_address,
        kind: DispatchKind::ArmSwitch8,
        table_start: lr,
        table_end,
        targets,
        comparison_value: u32::from(length_byte),
        comparison_register: Register::R0,
        comparison_address: dispatch_address,
        conditional_branch_address: dispatch_address,
    };
    Some((record, table_end))
}

fn handle_gnu_switch_table(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    dispatch_address: VirtAddr,
    subtype: GnuCaseSubtype,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
) -> Option<(SwitchRecord, VirtAddr)> {
    let comparison = find_preceding_comparison(disassembly, dispatch_address, config)?;

    let mut lr = dispatch_address.strict_add(4);
    if subtype.entry_width() == 4 {
        lr = lr.align_down(4);
    }

    let entry_width = subtype.entry_width();
    let num_entries = comparison.comparison_value.wrapping_add(1);
    let byte_len = num_entries.saturating_mul(entry_width);
    let table_end = round_table_end(lr, byte_len, dispatch_address);

    let mut targets = Vec::with_capacity(num_entries as usize);
    for i in 0..num_entries {
        let entry_offset = lr.value().wrapping_sub(app_code_base).wrapping_add(i * entry_width);
        let Ok(raw) = read_table_entry(image, entry_offset, entry_width) else {
            break;
        };
        let value = if subtype.is_signed() { sign_extend_entry(raw, entry_width) } else { raw as i32 };
        let target = if matches!(subtype, GnuCaseSubtype::CaseSi) {
            lr.value().wrapping_add_signed(value)
        } else {
            lr.value().wrapping_add_signed(value.wrapping_mul(2))
        };
        targets.push(VirtAddr::new(target));
    }

    mark_table_as_data(disassembly, image, app_code_base, decoder, lr, table_end);

    let record = SwitchRecord {
        dispatch_address,
        kind: DispatchKind::GnuThumbCase(subtype),
        table_start: lr,
        table_end,
        targets,
        comparison_value: comparison.comparison_value,
        comparison_register: comparison.comparison_register,
        comparison_address: comparison.comparison_address,
        conditional_branch_address: comparison.conditional_branch_address,
    };
    Some((record, table_end))
}

fn handle_table_branch(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    dispatch_address: VirtAddr,
    insn: &DecodedInstruction,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
) -> Option<(SwitchRecord, VirtAddr)> {
    let Some(Operand::Memory { index: Some(index_register), .. }) = insn.operands.as_slice().first()
    else {
        return None;
    };

    let comparison = find_preceding_comparison(disassembly, dispatch_address, config)?;
    if comparison.comparison_register != *index_register {
        return None;
    }

    let is_halfword = insn.opcode == Opcode::Tbh;
    let entry_width = if is_halfword { 2 } else { 1 };
    let table_start = dispatch_address.strict_add(4);
    let num_entries = comparison.comparison_value.wrapping_add(1);
    let byte_len = num_entries.saturating_mul(entry_width);
    let table_end = round_table_end(table_start, byte_len, dispatch_address);

    let mut targets = Vec::with_capacity(num_entries as usize);
    for i in 0..num_entries {
        let entry_offset =
            table_start.value().wrapping_sub(app_code_base).wrapping_add(i * entry_width);
        let Ok(entry) = read_table_entry(image, entry_offset, entry_width) else {
            break;
        };
        targets.push(VirtAddr::new(table_start.value().wrapping_add(2 * entry)));
    }

    mark_table_as_data(disassembly, image, app_code_base, decoder, table_start, table_end);

    let record = SwitchRecord {
        dispatch_address,
        kind: DispatchKind::TableBranch { halfword: is_halfword },
        table_start,
        table_end,
        targets,
        comparison_value: comparison.comparison_value,
        comparison_register: comparison.comparison_register,
        comparison_address: comparison.comparison_address,
        conditional_branch_address: comparison.conditional_branch_address,
    };
    Some((record, table_end))
}

fn pc_relative_load(insn: &DecodedInstruction, address: VirtAddr) -> Option<(VirtAddr, u32)> {
    let num_bytes = match insn.opcode {
        Opcode::Ldr => 4,
        Opcode::Ldrh | Opcode::Ldrsh => 2,
        Opcode::Ldrb | Opcode::Ldrsb => 1,
        _ => return None,
    };
    let Some(Operand::Memory {
        base: Register::Pc,
        displacement,
        ..
    }) = insn.operands.as_slice().get(1)
    else {
        return None;
    };
    let pc = address.strict_add(4).align_down(4);
    Some((VirtAddr::new(pc.value().wrapping_add_signed(*displacement)), num_bytes))
}

/// `LDR Rx, [PC, #imm]` (any width) or `ADR Rx, #imm` where `Rx` is one of `R0`-`R2`: marks
/// the resolved target as data and re-decodes the instruction following the marked range.
/// The `R0`-`R2` restriction on `ADR` is a known heuristic inherited from the original tool:
/// it avoids mistaking ordinary address-of-local-buffer computations for literal-pool loads,
/// at the cost of missing genuine inline data reached through a higher register.
fn handle_ldr_adr(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    decoder: &dyn Decoder,
    insn: &DecodedInstruction,
    address: VirtAddr,
) -> bool {
    if let Some((target, num_bytes)) = pc_relative_load(insn, address) {
        mark_data_and_redecode(disassembly, image, app_code_base, decoder, target, num_bytes);
        return true;
    }

    if insn.opcode == Opcode::Adr
        && let [Operand::Register(rd), _, Operand::Immediate(imm)] = insn.operands.as_slice()
        && matches!(rd, Register::R0 | Register::R1 | Register::R2)
    {
        let pc = address.strict_add(4).align_down(4);
        let target = VirtAddr::new(pc.value().wrapping_add_signed(*imm));
        mark_data_and_redecode(disassembly, image, app_code_base, decoder, target, 4);
        return true;
    }

    false
}

fn writes_pc_from_plain_source(insn: &DecodedInstruction) -> bool {
    if !matches!(insn.opcode, Opcode::Ldr | Opcode::Add | Opcode::Mov | Opcode::Movt | Opcode::Movw) {
        return false;
    }
    let operands = insn.operands.as_slice();
    let Some(Operand::Register(dest)) = operands.first() else { return false };
    if !dest.is_pc() {
        return false;
    }
    !operands
        .iter()
        .skip(1)
        .any(|op| matches!(op, Operand::Register(r) if r.is_lr() || r.is_sp()))
}

/// An indirect PC-switch: a range-checked branch whose body loads a value through a
/// register-indirect load and eventually writes it to `PC`. Resolved by consulting the
/// [`StrandTracer`] once per candidate index to find both the table source address (so it
/// can be marked as data) and the resulting branch target.
#[expect(clippy::too_many_arguments, reason = "mirrors the caller's own argument set")]
fn handle_pc_switch(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    dispatch_address: VirtAddr,
    initial_sp: u32,
    config: &PipelineConfig,
    decoder: &dyn Decoder,
    tracer: &dyn StrandTracer,
) -> Option<(SwitchRecord, VirtAddr)> {
    let comparison = find_preceding_comparison(disassembly, dispatch_address, config)?;

    let mut trace_start = next_address(disassembly, comparison.conditional_branch_address)?;
    if let Some(insn) = disassembly.get(&trace_start).and_then(|slot| slot.insn.as_ref())
        && matches!(insn.opcode, Opcode::B | Opcode::Cbz | Opcode::Cbnz)
    {
        trace_start = next_address(disassembly, trace_start)?;
    }

    let mut ldr_address = None;
    let mut ldr_width = 4u32;
    let mut cursor = trace_start;
    loop {
        if cursor >= dispatch_address {
            break;
        }
        if let Some(insn) = disassembly.get(&cursor).and_then(|slot| slot.insn.as_ref())
            && matches!(
                insn.opcode,
                Opcode::Ldr | Opcode::Ldrb | Opcode::Ldrh | Opcode::Ldrsb | Opcode::Ldrsh
            )
            && let Some(Operand::Memory { base, .. }) = insn.operands.as_slice().get(1)
            && !base.is_pc()
            && !base.is_lr()
            && !base.is_sp()
        {
            ldr_address = Some(cursor);
            ldr_width = match insn.opcode {
                Opcode::Ldr => 4,
                Opcode::Ldrh | Opcode::Ldrsh => 2,
                _ => 1,
            };
            break;
        }
        cursor = next_address(disassembly, cursor)?;
    }
    let ldr_address = ldr_address?;

    let num_entries = comparison.comparison_value.wrapping_add(1);
    let mut targets = Vec::with_capacity(num_entries as usize);
    let mut table_addresses = Vec::with_capacity(num_entries as usize);

    for index in 0..num_entries {
        let mut registers = RegisterSnapshot::EMPTY;
        registers.set(Register::Sp, initial_sp);
        registers.set(comparison.comparison_register, index);
        let flags = ConditionFlags::default();

        let Some(source_snapshot) =
            tracer.trace(disassembly, trace_start, &[ldr_address], registers, flags, true)
        else {
            continue;
        };
        let Some(table_source) = source_snapshot.get(comparison.comparison_register) else {
            continue;
        };
        table_addresses.push(VirtAddr::new(table_source));
        mark_data_and_redecode(
            disassembly,
            image,
            app_code_base,
            decoder,
            VirtAddr::new(table_source),
            ldr_width,
        );

        if let Some(final_snapshot) =
            tracer.trace(disassembly, trace_start, &[dispatch_address], registers, flags, true)
            && let Some(pc_value) = final_snapshot.get(Register::Pc)
        {
            targets.push(VirtAddr::from_thumb_pointer(pc_value));
        }
    }

    if targets.is_empty() {
        return None;
    }

    let table_start = *table_addresses.iter().min()?;
    let table_end = table_addresses.iter().max()?.strict_add(ldr_width);
    let next = next_address(disassembly, dispatch_address)?;

    let record = SwitchRecord {
        dispatch_address,
        kind: DispatchKind::PcSwitch,
        table_start,
        table_end,
        targets,
        comparison_value: comparison.comparison_value,
        comparison_register: comparison.comparison_register,
        comparison_address: comparison.comparison_address,
        conditional_branch_address: comparison.conditional_branch_address,
    };
    Some((record, next))
}

// ---------------------------------------------------------------------------------------
// (d) Inline-address pass
// ---------------------------------------------------------------------------------------

fn mark_inline_addresses(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    code_start_address: VirtAddr,
    code_end_address: VirtAddr,
) {
    let candidates: Vec<(VirtAddr, Register, VirtAddr)> = disassembly
        .iter()
        .filter_map(|(&address, slot)| {
            let insn = slot.insn.as_ref()?;
            let (pool_address, num_bytes) = pc_relative_load(insn, address)?;
            if num_bytes != 4 {
                return None;
            }
            let Operand::Register(dest) = *insn.operands.as_slice().first()? else { return None };
            let offset = pool_address.value().wrapping_sub(app_code_base);
            let loaded = image.read_u32(FileOffset::new(offset)).ok()?;
            let loaded_address = VirtAddr::new(loaded);
            if loaded_address < code_start_address || loaded_address > code_end_address {
                return None;
            }
            Some((loaded_address, dest, address))
        })
        .collect();

    for (loaded_address, dest, ldr_address) in candidates {
        let mut cursor = ldr_address;
        let mut found = false;
        for _ in 0..5 {
            let Some(next) = next_address(disassembly, cursor) else { break };
            cursor = next;
            let Some(insn) = disassembly.get(&cursor).and_then(|slot| slot.insn.as_ref()) else {
                continue;
            };

            if reads_zero_offset_from(insn, dest) || targets_register(insn, dest) {
                found = true;
                break;
            }
            if overwrites_register(insn, dest) {
                break;
            }
        }

        if found {
            let aligned = loaded_address.align_down(2);
            mark_one_data_slot(disassembly, image, app_code_base, aligned);
            mark_one_data_slot(disassembly, image, app_code_base, aligned.strict_add(2));
        }
    }
}

fn reads_zero_offset_from(insn: &DecodedInstruction, register: Register) -> bool {
    if !matches!(
        insn.opcode,
        Opcode::Ldr | Opcode::Ldrb | Opcode::Ldrh | Opcode::Ldrsb | Opcode::Ldrsh
    ) {
        return false;
    }
    matches!(
        insn.operands.as_slice().get(1),
        Some(Operand::Memory { base, index: None, displacement: 0, .. }) if *base == register
    )
}

fn targets_register(insn: &DecodedInstruction, register: Register) -> bool {
    matches!(insn.opcode, Opcode::Bx | Opcode::Blx)
        && matches!(insn.operands.as_slice().first(), Some(Operand::Register(r)) if *r == register)
}

fn overwrites_register(insn: &DecodedInstruction, register: Register) -> bool {
    insn.opcode != Opcode::Cmp
        && matches!(insn.operands.as_slice().first(), Some(Operand::Register(r)) if *r == register)
}

// ---------------------------------------------------------------------------------------
// Shared low-level helpers
// ---------------------------------------------------------------------------------------

fn mark_one_data_slot(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    address: VirtAddr,
) {
    let offset = address.value().wrapping_sub(app_code_base);
    let length = match image.read_slice(FileOffset::new(offset), 2) {
        Ok(_) => 2,
        Err(_) => usize::from(image.read_slice(FileOffset::new(offset), 1).is_ok()),
    };
    if length == 0 {
        return;
    }
    let raw = image
        .read_slice(FileOffset::new(offset), length)
        .expect("length was derived from a successful read above");
    let mut slot = DecodedSlot::code(
        decode::DecodedInstruction::new(Opcode::ByteLiteral, length as u8, decode::OperandList::EMPTY),
        RawBytes::from_slice(raw),
    );
    slot.mark_data();
    disassembly.insert(address, slot);
}

/// Invalidates `[start, start + num_bytes)` as data, in 2-byte-slot steps, then re-decodes
/// the first slot after the marked range so the main sweep resumes on a valid instruction.
/// This is the "invalidate range, redecode tail" operation every table-removal and
/// literal-pool-load bullet in this stage needs.
fn mark_data_and_redecode(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    decoder: &dyn Decoder,
    start: VirtAddr,
    num_bytes: u32,
) {
    let slot_count = num_bytes.div_ceil(2).max(1);
    let mut cursor = start.align_down(2);
    for _ in 0..slot_count {
        mark_one_data_slot(disassembly, image, app_code_base, cursor);
        cursor = cursor.strict_add(2);
    }
    redecode_gap_if_missing(disassembly, image, app_code_base, cursor, decoder);
}

fn mark_table_as_data(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    decoder: &dyn Decoder,
    table_start: VirtAddr,
    table_end: VirtAddr,
) {
    let mut cursor = table_start;
    while cursor.value() < table_end.value() {
        mark_one_data_slot(disassembly, image, app_code_base, cursor);
        cursor = cursor.strict_add(2);
    }
    redecode_gap_if_missing(disassembly, image, app_code_base, table_end, decoder);
}

fn redecode_gap_if_missing(
    disassembly: &mut DisassemblyMap,
    image: &Image<'_>,
    app_code_base: u32,
    address: VirtAddr,
    decoder: &dyn Decoder,
) {
    if disassembly.contains_key(&address) {
        return;
    }
    let offset = address.value().wrapping_sub(app_code_base);
    let Ok(bytes) = image.read_slice(FileOffset::new(offset), 2) else {
        return;
    };
    if let Ok(insn) = decoder.decode(bytes) {
        disassembly.insert(address, DecodedSlot::code(insn, RawBytes::from_slice(bytes)));
    }
}

#[cfg(test)]
mod test {
    use decode::ThumbDecoder;
    use image::Image;

    use super::*;
    use crate::stages::disassemble::linear_disassemble;

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

    #[test]
    fn arm_switch8_table_resolves_targets_and_marks_data() {
        // BL <switch8 trampoline> ; then inline table: length=1, entries 0x02, 0x04.
        let mut bytes = vec![0u8; 0x20];
        bytes[0x100..0x104].copy_from_slice(&0xF800_F000u32.to_be_bytes()); // placeholder
        // Build: trampoline entry at 0, BL targets it from address 0x10 (BL encoding irrelevant
        // to this unit test beyond resolving to a HelperKind lookup, exercised directly).
        let dispatch_address = address::VirtAddr::new(0x10);
        let lr = dispatch_address.strict_add(4);
        let mut image_bytes = vec![0u8; 0x20];
        image_bytes[0x14] = 0x01; // N = 1 -> 2 entries
        image_bytes[0x15] = 0x02;
        image_bytes[0x16] = 0x04;
        let image = Image::new(&image_bytes);
        let mut disassembly = DisassemblyMap::new();

        let (record, next) =
            handle_arm_switch8_table(&mut disassembly, &image, 0, dispatch_address, &ThumbDecoder)
                .unwrap();

        assert_eq!(record.table_start, lr);
        assert_eq!(record.targets, vec![
            address::VirtAddr::new(lr.value() + 4),
            address::VirtAddr::new(lr.value() + 8),
        ]);
        assert!(disassembly[&lr].is_data);
        assert_eq!(next, record.table_end);
    }

    #[test]
    fn table_branch_resolves_four_targets_gated_by_cmp() {
        // MOVS R0, #5 ; CMP R0, #3 ; BHI <past> ; TBB [PC, R0] ; table bytes 02 04 06 08.
        let mut bytes = vec![
            0x05, 0x20, // MOVS R0, #5
            0x03, 0x28, // CMP R0, #3
            0x01, 0xD8, // BHI +2 (arbitrary, condition != AL is what matters)
        ];
        let tbb_address_value = bytes.len() as u32;
        bytes.extend_from_slice(&[0x00, 0xE8, 0xD0, 0xF0]); // TBB [PC, R0]
        bytes.extend_from_slice(&[0x02, 0x04, 0x06, 0x08]);

        let image = Image::new(&bytes);
        let decoder = ThumbDecoder;
        let mut disassembly = linear_disassemble(&image, 0, &decoder);
        let dispatch_address = address::VirtAddr::new(tbb_address_value);
        let insn = disassembly[&dispatch_address].insn.unwrap();
        let config = PipelineConfig::default();

        let (record, _next) = handle_table_branch(
            &mut disassembly,
            &image,
            0,
            dispatch_address,
            &insn,
            &config,
            &decoder,
        )
        .unwrap();

        assert_eq!(record.comparison_value, 3);
        assert_eq!(record.targets.len(), 4);
        assert!(disassembly[&record.table_start].is_data);
    }

    #[test]
    fn it_with_unconditional_condition_and_else_letters_is_flagged() {
        // mask 0b0101 under firstcond AL: size=4, bit at i=1 is (mask>>3)&1=0 (then),
        // i=2 -> (mask>>2)&1=1 (else) -> has_else true.
        assert!(it_mask_has_else(0b0101));
        // mask 0b1000 (size 1): no trailing instructions, never an else.
        assert!(!it_mask_has_else(0b1000));
    }

    #[test]
    fn reset_handler_data_discovery_finds_source_and_destination() {
        // Two PC-relative LDRs: first resolves in-image (source), second resolves to RAM
        // (destination), disclosing the `.data` image per the concrete scenario this
        // behavior is grounded on.
        let mut bytes = vec![0u8; 0x420];
        // LDR R0, [PC, #0] at file offset 0 -> loads word at 0x04: 0x00000400 (in-image).
        bytes[0..2].copy_from_slice(&0x4800u16.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x0000_0400u32.to_le_bytes());
        // LDR R1, [PC, #0] at file offset 2 -> loads word at offset 2+4=6... use aligned slot.
        bytes[8..10].copy_from_slice(&0x4900u16.to_le_bytes());
        bytes[12..16].copy_from_slice(&0x2000_0000u32.to_le_bytes());
        // BX LR to end the scan cleanly.
        bytes[16..18].copy_from_slice(&0x4770u16.to_le_bytes());

        let image = Image::new(&bytes);
        let decoder = ThumbDecoder;
        let mut disassembly = linear_disassemble(&image, 0, &decoder);
        let config = PipelineConfig::default();

        let (data_segment, _data_region, code_end) = discover_reset_handler_data(
            &mut disassembly,
            &image,
            0,
            address::VirtAddr::new(0),
            address::VirtAddr::new(0),
            &config,
            &decoder,
        );

        let segment = data_segment.expect("two contrasting LDR values should disclose .data");
        assert_eq!(segment.ram_start, 0x2000_0000);
        assert_eq!(segment.file_start, address::VirtAddr::new(0x400));
        assert!(code_end.value() < 0x400);
    }

    #[test]
    fn separate_data_and_code_runs_all_four_passes() {
        let bytes = vec![
            0x05, 0x20, // MOVS R0, #5
            0x70, 0x47, // BX LR
        ];
        let image = Image::new(&bytes);
        let decoder = ThumbDecoder;
        let mut disassembly = linear_disassemble(&image, 0, &decoder);
        let config = PipelineConfig::default();
        let tracer = NullTracer;

        let output = separate_data_and_code(
            &mut disassembly,
            &image,
            0,
            address::VirtAddr::new(0),
            address::VirtAddr::new(0),
            0x2000_0400,
            &config,
            &decoder,
            &tracer,
        );

        assert!(output.switches.is_empty());
        assert!(output.replace_functions.is_empty());
    }
}
